use crate::coverage::CoverageSample;
use crate::digest::sha1_hex;
use crate::mutator::Candidate;
use crate::persist::{PersistError, atomic_write};
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};

const fn signalled(signal: Signal) -> i32 {
    128 + signal as i32
}

/// Exit codes (`128 + signal`) that mean the target died on a fatal signal.
pub const FATAL_SIGNALS: [(i32, &str); 7] = [
    (signalled(Signal::SIGILL), "SIGILL"),
    (signalled(Signal::SIGTRAP), "SIGTRAP"),
    (signalled(Signal::SIGABRT), "SIGABRT"),
    (signalled(Signal::SIGFPE), "SIGFPE"),
    (signalled(Signal::SIGBUS), "SIGBUS"),
    (signalled(Signal::SIGSEGV), "SIGSEGV"),
    (signalled(Signal::SIGTERM), "SIGTERM"),
];

pub fn fatal_signal_name(exit_code: i32) -> Option<&'static str> {
    FATAL_SIGNALS
        .iter()
        .find(|(code, _)| *code == exit_code)
        .map(|(_, name)| *name)
}

/// A crash observed while measuring a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    pub exit_code: i32,
    pub signal_name: &'static str,
    /// SHA-1 hex of the crashing buffer; also its file name on disk.
    pub input_hash: String,
    pub offset: usize,
    pub size: usize,
}

/// Decides whether a measured run is a bug worth keeping.
pub trait BugOracle: Send + Sync {
    fn examine(&self, candidate: &Candidate, sample: &CoverageSample) -> Option<BugReport>;
}

/// Reports a bug whenever the exit code is in [`FATAL_SIGNALS`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FatalSignalOracle;

impl BugOracle for FatalSignalOracle {
    fn examine(&self, candidate: &Candidate, sample: &CoverageSample) -> Option<BugReport> {
        let signal_name = fatal_signal_name(sample.exit_code)?;
        Some(BugReport {
            exit_code: sample.exit_code,
            signal_name,
            input_hash: sha1_hex(&candidate.data),
            offset: candidate.offset,
            size: candidate.size,
        })
    }
}

/// Where a proof of concept landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PocFiles {
    pub poc: PathBuf,
    pub diff: PathBuf,
    /// `false` when the same bytes had already been persisted.
    pub fresh: bool,
}

/// Writes `<sha1>` and `<sha1>.diff` into the output directory.
#[derive(Debug, Clone)]
pub struct CrashPersister {
    out_dir: PathBuf,
    seed_path: PathBuf,
}

impl CrashPersister {
    pub fn new(out_dir: impl Into<PathBuf>, seed_path: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            seed_path: seed_path.into(),
        }
    }

    pub fn diff_record(&self, offset: usize, size: usize) -> String {
        format!(
            "# Original file created by 'Blind Coverage Fuzzer' was {}\n{},{}",
            self.seed_path.display(),
            offset,
            size
        )
    }

    pub fn persist(&self, candidate: &Candidate, report: &BugReport) -> Result<PocFiles, PersistError> {
        let poc = self.out_dir.join(&report.input_hash);
        let diff = diff_path(&poc);
        if poc.is_file() && diff.is_file() {
            log::info!("Proof of concept {} already on disk", poc.display());
            return Ok(PocFiles {
                poc,
                diff,
                fresh: false,
            });
        }

        atomic_write(&poc, &candidate.data)?;
        log::info!("Created proof of concept {}", poc.display());
        atomic_write(&diff, self.diff_record(report.offset, report.size).as_bytes())?;
        log::info!("Created diff file {}", diff.display());
        Ok(PocFiles {
            poc,
            diff,
            fresh: true,
        })
    }
}

fn diff_path(poc: &Path) -> PathBuf {
    let mut name = poc.as_os_str().to_os_string();
    name.push(".diff");
    PathBuf::from(name)
}
