use crate::cancel::CancelToken;
use crate::config::{InstrumentationKind, InstrumentationTool};
use crate::executor::{CommandExecutor, CommandExecutorConfig, ExecutorError};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DRCOV_HEADER: &str = "BB Table:";
const DRCOV_RECORD_PREFIX: &str = "module[";

#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("Coverage run failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Coverage scratch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed line in coverage log {path:?}: {line}")]
    MalformedLog { path: PathBuf, line: String },
}

/// Result of one instrumented run of the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSample {
    pub basic_block_count: u64,
    pub unique_basic_block_count: u64,
    /// Every distinct block record this run hit.
    pub blocks: HashSet<String>,
    pub exit_code: i32,
}

impl CoverageSample {
    /// Worst-case measurement used when the oracle itself failed.
    pub fn zero() -> Self {
        Self::default()
    }

    /// The count the search optimises: unique blocks, or total blocks when
    /// `non_uniques` is set.
    pub fn metric(&self, non_uniques: bool) -> u64 {
        if non_uniques {
            self.basic_block_count
        } else {
            self.unique_basic_block_count
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MeasureRequest<'a> {
    pub command_line: &'a str,
    pub timeout: Duration,
    pub hide_output: bool,
    pub envs: &'a BTreeMap<String, String>,
}

/// Runs the target under instrumentation and reports what it covered.
///
/// Implementations must hard-kill the target at `timeout` and remove every
/// scratch artifact they create, whatever the outcome.
pub trait CoverageOracle: Send + Sync {
    fn measure(&self, request: &MeasureRequest<'_>) -> Result<CoverageSample, MeasurementError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(Arch::X86),
            64 => Some(Arch::X64),
            _ => None,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X64 => 64,
        }
    }

    fn pin_obj_dir(&self) -> &'static str {
        match self {
            Arch::X86 => "obj-ia32",
            Arch::X64 => "obj-intel64",
        }
    }
}

/// Block counts parsed out of a backend log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlockTrace {
    pub total: u64,
    pub blocks: HashSet<String>,
}

/// Coverage oracle backed by a binary instrumentation toolkit on disk.
#[derive(Debug, Clone)]
pub struct BinInstOracle {
    tool: InstrumentationTool,
    arch: Arch,
    cancel: CancelToken,
}

impl BinInstOracle {
    pub fn new(tool: InstrumentationTool, arch: Arch, cancel: CancelToken) -> Self {
        Self { tool, arch, cancel }
    }

    fn execute(
        &self,
        command_line: String,
        request: &MeasureRequest<'_>,
    ) -> Result<i32, MeasurementError> {
        let config = CommandExecutorConfig {
            hide_output: request.hide_output,
            envs: request.envs.clone(),
            ..CommandExecutorConfig::new(command_line, request.timeout)
        };
        let status = CommandExecutor::new(config)
            .with_cancel(self.cancel.clone())
            .run()?;
        Ok(status.exit_code())
    }

    fn measure_drcov(&self, request: &MeasureRequest<'_>) -> Result<CoverageSample, MeasurementError> {
        // Dropping the TempDir removes the log directory on every path out.
        let logdir = tempfile::Builder::new().prefix("bcf-drcov").tempdir()?;
        let command_line = format!(
            "{}/bin{}/drrun -t drcov -dump_text -logdir {} -- {}",
            self.tool.path.display(),
            self.arch.bits(),
            logdir.path().display(),
            request.command_line
        );
        let exit_code = self.execute(command_line, request)?;

        let trace = match find_drcov_log(logdir.path())? {
            Some(log_path) => {
                let raw = fs::read(&log_path)?;
                parse_drcov_log(&String::from_utf8_lossy(&raw), &log_path)?
            }
            None => {
                log::debug!("No drcov log produced, assuming zero coverage");
                BlockTrace::default()
            }
        };
        Ok(sample_from(trace, exit_code))
    }

    fn measure_pin(&self, request: &MeasureRequest<'_>) -> Result<CoverageSample, MeasurementError> {
        let logfile = tempfile::Builder::new().prefix("bcf-pin").tempfile()?;
        let tool_path = self
            .tool
            .path
            .join("source/tools/RunTracer")
            .join(self.arch.pin_obj_dir())
            .join("ccovtrace.so");
        let command_line = format!(
            "{}/pin.sh -t {} -o {} -- {}",
            self.tool.path.display(),
            tool_path.display(),
            logfile.path().display(),
            request.command_line
        );
        let exit_code = self.execute(command_line, request)?;

        let raw = fs::read(logfile.path())?;
        let trace = parse_pin_log(&String::from_utf8_lossy(&raw));
        Ok(sample_from(trace, exit_code))
    }
}

impl CoverageOracle for BinInstOracle {
    fn measure(&self, request: &MeasureRequest<'_>) -> Result<CoverageSample, MeasurementError> {
        match self.tool.kind {
            InstrumentationKind::DynamoRio => self.measure_drcov(request),
            InstrumentationKind::Pin => self.measure_pin(request),
        }
    }
}

fn sample_from(trace: BlockTrace, exit_code: i32) -> CoverageSample {
    log::debug!(
        "Return code {}, Basic Block(s) {}, Unique(s) {}",
        exit_code,
        trace.total,
        trace.blocks.len()
    );
    CoverageSample {
        basic_block_count: trace.total,
        unique_basic_block_count: trace.blocks.len() as u64,
        blocks: trace.blocks,
        exit_code,
    }
}

/// First `drcov*.log` in `logdir`, if the run got far enough to write one.
fn find_drcov_log(logdir: &Path) -> Result<Option<PathBuf>, std::io::Error> {
    for entry in fs::read_dir(logdir)? {
        let path = entry?.path();
        let is_drcov = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("drcov") && n.ends_with(".log"));
        if is_drcov && path.is_file() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Parses a `drcov -dump_text` log: a `BB Table: <n> bbs` header followed by
/// `module[ id]: 0xstart, size` records. A log cut short before the header
/// yields an empty trace.
pub fn parse_drcov_log(content: &str, origin: &Path) -> Result<BlockTrace, MeasurementError> {
    let mut trace = BlockTrace::default();
    let mut found_bb_table = false;

    for line in content.lines() {
        if !found_bb_table {
            if line.starts_with(DRCOV_HEADER) {
                let values: Vec<&str> = line.split(' ').collect();
                trace.total = match (values.len(), values.get(2).map(|v| v.parse::<u64>())) {
                    (4, Some(Ok(n))) => n,
                    _ => {
                        return Err(MeasurementError::MalformedLog {
                            path: origin.to_path_buf(),
                            line: line.to_string(),
                        });
                    }
                };
                found_bb_table = true;
            }
            continue;
        }
        let record = line.trim();
        if record.starts_with(DRCOV_RECORD_PREFIX) {
            trace.blocks.insert(record.to_string());
        }
    }
    Ok(trace)
}

/// Parses a Pin `ccovtrace` log: one header line, then tab-separated records
/// keyed by their first field.
pub fn parse_pin_log(content: &str) -> BlockTrace {
    let lines: Vec<&str> = content.lines().collect();
    let blocks = lines
        .iter()
        .skip(1)
        .filter_map(|line| line.split('\t').next())
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect();
    BlockTrace {
        total: lines.len().saturating_sub(1) as u64,
        blocks,
    }
}
