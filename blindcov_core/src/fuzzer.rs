use crate::cancel::CancelToken;
use crate::config::{ConfigError, ConfigSource, TargetDescriptor};
use crate::corpus::{CorpusError, CorpusPool};
use crate::coverage::{CoverageOracle, CoverageSample, MeasureRequest};
use crate::crash::{BugOracle, BugReport, CrashPersister, FatalSignalOracle, PocFiles};
use crate::executor::run_hook;
use crate::generation::GenerationHistory;
use crate::digest::sha1_hex;
use crate::mutator::{
    Candidate, DEFAULT_MAX_MUTATION_SIZE, MutationEngine, MutationError, MutationParams,
    MutationStrategy,
};
use crate::persist::ArtifactWriter;
use crate::state::{SharedState, lock_shared};
use crate::stats::{RunningStatistics, StateFile, Verdict};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use thiserror::Error;

/// Environment variable overriding the bootstrap worker-pool size.
pub const POOL_SIZE_ENV: &str = "BCF_PROCESSES";

const REGRESSION_PENALTY: i64 = 3;
const NEUTRAL_PENALTY: i64 = 1;

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to read seed file {path:?}: {source}")]
    Seed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Output directory {path:?} is unusable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("Failed to materialize test case: {0}")]
    Scratch(#[source] std::io::Error),
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

/// Bootstrap worker-pool size: `BCF_PROCESSES` when set to a positive
/// number, the logical CPU count otherwise.
pub fn worker_pool_size() -> usize {
    std::env::var(POOL_SIZE_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(num_cpus::get)
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    pub seed_path: PathBuf,
    pub out_dir: PathBuf,
    /// Overrides [`worker_pool_size`].
    pub pool_size: Option<usize>,
}

/// Everything the search loop owns. Only `shared` is ever locked.
#[derive(Debug)]
pub struct SearchState {
    pub template: Vec<u8>,
    pub history: GenerationHistory,
    pub generation_value: i64,
    pub bugs: u64,
    pub iteration: u64,
    pub original_stats: RunningStatistics,
    pub shared: Mutex<SharedState>,
}

/// What one iteration did.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// `None` when cancellation cut the measurement short.
    pub verdict: Option<Verdict>,
    pub coverage: u64,
    pub strategy: MutationStrategy,
    pub bug: Option<BugReport>,
    /// Where the crash landed on disk, when persisting it worked.
    pub poc: Option<PocFiles>,
}

/// Result of a campaign.
#[derive(Debug, Clone)]
pub struct FuzzOutcome {
    pub template: Vec<u8>,
    pub stats: RunningStatistics,
    pub original_stats: RunningStatistics,
    pub bugs: u64,
    pub iterations: u64,
    pub cancelled: bool,
}

impl FuzzOutcome {
    /// Whether the final template covers more than the seed did.
    pub fn maximized(&self) -> bool {
        self.stats.max > self.original_stats.max
    }
}

/// Greedy coverage maximizer around one seed file.
pub struct BlindCoverageFuzzer<O: CoverageOracle> {
    oracle: O,
    config_source: Box<dyn ConfigSource>,
    descriptor: TargetDescriptor,
    seed_path: PathBuf,
    artifacts: ArtifactWriter,
    crashes: CrashPersister,
    bug_oracle: FatalSignalOracle,
    corpus: Option<CorpusPool>,
    engine: MutationEngine,
    max_mutation_size: usize,
    pool_size: usize,
    cancel: CancelToken,
    bootstrapped: bool,
    state: SearchState,
}

impl<O: CoverageOracle> BlindCoverageFuzzer<O> {
    /// Loads the target description and the seed. Configuration errors here
    /// are fatal; later reloads that fail keep the previous description.
    pub fn new(
        oracle: O,
        config_source: Box<dyn ConfigSource>,
        options: FuzzerOptions,
        cancel: CancelToken,
    ) -> Result<Self, FuzzError> {
        let descriptor = config_source.load()?;
        log::info!("Input file is {}", options.seed_path.display());
        let template = std::fs::read(&options.seed_path).map_err(|source| FuzzError::Seed {
            path: options.seed_path.clone(),
            source,
        })?;
        std::fs::create_dir_all(&options.out_dir).map_err(|source| FuzzError::OutputDir {
            path: options.out_dir.clone(),
            source,
        })?;

        let mut rng = match descriptor.tunables.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        let max_mutation_size = match descriptor.tunables.max_mutation_size {
            Some(size) => size,
            None => {
                let size = rng.random_range(1..=DEFAULT_MAX_MUTATION_SIZE);
                log::info!("Selected a maximum size of {size} change(s) to apply");
                size
            }
        };
        let corpus = descriptor
            .corpus_path
            .as_ref()
            .map(CorpusPool::open)
            .transpose()?;
        let pool_size = options.pool_size.unwrap_or_else(worker_pool_size).max(1);
        let history = GenerationHistory::new(descriptor.tunables.max_generations);

        Ok(Self {
            oracle,
            config_source,
            artifacts: ArtifactWriter::new(&options.out_dir),
            crashes: CrashPersister::new(&options.out_dir, &options.seed_path),
            seed_path: options.seed_path,
            descriptor,
            bug_oracle: FatalSignalOracle,
            corpus,
            engine: MutationEngine::new(rng).with_cancel(cancel.clone()),
            max_mutation_size,
            pool_size,
            cancel,
            bootstrapped: false,
            state: SearchState {
                template,
                history,
                generation_value: 0,
                bugs: 0,
                iteration: 0,
                original_stats: RunningStatistics::new(0, 0, 0.0),
                shared: Mutex::new(SharedState::new(RunningStatistics::new(0, 0, 0.0))),
            },
        })
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn template(&self) -> &[u8] {
        &self.state.template
    }

    pub fn stats(&self) -> RunningStatistics {
        lock_shared(&self.state.shared).stats.clone()
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    pub fn max_mutation_size(&self) -> usize {
        self.max_mutation_size
    }

    /// Establishes the coverage baseline: resumes from the state file when it
    /// loads cleanly, otherwise samples the seed `metrics` times in parallel.
    /// Returns `true` when the run was resumed. Sampling cut short by
    /// cancellation saves nothing and leaves the fuzzer unbootstrapped.
    pub fn bootstrap(&mut self) -> Result<bool, FuzzError> {
        let descriptor = self.descriptor.clone();
        let state_file = descriptor.state_file.as_ref().map(StateFile::new);

        let resumed = state_file
            .as_ref()
            .filter(|sf| sf.exists())
            .and_then(|sf| {
                log::info!("Loading saved state...");
                match sf.load() {
                    Ok(stats) => {
                        log::info!("Reloaded statistics: {stats}");
                        Some(stats)
                    }
                    Err(e) => {
                        log::warn!("Error loading saved state: {e}");
                        None
                    }
                }
            });
        let was_resumed = resumed.is_some();

        let stats = match resumed {
            Some(stats) => {
                self.restore_snapshot(&descriptor);
                stats
            }
            None => {
                let mut metrics = descriptor.tunables.metrics;
                if self.pool_size > metrics {
                    log::info!(
                        "The number of processes is bigger than the number of metrics, adjusting it to {}",
                        self.pool_size
                    );
                    metrics = self.pool_size;
                }
                log::info!("Recording a total of {metrics} value(s) of coverage...");
                let samples = self.sample_parallel(&descriptor, &self.seed_path, metrics);
                if self.cancel.is_cancelled() {
                    log::warn!("Sampling interrupted after {} run(s), statistics not saved", samples.len());
                    return Ok(false);
                }
                let stats = RunningStatistics::from_samples(&samples, descriptor.tunables.non_uniques)
                    .unwrap_or_else(|| RunningStatistics::new(0, 0, 0.0));
                if let Some(sf) = &state_file {
                    if let Err(e) = sf.save(&stats) {
                        log::warn!("Failed to write state file: {e}");
                    }
                }
                stats
            }
        };

        self.state.original_stats = stats.clone();
        lock_shared(&self.state.shared).stats = stats;
        self.bootstrapped = true;
        self.print_statistics();
        Ok(was_resumed)
    }

    fn restore_snapshot(&mut self, descriptor: &TargetDescriptor) {
        let path = self
            .artifacts
            .current_state_path(&descriptor.current_state_file, &descriptor.extension);
        if !path.is_file() {
            return;
        }
        match std::fs::read(&path) {
            Ok(template) => {
                log::info!("Restoring template from {} ({})", path.display(), sha1_hex(&template));
                self.state.template = template;
            }
            Err(e) => log::warn!("Failed to read current state {}: {e}", path.display()),
        }
    }

    /// Measures `input` `count` times on the worker pool. Results flow back
    /// over a channel to this thread.
    fn sample_parallel(&self, descriptor: &TargetDescriptor, input: &Path, count: usize) -> Vec<CoverageSample> {
        let command_line = descriptor.command_line(input);
        let workers = self.pool_size.min(count).max(1);
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let command_line = command_line.as_str();
                scope.spawn(move || {
                    while !self.cancel.is_cancelled() && next.fetch_add(1, Ordering::Relaxed) < count {
                        let sample = measure_with_hooks(&self.oracle, descriptor, command_line, &self.cancel);
                        if tx.send(sample).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            rx.iter().collect()
        })
    }

    fn reload_configuration(&mut self) {
        match self.config_source.load() {
            Ok(descriptor) => {
                if descriptor.corpus_path != self.descriptor.corpus_path {
                    self.corpus = match descriptor.corpus_path.as_ref().map(CorpusPool::open).transpose() {
                        Ok(corpus) => corpus,
                        Err(e) => {
                            log::warn!("Corpus disabled: {e}");
                            None
                        }
                    };
                }
                self.state.history.set_capacity(descriptor.tunables.max_generations);
                self.descriptor = descriptor;
            }
            Err(e) => log::warn!("Failed to reload configuration, keeping the previous one: {e}"),
        }
    }

    /// Restores the newest snapshot when the generation value sank below the
    /// rollback floor. With an empty history nothing happens and the value
    /// keeps sinking.
    pub fn rollback_if_needed(&mut self) -> bool {
        let floor = self.descriptor.tunables.generation_bottom_level;
        if self.state.generation_value >= floor {
            return false;
        }
        let Some(snapshot) = self.state.history.pop_latest() else {
            return false;
        };

        log::info!("Dropping current generation and statistics as we have too many bad results");
        self.state.template = snapshot.template;
        self.state.generation_value = 0;
        let stats = {
            let mut shared = lock_shared(&self.state.shared);
            shared.stats = snapshot.stats;
            shared.stats.clone()
        };
        self.persist_progress(&stats);
        self.print_statistics();
        self.show_generation();
        true
    }

    /// One loop iteration: reload, maybe roll back, mutate, measure.
    pub fn step(&mut self) -> Result<IterationReport, FuzzError> {
        self.reload_configuration();
        self.rollback_if_needed();

        let params = MutationParams::from_descriptor(&self.descriptor, self.max_mutation_size);
        let strategy = self
            .engine
            .choose_strategy(&self.descriptor.tunables, self.corpus.is_some());
        let candidate = match self.engine.mutate(
            strategy,
            &self.state.template,
            &params,
            &self.state.shared,
            self.corpus.as_ref(),
        ) {
            Ok(candidate) => candidate,
            Err(e) => {
                log::warn!("{} mutation failed ({e}), falling back to internal", strategy.name());
                self.engine.mutate(
                    MutationStrategy::Internal,
                    &self.state.template,
                    &params,
                    &self.state.shared,
                    self.corpus.as_ref(),
                )?
            }
        };
        self.state.iteration += 1;
        self.evaluate(candidate)
    }

    /// Measures `candidate` once and applies the result to the search state.
    pub fn evaluate(&mut self, candidate: Candidate) -> Result<IterationReport, FuzzError> {
        let descriptor = self.descriptor.clone();
        let non_uniques = descriptor.tunables.non_uniques;

        // The scratch file is deleted when `scratch` drops at the end of
        // this function, whatever happened in between.
        let mut scratch = tempfile::Builder::new()
            .prefix("bcf")
            .suffix(&descriptor.extension)
            .tempfile()
            .map_err(FuzzError::Scratch)?;
        log::debug!("Creating temporary file {}", scratch.path().display());
        scratch
            .write_all(&candidate.data)
            .and_then(|_| scratch.flush())
            .map_err(FuzzError::Scratch)?;

        log::debug!("Performing code coverage...");
        let command_line = descriptor.command_line(scratch.path());
        let sample = measure_with_hooks(&self.oracle, &descriptor, &command_line, &self.cancel);
        let coverage = sample.metric(non_uniques);

        if self.cancel.is_cancelled() {
            return Ok(IterationReport {
                verdict: None,
                coverage,
                strategy: candidate.strategy,
                bug: None,
                poc: None,
            });
        }

        let verdict = lock_shared(&self.state.shared).stats.classify(coverage);
        match verdict {
            Verdict::Improved => self.accept(&candidate, &sample, coverage, scratch.path()),
            Verdict::Regressed => {
                let mut shared = lock_shared(&self.state.shared);
                log::debug!(
                    "Bad metric found: minimum basic block(s) {}, current test-case basic block(s) {}",
                    shared.stats.min,
                    coverage
                );
                shared.discards.insert(candidate.discard_record());
                drop(shared);
                self.state.generation_value -= REGRESSION_PENALTY;
            }
            Verdict::Neutral => {
                let mut shared = lock_shared(&self.state.shared);
                log::debug!(
                    "Uninteresting data with current test-case: min {}, max {}, current {}",
                    shared.stats.min,
                    shared.stats.max,
                    coverage
                );
                shared.discards.insert(candidate.discard_record());
                drop(shared);
                self.state.generation_value -= NEUTRAL_PENALTY;
            }
        }

        let bug = self.bug_oracle.examine(&candidate, &sample);
        let mut poc = None;
        if let Some(report) = &bug {
            self.state.generation_value += descriptor.tunables.generation_bottom_level.abs();
            log::info!(
                "*** Found a BUG, caught signal {} ({}), hurra!",
                report.exit_code,
                report.signal_name
            );
            match self.crashes.persist(&candidate, report) {
                Ok(files) => poc = Some(files),
                Err(e) => log::error!("Failed to persist proof of concept: {e}"),
            }
            self.state.bugs += 1;
        }

        log::debug!("Removing test-case {}", scratch.path().display());
        Ok(IterationReport {
            verdict: Some(verdict),
            coverage,
            strategy: candidate.strategy,
            bug,
            poc,
        })
    }

    fn accept(&mut self, candidate: &Candidate, sample: &CoverageSample, coverage: u64, scratch: &Path) {
        let (old_stats, grow_corpus) = {
            let mut shared = lock_shared(&self.state.shared);
            let mut grow_corpus = false;
            if shared.stats.has_unseen_blocks(&sample.blocks) {
                // Only the very first discovery feeds the corpus.
                grow_corpus = shared.stats.seen_blocks.is_empty();
                shared.stats.absorb_blocks(&sample.blocks);
            }
            if self.descriptor.tunables.iterative {
                shared.cursor.next_position();
            }
            (shared.stats.clone(), grow_corpus)
        };

        if grow_corpus {
            if let Some(corpus) = &self.corpus {
                log::info!("=+= Found yet unseen basic block! Saving to templates.");
                if let Err(e) = corpus.admit(scratch) {
                    log::warn!("Failed to grow corpus: {e}");
                }
            }
        }

        if candidate.strategy == MutationStrategy::External {
            log::info!(
                "GOOD! Found an interesting change! Covered basic blocks {}, original maximum {}",
                coverage,
                old_stats.max
            );
        } else {
            log::info!(
                "GOOD! Found an interesting change at 0x{:x}! Covered basic blocks {}, original maximum {}",
                candidate.offset,
                coverage,
                old_stats.max
            );
        }

        self.state.generation_value += (coverage - old_stats.max) as i64;
        let superseded = std::mem::replace(&mut self.state.template, candidate.data.clone());
        log::debug!("Saving old generation ({})", sha1_hex(&superseded));
        self.state
            .history
            .push(superseded, old_stats.clone(), self.state.generation_value);
        self.state.generation_value = 0;

        if self.descriptor.save_generations {
            if let Err(e) = self
                .artifacts
                .write_generation(&self.descriptor.extension, &candidate.data)
            {
                log::warn!("Failed to write generation file: {e}");
            }
        }

        let stats = {
            let mut shared = lock_shared(&self.state.shared);
            shared.stats.rebase(old_stats.max, coverage);
            shared.stats.clone()
        };
        log::info!("New statistics: {stats}");
        self.persist_progress(&stats);
    }

    /// Writes the state file and the current-state snapshot.
    fn persist_progress(&self, stats: &RunningStatistics) {
        if let Some(path) = &self.descriptor.state_file {
            if let Err(e) = StateFile::new(path).save(stats) {
                log::warn!("Failed to write state file: {e}");
            }
        }
        if let Err(e) = self.artifacts.write_current_state(
            &self.descriptor.current_state_file,
            &self.descriptor.extension,
            &self.state.template,
        ) {
            log::warn!("Failed to write current state: {e}");
        }
    }

    /// Runs the loop until `max_iterations` (0 = forever) or cancellation and
    /// returns the best template found.
    pub fn run(&mut self, max_iterations: u64) -> Result<FuzzOutcome, FuzzError> {
        if !self.bootstrapped {
            self.bootstrap()?;
        }
        if max_iterations != 0 {
            log::info!("Maximizing file in {max_iterations} iteration(s)");
        } else {
            log::info!("Fuzzing...");
        }

        let mut done = 0u64;
        while !self.cancel.is_cancelled() && (max_iterations == 0 || done < max_iterations) {
            self.step()?;
            done += 1;
            if (done % 10 == 0 && max_iterations != 0) || done % 100 == 0 {
                self.show_generation();
                self.print_statistics();
            }
        }

        Ok(FuzzOutcome {
            template: self.state.template.clone(),
            stats: self.stats(),
            original_stats: self.state.original_stats.clone(),
            bugs: self.state.bugs,
            iterations: done,
            cancelled: self.cancel.is_cancelled(),
        })
    }

    fn print_statistics(&self) {
        let stats = self.stats();
        log::info!(
            "Statistics: Min {}, Max {}, Avg {:.6}, Bugs {}",
            stats.min,
            stats.max,
            stats.avg,
            self.state.bugs
        );
    }

    fn show_generation(&self) {
        log::info!(
            "Iteration {}, current generation value {}, total generation(s) preserved {}",
            self.state.iteration,
            self.state.generation_value,
            self.state.history.len()
        );
    }
}

/// One measured run wrapped in the target's pre/post/cleanup hooks. Oracle
/// failures count as zero coverage so the campaign keeps going.
fn measure_with_hooks<O: CoverageOracle + ?Sized>(
    oracle: &O,
    descriptor: &TargetDescriptor,
    command_line: &str,
    cancel: &CancelToken,
) -> CoverageSample {
    let hook = |kind: &str, line: &str| {
        run_hook(kind, line, &descriptor.environment, descriptor.timeout, cancel)
    };
    if let Some(pre) = &descriptor.pre_command {
        hook("pre", pre);
    }
    let request = MeasureRequest {
        command_line,
        timeout: descriptor.timeout,
        hide_output: descriptor.hide_output,
        envs: &descriptor.environment,
    };
    let sample = oracle.measure(&request).unwrap_or_else(|e| {
        log::warn!("Measurement failed, counting it as zero coverage: {e}");
        CoverageSample::zero()
    });
    if let Some(post) = &descriptor.post_command {
        hook("post", post);
    }
    if let Some(cleanup) = &descriptor.cleanup_command {
        hook("cleanup", cleanup);
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstrumentationKind, InstrumentationTool};
    use crate::coverage::MeasurementError;
    use crate::crash::CrashPersister;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    /// Reads the test case named by the last token of the command line and
    /// scores it with `score`.
    struct StubOracle<F> {
        score: F,
        calls: AtomicUsize,
    }

    impl<F> StubOracle<F>
    where
        F: Fn(&[u8]) -> CoverageSample + Send + Sync,
    {
        fn new(score: F) -> Self {
            Self {
                score,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl<F> CoverageOracle for StubOracle<F>
    where
        F: Fn(&[u8]) -> CoverageSample + Send + Sync,
    {
        fn measure(&self, request: &MeasureRequest<'_>) -> Result<CoverageSample, MeasurementError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let data = read_case(request)?;
            Ok((self.score)(&data))
        }
    }

    /// Measures the seed fine and loses the trace of everything else.
    struct LossyOracle {
        seed: Vec<u8>,
    }

    impl CoverageOracle for LossyOracle {
        fn measure(&self, request: &MeasureRequest<'_>) -> Result<CoverageSample, MeasurementError> {
            if read_case(request)? == self.seed {
                Ok(blocks(10))
            } else {
                Err(std::io::Error::other("trace lost").into())
            }
        }
    }

    fn read_case(request: &MeasureRequest<'_>) -> std::io::Result<Vec<u8>> {
        let path = request
            .command_line
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .trim_matches('"');
        fs::read(path)
    }

    fn blocks(count: u64) -> CoverageSample {
        CoverageSample {
            basic_block_count: count,
            unique_basic_block_count: count,
            ..CoverageSample::zero()
        }
    }

    struct Workspace {
        dir: TempDir,
        seed: PathBuf,
        out: PathBuf,
    }

    impl Workspace {
        fn new(seed: &[u8]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let seed_path = dir.path().join("seed.bin");
            fs::write(&seed_path, seed).unwrap();
            let out = dir.path().join("out");
            Self {
                seed: seed_path,
                out,
                dir,
            }
        }

        fn descriptor(&self) -> TargetDescriptor {
            let tool = InstrumentationTool {
                kind: InstrumentationKind::DynamoRio,
                path: PathBuf::from("/nonexistent"),
            };
            let mut descriptor = TargetDescriptor::new("target {}", ".bin", tool);
            descriptor.state_file = Some(self.dir.path().join("state.json"));
            descriptor.tunables.metrics = 4;
            descriptor.tunables.skip_bytes = 0;
            descriptor.tunables.max_mutation_size = Some(4);
            descriptor.tunables.seed = Some(7);
            descriptor
        }

        fn fuzzer<O: CoverageOracle>(&self, descriptor: TargetDescriptor, oracle: O) -> BlindCoverageFuzzer<O> {
            self.fuzzer_with_cancel(descriptor, oracle, CancelToken::new())
        }

        fn fuzzer_with_cancel<O: CoverageOracle>(
            &self,
            descriptor: TargetDescriptor,
            oracle: O,
            cancel: CancelToken,
        ) -> BlindCoverageFuzzer<O> {
            let options = FuzzerOptions {
                seed_path: self.seed.clone(),
                out_dir: self.out.clone(),
                pool_size: Some(2),
            };
            BlindCoverageFuzzer::new(oracle, Box::new(descriptor), options, cancel).unwrap()
        }
    }

    fn byte_four_is_b(data: &[u8]) -> CoverageSample {
        if data.get(4) == Some(&b'B') { blocks(15) } else { blocks(10) }
    }

    #[test]
    fn bootstrap_samples_the_seed_and_saves_state() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));

        assert!(!fuzzer.bootstrap().unwrap());
        assert_eq!(fuzzer.oracle.calls.load(Ordering::SeqCst), 4);
        let stats = fuzzer.stats();
        assert_eq!((stats.min, stats.max), (10, 10));
        assert_eq!(stats.avg, 10.0);

        let saved = StateFile::new(ws.dir.path().join("state.json")).load().unwrap();
        assert_eq!((saved.min, saved.max), (10, 10));
    }

    #[test]
    fn metrics_are_raised_to_the_pool_size() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let options = FuzzerOptions {
            seed_path: ws.seed.clone(),
            out_dir: ws.out.clone(),
            pool_size: Some(6),
        };
        let mut fuzzer = BlindCoverageFuzzer::new(
            StubOracle::new(byte_four_is_b),
            Box::new(ws.descriptor()),
            options,
            CancelToken::new(),
        )
        .unwrap();
        fuzzer.bootstrap().unwrap();
        assert_eq!(fuzzer.oracle.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn improving_change_is_accepted() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
        fuzzer.bootstrap().unwrap();

        let candidate = Candidate::patch(fuzzer.template(), 4, b"B".to_vec(), MutationStrategy::Internal);
        let report = fuzzer.evaluate(candidate).unwrap();

        assert_eq!(report.verdict, Some(Verdict::Improved));
        assert_eq!(report.coverage, 15);
        assert!(report.bug.is_none());
        assert_eq!(fuzzer.template(), b"AAAABAAAA");
        let stats = fuzzer.stats();
        assert_eq!((stats.min, stats.max), (10, 15));
        assert_eq!(stats.avg, 12.5);
        assert_eq!(fuzzer.state().history.len(), 1);
        assert_eq!(fuzzer.state().generation_value, 0);

        let snapshot = ws.out.join("current-state.bin");
        assert_eq!(fs::read(snapshot).unwrap(), b"AAAABAAAA");
        let saved = StateFile::new(ws.dir.path().join("state.json")).load().unwrap();
        assert_eq!((saved.min, saved.max), (10, 15));
    }

    #[test]
    fn regressions_and_neutral_results_are_penalized_and_discarded() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let oracle = StubOracle::new(|data: &[u8]| match data.first() {
            Some(b'R') => blocks(5),
            _ => blocks(10),
        });
        let mut fuzzer = ws.fuzzer(ws.descriptor(), oracle);
        fuzzer.bootstrap().unwrap();

        let regress = Candidate::patch(fuzzer.template(), 0, b"R".to_vec(), MutationStrategy::Internal);
        let record = regress.discard_record();
        let report = fuzzer.evaluate(regress).unwrap();
        assert_eq!(report.verdict, Some(Verdict::Regressed));
        assert_eq!(fuzzer.state().generation_value, -3);
        assert!(lock_shared(&fuzzer.state().shared).discards.contains(&record));

        let neutral = Candidate::patch(fuzzer.template(), 1, b"N".to_vec(), MutationStrategy::Internal);
        let report = fuzzer.evaluate(neutral).unwrap();
        assert_eq!(report.verdict, Some(Verdict::Neutral));
        assert_eq!(fuzzer.state().generation_value, -4);
        assert_eq!(lock_shared(&fuzzer.state().shared).discards.len(), 2);
        assert_eq!(fuzzer.template(), b"AAAAAAAAA");
    }

    #[test]
    fn crash_is_persisted_and_rewarded() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let oracle = StubOracle::new(|data: &[u8]| CoverageSample {
            exit_code: if data.first() == Some(&b'X') { 139 } else { 0 },
            ..blocks(10)
        });
        let mut fuzzer = ws.fuzzer(ws.descriptor(), oracle);
        fuzzer.bootstrap().unwrap();

        let candidate = Candidate::patch(fuzzer.template(), 0, b"X".to_vec(), MutationStrategy::Internal);
        let report = fuzzer.evaluate(candidate.clone()).unwrap();
        let bug = report.bug.expect("SIGSEGV is a bug");
        assert_eq!(bug.signal_name, "SIGSEGV");
        let files = report.poc.expect("crash persisted");
        assert!(files.fresh);
        assert_eq!(fuzzer.state().bugs, 1);
        // Neutral penalty, then the crash reward of |floor|.
        assert_eq!(fuzzer.state().generation_value, -1 + 100);

        let poc = ws.out.join(sha1_hex(b"XAAAAAAAA"));
        assert_eq!(fs::read(&poc).unwrap(), b"XAAAAAAAA");
        let expected = CrashPersister::new(&ws.out, &ws.seed).diff_record(0, 1);
        assert_eq!(
            fs::read_to_string(ws.out.join(format!("{}.diff", sha1_hex(b"XAAAAAAAA")))).unwrap(),
            expected
        );

        let again = fuzzer.evaluate(candidate).unwrap();
        assert!(!again.poc.expect("crash persisted").fresh);
        assert_eq!(fuzzer.state().bugs, 2);
        let pocs = fs::read_dir(&ws.out)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&sha1_hex(b"XAAAAAAAA")))
            .count();
        assert_eq!(pocs, 2);
    }

    #[test]
    fn valid_state_file_skips_sampling() {
        let ws = Workspace::new(b"AAAAAAAAA");
        StateFile::new(ws.dir.path().join("state.json"))
            .save(&RunningStatistics::new(3, 7, 5.0))
            .unwrap();

        for _ in 0..2 {
            let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
            assert!(fuzzer.bootstrap().unwrap());
            assert_eq!(fuzzer.oracle.calls.load(Ordering::SeqCst), 0);
            let stats = fuzzer.stats();
            assert_eq!((stats.min, stats.max, stats.avg), (3, 7, 5.0));
        }
    }

    #[test]
    fn resume_restores_the_current_state_snapshot() {
        let ws = Workspace::new(b"AAAAAAAAA");
        {
            let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
            fuzzer.bootstrap().unwrap();
            let candidate = Candidate::patch(fuzzer.template(), 4, b"B".to_vec(), MutationStrategy::Internal);
            fuzzer.evaluate(candidate).unwrap();
        }

        let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
        assert!(fuzzer.bootstrap().unwrap());
        assert_eq!(fuzzer.template(), b"AAAABAAAA");
        assert_eq!(fuzzer.stats().max, 15);
    }

    #[test]
    fn broken_state_file_falls_back_to_sampling() {
        let ws = Workspace::new(b"AAAAAAAAA");
        fs::write(ws.dir.path().join("state.json"), b"{not json").unwrap();
        let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
        assert!(!fuzzer.bootstrap().unwrap());
        assert_eq!(fuzzer.oracle.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn rollback_restores_the_previous_generation() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let mut descriptor = ws.descriptor();
        descriptor.tunables.generation_bottom_level = -5;
        let oracle = StubOracle::new(|data: &[u8]| match data.first() {
            Some(b'R') => blocks(1),
            _ => byte_four_is_b(data),
        });
        let mut fuzzer = ws.fuzzer(descriptor, oracle);
        fuzzer.bootstrap().unwrap();

        let better = Candidate::patch(fuzzer.template(), 4, b"B".to_vec(), MutationStrategy::Internal);
        fuzzer.evaluate(better).unwrap();
        assert!(!fuzzer.rollback_if_needed());

        for _ in 0..2 {
            let worse = Candidate::patch(fuzzer.template(), 0, b"R".to_vec(), MutationStrategy::Internal);
            fuzzer.evaluate(worse).unwrap();
        }
        assert_eq!(fuzzer.state().generation_value, -6);

        assert!(fuzzer.rollback_if_needed());
        assert_eq!(fuzzer.template(), b"AAAAAAAAA");
        let stats = fuzzer.stats();
        assert_eq!((stats.min, stats.max), (10, 10));
        assert!(fuzzer.state().history.is_empty());
        assert_eq!(fuzzer.state().generation_value, 0);

        // Nothing left to restore: the value just keeps sinking.
        for _ in 0..3 {
            let worse = Candidate::patch(fuzzer.template(), 0, b"R".to_vec(), MutationStrategy::Internal);
            fuzzer.evaluate(worse).unwrap();
        }
        assert!(!fuzzer.rollback_if_needed());
        assert_eq!(fuzzer.state().generation_value, -9);
    }

    #[test]
    fn history_keeps_only_the_newest_generations() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let mut descriptor = ws.descriptor();
        descriptor.tunables.max_generations = 2;
        let oracle = StubOracle::new(|data: &[u8]| blocks(data.iter().filter(|b| **b == b'B').count() as u64 + 10));
        let mut fuzzer = ws.fuzzer(descriptor, oracle);
        fuzzer.bootstrap().unwrap();

        for offset in 0..4 {
            let candidate = Candidate::patch(fuzzer.template(), offset, b"B".to_vec(), MutationStrategy::Internal);
            assert_eq!(fuzzer.evaluate(candidate).unwrap().verdict, Some(Verdict::Improved));
        }
        assert_eq!(fuzzer.state().history.len(), 2);
        assert_eq!(fuzzer.template(), b"BBBBAAAAA");
    }

    #[test]
    fn only_the_first_unseen_blocks_grow_the_corpus() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let corpus_dir = ws.dir.path().join("corpus");
        let mut descriptor = ws.descriptor();
        descriptor.corpus_path = Some(corpus_dir.clone());
        descriptor.save_generations = true;
        let oracle = StubOracle::new(|data: &[u8]| {
            let found: HashSet<String> = data
                .iter()
                .enumerate()
                .filter(|(_, b)| **b == b'B')
                .map(|(i, _)| format!("block_{i}"))
                .collect();
            CoverageSample {
                blocks: found.clone(),
                ..blocks(10 + found.len() as u64)
            }
        });
        let mut fuzzer = ws.fuzzer(descriptor, oracle);
        fuzzer.bootstrap().unwrap();

        for offset in [2, 6] {
            let candidate = Candidate::patch(fuzzer.template(), offset, b"B".to_vec(), MutationStrategy::Internal);
            fuzzer.evaluate(candidate).unwrap();
        }

        assert_eq!(CorpusPool::open(&corpus_dir).unwrap().len().unwrap(), 1);
        let shared = lock_shared(&fuzzer.state().shared);
        assert!(shared.stats.seen_blocks.contains("block_2"));
        assert!(shared.stats.seen_blocks.contains("block_6"));
        drop(shared);

        let generations = fs::read_dir(&ws.out)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("generation_"))
            .count();
        assert_eq!(generations, 2);
    }

    #[test]
    fn iterative_run_sweeps_bytes_in_order() {
        let ws = Workspace::new(b"AAAA");
        let mut descriptor = ws.descriptor();
        descriptor.tunables.iterative = true;
        descriptor.tunables.generation_bottom_level = -1000;
        let oracle = StubOracle::new(|data: &[u8]| blocks(data.iter().filter(|b| **b == b'B').count() as u64 + 10));
        let mut fuzzer = ws.fuzzer(descriptor, oracle);

        let outcome = fuzzer.run(100).unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(outcome.iterations, 100);
        // Byte 0 reaches b'B' on iteration 67; byte 1 only gets through 33
        // values afterwards.
        assert_eq!(outcome.template, b"BAAA");
        assert!(outcome.maximized());
        assert_eq!((outcome.stats.min, outcome.stats.max), (10, 11));
        assert_eq!(outcome.original_stats.max, 10);
    }

    #[test]
    fn cancelled_run_stops_before_the_first_iteration() {
        let ws = Workspace::new(b"AAAA");
        let options = FuzzerOptions {
            seed_path: ws.seed.clone(),
            out_dir: ws.out.clone(),
            pool_size: Some(2),
        };
        let cancel = CancelToken::new();
        let mut fuzzer = BlindCoverageFuzzer::new(
            StubOracle::new(byte_four_is_b),
            Box::new(ws.descriptor()),
            options,
            cancel.clone(),
        )
        .unwrap();
        cancel.cancel();

        let outcome = fuzzer.run(0).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.template, b"AAAA");
        assert!(!outcome.maximized());
    }

    #[test]
    fn missing_seed_is_fatal() {
        let ws = Workspace::new(b"AAAA");
        let options = FuzzerOptions {
            seed_path: ws.dir.path().join("missing.bin"),
            out_dir: ws.out.clone(),
            pool_size: Some(1),
        };
        let result = BlindCoverageFuzzer::new(
            StubOracle::new(byte_four_is_b),
            Box::new(ws.descriptor()),
            options,
            CancelToken::new(),
        );
        assert!(matches!(result, Err(FuzzError::Seed { .. })));
    }
    #[test]
    fn cancelled_sampling_leaves_no_state_file() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut fuzzer = ws.fuzzer_with_cancel(ws.descriptor(), StubOracle::new(byte_four_is_b), cancel);

        let outcome = fuzzer.run(0).unwrap();
        assert!(outcome.cancelled);
        assert!(!ws.dir.path().join("state.json").exists());

        let mut next = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
        assert!(!next.bootstrap().unwrap());
        assert_eq!(next.oracle.calls.load(Ordering::SeqCst), 4);
        assert_eq!(next.stats().max, 10);
    }

    #[test]
    fn failed_measurement_counts_as_zero_coverage() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let mut descriptor = ws.descriptor();
        descriptor.tunables.strategy_weights = [1, 0, 0, 0];
        let mut fuzzer = ws.fuzzer(descriptor, LossyOracle { seed: b"AAAAAAAAA".to_vec() });
        fuzzer.bootstrap().unwrap();
        assert_eq!(fuzzer.stats().max, 10);

        let candidate = Candidate::patch(fuzzer.template(), 2, b"Z".to_vec(), MutationStrategy::Internal);
        let report = fuzzer.evaluate(candidate).unwrap();
        assert_eq!(report.verdict, Some(Verdict::Regressed));
        assert_eq!(report.coverage, 0);
        assert_eq!(fuzzer.state().generation_value, -3);

        let outcome = fuzzer.run(5).unwrap();
        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.template, b"AAAAAAAAA");
        assert_eq!(outcome.stats.max, 10);
    }

    #[test]
    fn hooks_run_around_every_measurement() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let log = ws.dir.path().join("hooks.log");
        let mut descriptor = ws.descriptor();
        descriptor.pre_command = Some(format!("echo pre >> {}", log.display()));
        descriptor.post_command = Some(format!("echo post >> {}", log.display()));
        descriptor.cleanup_command = Some(format!("echo cleanup >> {}", log.display()));
        let mut fuzzer = ws.fuzzer(descriptor, StubOracle::new(byte_four_is_b));
        fuzzer.bootstrap().unwrap();

        let candidate = Candidate::patch(fuzzer.template(), 4, b"B".to_vec(), MutationStrategy::Internal);
        fuzzer.evaluate(candidate).unwrap();

        let lines: Vec<String> = fs::read_to_string(&log).unwrap().lines().map(str::to_string).collect();
        // Four bootstrap samples plus one evaluation.
        for kind in ["pre", "post", "cleanup"] {
            assert_eq!(lines.iter().filter(|l| *l == kind).count(), 5, "{kind}");
        }
        assert_eq!(lines.last().map(String::as_str), Some("cleanup"));
    }

    #[test]
    fn measurement_cut_short_by_cancellation_is_not_scored() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let oracle = StubOracle::new(move |data: &[u8]| {
            if data.first() == Some(&b'C') {
                trigger.cancel();
                return blocks(1);
            }
            blocks(10)
        });
        let mut fuzzer = ws.fuzzer_with_cancel(ws.descriptor(), oracle, cancel);
        fuzzer.bootstrap().unwrap();

        let candidate = Candidate::patch(fuzzer.template(), 0, b"C".to_vec(), MutationStrategy::Internal);
        let report = fuzzer.evaluate(candidate).unwrap();
        assert_eq!(report.verdict, None);
        assert_eq!(fuzzer.state().generation_value, 0);
        assert!(lock_shared(&fuzzer.state().shared).discards.is_empty());
        assert_eq!(fuzzer.template(), b"AAAAAAAAA");
        assert_eq!(fuzzer.stats().min, 10);
    }

    #[test]
    fn drawn_iterative_change_keeps_the_sweep_position() {
        let ws = Workspace::new(b"AAAAAAAAA");
        let mut fuzzer = ws.fuzzer(ws.descriptor(), StubOracle::new(byte_four_is_b));
        fuzzer.bootstrap().unwrap();

        let candidate = Candidate::patch(fuzzer.template(), 4, b"B".to_vec(), MutationStrategy::Iterative);
        assert_eq!(fuzzer.evaluate(candidate).unwrap().verdict, Some(Verdict::Improved));
        let cursor = lock_shared(&fuzzer.state().shared).cursor;
        assert_eq!((cursor.iteration, cursor.iteration_char), (0, 0));
    }
}
