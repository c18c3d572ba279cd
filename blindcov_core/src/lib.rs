pub mod cancel;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod crash;
pub mod digest;
pub mod executor;
pub mod fuzzer;
pub mod generation;
pub mod mutator;
pub mod persist;
pub mod state;
pub mod stats;

pub use cancel::CancelToken;
pub use config::{ConfigError, ConfigSource, FileConfigSource, SearchTunables, TargetDescriptor};
pub use corpus::{CorpusError, CorpusPool};
pub use coverage::{Arch, BinInstOracle, CoverageOracle, CoverageSample, MeasurementError};
pub use crash::{BugOracle, BugReport, CrashPersister, FatalSignalOracle};
pub use digest::sha1_hex;
pub use executor::{CommandExecutor, ExecutionStatus};
pub use fuzzer::{BlindCoverageFuzzer, FuzzError, FuzzOutcome, FuzzerOptions};
pub use generation::{GenerationHistory, GenerationSnapshot};
pub use mutator::{Candidate, MutationEngine, MutationError, MutationStrategy};
pub use persist::{ArtifactWriter, PersistError};
pub use stats::{ResumeError, RunningStatistics, StateFile, Verdict};
