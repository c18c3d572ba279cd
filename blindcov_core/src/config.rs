use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Placeholder replaced by the candidate path in a target `command`.
pub const INPUT_PLACEHOLDER: &str = "{}";

const BCF_TABLE: &str = "bcf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration for section '{section}': {}", .problems.join("; "))]
    Invalid {
        section: String,
        problems: Vec<String>,
    },
}

/// Block-trace backend the coverage oracle drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationKind {
    DynamoRio,
    Pin,
}

impl InstrumentationKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "DynamoRIO" => Some(InstrumentationKind::DynamoRio),
            "Pin" => Some(InstrumentationKind::Pin),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstrumentationKind::DynamoRio => "DynamoRIO",
            InstrumentationKind::Pin => "Pin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationTool {
    pub kind: InstrumentationKind,
    pub path: PathBuf,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct BcfSettings {
    bininst_tool: Option<String>,
    templates_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
struct ToolSettings {
    path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct TargetSettings {
    command: Option<String>,
    extension: Option<String>,
    pre_command: Option<String>,
    post_command: Option<String>,
    cleanup_command: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    timeout: u64,
    #[serde(default = "default_true")]
    hide_output: bool,
    #[serde(default = "default_skip_bytes")]
    skip_bytes: usize,
    max_mutation_size: Option<usize>,
    #[serde(default = "default_max_mutation_retries")]
    max_mutation_retries: usize,
    #[serde(default = "default_generation_bottom_level")]
    generation_bottom_level: i64,
    #[serde(default = "default_max_generations")]
    max_generations: usize,
    #[serde(default = "default_metrics")]
    metrics: usize,
    #[serde(default)]
    non_uniques: bool,
    #[serde(default)]
    iterative: bool,
    #[serde(default)]
    radamsa: bool,
    #[serde(default = "default_external_mutator")]
    external_mutator: String,
    #[serde(default = "default_strategy_weights")]
    strategy_weights: Vec<u32>,
    state_file: Option<PathBuf>,
    #[serde(default = "default_current_state_file")]
    current_state_file: String,
    #[serde(default)]
    save_generations: bool,
    seed: Option<u64>,
}

fn default_timeout_secs() -> u64 {
    90
}
fn default_true() -> bool {
    true
}
fn default_skip_bytes() -> usize {
    4
}
fn default_max_mutation_retries() -> usize {
    64
}
fn default_generation_bottom_level() -> i64 {
    -100
}
fn default_max_generations() -> usize {
    10
}
fn default_metrics() -> usize {
    10
}
fn default_external_mutator() -> String {
    "radamsa".to_string()
}
fn default_strategy_weights() -> Vec<u32> {
    vec![1, 1, 1, 1]
}
fn default_current_state_file() -> String {
    "current-state".to_string()
}

/// Knobs of the search itself, reloaded with the rest of the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTunables {
    /// `None` lets the fuzzer pick a size in `1..=8` once at startup.
    pub max_mutation_size: Option<usize>,
    pub max_mutation_retries: usize,
    pub skip_bytes: usize,
    /// Rollback floor: a generation value below this triggers a rollback.
    pub generation_bottom_level: i64,
    pub max_generations: usize,
    pub metrics: usize,
    pub non_uniques: bool,
    pub iterative: bool,
    pub external: bool,
    pub external_mutator: String,
    /// Weights for internal, splice, iterative and external, in that order.
    pub strategy_weights: [u32; 4],
    pub seed: Option<u64>,
}

impl Default for SearchTunables {
    fn default() -> Self {
        Self {
            max_mutation_size: None,
            max_mutation_retries: default_max_mutation_retries(),
            skip_bytes: default_skip_bytes(),
            generation_bottom_level: default_generation_bottom_level(),
            max_generations: default_max_generations(),
            metrics: default_metrics(),
            non_uniques: false,
            iterative: false,
            external: false,
            external_mutator: default_external_mutator(),
            strategy_weights: [1, 1, 1, 1],
            seed: None,
        }
    }
}

/// Everything the fuzzer knows about one target section.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDescriptor {
    pub command: String,
    pub extension: String,
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    pub cleanup_command: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub timeout: Duration,
    pub hide_output: bool,
    pub tool: InstrumentationTool,
    pub corpus_path: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub current_state_file: String,
    pub save_generations: bool,
    pub tunables: SearchTunables,
}

impl TargetDescriptor {
    /// Descriptor with every optional key at its default.
    pub fn new(command: impl Into<String>, extension: impl Into<String>, tool: InstrumentationTool) -> Self {
        Self {
            command: command.into(),
            extension: extension.into(),
            pre_command: None,
            post_command: None,
            cleanup_command: None,
            environment: BTreeMap::new(),
            timeout: Duration::from_secs(default_timeout_secs()),
            hide_output: true,
            tool,
            corpus_path: None,
            state_file: None,
            current_state_file: default_current_state_file(),
            save_generations: false,
            tunables: SearchTunables::default(),
        }
    }

    pub fn load_from_file(path: &Path, section: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_with_origin(&content, section, path)
    }

    pub fn from_toml_str(content: &str, section: &str) -> Result<Self, ConfigError> {
        Self::parse_with_origin(content, section, Path::new("<inline>"))
    }

    fn parse_with_origin(content: &str, section: &str, origin: &Path) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

        let mut problems = Vec::new();

        let bcf: BcfSettings = read_table(&table, BCF_TABLE, &mut problems).unwrap_or_default();

        let tool = match &bcf.bininst_tool {
            None => {
                problems.push(format!("[{BCF_TABLE}] missing required key 'bininst-tool'"));
                None
            }
            Some(name) => {
                let kind = InstrumentationKind::from_name(name);
                if kind.is_none() {
                    problems.push(format!(
                        "[{BCF_TABLE}] unknown bininst-tool '{name}' (expected 'DynamoRIO' or 'Pin')"
                    ));
                }
                let tool_path = read_table::<ToolSettings>(&table, name, &mut problems)
                    .and_then(|settings| {
                        if settings.path.is_none() {
                            problems.push(format!("[{name}] missing required key 'path'"));
                        }
                        settings.path
                    });
                kind.zip(tool_path)
                    .map(|(kind, path)| InstrumentationTool { kind, path })
            }
        };

        let target: TargetSettings = read_table(&table, section, &mut problems).unwrap_or_default();
        if table.contains_key(section) {
            if target.command.is_none() {
                problems.push(format!("[{section}] missing required key 'command'"));
            }
            if target.extension.is_none() {
                problems.push(format!("[{section}] missing required key 'extension'"));
            }
            if target.timeout == 0 {
                problems.push(format!("[{section}] 'timeout' must be greater than 0"));
            }
            if target.max_generations == 0 {
                problems.push(format!("[{section}] 'max-generations' must be greater than 0"));
            }
            if target.metrics == 0 {
                problems.push(format!("[{section}] 'metrics' must be greater than 0"));
            }
            if target.generation_bottom_level >= 0 {
                problems.push(format!("[{section}] 'generation-bottom-level' must be negative"));
            }
            if target.max_mutation_size == Some(0) {
                problems.push(format!("[{section}] 'max-mutation-size' must be greater than 0"));
            }
            if target.strategy_weights.len() != 4 {
                problems.push(format!(
                    "[{section}] 'strategy-weights' needs exactly 4 entries, got {}",
                    target.strategy_weights.len()
                ));
            } else if target.strategy_weights.iter().all(|w| *w == 0) {
                problems.push(format!("[{section}] 'strategy-weights' cannot all be zero"));
            }
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                problems,
            });
        }

        // Every `None` below was reported as a problem above.
        let (Some(tool), Some(command), Some(extension)) = (tool, target.command, target.extension)
        else {
            return Err(ConfigError::Invalid {
                section: section.to_string(),
                problems: vec!["incomplete target description".to_string()],
            });
        };
        let mut weights = [0u32; 4];
        weights.copy_from_slice(&target.strategy_weights);

        Ok(Self {
            command,
            extension,
            pre_command: target.pre_command,
            post_command: target.post_command,
            cleanup_command: target.cleanup_command,
            environment: target.environment,
            timeout: Duration::from_secs(target.timeout),
            hide_output: target.hide_output,
            tool,
            corpus_path: bcf.templates_path,
            state_file: target.state_file,
            current_state_file: target.current_state_file,
            save_generations: target.save_generations,
            tunables: SearchTunables {
                max_mutation_size: target.max_mutation_size,
                max_mutation_retries: target.max_mutation_retries,
                skip_bytes: target.skip_bytes,
                generation_bottom_level: target.generation_bottom_level,
                max_generations: target.max_generations,
                metrics: target.metrics,
                non_uniques: target.non_uniques,
                iterative: target.iterative,
                external: target.radamsa,
                external_mutator: target.external_mutator,
                strategy_weights: weights,
                seed: target.seed,
            },
        })
    }

    /// Target command with `input` substituted for `{}`, or appended when the
    /// command carries no placeholder.
    pub fn command_line(&self, input: &Path) -> String {
        let quoted = shell_path(input);
        if self.command.contains(INPUT_PLACEHOLDER) {
            self.command.replace(INPUT_PLACEHOLDER, &quoted)
        } else {
            format!("{} {}", self.command, quoted)
        }
    }
}

/// `path` as a shell word, double-quoted when it contains whitespace.
pub fn shell_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if raw.contains(char::is_whitespace) && !raw.starts_with('"') {
        format!("\"{raw}\"")
    } else {
        raw.into_owned()
    }
}

fn read_table<T>(table: &toml::Table, name: &str, problems: &mut Vec<String>) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    match table.get(name) {
        None => {
            problems.push(format!("missing table [{name}]"));
            None
        }
        Some(value) => match value.clone().try_into::<T>() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                problems.push(format!("[{name}] {}", e.message().trim()));
                None
            }
        },
    }
}

/// Where the orchestrator gets a fresh descriptor at the top of every iteration.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<TargetDescriptor, ConfigError>;
}

/// Re-reads one section of a TOML file on every call.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
    section: String,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>, section: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            section: section.into(),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<TargetDescriptor, ConfigError> {
        TargetDescriptor::load_from_file(&self.path, &self.section)
    }
}

impl ConfigSource for TargetDescriptor {
    fn load(&self) -> Result<TargetDescriptor, ConfigError> {
        Ok(self.clone())
    }
}
