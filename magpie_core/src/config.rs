use crate::executor::DEFAULT_COVERAGE_ENV;
use crate::minimizer::DEFAULT_MAX_ROUNDS;
use crate::mutator::DEFAULT_MAX_INPUT_LEN;
use crate::scheduler::{DEFAULT_DECAY_FACTOR, DEFAULT_REWARD_FACTOR};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandExecutorSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_coverage_env")]
    pub coverage_env: String,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_coverage_env() -> String {
    DEFAULT_COVERAGE_ENV.to_string()
}

impl Default for CommandExecutorSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input_delivery: ConfigInputDelivery::default(),
            timeout_ms: default_timeout_ms(),
            working_dir: None,
            coverage_env: default_coverage_env(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorType {
    InProcess,
    #[default]
    Command,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub command_settings: Option<CommandExecutorSettings>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusType {
    InMemory,
    #[default]
    OnDisk,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default)]
    pub corpus_type: CorpusType,
    /// Files and/or directories holding initial seed payloads. Every seed
    /// is dry-run through the executor before entering the store.
    pub initial_seed_paths: Option<Vec<PathBuf>>,
    #[serde(default = "default_corpus_dir")]
    pub dir: PathBuf,
}

pub fn default_corpus_dir() -> PathBuf {
    PathBuf::from("./.magpie_corpus")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            corpus_type: CorpusType::default(),
            initial_seed_paths: None,
            dir: default_corpus_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerType {
    #[default]
    WeightedEnergy,
    Random,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub scheduler_type: SchedulerType,
    #[serde(default = "default_reward_factor")]
    pub reward_factor: f64,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
}

fn default_reward_factor() -> f64 {
    DEFAULT_REWARD_FACTOR
}
fn default_decay_factor() -> f64 {
    DEFAULT_DECAY_FACTOR
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::default(),
            reward_factor: default_reward_factor(),
            decay_factor: default_decay_factor(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutatorConfig {
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
}

fn default_max_input_len() -> usize {
    DEFAULT_MAX_INPUT_LEN
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            max_input_len: default_max_input_len(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizerConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Also minimize coverage-novel non-crash inputs before storing them.
    /// Costs extra executions per discovery; disable for raw throughput.
    #[serde(default = "default_minimize_additions")]
    pub minimize_additions: bool,
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}
fn default_minimize_additions() -> bool {
    true
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            minimize_additions: default_minimize_additions(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

pub fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("./magpie_artifacts")
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Master seed; worker RNGs are derived from it, so a fixed seed plus a
    /// single worker replays a session.
    #[serde(default)]
    pub master_seed: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Each worker rescans the corpus directory for externally dropped
    /// seed files every this many of its iterations. 0 disables rescans
    /// (the startup scan still runs).
    #[serde(default = "default_external_scan_interval")]
    pub external_scan_interval: u64,
}

pub fn default_iterations() -> u64 {
    1_000_000
}
pub fn default_workers() -> usize {
    1
}
fn default_stats_interval_secs() -> u64 {
    10
}
fn default_external_scan_interval() -> u64 {
    128
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            workers: default_workers(),
            master_seed: 0,
            stats_interval_secs: default_stats_interval_secs(),
            external_scan_interval: default_external_scan_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MagpieConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mutator: MutatorConfig,
    #[serde(default)]
    pub minimizer: MinimizerConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

impl MagpieConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: MagpieConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
