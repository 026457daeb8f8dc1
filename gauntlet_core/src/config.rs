use crate::coverage::DEFAULT_MAP_SIZE;
use crate::executor::{CommandExecutorConfig, InputDelivery};
use crate::feedback::FeedbackConfig;
use crate::mutator::engine::{DEFAULT_MAX_MUTATIONS, DEFAULT_MUTATION_PROBABILITY};
use crate::mutator::{MutationError, MutationStrategy, MutatorEngine, default_registry};
use crate::random::SharedRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

impl From<&ConfigInputDelivery> for InputDelivery {
    fn from(delivery: &ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template } => InputDelivery::File(template.clone()),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandExecutorSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_exec_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_exec_timeout_ms() -> u64 {
    2000
}

impl CommandExecutorSettings {
    pub fn to_command_config(&self) -> CommandExecutorConfig {
        CommandExecutorConfig {
            command: self.command.clone(),
            input_delivery: (&self.input_delivery).into(),
            timeout: Duration::from_millis(self.timeout_ms),
            working_dir: self.working_dir.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorType {
    #[default]
    InProcess,
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

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// On-disk corpus root. Without it the corpus lives in memory.
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
    /// Interval of the background pruner; `0` disables it.
    #[serde(default)]
    pub minimize_interval_secs: u64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    Weighted,
    Random,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerKind,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationSettings {
    #[serde(default)]
    pub strategy: MutationStrategy,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default = "default_max_mutations")]
    pub max_mutations: usize,
    #[serde(default)]
    pub chain: bool,
    pub enabled: Option<Vec<String>>,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

fn default_probability() -> f64 {
    DEFAULT_MUTATION_PROBABILITY
}

fn default_max_mutations() -> usize {
    DEFAULT_MAX_MUTATIONS
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            strategy: MutationStrategy::default(),
            probability: default_probability(),
            max_mutations: default_max_mutations(),
            chain: false,
            enabled: None,
            weights: HashMap::new(),
        }
    }
}

impl MutationSettings {
    /// Engine over the full default registry, restricted to `enabled` when set.
    pub fn build_engine(&self, rng: &SharedRandom) -> Result<MutatorEngine, MutationError> {
        let engine = MutatorEngine::new(default_registry(rng), rng.clone())
            .with_strategy(self.strategy)
            .with_probability(self.probability)
            .with_max_mutations(self.max_mutations)
            .with_weights(self.weights.clone());
        match &self.enabled {
            Some(names) => engine.with_active_mutators(names.as_slice()),
            None => Ok(engine),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_max_executions")]
    pub max_executions: u64,
    /// Campaign budget; `0` means unlimited.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_bitmap_size")]
    pub bitmap_size: usize,
    #[serde(default = "default_mutations_per_seed")]
    pub mutations_per_seed: usize,
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
    #[serde(default)]
    pub min_input_size: usize,
    /// Fixes every random choice for a reproducible campaign.
    pub seed: Option<u64>,
}

pub fn default_max_executions() -> u64 {
    100_000
}

fn default_bitmap_size() -> usize {
    DEFAULT_MAP_SIZE
}

fn default_mutations_per_seed() -> usize {
    16
}

fn default_max_input_size() -> usize {
    1 << 20
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_executions: default_max_executions(),
            timeout_ms: 0,
            bitmap_size: default_bitmap_size(),
            mutations_per_seed: default_mutations_per_seed(),
            max_input_size: default_max_input_size(),
            min_input_size: 0,
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GauntletConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub mutation: MutationSettings,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl GauntletConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_feedback_config(&self) -> FeedbackConfig {
        let fuzzer = &self.fuzzer;
        FeedbackConfig {
            max_executions: fuzzer.max_executions,
            timeout: (fuzzer.timeout_ms > 0).then(|| Duration::from_millis(fuzzer.timeout_ms)),
            bitmap_size: fuzzer.bitmap_size,
            mutations_per_seed: fuzzer.mutations_per_seed,
            max_input_size: fuzzer.max_input_size,
            min_input_size: fuzzer.min_input_size,
        }
    }
}
