//! Configuration for training runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! `ccnet.toml` (or an explicit file) -> `CCNET_` environment -> explicit overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-level configuration file.
pub const CONFIG_FILE_NAME: &str = "ccnet.toml";

/// Default number of steps between saves into the permanent model directory.
pub const DEFAULT_SAVE_INTERVAL: usize = 1000;

/// Top-level configuration of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Iteration budget used by the learning-rate schedulers.
    #[serde(default = "default_total_iterations")]
    pub total_iterations: usize,
    /// Bookkeeping cadence and output locations.
    #[serde(default)]
    pub hub: HubConfig,
    /// Shape of the data flowing through the networks.
    #[serde(default)]
    pub data: DataConfig,
    /// Core cooperative networks.
    #[serde(default = "NetworkGroupConfig::core")]
    pub core: NetworkGroupConfig,
    /// Optional encoder placed in front of the core networks.
    #[serde(default = "NetworkGroupConfig::encoder")]
    pub encoder: NetworkGroupConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_iterations: default_total_iterations(),
            hub: HubConfig::default(),
            data: DataConfig::default(),
            core: NetworkGroupConfig::core(),
            encoder: NetworkGroupConfig::encoder(),
        }
    }
}

fn default_total_iterations() -> usize {
    100_000
}

/// Checkpoint and logging cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Steps between checkpoints (metric flush + trainer save).
    #[serde(default = "default_print_interval")]
    pub print_interval: usize,
    /// Steps between saves into the permanent model directory.
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    /// Directory under which `models/`, `models/temp/` and `logs/` are created.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Print checkpoint summaries to the console.
    #[serde(default = "default_true")]
    pub use_print: bool,
    /// Forward checkpoint data to the experiment tracker.
    #[serde(default)]
    pub use_tracker: bool,
    /// The core model consumes `[batch, seq, feature]` trajectories.
    #[serde(default)]
    pub use_gpt: bool,
    /// Number of passes the driver makes over the data.
    #[serde(default = "default_num_epoch")]
    pub num_epoch: usize,
    /// How many entries a checkpoint manifest keeps.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            print_interval: default_print_interval(),
            save_interval: default_save_interval(),
            base_path: default_base_path(),
            use_print: true,
            use_tracker: false,
            use_gpt: false,
            num_epoch: default_num_epoch(),
            max_checkpoints: default_max_checkpoints(),
        }
    }
}

fn default_print_interval() -> usize {
    50
}

fn default_save_interval() -> usize {
    DEFAULT_SAVE_INTERVAL
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".ccnet")
}

fn default_num_epoch() -> usize {
    1
}

fn default_max_checkpoints() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Dataset description consumed by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset name, used in run names.
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    /// Observation shape without the batch axis. Rank > 1 means image data.
    #[serde(default = "default_obs_shape")]
    pub obs_shape: Vec<usize>,
    /// Label width.
    #[serde(default = "default_label_size")]
    pub label_size: usize,
    /// Width of the explanation vector the cooperative networks exchange.
    #[serde(default = "default_explain_size")]
    pub explain_size: usize,
    /// Dataset indices rendered by the image debugger, when enabled.
    #[serde(default)]
    pub show_image_indices: Option<Vec<usize>>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset_name: default_dataset_name(),
            obs_shape: default_obs_shape(),
            label_size: default_label_size(),
            explain_size: default_explain_size(),
            show_image_indices: None,
        }
    }
}

impl DataConfig {
    /// Flattened observation width.
    pub fn obs_size(&self) -> usize {
        self.obs_shape.iter().product()
    }

    /// Observations with more than one axis are treated as images.
    pub fn is_image(&self) -> bool {
        self.obs_shape.len() != 1
    }
}

fn default_dataset_name() -> String {
    "synthetic".to_string()
}

fn default_obs_shape() -> Vec<usize> {
    vec![8]
}

fn default_label_size() -> usize {
    4
}

fn default_explain_size() -> usize {
    4
}

/// One trainer role (core or encoder) and the networks it optimizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkGroupConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Display name of the composite model.
    pub model_name: String,
    /// Names of the networks, in optimization order.
    pub networks: Vec<String>,
    /// Learning parameters applied to each network of the group.
    #[serde(default)]
    pub learning: LearningParams,
}

impl NetworkGroupConfig {
    pub fn core() -> Self {
        Self {
            enabled: true,
            model_name: "cooperative-core".to_string(),
            networks: vec![
                "explainer".to_string(),
                "reasoner".to_string(),
                "producer".to_string(),
            ],
            learning: LearningParams::default(),
        }
    }

    pub fn encoder() -> Self {
        Self {
            enabled: false,
            model_name: "cooperative-encoder".to_string(),
            networks: vec![
                "encoder".to_string(),
                "decoder".to_string(),
                "critic".to_string(),
            ],
            learning: LearningParams::default(),
        }
    }

    /// One copy of the group's learning parameters per network.
    pub fn per_network_params(&self) -> Vec<LearningParams> {
        vec![self.learning.clone(); self.networks.len()]
    }
}

/// Per-network optimization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningParams {
    /// Initial (peak) learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// One of `linear`, `exponential`, `cyclic`. Validated when the optimizer is built.
    #[serde(default = "default_scheduler_type")]
    pub scheduler_type: String,
    /// Multiplicative decay reached after 100k steps.
    #[serde(default = "default_decay_rate_100k")]
    pub decay_rate_100k: f64,
    /// Clamp every gradient element into `[-range, range]`.
    #[serde(default)]
    pub clip_grad_range: Option<f64>,
    /// Rescale gradients whose global L2 norm exceeds this value.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
}

impl Default for LearningParams {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            scheduler_type: default_scheduler_type(),
            decay_rate_100k: default_decay_rate_100k(),
            clip_grad_range: None,
            max_grad_norm: default_max_grad_norm(),
        }
    }
}

fn default_lr() -> f64 {
    2e-4
}

fn default_scheduler_type() -> String {
    "exponential".to_string()
}

fn default_decay_rate_100k() -> f64 {
    0.05
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (prefixed with `CCNET_`, `__` for nesting)
/// 3. `config_file` if given, else `<workspace>/ccnet.toml`
/// 4. User config (`~/.config/ccnet/ccnet.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&TrainConfig>,
) -> Result<TrainConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "ccnet", "ccnet") {
        let user_config = dirs.config_dir().join(CONFIG_FILE_NAME);
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match (config_file, workspace) {
        (Some(file), _) => {
            tracing::debug!(path = %file.display(), "Loading explicit config file");
            figment = figment.merge(Toml::file(file));
        }
        (None, Some(ws)) => {
            let ws_config = ws.join(CONFIG_FILE_NAME);
            if ws_config.exists() {
                figment = figment.merge(Toml::file(&ws_config));
            }
        }
        (None, None) => {}
    }

    // CCNET_HUB__PRINT_INTERVAL, CCNET_CORE__LEARNING__LR, ...
    figment = figment.merge(Env::prefixed("CCNET_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Render a configuration as TOML, for `ccnet config show`.
pub fn to_toml_string(config: &TrainConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}
