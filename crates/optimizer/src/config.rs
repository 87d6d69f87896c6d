//! Configuration file support for bert-fusion
//!
//! Supports loading optimizer settings from TOML configuration files.
//!
//! # Config File Locations
//!
//! The optimizer searches for config files in the following order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./bert-fusion.toml` (current directory)
//! 3. `./.bert-fusion.toml` (dotfile)
//! 4. `~/.config/bert-fusion/config.toml` (user config)
//!
//! # Example Config File
//!
//! ```toml
//! # bert-fusion.toml
//!
//! # Model family: "bert" (default) or "generic"
//! model_type = "bert"
//!
//! # Declared hyperparameters; 0 or absent means "infer from the graph"
//! num_heads = 12
//! hidden_size = 768
//! num_layers = 12
//!
//! # Fusions to skip
//! disable = ["gelu"]
//!
//! # Fail when the report is not fully optimized (default: false)
//! strict = true
//!
//! # Runtime session options written with --session-config
//! intra_op_threads = 4
//! wait_policy = "yield"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fusion::FusionKind;

/// Model family being optimized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Transformer encoder: expected fusion counts are checked
    #[default]
    Bert,
    /// Any graph: fusions run, no expectation model
    Generic,
}

impl FromStr for ModelType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bert" => Ok(ModelType::Bert),
            "generic" => Ok(ModelType::Generic),
            _ => Err(ConfigError::Invalid(format!(
                "unknown model type '{s}' (expected bert or generic)"
            ))),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Bert => f.write_str("bert"),
            ModelType::Generic => f.write_str("generic"),
        }
    }
}

/// How idle runtime worker threads wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    Spin,
    #[default]
    Yield,
}

impl FromStr for WaitPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spin" => Ok(WaitPolicy::Spin),
            "yield" => Ok(WaitPolicy::Yield),
            _ => Err(ConfigError::Invalid(format!(
                "unknown wait policy '{s}' (expected spin or yield)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
}

/// Options for the inference runtime that will load the optimized model.
///
/// The optimizer never spawns threads; these are only carried through to a
/// JSON sidecar of runtime configuration entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Intra-op thread count, 0 for the runtime default
    pub intra_op_threads: usize,
    pub wait_policy: WaitPolicy,
    pub execution_provider: ExecutionProvider,
}

impl SessionOptions {
    /// Runtime configuration entries as key/value strings
    pub fn runtime_entries(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        entries.insert("session.intra_op_num_threads".into(), self.intra_op_threads.to_string());
        let spinning = match self.wait_policy {
            WaitPolicy::Spin => "1",
            WaitPolicy::Yield => "0",
        };
        entries.insert("session.intra_op.allow_spinning".into(), spinning.into());
        entries.insert("session.execution_provider".into(), "CPUExecutionProvider".into());
        entries
    }

    /// Write [`runtime_entries`](Self::runtime_entries) as a JSON object
    pub fn write_sidecar<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(&self.runtime_entries())
            .map_err(|e| ConfigError::Invalid(format!("cannot encode session options: {e}")))?;
        std::fs::write(path.as_ref(), json).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))
    }
}

/// Root configuration that can contain sections for different tools
///
/// Supports two formats:
///
/// 1. **Sectioned format** (recommended for shared config):
/// ```toml
/// [bert-fusion]
/// num_heads = 12
/// ```
///
/// 2. **Direct format**:
/// ```toml
/// num_heads = 12
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootConfig {
    /// Optimizer settings (under [bert-fusion] section)
    #[serde(rename = "bert-fusion", skip_serializing_if = "Option::is_none")]
    pub bert_fusion: Option<OptimizerConfig>,

    /// Direct settings, flattened at root level
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub direct: Option<OptimizerConfig>,
}

/// Optimizer configuration loaded from TOML file
///
/// All fields are optional. CLI arguments override config file values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimizerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<ModelType>,

    /// Declared attention head count (0 = infer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_heads: Option<usize>,

    /// Declared hidden size (0 = infer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<usize>,

    /// Declared encoder depth (0 = count Softmax nodes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_layers: Option<usize>,

    /// Fusions to skip, by name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable: Option<Vec<String>>,

    /// Treat an incomplete optimization as a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub intra_op_threads: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_policy: Option<WaitPolicy>,
}

impl OptimizerConfig {
    /// Load config from TOML file
    ///
    /// Supports both sectioned (`[bert-fusion]`) and direct formats.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;

        let root: RootConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(path.as_ref().to_path_buf(), e))?;

        // Prefer sectioned format, fall back to direct format
        Ok(root.bert_fusion.or(root.direct).unwrap_or_default())
    }

    /// Find and load config file from standard locations
    ///
    /// Searches in order:
    /// 1. Current directory: `./bert-fusion.toml`
    /// 2. Current directory: `./.bert-fusion.toml` (dotfile)
    /// 3. User config: `~/.config/bert-fusion/config.toml`
    ///
    /// Returns `None` if no config file found.
    pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
        for candidate in ["./bert-fusion.toml", "./.bert-fusion.toml"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(Some(Self::load(&path)?));
            }
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/bert-fusion/config.toml");
            if user_config.exists() {
                return Ok(Some(Self::load(&user_config)?));
            }
        }

        Ok(None)
    }

    /// Save config to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeError)?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;

        Ok(())
    }

    /// Merge with CLI arguments (CLI args take precedence)
    ///
    /// A non-empty `disable` list from the CLI replaces the configured one.
    /// Zero hyperparameters mean "infer" and become `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli(
        &self,
        model_type: Option<ModelType>,
        num_heads: Option<usize>,
        hidden_size: Option<usize>,
        num_layers: Option<usize>,
        disable: &[String],
        strict: Option<bool>,
        verbose: Option<bool>,
        intra_op_threads: Option<usize>,
        wait_policy: Option<WaitPolicy>,
    ) -> Result<MergedConfig, ConfigError> {
        let disable_names: &[String] = if disable.is_empty() {
            self.disable.as_deref().unwrap_or_default()
        } else {
            disable
        };
        let mut disabled = disable_names
            .iter()
            .map(|name| name.parse::<FusionKind>().map_err(ConfigError::Invalid))
            .collect::<Result<Vec<_>, _>>()?;
        disabled.sort();
        disabled.dedup();

        let declared = |cli: Option<usize>, file: Option<usize>| cli.or(file).filter(|&v| v > 0);

        Ok(MergedConfig {
            model_type: model_type.or(self.model_type).unwrap_or_default(),
            num_heads: declared(num_heads, self.num_heads),
            hidden_size: declared(hidden_size, self.hidden_size),
            num_layers: declared(num_layers, self.num_layers),
            disabled,
            strict: strict.or(self.strict).unwrap_or(false),
            verbose: verbose.or(self.verbose).unwrap_or(false),
            session: SessionOptions {
                intra_op_threads: intra_op_threads.or(self.intra_op_threads).unwrap_or(0),
                wait_policy: wait_policy.or(self.wait_policy).unwrap_or_default(),
                execution_provider: ExecutionProvider::Cpu,
            },
        })
    }
}

/// Merged configuration after combining config file + CLI args
///
/// Declared hyperparameters stay optional: `None` means infer from the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedConfig {
    pub model_type: ModelType,
    pub num_heads: Option<usize>,
    pub hidden_size: Option<usize>,
    pub num_layers: Option<usize>,
    pub disabled: Vec<FusionKind>,
    pub strict: bool,
    pub verbose: bool,
    pub session: SessionOptions,
}

impl MergedConfig {
    pub fn optimization_options(&self) -> crate::pipeline::OptimizationOptions {
        crate::pipeline::OptimizationOptions {
            model_type: self.model_type,
            num_heads: self.num_heads,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            disabled: self.disabled.clone(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, #[source] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),

    /// A value is present but not acceptable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
