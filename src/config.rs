use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PeargentError, Result};
use crate::history::{HistoryConfig, StoreKind};
use crate::pool::{PoolBuilder, DEFAULT_MAX_ITER};
use crate::tool::ToolPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSettings {
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
        }
    }
}

fn default_max_iter() -> usize {
    DEFAULT_MAX_ITER
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when it is set.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    /// Applied to tools registered without an explicit timeout.
    #[serde(default)]
    pub default_timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tools: ToolSettings,
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|err| PeargentError::Config(format!("Failed to parse configuration: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Defaults overridden by `PEARGENT_*` variables, for hosts without a config file.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(max_iter) = env::var("PEARGENT_MAX_ITER") {
            self.pool.max_iter = max_iter.parse::<usize>().map_err(|_| {
                PeargentError::Config(format!("PEARGENT_MAX_ITER is not a number: {max_iter}"))
            })?;
        }
        if let Ok(backend) = env::var("PEARGENT_HISTORY_BACKEND") {
            self.history.store_type = StoreKind::parse(&backend).ok_or_else(|| {
                PeargentError::Config(format!("unknown history backend `{backend}`"))
            })?;
        }
        if let Ok(path) = env::var("PEARGENT_HISTORY_PATH") {
            self.history.path = Some(path);
        }
        if let Ok(url) = env::var("PEARGENT_DATABASE_URL") {
            self.history.database_url = Some(url);
        }
        if let Ok(filter) = env::var("PEARGENT_LOG") {
            self.logging.filter = filter;
        }
        if let Ok(format) = env::var("PEARGENT_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => {
                    return Err(PeargentError::Config(format!(
                        "unknown PEARGENT_LOG_FORMAT `{format}`, expected pretty or json"
                    )))
                }
            };
        }
        if let Ok(timeout) = env::var("PEARGENT_TOOL_TIMEOUT_SECS") {
            let parsed = timeout.parse::<f64>().map_err(|_| {
                PeargentError::Config(format!("PEARGENT_TOOL_TIMEOUT_SECS is not a number: {timeout}"))
            })?;
            self.tools.default_timeout_secs = Some(parsed);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_iter == 0 {
            return Err(PeargentError::Config("pool.max_iter must be at least 1".into()));
        }
        self.default_tool_policy().validate("tools.default_timeout_secs")
    }

    /// Policy for tools registered without their own.
    pub fn default_tool_policy(&self) -> ToolPolicy {
        match self.tools.default_timeout_secs {
            Some(secs) => ToolPolicy::default().with_timeout(secs),
            None => ToolPolicy::default(),
        }
    }

    /// Seed a pool builder with the configured budget and history store.
    pub fn pool_builder(&self) -> PoolBuilder {
        PoolBuilder::default()
            .max_iter(self.pool.max_iter)
            .history_config(self.history.clone())
    }
}
