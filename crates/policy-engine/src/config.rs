//! Engine configuration
//!
//! Loaded once at startup, from a YAML file, the environment, or both.
//!
//! ```yaml
//! connection_timeout_ms: 2000
//! max_eval_steps: 10000
//! reject_free_variables: true
//! restricted_precheck: true
//! fallback_version: 1
//! limits:
//!   max_source_bytes: 65536
//!   max_nodes: 4096
//!   max_depth: 32
//!   max_string_len: 4096
//! ```

use policy_lang::{CompileOptions, Limits};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PolicyError, Result};

pub const CONFIG_PATH_ENV: &str = "POLICY_ENGINE_CONFIG";
pub const CONNECTION_TIMEOUT_ENV: &str = "POLICY_CONNECTION_TIMEOUT_MS";
pub const MAX_EVAL_STEPS_ENV: &str = "POLICY_MAX_EVAL_STEPS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-connection bound on ownership queries
    pub connection_timeout_ms: u64,
    /// Interpreter fuel per evaluation
    pub max_eval_steps: u64,
    pub reject_free_variables: bool,
    /// Run the restricted compile on raw submissions before the pipeline
    pub restricted_precheck: bool,
    /// Registry version loaded classes are stored under and the fallback
    /// path consults
    pub fallback_version: u32,
    pub limits: Limits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 2000,
            max_eval_steps: 10_000,
            reject_free_variables: true,
            restricted_precheck: true,
            fallback_version: 1,
            limits: Limits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(text).map_err(|e| PolicyError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    /// `POLICY_ENGINE_CONFIG` file if set, then numeric overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if let Some(ms) = env_u64(CONNECTION_TIMEOUT_ENV)? {
            config.connection_timeout_ms = ms;
        }
        if let Some(steps) = env_u64(MAX_EVAL_STEPS_ENV)? {
            config.max_eval_steps = steps;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("connection_timeout_ms", self.connection_timeout_ms == 0),
            ("max_eval_steps", self.max_eval_steps == 0),
            ("limits.max_source_bytes", self.limits.max_source_bytes == 0),
            ("limits.max_nodes", self.limits.max_nodes == 0),
            ("limits.max_depth", self.limits.max_depth == 0),
            ("limits.max_string_len", self.limits.max_string_len == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(PolicyError::Config(format!("{} must be greater than zero", name))),
            None => Ok(()),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            limits: self.limits,
            reject_free_variables: self.reject_free_variables,
        }
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PolicyError::Config(format!("{} must be an unsigned integer, got '{}'", key, v))),
        Err(_) => Ok(None),
    }
}
