//! CPU configuration, loadable from JSON.

use crate::error::ConfigError;
use crate::logging::{log, LogCategory, LogLevel};
use crate::state::CpuModel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub enabled: bool,
    /// Chains shorter than this stay interpreted
    pub min_block_size: usize,
    pub max_block_size: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_block_size: 3,
            max_block_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub model: CpuModel,
    /// Report invalid opcodes to the host instead of raising INT 6
    pub fail_on_invalid_opcode: bool,
    pub jit: JitConfig,
    /// Decoded variants of one address kept around for self-modifying code that flips back
    pub max_versions_per_address: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            model: CpuModel::default(),
            fail_on_invalid_opcode: false,
            jit: JitConfig::default(),
            max_versions_per_address: 4,
        }
    }
}

impl CpuConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Load from `path`, falling back to defaults on error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log(LogCategory::Cpu, LogLevel::Warn, || {
                    format!(
                        "Failed to load CPU config {}: {}. Using defaults.",
                        path.display(),
                        e
                    )
                });
                Self::default()
            }
        }
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
