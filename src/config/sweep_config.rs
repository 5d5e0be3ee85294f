use crate::config::toml_config::{substitute_env_vars, DesignConfig, MonitoringConfig, OutputConfig};
use crate::utils::error::{Result, RfError};
use crate::utils::validation::{validate_non_empty_string, validate_positive_number, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// A batch of independent designs run side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub sweep: SweepInfo,
    pub designs: Vec<DesignConfig>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Keep going when one design fails.
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
}

fn default_max_parallel() -> usize {
    2
}

fn default_continue_on_error() -> bool {
    true
}

impl SweepConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| RfError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("sweep.name", &self.sweep.name)?;
        validate_positive_number("sweep.max_parallel", self.sweep.max_parallel, 1)?;
        validate_positive_number("designs", self.designs.len(), 1)?;

        let mut names = HashSet::new();
        for (i, design) in self.designs.iter().enumerate() {
            design.validate().map_err(|e| match e {
                RfError::InvalidConfigValueError { field, value, reason } => {
                    RfError::InvalidConfigValueError {
                        field: format!("designs[{}].{}", i, field),
                        value,
                        reason,
                    }
                }
                other => other,
            })?;
            if !names.insert(design.design.name.as_str()) {
                return Err(RfError::InvalidConfigValueError {
                    field: format!("designs[{}].design.name", i),
                    value: design.design.name.clone(),
                    reason: "Design names must be unique within a sweep".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn max_parallel(&self) -> usize {
        self.sweep.max_parallel.max(1)
    }
}

impl Validate for SweepConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
