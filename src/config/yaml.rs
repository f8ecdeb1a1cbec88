//! YAML configuration parsing.

use std::path::Path;

use super::{ConfigError, OrchestratorConfig};

/// Loads [`OrchestratorConfig`] from YAML.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a configuration file. Missing keys take their defaults.
    pub fn load_file(path: impl AsRef<Path>) -> Result<OrchestratorConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<OrchestratorConfig, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(OrchestratorConfig::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load `path`, overlay the process environment and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<OrchestratorConfig, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }
}
