//! Run Config Parser
//!
//! Handles loading and saving [`RunConfig`] files in YAML.

use std::fs;

use log::{debug, info};

use super::config::{ConfigError, RunConfig};

/// Parses and validates a run configuration from YAML text.
pub fn parse_run_config(yaml: &str) -> Result<RunConfig, ConfigError> {
    let config: RunConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Loads a run configuration from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use steprunner::workflow::load_run_config;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_run_config("run.yaml")?;
///     println!("Timeout: {:?}", config.timeout());
///     Ok(())
/// }
/// ```
pub fn load_run_config(path: &str) -> Result<RunConfig, ConfigError> {
    info!("Loading run config from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let config = parse_run_config(&yaml_content)?;

    info!(
        "Run config loaded: timeout {:?} ({:?}), max retries {}, {} params",
        config.timeout(),
        config.timeout_mode,
        config.max_retries,
        config.params.len()
    );

    Ok(config)
}

/// Saves a run configuration to a YAML file.
pub fn save_run_config(config: &RunConfig, path: &str) -> Result<(), ConfigError> {
    let yaml_content = serde_yaml::to_string(config)?;
    fs::write(path, yaml_content).map_err(|source| ConfigError::Write {
        path: path.to_string(),
        source,
    })?;
    info!("Run config saved to: {}", path);
    Ok(())
}
