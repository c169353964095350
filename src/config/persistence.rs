use crate::error::{Result, StackfsError};
use fxhash::FxHashSet;
use std::path::Path;

use crate::config::paths::*;
use crate::config::schema::*;

/// Load `config.toml` from the config directory, or the defaults if there
/// is none.
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        tracing::debug!(
            "No config file at {}, using defaults",
            config_path.display()
        );
        return Ok(Config::default());
    }
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let toml_content = std::fs::read_to_string(path).map_err(|e| {
        StackfsError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&toml_content)
        .map_err(|e| StackfsError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;
    Ok(config)
}

pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    validate_config(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StackfsError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| StackfsError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, toml_str)
        .map_err(|e| StackfsError::Config(format!("Failed to write config file: {}", e)))?;
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.xino.get_trunc_step_blocks() == 0 {
        return Err(StackfsError::Config(
            "xino.trunc_step_blocks must be greater than 0".to_string(),
        ));
    }
    if config.xino.get_trunc_init_blocks() == 0 {
        return Err(StackfsError::Config(
            "xino.trunc_init_blocks must be greater than 0".to_string(),
        ));
    }

    let mut paths = FxHashSet::default();
    let mut ids = FxHashSet::default();
    for branch in &config.branches {
        if branch.path.trim().is_empty() {
            return Err(StackfsError::Config(
                "Branch path cannot be empty".to_string(),
            ));
        }
        if !paths.insert(expand_tilde(&branch.path)) {
            return Err(StackfsError::Config(format!(
                "Branch '{}' is listed more than once",
                branch.path
            )));
        }
        match branch.id {
            Some(0) => {
                return Err(StackfsError::Config(format!(
                    "Branch '{}': id 0 is reserved",
                    branch.path
                )))
            }
            Some(id) if !ids.insert(id) => {
                return Err(StackfsError::Config(format!(
                    "Branch id {} is used more than once",
                    id
                )))
            }
            _ => {}
        }
    }
    Ok(())
}
