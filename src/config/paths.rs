use crate::error::{Result, StackfsError};
use directories::ProjectDirs;
use std::path::PathBuf;

use super::schema::Config;

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "stackfs", "stackfs").ok_or_else(|| {
        StackfsError::Config("Could not determine config directory".to_string())
    })
}

pub fn expand_tilde(path: &str) -> PathBuf {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(config_dir) = std::env::var("STACKFS_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(data_dir) = std::env::var("STACKFS_DATA_DIR") {
        return Ok(PathBuf::from(data_dir));
    }
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Where the xino and xib files of `config` live, or `None` if xino is off.
pub fn get_xino_dir(config: &Config) -> Result<Option<PathBuf>> {
    if !config.xino.get_enabled() {
        return Ok(None);
    }
    match &config.xino.dir {
        Some(dir) => Ok(Some(expand_tilde(dir))),
        None => Ok(Some(get_data_dir()?.join("xino"))),
    }
}
