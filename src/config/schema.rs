use serde::{Deserialize, Serialize};

use crate::branch::BranchPerm;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct XinoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Directory for xino and xib files; defaults to the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_colocated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunc_init_blocks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunc_step_blocks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_truncate: Option<bool>,
}

impl XinoConfig {
    pub fn get_enabled(&self) -> bool {
        self.enabled.unwrap_or_else(super::default_xino_enabled)
    }

    pub fn get_share_colocated(&self) -> bool {
        self.share_colocated
            .unwrap_or_else(super::default_share_colocated)
    }

    pub fn get_ephemeral(&self) -> bool {
        self.ephemeral.unwrap_or_else(super::default_ephemeral)
    }

    pub fn get_trunc_init_blocks(&self) -> u64 {
        self.trunc_init_blocks
            .unwrap_or_else(super::default_trunc_init_blocks)
    }

    pub fn get_trunc_step_blocks(&self) -> u64 {
        self.trunc_step_blocks
            .unwrap_or_else(super::default_trunc_step_blocks)
    }

    pub fn get_auto_truncate(&self) -> bool {
        self.auto_truncate.unwrap_or_else(super::default_auto_truncate)
    }
}

/// One `[[branches]]` entry, top of the stack first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub path: String,
    pub perm: BranchPerm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub xino: XinoConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchConfig>,
}
