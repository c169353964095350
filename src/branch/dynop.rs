//! Per-filesystem-type operation tables.
//!
//! Every branch on the same filesystem type behaves the same way for a given
//! kind of inode, so the tables are built once per `(fs type, kind)` and
//! shared. Branches keep their own small cache of the tables they used; the
//! registry drops tables nobody references any more on [`DynopRegistry::gc`].

use dashmap::DashMap;
use std::sync::{Arc, LazyLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynOpKind {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynKey {
    pub fs_type: String,
    pub kind: DynOpKind,
}

/// What the underlying filesystem supports for one kind of inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCaps {
    pub hard_links: bool,
}

#[derive(Debug)]
pub struct DynOps {
    key: DynKey,
    caps: OpCaps,
}

impl DynOps {
    fn build(key: DynKey) -> Self {
        let caps = caps_for(&key.fs_type, key.kind);
        tracing::trace!("Built dynops for {:?}: {:?}", key, caps);
        DynOps { key, caps }
    }

    pub fn key(&self) -> &DynKey {
        &self.key
    }

    pub fn caps(&self) -> OpCaps {
        self.caps
    }
}

const NO_HARD_LINKS: &[&str] = &["vfat", "msdos", "exfat", "iso9660", "fuse.sshfs"];

fn caps_for(fs_type: &str, kind: DynOpKind) -> OpCaps {
    OpCaps {
        hard_links: kind != DynOpKind::Directory && !NO_HARD_LINKS.contains(&fs_type),
    }
}

static REGISTRY: LazyLock<DashMap<DynKey, Arc<DynOps>>> = LazyLock::new(DashMap::new);

pub struct DynopRegistry;

impl DynopRegistry {
    /// Shared table for `key`, built on first request.
    pub fn get(key: DynKey) -> Arc<DynOps> {
        let build_key = key.clone();
        REGISTRY
            .entry(key)
            .or_insert_with(|| Arc::new(DynOps::build(build_key)))
            .value()
            .clone()
    }

    pub fn contains(key: &DynKey) -> bool {
        REGISTRY.contains_key(key)
    }

    /// Drop tables that only the registry still references.
    pub fn gc() -> usize {
        let before = REGISTRY.len();
        REGISTRY.retain(|_, ops| Arc::strong_count(ops) > 1);
        let removed = before.saturating_sub(REGISTRY.len());
        if removed > 0 {
            tracing::debug!("Released {} unused dynops tables", removed);
        }
        removed
    }
}
