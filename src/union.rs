//! Union-wide state: the branch stack plus everything the directory layer
//! needs to turn `(branch, native inode)` into a union inode number.

use std::path::PathBuf;
use std::sync::Arc;

use crate::branch::{
    Access, BranchId, BranchRef, BranchSpec, BranchStack, TruncOutcome, XinoOptions,
};
use crate::config::{expand_tilde, get_xino_dir, validate_config, Config};
use crate::error::{Result, StackfsError};
use crate::xino::{self, CompactStats, Liveness, TreeScan, Xib};

/// Name of the xib bitmap inside the xino directory.
pub const XIB_FILE_NAME: &str = "xib";

pub struct UnionFs {
    stack: BranchStack,
    xib: Option<Xib>,
    liveness: Arc<dyn Liveness>,
    auto_truncate: bool,
}

impl UnionFs {
    /// Build a union from `config`, adding its branches top first.
    pub fn open(config: &Config) -> Result<Self> {
        validate_config(config)?;
        if config.branches.is_empty() {
            return Err(StackfsError::InvalidState(
                "a union needs at least one branch".to_string(),
            ));
        }

        let xino = XinoOptions {
            dir: get_xino_dir(config)?,
            share_colocated: config.xino.get_share_colocated(),
            ephemeral: config.xino.get_ephemeral(),
            trunc_init_blocks: config.xino.get_trunc_init_blocks(),
            trunc_step_blocks: config.xino.get_trunc_step_blocks(),
        };

        let union = Self::with_stack(
            BranchStack::new(xino),
            Arc::new(TreeScan),
            config.xino.get_auto_truncate(),
        )?;
        for branch in &config.branches {
            let mut spec = BranchSpec::new(expand_tilde(&branch.path), branch.perm);
            if let Some(id) = branch.id {
                spec = spec.with_id(BranchId::new(id));
            }
            union.stack.add(spec)?;
        }
        Ok(union)
    }

    /// Wrap an existing stack. Opens the xib when xino is enabled and seeds
    /// the union inode counter past every number it records.
    pub fn with_stack(
        stack: BranchStack,
        liveness: Arc<dyn Liveness>,
        auto_truncate: bool,
    ) -> Result<Self> {
        let xib = match &stack.xino_options().dir {
            Some(dir) => {
                let xib = Xib::open(&dir.join(XIB_FILE_NAME))?;
                if let Some(highest) = xib.highest()? {
                    xino::seed_union_inodes(highest.saturating_add(1));
                }
                Some(xib)
            }
            None => None,
        };

        Ok(UnionFs {
            stack,
            xib,
            liveness,
            auto_truncate,
        })
    }

    pub fn stack(&self) -> &BranchStack {
        &self.stack
    }

    pub fn xib(&self) -> Option<&Xib> {
        self.xib.as_ref()
    }

    /// Mint a union inode number and record it as issued.
    pub fn new_union_inode(&self) -> Result<u64> {
        let ino = xino::new_union_inode()?;
        if let Some(xib) = &self.xib {
            xib.set(ino)?;
        }
        Ok(ino)
    }

    pub fn xino_read(&self, id: BranchId, h_ino: u64) -> Result<Option<u64>> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Read)?;
        br.xino_read(h_ino)
    }

    pub fn xino_write(&self, id: BranchId, h_ino: u64, ino: u64) -> Result<()> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Read)?;
        br.xino_write(h_ino, ino)?;
        self.after_write(&br);
        Ok(())
    }

    /// The union inode for `h_ino` on branch `id`, minting one on a miss.
    pub fn resolve_ino(&self, id: BranchId, h_ino: u64) -> Result<u64> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Read)?;
        let Some(store) = br.xino()? else {
            return self.new_union_inode();
        };

        let ino = store.read_or_insert(h_ino, || self.new_union_inode())?;
        self.after_write(&br);
        Ok(ino)
    }

    fn after_write(&self, br: &BranchRef) {
        if !self.auto_truncate {
            return;
        }
        if let TruncOutcome::Compacted(stats) = br.maybe_truncate_xino(self.liveness.as_ref()) {
            tracing::debug!(
                "Branch {}: xino compacted, {} kept, {} dropped",
                br.id(),
                stats.kept,
                stats.dropped
            );
        }
    }

    /// Compact branch `id`'s xino store now. Unlike the automatic path this
    /// reports failures, including `Busy` when a compaction is running.
    pub fn xino_trunc(&self, id: BranchId) -> Result<CompactStats> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Read)?;
        br.truncate_xino(self.liveness.as_ref())
    }

    /// Compact branch `id`'s xino store if it is past its watermark.
    pub fn maybe_truncate(&self, id: BranchId) -> Result<TruncOutcome> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Read)?;
        Ok(br.maybe_truncate_xino(self.liveness.as_ref()))
    }

    pub fn xino_path(&self, id: BranchId) -> Result<Option<PathBuf>> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Read)?;
        Ok(br.xino()?.map(|store| store.path()))
    }

    /// Forget a union inode that is going away.
    ///
    /// Mappings only matter for inodes that still exist, so nothing happens
    /// unless the inode was `unlinked`. Then every `(branch, native inode)`
    /// that backed it is cleared and its number released in the xib.
    /// Branches that have left the stack meanwhile are skipped.
    pub fn delete_inode(
        &self,
        ino: u64,
        unlinked: bool,
        hidden: &[(BranchId, u64)],
    ) -> Result<()> {
        if !unlinked {
            return Ok(());
        }

        let stack = self.stack.read();
        for &(id, h_ino) in hidden {
            let br = match stack.acquire(id, Access::Read) {
                Ok(br) => br,
                Err(StackfsError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            br.xino_clear(h_ino)?;
        }
        drop(stack);

        if let Some(xib) = &self.xib {
            xib.clear(ino)?;
        }
        Ok(())
    }

    /// Rebuild the xib from the union inode numbers that are still recorded
    /// in any branch's xino store.
    pub fn xib_rebuild(&self) -> Result<u64> {
        let Some(xib) = &self.xib else {
            return Ok(0);
        };

        let stack = self.stack.read();
        let mut issued = Vec::new();
        for id in stack.ids() {
            let br = stack.acquire(id, Access::Read)?;
            if let Some(store) = br.xino()? {
                issued.extend(store.entries()?.into_iter().map(|(_, ino)| ino));
            }
        }
        drop(stack);

        xib.rebuild(issued)
    }

    /// Create a whiteout for `name` in `parent` on writable branch `id`.
    pub fn whiteout(
        &self,
        id: BranchId,
        parent: &std::path::Path,
        name: &std::ffi::OsStr,
    ) -> Result<PathBuf> {
        let stack = self.stack.read();
        let br = stack.acquire(id, Access::Write)?;
        br.whiteout(parent, name)
    }
}
