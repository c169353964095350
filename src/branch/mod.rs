pub mod dynop;
pub mod mount;
pub mod perm;
pub mod stack;

pub use dynop::{DynOpKind, DynOps, DynopRegistry, OpCaps};
pub use mount::{FsInfo, FsProbe, MountHandle, SystemProbe};
pub use perm::BranchPerm;
pub use stack::{BranchSpec, BranchStack, StackReadGuard, XinoOptions};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Result, StackfsError};
use crate::whiteout::WhiteoutSet;
use crate::xino::{CompactStats, Liveness, XinoFile, ROOT_INO};

/// Stable branch identifier. Unlike the position in the stack it survives
/// reordering and removal of other branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(u32);

impl BranchId {
    pub const fn new(raw: u32) -> Self {
        BranchId(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BranchState {
    Uninitialized = 0,
    Active = 1,
    Draining = 2,
    Freed = 3,
}

impl BranchState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BranchState::Uninitialized,
            1 => BranchState::Active,
            2 => BranchState::Draining,
            _ => BranchState::Freed,
        }
    }
}

/// How an operation intends to use the branch it acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Outcome of an opportunistic xino truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncOutcome {
    Disabled,
    BelowWatermark,
    AlreadyRunning,
    Compacted(CompactStats),
    Abandoned,
}

pub(crate) enum XinoSlot {
    Disabled,
    Pending { path: PathBuf, ephemeral: bool },
    Open(Arc<XinoFile>),
}

/// One slot of the branch stack.
pub struct Branch {
    id: BranchId,
    perm: RwLock<BranchPerm>,
    mount: MountHandle,
    xino: Mutex<XinoSlot>,
    wbr: Mutex<Option<Arc<WhiteoutSet>>>,
    count: AtomicUsize,
    writers: AtomicUsize,
    dynops: Mutex<Vec<Arc<DynOps>>>,
    xino_upper: AtomicU64,
    xino_step: u64,
    state: AtomicU8,
}

impl Branch {
    pub(crate) fn new(
        id: BranchId,
        perm: BranchPerm,
        mount: MountHandle,
        xino: XinoSlot,
        trunc_init_blocks: u64,
        trunc_step_blocks: u64,
    ) -> Self {
        Branch {
            id,
            perm: RwLock::new(perm),
            mount,
            xino: Mutex::new(xino),
            wbr: Mutex::new(None),
            count: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            dynops: Mutex::new(Vec::new()),
            xino_upper: AtomicU64::new(trunc_init_blocks),
            xino_step: trunc_step_blocks,
            state: AtomicU8::new(BranchState::Uninitialized as u8),
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn perm(&self) -> BranchPerm {
        *self.perm.read()
    }

    pub(crate) fn set_perm(&self, perm: BranchPerm) {
        *self.perm.write() = perm;
    }

    pub fn mount(&self) -> &MountHandle {
        &self.mount
    }

    pub fn root(&self) -> &Path {
        self.mount.root()
    }

    pub fn state(&self) -> BranchState {
        BranchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BranchState) {
        let old = BranchState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        tracing::debug!("Branch {}: {:?} -> {:?}", self.id, old, state);
    }

    pub(crate) fn activate(&self) {
        self.set_state(BranchState::Active);
    }

    pub(crate) fn start_draining(&self) {
        self.set_state(BranchState::Draining);
    }

    /// Number of live `BranchRef`s.
    pub fn refcount(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Number of live `BranchRef`s acquired for writing.
    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    /// Writable by perm and not natively read-only.
    pub fn is_writable(&self) -> bool {
        self.perm().is_writable() && !self.mount.is_native_ro()
    }

    pub fn is_rdonly(&self) -> bool {
        !self.is_writable()
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(StackfsError::PermissionDenied(format!(
                "branch {} ({}) is read-only",
                self.id,
                self.perm()
            )))
        }
    }

    /// The branch's xino store, opened on first use.
    ///
    /// Returns `None` when xino is disabled for this union.
    pub fn xino(&self) -> Result<Option<Arc<XinoFile>>> {
        let mut slot = self.xino.lock();
        let xino = match &*slot {
            XinoSlot::Disabled => return Ok(None),
            XinoSlot::Open(xino) => return Ok(Some(Arc::clone(xino))),
            XinoSlot::Pending { path, ephemeral } => XinoFile::open(path, *ephemeral)?,
        };

        if xino.read(self.mount.root_ino())?.is_none() {
            xino.write(self.mount.root_ino(), ROOT_INO)?;
        }
        *slot = XinoSlot::Open(Arc::clone(&xino));
        Ok(Some(xino))
    }

    pub(crate) fn xino_enabled(&self) -> bool {
        !matches!(*self.xino.lock(), XinoSlot::Disabled)
    }

    pub fn xino_read(&self, h_ino: u64) -> Result<Option<u64>> {
        match self.xino()? {
            Some(xino) => xino.read(h_ino),
            None => Ok(None),
        }
    }

    pub fn xino_write(&self, h_ino: u64, ino: u64) -> Result<()> {
        match self.xino()? {
            Some(xino) => xino.write(h_ino, ino),
            None => Ok(()),
        }
    }

    pub fn xino_clear(&self, h_ino: u64) -> Result<()> {
        match self.xino()? {
            Some(xino) => xino.clear(h_ino),
            None => Ok(()),
        }
    }

    /// Truncation watermark in 512-byte blocks.
    pub fn xino_upper(&self) -> u64 {
        self.xino_upper.load(Ordering::Acquire)
    }

    pub fn xino_truncating(&self) -> bool {
        match &*self.xino.lock() {
            XinoSlot::Open(xino) => xino.is_truncating(),
            _ => false,
        }
    }

    /// Compact the xino store if it has grown past the watermark.
    ///
    /// Never fails: problems are logged and the store is left as it was.
    pub fn maybe_truncate_xino(&self, live: &dyn Liveness) -> TruncOutcome {
        let xino = match self.xino() {
            Ok(Some(xino)) => xino,
            Ok(None) => return TruncOutcome::Disabled,
            Err(e) => {
                tracing::warn!("Branch {}: cannot open xino: {}", self.id, e);
                return TruncOutcome::Abandoned;
            }
        };

        match xino.blocks() {
            Ok(blocks) if blocks <= self.xino_upper() => return TruncOutcome::BelowWatermark,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Branch {}: cannot stat xino: {}", self.id, e);
                return TruncOutcome::Abandoned;
            }
        }
        if xino.is_truncating() {
            return TruncOutcome::AlreadyRunning;
        }

        match self.compact_xino(&xino, live) {
            Ok(stats) => TruncOutcome::Compacted(stats),
            Err(e) if e.is_busy() => TruncOutcome::AlreadyRunning,
            Err(e) => {
                tracing::warn!(
                    "Branch {}: xino truncation of {} abandoned: {}",
                    self.id,
                    xino.path().display(),
                    e
                );
                TruncOutcome::Abandoned
            }
        }
    }

    /// Compact the xino store now, regardless of the watermark.
    pub fn truncate_xino(&self, live: &dyn Liveness) -> Result<CompactStats> {
        let xino = self.xino()?.ok_or_else(|| {
            StackfsError::InvalidState(format!("xino is disabled for branch {}", self.id))
        })?;
        self.compact_xino(&xino, live)
    }

    fn compact_xino(&self, xino: &XinoFile, live: &dyn Liveness) -> Result<CompactStats> {
        let root_ino = self.mount.root_ino();
        let stats = xino.compact_with(|| {
            let live_set = live.live_set(self.root())?;
            Ok(move |h_ino| h_ino == root_ino || live_set.contains(&h_ino))
        })?;

        if stats.blocks_after > self.xino_upper() {
            let upper = stats.blocks_after + self.xino_step;
            self.xino_upper.store(upper, Ordering::Release);
            tracing::debug!("Branch {}: xino watermark raised to {}", self.id, upper);
        }
        Ok(stats)
    }

    /// The whiteout set, created on first use. Only writable branches have one.
    pub fn wbr(&self) -> Result<Arc<WhiteoutSet>> {
        self.check_writable()?;
        let mut wbr = self.wbr.lock();
        Ok(Arc::clone(
            wbr.get_or_insert_with(|| Arc::new(WhiteoutSet::new(self.mount.root()))),
        ))
    }

    pub fn wbr_if_present(&self) -> Option<Arc<WhiteoutSet>> {
        self.wbr.lock().clone()
    }

    /// Detach and tear down the whiteout set, e.g. when writability is revoked.
    pub(crate) fn drop_wbr(&self) -> Result<()> {
        let mut slot = self.wbr.lock();
        if let Some(wbr) = slot.as_ref() {
            if Arc::strong_count(wbr) > 1 {
                return Err(StackfsError::Busy(format!(
                    "whiteout set of branch {} is in use",
                    self.id
                )));
            }
            wbr.teardown()?;
        }
        *slot = None;
        Ok(())
    }

    /// Create a whiteout for `name` in the branch-relative directory `parent`.
    pub fn whiteout(&self, parent: &Path, name: &OsStr) -> Result<PathBuf> {
        let link = self.perm().links_whiteouts() && self.dynop(DynOpKind::Regular).caps().hard_links;
        self.wbr()?.whiteout(parent, name, link)
    }

    /// Operation table for `kind` on this branch's filesystem type.
    pub fn dynop(&self, kind: DynOpKind) -> Arc<DynOps> {
        let mut cache = self.dynops.lock();
        if let Some(ops) = cache.iter().find(|ops| ops.key().kind == kind) {
            return Arc::clone(ops);
        }
        let ops = DynopRegistry::get(dynop::DynKey {
            fs_type: self.mount.fs_type().to_string(),
            kind,
        });
        cache.push(Arc::clone(&ops));
        ops
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        self.set_state(BranchState::Freed);
        if let Some(wbr) = self.wbr.get_mut().take() {
            if let Err(e) = wbr.teardown() {
                tracing::warn!("Branch {}: whiteout teardown failed: {}", self.id, e);
            }
        }
        tracing::debug!("Branch {} at {} freed", self.id, self.mount.root().display());
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("perm", &self.perm())
            .field("root", &self.mount.root())
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// A counted reference to a branch.
///
/// While any `BranchRef` lives the branch stays usable, even after it has
/// been removed from the stack. Dropping the last one of a removed branch
/// frees it.
pub struct BranchRef {
    branch: Arc<Branch>,
    access: Access,
}

impl BranchRef {
    pub(crate) fn acquire(branch: &Arc<Branch>, access: Access) -> Result<Self> {
        if branch.state() != BranchState::Active {
            return Err(StackfsError::NotFound(format!(
                "branch {} is {:?}",
                branch.id,
                branch.state()
            )));
        }
        if access == Access::Write {
            branch.check_writable()?;
        }
        Ok(Self::count(Arc::clone(branch), access))
    }

    fn count(branch: Arc<Branch>, access: Access) -> Self {
        branch.count.fetch_add(1, Ordering::AcqRel);
        if access == Access::Write {
            branch.writers.fetch_add(1, Ordering::AcqRel);
        }
        BranchRef { branch, access }
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Observe the branch's lifecycle without keeping it alive.
    pub fn watch(&self) -> BranchWatch {
        BranchWatch(Arc::downgrade(&self.branch))
    }
}

impl Clone for BranchRef {
    fn clone(&self) -> Self {
        Self::count(Arc::clone(&self.branch), self.access)
    }
}

impl Deref for BranchRef {
    type Target = Branch;

    fn deref(&self) -> &Branch {
        &self.branch
    }
}

impl Drop for BranchRef {
    fn drop(&mut self) {
        if self.access == Access::Write {
            self.branch.writers.fetch_sub(1, Ordering::AcqRel);
        }
        self.branch.count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for BranchRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchRef")
            .field("branch", &self.branch.id)
            .field("access", &self.access)
            .finish()
    }
}

/// Weak observer of a branch's lifecycle.
#[derive(Debug, Clone)]
pub struct BranchWatch(Weak<Branch>);

impl BranchWatch {
    pub(crate) fn new(branch: &Arc<Branch>) -> Self {
        BranchWatch(Arc::downgrade(branch))
    }

    pub fn state(&self) -> BranchState {
        self.0
            .upgrade()
            .map_or(BranchState::Freed, |branch| branch.state())
    }

    pub fn is_freed(&self) -> bool {
        self.state() == BranchState::Freed
    }
}
