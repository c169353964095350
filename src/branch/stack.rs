//! The ordered branch stack of one union mount.
//!
//! The stack's `RwLock` is the mount-wide lock. Data-plane operations take it
//! shared through [`BranchStack::read`] and pin the branch they work on with a
//! [`BranchRef`]; `add`, `del` and `modify` take it exclusively, so no
//! operation ever observes a half-applied change of the stack's shape.
//!
//! Lock order: the mount-wide lock, then a branch's whiteout lock, then that
//! branch's xino lock. Locks of two different branches are never nested.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::branch::mount::{FsProbe, MountHandle, SystemProbe, UNION_FS_TYPE, UNSUPPORTED_FS_TYPES};
use crate::branch::{
    Access, Branch, BranchId, BranchPerm, BranchRef, BranchWatch, XinoSlot,
};
use crate::error::{Result, StackfsError};
use crate::xino::{ROOT_INO, XINO_TRUNC_INIT, XINO_TRUNC_STEP};

/// Largest branch id handed out automatically.
pub const MAX_BRANCH_ID: u32 = i16::MAX as u32;

/// A branch to be added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub root: PathBuf,
    pub perm: BranchPerm,
    /// Requested id; allocated automatically when `None`.
    pub id: Option<BranchId>,
    /// Insert position (0 is the top); the bottom of the stack when `None`.
    pub position: Option<usize>,
}

impl BranchSpec {
    pub fn new(root: impl Into<PathBuf>, perm: BranchPerm) -> Self {
        BranchSpec {
            root: root.into(),
            perm,
            id: None,
            position: None,
        }
    }

    pub fn with_id(mut self, id: BranchId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XinoOptions {
    /// Directory holding the xino files; xino is disabled when `None`.
    pub dir: Option<PathBuf>,
    /// Branches on the same device share one xino file.
    pub share_colocated: bool,
    /// Remove xino files when their last branch goes away.
    pub ephemeral: bool,
    pub trunc_init_blocks: u64,
    pub trunc_step_blocks: u64,
}

impl Default for XinoOptions {
    fn default() -> Self {
        XinoOptions {
            dir: None,
            share_colocated: false,
            ephemeral: false,
            trunc_init_blocks: XINO_TRUNC_INIT,
            trunc_step_blocks: XINO_TRUNC_STEP,
        }
    }
}

impl XinoOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        XinoOptions {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }
}

/// Name of the xino file for a branch rooted at `root`.
///
/// Derived from the root path so that a branch finds its mappings again
/// after a remount, whatever its id or position.
pub fn xino_file_name(root: &Path) -> String {
    use std::os::unix::ffi::OsStrExt;
    format!("xino-{:016x}", fxhash::hash64(root.as_os_str().as_bytes()))
}

/// Name of the xino file shared by every branch on device `dev`.
///
/// Depends only on the device, so co-located branches find the same file
/// whichever of them is stacked first.
pub fn shared_xino_file_name(dev: u64) -> String {
    format!("xino-dev-{:016x}", dev)
}

struct StackInner {
    branches: Vec<Arc<Branch>>,
    last_id: u32,
    default_write: Option<BranchId>,
    retired: Vec<Weak<Branch>>,
}

impl StackInner {
    fn index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id() == id)
    }

    fn prune_retired(&mut self) {
        self.retired.retain(|w| w.strong_count() > 0);
    }

    /// An id is in use while the branch is stacked or still draining.
    fn id_in_use(&self, id: BranchId) -> bool {
        self.index_of(id).is_some()
            || self
                .retired
                .iter()
                .any(|w| w.upgrade().is_some_and(|b| b.id() == id))
    }

    fn alloc_id(&mut self) -> Result<BranchId> {
        let mut candidate = self.last_id;
        for _ in 0..MAX_BRANCH_ID {
            candidate = if candidate >= MAX_BRANCH_ID {
                1
            } else {
                candidate + 1
            };
            let id = BranchId::new(candidate);
            if !self.id_in_use(id) {
                self.last_id = candidate;
                return Ok(id);
            }
        }
        Err(StackfsError::ResourceExhausted(
            "no free branch id".to_string(),
        ))
    }
}

pub struct BranchStack {
    inner: RwLock<StackInner>,
    probe: Arc<dyn FsProbe>,
    xino: XinoOptions,
}

impl BranchStack {
    pub fn new(xino: XinoOptions) -> Self {
        Self::with_probe(xino, Arc::new(SystemProbe))
    }

    pub fn with_probe(xino: XinoOptions, probe: Arc<dyn FsProbe>) -> Self {
        BranchStack {
            inner: RwLock::new(StackInner {
                branches: Vec::new(),
                last_id: 0,
                default_write: None,
                retired: Vec::new(),
            }),
            probe,
            xino,
        }
    }

    pub fn xino_options(&self) -> &XinoOptions {
        &self.xino
    }

    /// Take the mount-wide lock shared.
    pub fn read(&self) -> StackReadGuard<'_> {
        StackReadGuard {
            inner: self.inner.read(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StackInner> {
        let mut inner = self.inner.write();
        inner.prune_retired();
        inner
    }

    pub fn len(&self) -> usize {
        self.inner.read().branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().branches.is_empty()
    }

    /// Add a branch. On failure the stack is left unchanged.
    pub fn add(&self, spec: BranchSpec) -> Result<BranchId> {
        let mut inner = self.write();

        let mount = MountHandle::open(&spec.root, self.probe.as_ref())?;
        Self::verify(&inner, &mount, spec.perm)?;

        let position = spec.position.unwrap_or(inner.branches.len());
        if position > inner.branches.len() {
            return Err(StackfsError::InvalidState(format!(
                "position {} is past the bottom of a {}-branch stack",
                position,
                inner.branches.len()
            )));
        }

        let id = match spec.id {
            Some(id) if id.get() == 0 => {
                return Err(StackfsError::InvalidState(
                    "branch id 0 is reserved".to_string(),
                ))
            }
            Some(id) if inner.id_in_use(id) => {
                return Err(StackfsError::InvalidState(format!(
                    "branch id {} collides with a live branch",
                    id
                )))
            }
            Some(id) => id,
            None => inner.alloc_id()?,
        };

        let xino = self.xino_slot(&inner, &mount)?;
        let branch = Arc::new(Branch::new(
            id,
            spec.perm,
            mount,
            xino,
            self.xino.trunc_init_blocks,
            self.xino.trunc_step_blocks,
        ));
        branch.activate();

        if inner.default_write.is_none() && branch.is_writable() {
            inner.default_write = Some(id);
        }
        tracing::info!(
            "Added branch {} ({}) at {} from {}",
            id,
            spec.perm,
            position,
            branch.root().display()
        );
        inner.branches.insert(position, branch);
        Ok(id)
    }

    fn verify(inner: &StackInner, mount: &MountHandle, perm: BranchPerm) -> Result<()> {
        let fs_type = mount.fs_type();
        if fs_type == UNION_FS_TYPE {
            return Err(StackfsError::InvalidState(format!(
                "{} is a union mount; unions cannot be nested",
                mount.root().display()
            )));
        }
        if UNSUPPORTED_FS_TYPES.contains(&fs_type) {
            return Err(StackfsError::InvalidState(format!(
                "filesystem type {} of {} is not supported as a branch",
                fs_type,
                mount.root().display()
            )));
        }

        if let Some(other) = inner
            .branches
            .iter()
            .find(|b| mount.overlaps(b.root()))
        {
            return Err(StackfsError::InvalidState(format!(
                "{} overlaps branch {} at {}",
                mount.root().display(),
                other.id(),
                other.root().display()
            )));
        }

        if perm.is_writable() && mount.is_native_ro() {
            return Err(StackfsError::PermissionDenied(format!(
                "{} is natively read-only and cannot be {}",
                mount.root().display(),
                perm
            )));
        }
        Ok(())
    }

    fn xino_slot(&self, inner: &StackInner, mount: &MountHandle) -> Result<XinoSlot> {
        let Some(dir) = &self.xino.dir else {
            return Ok(XinoSlot::Disabled);
        };

        if self.xino.share_colocated {
            // Draining branches may still hold the device's store open.
            let colocated = inner
                .branches
                .iter()
                .cloned()
                .chain(inner.retired.iter().filter_map(Weak::upgrade))
                .find(|b| b.mount().dev() == mount.dev() && b.xino_enabled());
            if let Some(other) = colocated {
                if let Some(xino) = other.xino()? {
                    if xino.read(mount.root_ino())?.is_none() {
                        xino.write(mount.root_ino(), ROOT_INO)?;
                    }
                    tracing::debug!(
                        "Sharing xino {} with branch {}",
                        xino.path().display(),
                        other.id()
                    );
                    return Ok(XinoSlot::Open(xino));
                }
            }
        }

        let name = if self.xino.share_colocated {
            shared_xino_file_name(mount.dev())
        } else {
            xino_file_name(mount.root())
        };
        Ok(XinoSlot::Pending {
            path: dir.join(name),
            ephemeral: self.xino.ephemeral,
        })
    }

    /// Remove a branch from the stack.
    ///
    /// The branch is unlinked at once; operations still holding a
    /// [`BranchRef`] keep it alive until they finish.
    pub fn del(&self, id: BranchId) -> Result<()> {
        let mut inner = self.write();

        let index = inner
            .index_of(id)
            .ok_or_else(|| StackfsError::NotFound(format!("no branch {}", id)))?;
        if inner.branches.len() == 1 {
            return Err(StackfsError::InvalidState(format!(
                "cannot remove {}, the last branch",
                id
            )));
        }
        if inner.default_write == Some(id) {
            return Err(StackfsError::InvalidState(format!(
                "branch {} is the default write target; reassign it first",
                id
            )));
        }

        let branch = inner.branches.remove(index);
        branch.start_draining();
        inner.retired.push(Arc::downgrade(&branch));
        tracing::info!(
            "Removed branch {} from {} ({} holders draining)",
            id,
            branch.root().display(),
            branch.refcount()
        );
        Ok(())
    }

    /// Change a branch's permission.
    ///
    /// Revoking writability is refused with `Busy` while the branch has
    /// write-mode holders, and with `InvalidState` while it is the default
    /// write target. Returns true when whiteout visibility changed, meaning
    /// cached directory entries should be refreshed.
    pub fn modify(&self, id: BranchId, perm: BranchPerm) -> Result<bool> {
        let mut inner = self.write();

        let index = inner
            .index_of(id)
            .ok_or_else(|| StackfsError::NotFound(format!("no branch {}", id)))?;
        let branch = Arc::clone(&inner.branches[index]);
        let old = branch.perm();
        if old == perm {
            return Ok(false);
        }

        if perm.is_writable() && branch.mount().is_native_ro() {
            return Err(StackfsError::PermissionDenied(format!(
                "branch {} is natively read-only and cannot be {}",
                id, perm
            )));
        }

        if old.is_writable() && !perm.is_writable() {
            if branch.writers() > 0 {
                return Err(StackfsError::Busy(format!(
                    "branch {} has {} writers",
                    id,
                    branch.writers()
                )));
            }
            if inner.default_write == Some(id) {
                return Err(StackfsError::InvalidState(format!(
                    "branch {} is the default write target; reassign it first",
                    id
                )));
            }
            branch.drop_wbr()?;
        }

        branch.set_perm(perm);
        if inner.default_write.is_none() && branch.is_writable() {
            inner.default_write = Some(id);
        }

        let refresh = old.is_whiteoutable() != perm.is_whiteoutable();
        tracing::info!("Branch {}: {} -> {}", id, old, perm);
        Ok(refresh)
    }

    /// Make `id` the default target for new writes.
    pub fn set_default_write(&self, id: BranchId) -> Result<()> {
        let mut inner = self.write();
        let index = inner
            .index_of(id)
            .ok_or_else(|| StackfsError::NotFound(format!("no branch {}", id)))?;
        inner.branches[index].check_writable()?;
        inner.default_write = Some(id);
        Ok(())
    }
}

/// The mount-wide lock held shared.
pub struct StackReadGuard<'a> {
    inner: RwLockReadGuard<'a, StackInner>,
}

impl StackReadGuard<'_> {
    pub fn len(&self) -> usize {
        self.inner.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.branches.is_empty()
    }

    pub fn branch(&self, bindex: usize) -> Option<&Branch> {
        self.inner.branches.get(bindex).map(|b| b.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.inner.branches.iter().map(|b| b.as_ref())
    }

    /// Current position of the branch with `id`.
    pub fn index_of(&self, id: BranchId) -> Option<usize> {
        self.inner.index_of(id)
    }

    pub fn id_at(&self, bindex: usize) -> Option<BranchId> {
        self.inner.branches.get(bindex).map(|b| b.id())
    }

    pub fn ids(&self) -> Vec<BranchId> {
        self.inner.branches.iter().map(|b| b.id()).collect()
    }

    pub fn default_write(&self) -> Option<BranchId> {
        self.inner.default_write
    }

    /// Pin the branch with `id` for an operation.
    pub fn acquire(&self, id: BranchId, access: Access) -> Result<BranchRef> {
        let index = self
            .index_of(id)
            .ok_or_else(|| StackfsError::NotFound(format!("no branch {}", id)))?;
        BranchRef::acquire(&self.inner.branches[index], access)
    }

    pub fn acquire_at(&self, bindex: usize, access: Access) -> Result<BranchRef> {
        let branch = self.inner.branches.get(bindex).ok_or_else(|| {
            StackfsError::NotFound(format!("no branch at position {}", bindex))
        })?;
        BranchRef::acquire(branch, access)
    }

    pub fn watch(&self, id: BranchId) -> Option<BranchWatch> {
        self.index_of(id)
            .map(|index| BranchWatch::new(&self.inner.branches[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::mount::FsInfo;
    use std::fs;
    use std::io;
    use tempfile::{tempdir, TempDir};

    struct Probe;
    impl FsProbe for Probe {
        fn probe(&self, root: &Path) -> io::Result<FsInfo> {
            let name = root.file_name().unwrap_or_default().to_string_lossy();
            let fs_type = if name.starts_with("proc") {
                "proc"
            } else if name.starts_with("union") {
                UNION_FS_TYPE
            } else {
                "ext4"
            };
            Ok(FsInfo {
                fs_type: fs_type.to_string(),
                read_only: name.starts_with("native-ro"),
            })
        }
    }

    fn setup(names: &[&str]) -> (TempDir, Vec<PathBuf>) {
        let dir = tempdir().unwrap();
        let roots = names
            .iter()
            .map(|n| {
                let p = dir.path().join(n);
                fs::create_dir_all(&p).unwrap();
                p
            })
            .collect();
        (dir, roots)
    }

    fn stack() -> BranchStack {
        BranchStack::with_probe(XinoOptions::default(), Arc::new(Probe))
    }

    #[test]
    fn test_add_appends_and_sets_default() {
        let (_dir, roots) = setup(&["upper", "lower"]);
        let stack = stack();

        let b0 = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        let b1 = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly)).unwrap();

        let guard = stack.read();
        assert_eq!(guard.ids(), vec![b0, b1]);
        assert_eq!(guard.default_write(), Some(b0));
        assert_ne!(b0, b1);
    }

    #[test]
    fn test_add_at_position() {
        let (_dir, roots) = setup(&["a", "b", "c"]);
        let stack = stack();
        let a = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly)).unwrap();
        let b = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly)).unwrap();
        let c = stack
            .add(BranchSpec::new(&roots[2], BranchPerm::ReadWrite).at(0))
            .unwrap();

        let guard = stack.read();
        assert_eq!(guard.ids(), vec![c, a, b]);
        assert_eq!(guard.index_of(b), Some(2));
        assert_eq!(guard.default_write(), Some(c));
    }

    #[test]
    fn test_add_rejects_bad_position() {
        let (_dir, roots) = setup(&["a"]);
        let stack = stack();
        let err = stack
            .add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly).at(3))
            .unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_add_rejects_id_collision() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        stack
            .add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly).with_id(BranchId::new(5)))
            .unwrap();

        let err = stack
            .add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly).with_id(BranchId::new(5)))
            .unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_add_rejects_unsupported_and_nested() {
        let (_dir, roots) = setup(&["proc", "union"]);
        let stack = stack();

        for root in &roots {
            let err = stack
                .add(BranchSpec::new(root, BranchPerm::ReadOnly))
                .unwrap_err();
            assert!(matches!(err, StackfsError::InvalidState(_)));
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn test_add_rejects_overlap() {
        let (_dir, roots) = setup(&["outer", "outer/inner"]);
        let stack = stack();
        stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly)).unwrap();

        let err = stack
            .add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly))
            .unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));
        let err = stack
            .add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly))
            .unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));
    }

    #[test]
    fn test_add_rejects_rw_on_native_ro() {
        let (_dir, roots) = setup(&["native-ro"]);
        let stack = stack();

        let err = stack
            .add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite))
            .unwrap_err();
        assert!(matches!(err, StackfsError::PermissionDenied(_)));
        stack
            .add(BranchSpec::new(&roots[0], BranchPerm::ReadOnlyNative))
            .unwrap();
    }

    #[test]
    fn test_ids_not_reused_while_draining() {
        let (_dir, roots) = setup(&["a", "b", "c"]);
        let stack = stack();
        let a = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        let b = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly)).unwrap();

        let held = stack.read().acquire(b, Access::Read).unwrap();
        stack.del(b).unwrap();

        // Requesting the draining id explicitly collides.
        let err = stack
            .add(BranchSpec::new(&roots[2], BranchPerm::ReadOnly).with_id(b))
            .unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));

        drop(held);
        let c = stack
            .add(BranchSpec::new(&roots[2], BranchPerm::ReadOnly).with_id(b))
            .unwrap();
        assert_eq!(c, b);
        assert_eq!(stack.read().ids(), vec![a, c]);
    }

    #[test]
    fn test_alloc_id_wraps_and_skips_live() {
        let mut inner = StackInner {
            branches: Vec::new(),
            last_id: MAX_BRANCH_ID - 1,
            default_write: None,
            retired: Vec::new(),
        };
        assert_eq!(inner.alloc_id().unwrap(), BranchId::new(MAX_BRANCH_ID));
        assert_eq!(inner.alloc_id().unwrap(), BranchId::new(1));
        assert_eq!(inner.alloc_id().unwrap(), BranchId::new(2));
    }

    #[test]
    fn test_del_last_branch_fails() {
        let (_dir, roots) = setup(&["only"]);
        let stack = stack();
        let id = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly)).unwrap();

        let err = stack.del(id).unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_del_default_write_fails_until_reassigned() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        let a = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        let b = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadWrite)).unwrap();

        assert!(matches!(
            stack.del(a).unwrap_err(),
            StackfsError::InvalidState(_)
        ));
        stack.set_default_write(b).unwrap();
        stack.del(a).unwrap();
        assert_eq!(stack.read().ids(), vec![b]);
    }

    #[test]
    fn test_del_unknown() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly)).unwrap();
        stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly)).unwrap();

        let err = stack.del(BranchId::new(999)).unwrap_err();
        assert!(matches!(err, StackfsError::NotFound(_)));
    }

    #[test]
    fn test_set_default_write_requires_writable() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        let ro = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly)).unwrap();

        let err = stack.set_default_write(ro).unwrap_err();
        assert!(matches!(err, StackfsError::PermissionDenied(_)));
    }

    #[test]
    fn test_modify_downgrade_busy_with_writers() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        let b = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadWrite)).unwrap();

        let writer = stack.read().acquire(b, Access::Write).unwrap();
        let err = stack.modify(b, BranchPerm::ReadOnly).unwrap_err();
        assert!(err.is_busy());
        assert_eq!(stack.read().branch(1).unwrap().perm(), BranchPerm::ReadWrite);

        drop(writer);
        let refresh = stack.modify(b, BranchPerm::ReadOnly).unwrap();
        assert!(refresh);
        assert_eq!(stack.read().branch(1).unwrap().perm(), BranchPerm::ReadOnly);
    }

    #[test]
    fn test_modify_downgrade_default_write_fails() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        let a = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadOnly)).unwrap();

        let err = stack.modify(a, BranchPerm::ReadOnly).unwrap_err();
        assert!(matches!(err, StackfsError::InvalidState(_)));
    }

    #[test]
    fn test_modify_tears_down_whiteouts() {
        let (_dir, roots) = setup(&["a", "b"]);
        let stack = stack();
        stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        let b = stack.add(BranchSpec::new(&roots[1], BranchPerm::ReadWrite)).unwrap();

        {
            let guard = stack.read();
            let br = guard.acquire(b, Access::Write).unwrap();
            br.whiteout(Path::new(""), std::ffi::OsStr::new("x")).unwrap();
            assert!(br.wbr_if_present().is_some());
        }

        stack.modify(b, BranchPerm::ReadOnlyWhiteoutable).unwrap();
        let guard = stack.read();
        assert!(guard.branch(1).unwrap().wbr_if_present().is_none());
    }

    #[test]
    fn test_modify_same_perm_is_noop() {
        let (_dir, roots) = setup(&["a"]);
        let stack = stack();
        let a = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadWrite)).unwrap();
        assert!(!stack.modify(a, BranchPerm::ReadWrite).unwrap());
    }

    #[test]
    fn test_modify_upgrade_native_ro_denied() {
        let (_dir, roots) = setup(&["native-ro"]);
        let stack = stack();
        let a = stack
            .add(BranchSpec::new(&roots[0], BranchPerm::ReadOnlyNative))
            .unwrap();

        let err = stack.modify(a, BranchPerm::ReadWrite).unwrap_err();
        assert!(matches!(err, StackfsError::PermissionDenied(_)));
    }

    #[test]
    fn test_modify_upgrade_becomes_default() {
        let (_dir, roots) = setup(&["a"]);
        let stack = stack();
        let a = stack.add(BranchSpec::new(&roots[0], BranchPerm::ReadOnly)).unwrap();
        assert_eq!(stack.read().default_write(), None);

        let refresh = stack.modify(a, BranchPerm::ReadWrite).unwrap();
        assert!(refresh);
        assert_eq!(stack.read().default_write(), Some(a));
    }

    #[test]
    fn test_xino_file_name_is_stable() {
        let a = xino_file_name(Path::new("/srv/upper"));
        assert_eq!(a, xino_file_name(Path::new("/srv/upper")));
        assert_ne!(a, xino_file_name(Path::new("/srv/lower")));
        assert_ne!(shared_xino_file_name(0x801), shared_xino_file_name(0x802));
        assert!(shared_xino_file_name(0x801).starts_with("xino-"));
        assert!(a.starts_with("xino-"));
        assert_eq!(a.len(), "xino-".len() + 16);
    }
}
