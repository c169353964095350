//! Whiteouts and the per-branch whiteout set.
//!
//! A whiteout for `foo` is an empty file named `.wh.foo` in the same directory
//! of a writable branch; it hides `foo` in every lower branch. Each writable
//! branch also keeps three bookkeeping directories at its root:
//!
//! * `.wh..wh.base`: holds the template file that link whiteouts share,
//! * `.wh..wh.plnk`: pseudo-link records for cross-branch hard links,
//! * `.wh..wh.orph`: orphans detached from their parent but still open.
//!
//! The directories are created on first use. Access goes through
//! [`WhiteoutSet::read`] / [`WhiteoutSet::write`], and the guard types decide
//! what the caller may do: lookups need any guard, creating a slot needs the
//! write guard.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{Result, StackfsError};

/// The prefix used for whiteout marker files.
pub const WHITEOUT_PREFIX: &str = ".wh.";

pub const WH_BASE_NAME: &str = ".wh..wh.base";
pub const WH_PLINK_NAME: &str = ".wh..wh.plnk";
pub const WH_ORPH_NAME: &str = ".wh..wh.orph";

/// Template that link whiteouts are hard-linked to, inside the base slot.
pub const WH_TEMPLATE_NAME: &str = ".wh.tmpl";

/// Whiteout marker naming.
pub struct Whiteout;

impl Whiteout {
    /// For a file named `foo`, this returns `.wh.foo`.
    pub fn marker_name(name: &OsStr) -> OsString {
        let mut whiteout_name = OsString::from(WHITEOUT_PREFIX);
        whiteout_name.push(name);
        whiteout_name
    }

    pub fn is_whiteout_marker(name: &OsStr) -> bool {
        name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
    }

    /// For a whiteout marker `.wh.foo`, this returns `foo`.
    pub fn extract_target(whiteout_name: &OsStr) -> Option<OsString> {
        whiteout_name
            .as_bytes()
            .strip_prefix(WHITEOUT_PREFIX.as_bytes())
            .map(|target| OsStr::from_bytes(target).to_os_string())
    }

    /// Names reserved for the whiteout set itself; never valid entry names.
    pub fn is_reserved(name: &OsStr) -> bool {
        [WH_BASE_NAME, WH_PLINK_NAME, WH_ORPH_NAME]
            .iter()
            .any(|reserved| name == OsStr::new(reserved))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhSlot {
    Base,
    PseudoLink,
    Orphan,
}

impl WhSlot {
    pub const ALL: [WhSlot; 3] = [WhSlot::Base, WhSlot::PseudoLink, WhSlot::Orphan];

    fn index(self) -> usize {
        match self {
            WhSlot::Base => 0,
            WhSlot::PseudoLink => 1,
            WhSlot::Orphan => 2,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            WhSlot::Base => WH_BASE_NAME,
            WhSlot::PseudoLink => WH_PLINK_NAME,
            WhSlot::Orphan => WH_ORPH_NAME,
        }
    }
}

type Slots = [Option<PathBuf>; 3];

/// Whiteout bookkeeping for one writable branch.
pub struct WhiteoutSet {
    root: PathBuf,
    slots: RwLock<Slots>,
    running: AtomicUsize,
    bytes: AtomicU64,
}

/// Shared access to the slots.
pub struct WhReadGuard<'a> {
    slots: RwLockReadGuard<'a, Slots>,
}

impl WhReadGuard<'_> {
    pub fn get(&self, slot: WhSlot) -> Option<&Path> {
        self.slots[slot.index()].as_deref()
    }
}

/// Exclusive access to the slots.
pub struct WhWriteGuard<'a> {
    root: &'a Path,
    slots: RwLockWriteGuard<'a, Slots>,
}

impl WhWriteGuard<'_> {
    pub fn get(&self, slot: WhSlot) -> Option<&Path> {
        self.slots[slot.index()].as_deref()
    }

    /// Return the slot directory, creating it if needed.
    pub fn ensure(&mut self, slot: WhSlot) -> Result<PathBuf> {
        if let Some(dir) = &self.slots[slot.index()] {
            return Ok(dir.clone());
        }

        let dir = self.root.join(slot.dir_name());
        match fs::create_dir(&dir) {
            Ok(()) => tracing::debug!("Created whiteout slot {}", dir.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !dir.is_dir() {
                    return Err(StackfsError::InvalidState(format!(
                        "{} exists and is not a directory",
                        dir.display()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.slots[slot.index()] = Some(dir.clone());
        Ok(dir)
    }
}

/// Space a file takes on the branch: its allocated size, at least one block.
fn footprint(meta: &fs::Metadata) -> u64 {
    (meta.blocks() * 512).max(meta.blksize())
}

struct Running<'a>(&'a AtomicUsize);

impl<'a> Running<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Running(counter)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WhiteoutSet {
    pub fn new(root: &Path) -> Self {
        WhiteoutSet {
            root: root.to_path_buf(),
            slots: RwLock::new([None, None, None]),
            running: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read(&self) -> WhReadGuard<'_> {
        WhReadGuard {
            slots: self.slots.read(),
        }
    }

    pub fn write(&self) -> WhWriteGuard<'_> {
        WhWriteGuard {
            root: &self.root,
            slots: self.slots.write(),
        }
    }

    /// Number of whiteout operations in flight.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Bytes consumed on this branch by whiteout markers and anything else
    /// reported through `charge` / `uncharge`.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn charge(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn uncharge(&self, bytes: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Hide `name` inside the branch-relative directory `parent`.
    ///
    /// With `link` set the marker is hard-linked to the shared template in
    /// the base slot; otherwise (or if linking fails) it is a fresh empty file.
    pub fn whiteout(&self, parent: &Path, name: &OsStr, link: bool) -> Result<PathBuf> {
        let _running = Running::enter(&self.running);
        let marker = self.marker_path(parent, name)?;

        let mut guard = self.write();
        if link {
            let template = guard.ensure(WhSlot::Base)?.join(WH_TEMPLATE_NAME);
            if !template.exists() {
                File::create(&template)?;
                self.charge(footprint(&template.symlink_metadata()?));
            }
            match fs::hard_link(&template, &marker) {
                Ok(()) => return Ok(marker),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(marker),
                Err(e) => {
                    tracing::debug!(
                        "Link whiteout {} failed ({}), creating a plain marker",
                        marker.display(),
                        e
                    );
                }
            }
        }

        let existed = marker.symlink_metadata().is_ok();
        File::create(&marker)?;
        if !existed {
            self.charge(footprint(&marker.symlink_metadata()?));
        }
        Ok(marker)
    }

    pub fn is_whiteout(&self, parent: &Path, name: &OsStr) -> Result<bool> {
        let marker = self.marker_path(parent, name)?;
        let _guard = self.read();
        Ok(marker.symlink_metadata().is_ok())
    }

    /// Remove the whiteout for `name`; returns false if there was none.
    pub fn unwhiteout(&self, parent: &Path, name: &OsStr) -> Result<bool> {
        let _running = Running::enter(&self.running);
        let marker = self.marker_path(parent, name)?;

        let _guard = self.write();
        let meta = match marker.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&marker) {
            Ok(()) => {
                // Dropping one link of the template frees nothing.
                if meta.nlink() <= 1 {
                    self.uncharge(footprint(&meta));
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Path for a detached entry in the orphan slot.
    pub fn orphan_path(&self, name: &OsStr) -> Result<PathBuf> {
        Ok(self.write().ensure(WhSlot::Orphan)?.join(name))
    }

    /// Path for a pseudo-link record in the pseudo-link slot.
    pub fn plink_path(&self, name: &OsStr) -> Result<PathBuf> {
        Ok(self.write().ensure(WhSlot::PseudoLink)?.join(name))
    }

    /// Drop all slot handles.
    ///
    /// Fails with `Busy` while anyone holds or waits on the lock, or while a
    /// whiteout operation is running.
    pub fn teardown(&self) -> Result<()> {
        if self.running() > 0 {
            return Err(StackfsError::Busy(format!(
                "{} whiteout operations running on {}",
                self.running(),
                self.root.display()
            )));
        }
        let mut slots = self.slots.try_write().ok_or_else(|| {
            StackfsError::Busy(format!("whiteout lock of {} is held", self.root.display()))
        })?;
        *slots = [None, None, None];
        tracing::debug!("Tore down whiteout set of {}", self.root.display());
        Ok(())
    }

    fn marker_path(&self, parent: &Path, name: &OsStr) -> Result<PathBuf> {
        if name.is_empty() || name.as_bytes().contains(&b'/') || Whiteout::is_reserved(name) {
            return Err(StackfsError::InvalidState(format!(
                "cannot white out {:?}",
                name
            )));
        }
        if parent.is_absolute()
            || parent
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StackfsError::InvalidState(format!(
                "{} is not a branch-relative directory",
                parent.display()
            )));
        }
        Ok(self.root.join(parent).join(Whiteout::marker_name(name)))
    }
}

impl std::fmt::Debug for WhiteoutSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhiteoutSet")
            .field("root", &self.root)
            .field("running", &self.running())
            .field("bytes", &self.bytes())
            .finish()
    }
}
