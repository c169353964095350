//! Per-branch "xino" files: persistent native-inode -> union-inode translation.
//!
//! A xino file is direct-indexed. The record for native inode `n` lives at
//! byte offset `n * XINO_RECORD_SIZE` and holds the union inode number in
//! native byte order. A zero record (or a read past the end of the file) means
//! no union inode has been assigned yet. Files are sparse in practice, so
//! compaction reclaims space by rewriting only live records into a fresh file.

pub mod live;
pub mod xib;

pub use live::{LiveSet, Liveness, TreeScan};
pub use xib::{new_union_inode, seed_union_inodes, Xib};

use fs2::FileExt;
use fxhash::FxHashSet;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt as _;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StackfsError};

/// Size of one xino record in bytes.
pub const XINO_RECORD_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Union inode number reserved for the union root directory.
pub const ROOT_INO: u64 = 2;

/// First union inode number handed out by the allocator.
pub const FIRST_INO: u64 = 11;

/// Initial truncation watermark, in 512-byte blocks.
pub const XINO_TRUNC_INIT: u64 = 64;

/// Amount the watermark is raised by when compaction cannot get below it.
pub const XINO_TRUNC_STEP: u64 = 4;

const SCAN_CHUNK: usize = 64 * 1024;
const TRUNC_SUFFIX: &str = "trunc";

/// Result of one successful compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    pub kept: u64,
    pub dropped: u64,
    pub blocks_before: u64,
    pub blocks_after: u64,
}

struct XinoInner {
    file: File,
    path: PathBuf,
}

/// One xino file. Shared by `Arc` between co-located branches.
pub struct XinoFile {
    inner: Mutex<XinoInner>,
    truncating: AtomicBool,
    /// Native inodes written while a compaction is scanning for live entries.
    written_during_scan: Mutex<Option<FxHashSet<u64>>>,
    ephemeral: bool,
}

impl XinoFile {
    /// Open (or create) the xino file at `path`.
    ///
    /// The file is locked exclusively for as long as the handle lives, so a
    /// second open of the same file, from this process or another, fails with
    /// `Busy`. Ephemeral files are unlinked when the handle is dropped.
    pub fn open(path: &Path, ephemeral: bool) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|e| {
            StackfsError::Busy(format!("xino file {} is in use: {}", path.display(), e))
        })?;

        tracing::debug!("Opened xino file {}", path.display());

        Ok(Arc::new(XinoFile {
            inner: Mutex::new(XinoInner {
                file,
                path: path.to_path_buf(),
            }),
            truncating: AtomicBool::new(false),
            written_during_scan: Mutex::new(None),
            ephemeral,
        }))
    }

    fn offset(h_ino: u64) -> Result<u64> {
        h_ino
            .checked_mul(XINO_RECORD_SIZE)
            .filter(|pos| *pos <= i64::MAX as u64 - XINO_RECORD_SIZE)
            .ok_or_else(|| {
                StackfsError::ResourceExhausted(format!(
                    "native inode {} is too large for xino",
                    h_ino
                ))
            })
    }

    /// Read the union inode assigned to `h_ino`, if any.
    pub fn read(&self, h_ino: u64) -> Result<Option<u64>> {
        let pos = Self::offset(h_ino)?;
        let inner = self.inner.lock();

        let mut buf = [0u8; XINO_RECORD_SIZE as usize];
        match inner.file.read_exact_at(&mut buf, pos) {
            Ok(()) => {
                let ino = u64::from_ne_bytes(buf);
                Ok((ino != 0).then_some(ino))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record `h_ino -> ino`. Writing the same pair again changes nothing.
    pub fn write(&self, h_ino: u64, ino: u64) -> Result<()> {
        if ino == 0 {
            return Err(StackfsError::InvalidState(
                "union inode 0 cannot be stored in xino".to_string(),
            ));
        }
        let pos = Self::offset(h_ino)?;
        let inner = self.inner.lock();
        inner.file.write_all_at(&ino.to_ne_bytes(), pos)?;
        self.note_written(h_ino);
        Ok(())
    }

    fn note_written(&self, h_ino: u64) {
        if let Some(written) = self.written_during_scan.lock().as_mut() {
            written.insert(h_ino);
        }
    }

    /// Return the union inode for `h_ino`, assigning `mint()` on a miss.
    ///
    /// The lookup and the assignment happen under one hold of the store lock,
    /// so two racing callers always agree on the number.
    pub fn read_or_insert(&self, h_ino: u64, mint: impl FnOnce() -> Result<u64>) -> Result<u64> {
        let pos = Self::offset(h_ino)?;
        let inner = self.inner.lock();

        let mut buf = [0u8; XINO_RECORD_SIZE as usize];
        match inner.file.read_exact_at(&mut buf, pos) {
            Ok(()) => {
                let ino = u64::from_ne_bytes(buf);
                if ino != 0 {
                    return Ok(ino);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e.into()),
        }

        let ino = mint()?;
        if ino == 0 {
            return Err(StackfsError::InvalidState(
                "union inode 0 cannot be stored in xino".to_string(),
            ));
        }
        inner.file.write_all_at(&ino.to_ne_bytes(), pos)?;
        self.note_written(h_ino);
        Ok(ino)
    }

    /// Forget the mapping for `h_ino`.
    pub fn clear(&self, h_ino: u64) -> Result<()> {
        let pos = Self::offset(h_ino)?;
        let inner = self.inner.lock();
        if pos >= inner.file.metadata()?.len() {
            return Ok(());
        }
        inner.file.write_all_at(&[0u8; XINO_RECORD_SIZE as usize], pos)?;
        Ok(())
    }

    /// Every non-zero record, in native inode order.
    pub fn entries(&self) -> Result<Vec<(u64, u64)>> {
        let inner = self.inner.lock();
        let mut entries = Vec::new();
        scan_records(&inner.file, |h_ino, ino| {
            entries.push((h_ino, ino));
            Ok(())
        })?;
        Ok(entries)
    }

    /// Allocated size in 512-byte blocks.
    pub fn blocks(&self) -> Result<u64> {
        Ok(self.inner.lock().file.metadata()?.blocks())
    }

    /// Apparent size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.inner.lock().file.metadata()?.len())
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// True while a compaction of this file is in progress.
    pub fn is_truncating(&self) -> bool {
        self.truncating.load(Ordering::Acquire)
    }

    /// Rewrite the file keeping only records whose native inode is `live`.
    pub fn compact(&self, live: impl Fn(u64) -> bool) -> Result<CompactStats> {
        self.compact_with(|| Ok(live))
    }

    /// Compact using a liveness predicate built by `scan`.
    ///
    /// Only one compaction runs per file; a concurrent call fails with `Busy`
    /// before `scan` runs. `scan` runs without the store lock, so lookups and
    /// assignments continue meanwhile; every native inode written during the
    /// scan is kept whatever the predicate says. The store lock is held for
    /// the rewrite, so readers see either the old or the new contents. The
    /// new file is built next to the old one and renamed over it; on any
    /// failure the original is untouched.
    pub fn compact_with<F, P>(&self, scan: F) -> Result<CompactStats>
    where
        F: FnOnce() -> Result<P>,
        P: Fn(u64) -> bool,
    {
        if self
            .truncating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StackfsError::Busy(format!(
                "xino file {} is already being truncated",
                self.path().display()
            )));
        }
        let _running = Compacting(self);
        *self.written_during_scan.lock() = Some(FxHashSet::default());

        let live = scan()?;

        let mut inner = self.inner.lock();
        let written = self
            .written_during_scan
            .lock()
            .take()
            .unwrap_or_default();
        let live = |h_ino: u64| written.contains(&h_ino) || live(h_ino);
        let blocks_before = inner.file.metadata()?.blocks();
        let tmp_path = trunc_path(&inner.path);

        match rewrite_live(&inner.file, &inner.path, &tmp_path, &live) {
            Ok((file, kept, dropped)) => {
                inner.file = file;
                let blocks_after = inner.file.metadata()?.blocks();
                tracing::debug!(
                    "Compacted xino {}: kept {}, dropped {}, blocks {} -> {}",
                    inner.path.display(),
                    kept,
                    dropped,
                    blocks_before,
                    blocks_after
                );
                Ok(CompactStats {
                    kept,
                    dropped,
                    blocks_before,
                    blocks_after,
                })
            }
            Err(e) => {
                if tmp_path.is_file() {
                    if let Err(rm) = fs::remove_file(&tmp_path) {
                        tracing::warn!("Failed to remove {}: {}", tmp_path.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }
}

impl Drop for XinoFile {
    fn drop(&mut self) {
        if !self.ephemeral {
            return;
        }
        let path = self.inner.get_mut().path.clone();
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Failed to remove xino file {}: {}", path.display(), e);
        } else {
            tracing::debug!("Removed ephemeral xino file {}", path.display());
        }
    }
}

impl std::fmt::Debug for XinoFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XinoFile")
            .field("path", &self.path())
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

/// Marks a compaction in progress; clears the scan record and the
/// truncating flag however the compaction ends.
struct Compacting<'a>(&'a XinoFile);

impl Drop for Compacting<'_> {
    fn drop(&mut self) {
        self.0.written_during_scan.lock().take();
        self.0.truncating.store(false, Ordering::Release);
    }
}

fn trunc_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TRUNC_SUFFIX);
    path.with_file_name(name)
}

fn rewrite_live(
    old: &File,
    path: &Path,
    tmp_path: &Path,
    live: &impl Fn(u64) -> bool,
) -> Result<(File, u64, u64)> {
    let tmp = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;
    tmp.try_lock_exclusive().map_err(|e| {
        StackfsError::Busy(format!("{} is in use: {}", tmp_path.display(), e))
    })?;

    let mut kept = 0;
    let mut dropped = 0;
    scan_records(old, |h_ino, ino| {
        if live(h_ino) {
            tmp.write_all_at(&ino.to_ne_bytes(), h_ino * XINO_RECORD_SIZE)?;
            kept += 1;
        } else {
            dropped += 1;
        }
        Ok(())
    })?;

    tmp.sync_all()?;
    fs::rename(tmp_path, path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|d| d.sync_all()) {
            tracing::debug!("Failed to sync {}: {}", parent.display(), e);
        }
    }

    Ok((tmp, kept, dropped))
}

/// Call `f(native_ino, union_ino)` for every non-zero record in `file`.
fn scan_records(file: &File, mut f: impl FnMut(u64, u64) -> Result<()>) -> Result<()> {
    let len = file.metadata()?.len();
    let records = len / XINO_RECORD_SIZE;
    let per_chunk = (SCAN_CHUNK as u64) / XINO_RECORD_SIZE;
    let mut buf = vec![0u8; SCAN_CHUNK];

    let mut first = 0;
    while first < records {
        let count = per_chunk.min(records - first);
        let bytes = (count * XINO_RECORD_SIZE) as usize;
        file.read_exact_at(&mut buf[..bytes], first * XINO_RECORD_SIZE)?;

        for (i, record) in buf[..bytes]
            .chunks_exact(XINO_RECORD_SIZE as usize)
            .enumerate()
        {
            let mut raw = [0u8; XINO_RECORD_SIZE as usize];
            raw.copy_from_slice(record);
            let ino = u64::from_ne_bytes(raw);
            if ino != 0 {
                f(first + i as u64, ino)?;
            }
        }
        first += count;
    }
    Ok(())
}
