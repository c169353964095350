//! The xib bitmap and the union inode counter.
//!
//! Bit `n` of the xib file is set once union inode `n` has been issued for
//! this union. After a remount the highest set bit seeds the counter, so newly
//! minted numbers never collide with numbers already persisted in xino files.

use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, StackfsError};
use crate::xino::FIRST_INO;

static NEXT_INO: AtomicU64 = AtomicU64::new(FIRST_INO);

/// Mint a fresh union inode number from the process-wide counter.
pub fn new_union_inode() -> Result<u64> {
    NEXT_INO
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
            next.checked_add(1)
        })
        .map_err(|_| StackfsError::ResourceExhausted("union inode numbers exhausted".to_string()))
}

/// Make sure the counter never hands out anything below `floor`.
pub fn seed_union_inodes(floor: u64) {
    let prev = NEXT_INO.fetch_max(floor, Ordering::AcqRel);
    if prev < floor {
        tracing::debug!("Union inode counter raised from {} to {}", prev, floor);
    }
}

struct XibInner {
    file: File,
    path: PathBuf,
}

pub struct Xib {
    inner: Mutex<XibInner>,
}

impl Xib {
    pub fn open(path: &Path) -> Result<Self> {
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
            StackfsError::Busy(format!("xib file {} is in use: {}", path.display(), e))
        })?;

        Ok(Xib {
            inner: Mutex::new(XibInner {
                file,
                path: path.to_path_buf(),
            }),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    fn read_byte(file: &File, pos: u64) -> Result<u8> {
        let mut byte = [0u8; 1];
        match file.read_exact_at(&mut byte, pos) {
            Ok(()) => Ok(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, ino: u64, set: bool) -> Result<()> {
        let pos = ino / 8;
        let mask = 1u8 << (ino % 8);
        let inner = self.inner.lock();

        let old = Self::read_byte(&inner.file, pos)?;
        let new = if set { old | mask } else { old & !mask };
        if new != old {
            inner.file.write_all_at(&[new], pos)?;
        }
        Ok(())
    }

    /// Record `ino` as issued.
    pub fn set(&self, ino: u64) -> Result<()> {
        self.update(ino, true)
    }

    /// Release `ino`.
    pub fn clear(&self, ino: u64) -> Result<()> {
        self.update(ino, false)
    }

    pub fn test(&self, ino: u64) -> Result<bool> {
        let inner = self.inner.lock();
        let byte = Self::read_byte(&inner.file, ino / 8)?;
        Ok(byte & (1u8 << (ino % 8)) != 0)
    }

    /// Highest issued union inode number, if any.
    pub fn highest(&self) -> Result<Option<u64>> {
        let inner = self.inner.lock();
        let len = inner.file.metadata()?.len();
        let mut bytes = vec![0u8; len as usize];
        inner.file.read_exact_at(&mut bytes, 0)?;

        Ok(bytes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, b)| **b != 0)
            .map(|(i, b)| i as u64 * 8 + (7 - b.leading_zeros() as u64)))
    }

    /// Replace the bitmap with exactly the given issued numbers.
    ///
    /// Returns the number of distinct bits set.
    pub fn rebuild(&self, issued: impl IntoIterator<Item = u64>) -> Result<u64> {
        let mut bytes: Vec<u8> = Vec::new();
        let mut count = 0;
        for ino in issued {
            let pos = (ino / 8) as usize;
            if pos >= bytes.len() {
                bytes.resize(pos + 1, 0);
            }
            let mask = 1u8 << (ino % 8);
            if bytes[pos] & mask == 0 {
                bytes[pos] |= mask;
                count += 1;
            }
        }

        let inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.write_all_at(&bytes, 0)?;
        inner.file.sync_data()?;
        tracing::debug!(
            "Rebuilt xib {} with {} issued inodes",
            inner.path.display(),
            count
        );
        Ok(count)
    }
}
