use fxhash::FxHashSet;
use std::path::Path;
use walkdir::{DirEntryExt, WalkDir};

use crate::error::{Result, StackfsError};

/// Native inode numbers that still exist on a branch.
pub type LiveSet = FxHashSet<u64>;

/// Source of liveness information used by xino compaction.
///
/// A liveness source must err on the side of keeping entries: if it cannot
/// tell for certain which inodes exist it has to fail, and the compaction is
/// abandoned.
pub trait Liveness: Send + Sync {
    fn live_set(&self, root: &Path) -> Result<LiveSet>;
}

impl<F> Liveness for F
where
    F: Fn(&Path) -> Result<LiveSet> + Send + Sync,
{
    fn live_set(&self, root: &Path) -> Result<LiveSet> {
        self(root)
    }
}

/// Walks the branch tree and records every inode it finds.
///
/// Stays on the branch's filesystem; any unreadable entry fails the scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeScan;

impl Liveness for TreeScan {
    fn live_set(&self, root: &Path) -> Result<LiveSet> {
        let mut live = LiveSet::default();
        for entry in WalkDir::new(root).same_file_system(true).follow_links(false) {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io) => StackfsError::from(io),
                None => StackfsError::InvalidState(format!(
                    "filesystem loop while scanning {}",
                    root.display()
                )),
            })?;
            live.insert(entry.ino());
        }
        tracing::trace!("Scanned {} live inodes under {}", live.len(), root.display());
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    #[test]
    fn test_tree_scan_sees_files_and_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();

        let live = TreeScan.live_set(dir.path()).unwrap();

        for p in ["", "sub", "sub/a.txt", "b.txt"] {
            let ino = fs::metadata(dir.path().join(p)).unwrap().ino();
            assert!(live.contains(&ino), "missing {}", p);
        }
        assert_eq!(live.len(), 4);
    }

    #[test]
    fn test_tree_scan_missing_root_fails() {
        let dir = tempdir().unwrap();
        assert!(TreeScan.live_set(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_closure_liveness() {
        let fixed = |_: &Path| -> Result<LiveSet> { Ok([1u64, 2].into_iter().collect()) };
        let live = fixed.live_set(Path::new("/")).unwrap();
        assert!(live.contains(&2));
    }
}
