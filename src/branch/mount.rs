use nix::sys::statvfs::{statvfs, FsFlags};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StackfsError};

/// Filesystem type a mounted union reports; a branch of this type would nest
/// one union inside another.
pub const UNION_FS_TYPE: &str = "fuse.stackfs";

/// Pseudo filesystems that cannot serve as branches.
pub const UNSUPPORTED_FS_TYPES: &[&str] = &[
    "proc",
    "sysfs",
    "devpts",
    "debugfs",
    "securityfs",
    "cgroup",
    "cgroup2",
    "tracefs",
    "configfs",
    UNION_FS_TYPE,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub fs_type: String,
    pub read_only: bool,
}

/// Tells the stack what kind of filesystem a branch root lives on.
pub trait FsProbe: Send + Sync {
    fn probe(&self, root: &Path) -> io::Result<FsInfo>;
}

/// Probes the running system through `/proc/self/mounts` and `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl FsProbe for SystemProbe {
    fn probe(&self, root: &Path) -> io::Result<FsInfo> {
        let read_only = statvfs(root)
            .map_err(io::Error::from)?
            .flags()
            .contains(FsFlags::ST_RDONLY);

        let fs_type = match fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => mount_fs_type(&mounts, root),
            Err(e) => {
                tracing::debug!("Cannot read /proc/self/mounts: {}", e);
                None
            }
        };

        Ok(FsInfo {
            fs_type: fs_type.unwrap_or_else(|| "unknown".to_string()),
            read_only,
        })
    }
}

/// Find the filesystem type of the mount that contains `path`.
///
/// The deepest mount point wins; among equal mount points the last listed
/// one, since later mounts shadow earlier ones.
pub(crate) fn mount_fs_type(mounts: &str, path: &Path) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let target = unescape_mount_field(target);
        if !path.starts_with(&target) {
            continue;
        }
        let depth = Path::new(&target).components().count();
        if best.as_ref().map_or(true, |(d, _)| depth >= *d) {
            best = Some((depth, fs_type.to_string()));
        }
    }
    best.map(|(_, fs_type)| fs_type)
}

/// `/proc/self/mounts` escapes space, tab, newline and backslash as octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The underlying filesystem a branch is attached to.
#[derive(Debug, Clone)]
pub struct MountHandle {
    root: PathBuf,
    dev: u64,
    root_ino: u64,
    fs_type: String,
    native_ro: bool,
}

impl MountHandle {
    /// Attach to the directory at `root`.
    pub fn open(root: &Path, probe: &dyn FsProbe) -> Result<Self> {
        let root = fs::canonicalize(root).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                StackfsError::NotFound(format!("branch root {} does not exist", root.display()))
            }
            _ => e.into(),
        })?;

        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(StackfsError::InvalidState(format!(
                "branch root {} is not a directory",
                root.display()
            )));
        }

        let info = probe.probe(&root)?;

        Ok(MountHandle {
            dev: meta.dev(),
            root_ino: meta.ino(),
            fs_type: info.fs_type,
            native_ro: info.read_only,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Native inode number of the branch root.
    pub fn root_ino(&self) -> u64 {
        self.root_ino
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn is_native_ro(&self) -> bool {
        self.native_ro
    }

    /// True if one root contains the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.root.starts_with(other) || other.starts_with(&self.root)
    }

    /// Bytes available to unprivileged writers on this filesystem.
    pub fn free_bytes(&self) -> Result<u64> {
        let st = statvfs(&self.root).map_err(io::Error::from)?;
        Ok(st.blocks_available() as u64 * st.fragment_size() as u64)
    }
}
