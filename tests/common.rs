use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stackfs::branch::{FsInfo, FsProbe};
use stackfs::{BranchStack, XinoOptions};
use tempfile::TempDir;

/// Get the path to the stackfs binary for testing.
#[allow(dead_code)]
pub fn get_stackfs_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("stackfs").to_path_buf()
}

/// Reports every root as ext4; roots whose directory name starts with
/// `native-ro` are reported as natively read-only.
#[allow(dead_code)]
pub struct FakeProbe;

impl FsProbe for FakeProbe {
    fn probe(&self, root: &Path) -> io::Result<FsInfo> {
        let name = root.file_name().unwrap_or_default().to_string_lossy();
        Ok(FsInfo {
            fs_type: "ext4".to_string(),
            read_only: name.starts_with("native-ro"),
        })
    }
}

/// Scratch area holding branch roots, a xino directory and a config
/// directory.
#[allow(dead_code)]
pub struct TestUnion {
    pub temp_dir: TempDir,
    pub xino_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl Default for TestUnion {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl TestUnion {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let xino_dir = temp_dir.path().join("xino");
        let config_dir = temp_dir.path().join("config");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        Self {
            temp_dir,
            xino_dir,
            config_dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create (if needed) and return a branch root directory.
    pub fn branch_dir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join("branches").join(name);
        fs::create_dir_all(&dir).expect("Failed to create branch dir");
        dir
    }

    pub fn xino_options(&self) -> XinoOptions {
        XinoOptions::in_dir(&self.xino_dir)
    }

    pub fn stack(&self, xino: XinoOptions) -> BranchStack {
        BranchStack::with_probe(xino, Arc::new(FakeProbe))
    }

    /// Files in the xino directory whose names start with `xino-`.
    pub fn xino_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.xino_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("xino-"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    /// Write a config file for the given branches, top first.
    pub fn write_config(&self, branches: &[(&Path, &str)], extra_xino: &str) -> PathBuf {
        let mut content = format!(
            "[xino]\ndir = \"{}\"\n{}\n",
            self.xino_dir.display(),
            extra_xino
        );
        for (path, perm) in branches {
            content.push_str(&format!(
                "\n[[branches]]\npath = \"{}\"\nperm = \"{}\"\n",
                path.display(),
                perm
            ));
        }
        let config_path = self.config_dir.join("config.toml");
        fs::write(&config_path, content).expect("Failed to write config file");
        config_path
    }
}
