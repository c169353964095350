mod common;

use common::TestUnion;
use stackfs::config::{BranchConfig, Config, XinoConfig};
use stackfs::union::XIB_FILE_NAME;
use stackfs::xino::{LiveSet, Liveness, TreeScan, Xib, ROOT_INO};
use stackfs::{BranchId, BranchPerm, BranchSpec, StackfsError, UnionFs};
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

fn config(env: &TestUnion, ephemeral: bool) -> Config {
    Config {
        xino: XinoConfig {
            dir: Some(env.xino_dir.display().to_string()),
            ephemeral: Some(ephemeral),
            ..Default::default()
        },
        branches: vec![
            BranchConfig {
                path: env.branch_dir("upper").display().to_string(),
                perm: BranchPerm::ReadWrite,
                id: Some(1),
            },
            BranchConfig {
                path: env.branch_dir("lower").display().to_string(),
                perm: BranchPerm::ReadOnly,
                id: Some(2),
            },
        ],
    }
}

#[test]
fn test_open_builds_stack_in_order() {
    let env = TestUnion::new();
    let union = UnionFs::open(&config(&env, false)).unwrap();

    let stack = union.stack().read();
    assert_eq!(stack.ids(), vec![BranchId::new(1), BranchId::new(2)]);
    assert_eq!(stack.default_write(), Some(BranchId::new(1)));
    assert_eq!(stack.branch(1).unwrap().perm(), BranchPerm::ReadOnly);
}

#[test]
fn test_open_without_branches_fails() {
    let env = TestUnion::new();
    let mut config = config(&env, false);
    config.branches.clear();

    let err = UnionFs::open(&config).err().unwrap();
    assert!(matches!(err, StackfsError::InvalidState(_)));
}

#[test]
fn test_mappings_survive_remount() {
    let env = TestUnion::new();
    let config = config(&env, false);

    let ino = {
        let union = UnionFs::open(&config).unwrap();
        union.resolve_ino(BranchId::new(2), 4242).unwrap()
    };

    let union = UnionFs::open(&config).unwrap();
    assert_eq!(union.xino_read(BranchId::new(2), 4242).unwrap(), Some(ino));
    assert_eq!(union.resolve_ino(BranchId::new(2), 4242).unwrap(), ino);
}

#[test]
fn test_xib_seeds_counter_after_remount() {
    let env = TestUnion::new();
    let config = config(&env, false);
    let issued = 5_000_000;
    {
        let xib = Xib::open(&env.xino_dir.join(XIB_FILE_NAME)).unwrap();
        xib.set(issued).unwrap();
    }

    let union = UnionFs::open(&config).unwrap();
    let fresh = union.resolve_ino(BranchId::new(1), 99).unwrap();
    assert!(fresh > issued);
    assert!(union.xib().unwrap().test(fresh).unwrap());
}

#[test]
fn test_ephemeral_stores_removed_on_unmount() {
    let env = TestUnion::new();
    {
        let union = UnionFs::open(&config(&env, true)).unwrap();
        union.resolve_ino(BranchId::new(1), 10).unwrap();
        union.resolve_ino(BranchId::new(2), 10).unwrap();
        assert_eq!(env.xino_files().len(), 2);
    }
    assert!(env.xino_files().is_empty());
}

#[test]
fn test_xino_disabled_always_mints() {
    let env = TestUnion::new();
    let mut config = config(&env, false);
    config.xino.enabled = Some(false);

    let union = UnionFs::open(&config).unwrap();
    let a = union.resolve_ino(BranchId::new(1), 10).unwrap();
    let b = union.resolve_ino(BranchId::new(1), 10).unwrap();
    assert_ne!(a, b);
    assert!(union.xib().is_none());
    assert_eq!(union.xino_read(BranchId::new(1), 10).unwrap(), None);
    assert!(!env.xino_dir.exists());
}

#[test]
fn test_concurrent_resolve_agrees() {
    let env = TestUnion::new();
    let union = Arc::new(UnionFs::open(&config(&env, false)).unwrap());

    let results: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let union = Arc::clone(&union);
                s.spawn(move || {
                    (1000..1100u64)
                        .map(|h_ino| union.resolve_ino(BranchId::new(1), h_ino).unwrap())
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }
}

#[test]
fn test_root_of_every_branch_is_root_ino() {
    let env = TestUnion::new();
    let union = UnionFs::open(&config(&env, false)).unwrap();

    let roots: Vec<_> = {
        let stack = union.stack().read();
        stack
            .iter()
            .map(|b| (b.id(), b.mount().root_ino()))
            .collect()
    };
    for (id, root_ino) in roots {
        assert_eq!(union.resolve_ino(id, root_ino).unwrap(), ROOT_INO);
    }
}

#[test]
fn test_second_union_on_same_xino_dir_is_busy() {
    let env = TestUnion::new();
    let config = config(&env, false);
    let _first = UnionFs::open(&config).unwrap();

    let err = UnionFs::open(&config).err().unwrap();
    assert!(err.is_busy());
}

#[test]
fn test_removed_branch_is_skipped_on_delete() {
    let env = TestUnion::new();
    let union = UnionFs::open(&config(&env, false)).unwrap();
    let upper = BranchId::new(1);
    let lower = BranchId::new(2);

    let ino = union.resolve_ino(upper, 31).unwrap();
    union.resolve_ino(lower, 31).unwrap();
    union.stack().del(lower).unwrap();

    union
        .delete_inode(ino, true, &[(upper, 31), (lower, 31)])
        .unwrap();
    assert_eq!(union.xino_read(upper, 31).unwrap(), None);
}

/// Scans the branch tree, then waits until the test lets it continue.
struct PausedScan {
    scanned: Barrier,
    resume: Barrier,
}

impl Liveness for PausedScan {
    fn live_set(&self, root: &Path) -> stackfs::Result<LiveSet> {
        let live = TreeScan.live_set(root)?;
        self.scanned.wait();
        self.resume.wait();
        Ok(live)
    }
}

#[test]
fn test_lookup_during_compaction_scan_is_kept() {
    let env = TestUnion::new();
    let upper = env.branch_dir("upper");
    let stack = env.stack(env.xino_options());
    let id = stack
        .add(BranchSpec::new(&upper, BranchPerm::ReadWrite))
        .unwrap();
    let scan = Arc::new(PausedScan {
        scanned: Barrier::new(2),
        resume: Barrier::new(2),
    });
    let union = UnionFs::with_stack(stack, Arc::clone(&scan) as Arc<dyn Liveness>, false).unwrap();

    let (ino, assigned) = thread::scope(|s| {
        let compaction = s.spawn(|| union.xino_trunc(id));

        scan.scanned.wait();
        let path = upper.join("new.txt");
        std::fs::write(&path, "x").unwrap();
        let ino = std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&path).unwrap());
        let assigned = union.resolve_ino(id, ino).unwrap();
        scan.resume.wait();

        compaction.join().unwrap().unwrap();
        (ino, assigned)
    });

    assert_eq!(union.xino_read(id, ino).unwrap(), Some(assigned));
    assert_eq!(union.resolve_ino(id, ino).unwrap(), assigned);
}
