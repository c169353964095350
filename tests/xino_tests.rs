mod common;

use proptest::prelude::*;
use stackfs::xino::{XinoFile, XINO_RECORD_SIZE};
use stackfs::StackfsError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::tempdir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_write_then_read(pairs in prop::collection::vec((0u64..1_000_000, 1u64..u64::MAX), 1..32)) {
        let dir = tempdir().unwrap();
        let xino = XinoFile::open(&dir.path().join("xino"), false).unwrap();

        let mut expected = std::collections::BTreeMap::new();
        for (h_ino, ino) in &pairs {
            xino.write(*h_ino, *ino).unwrap();
            expected.insert(*h_ino, *ino);
        }
        for (h_ino, ino) in &expected {
            prop_assert_eq!(xino.read(*h_ino).unwrap(), Some(*ino));
        }
        let entries: Vec<(u64, u64)> = expected.into_iter().collect();
        prop_assert_eq!(xino.entries().unwrap(), entries);
    }

    #[test]
    fn prop_write_is_idempotent(h_ino in 0u64..1_000_000, ino in 1u64..u64::MAX) {
        let dir = tempdir().unwrap();
        let xino = XinoFile::open(&dir.path().join("xino"), false).unwrap();

        xino.write(h_ino, ino).unwrap();
        let size = xino.size().unwrap();
        xino.write(h_ino, ino).unwrap();
        prop_assert_eq!(xino.read(h_ino).unwrap(), Some(ino));
        prop_assert_eq!(xino.size().unwrap(), size);
    }
}

#[test]
fn test_records_are_native_endian_at_fixed_offsets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("xino");
    {
        let xino = XinoFile::open(&path, false).unwrap();
        xino.write(3, 0x0102_0304).unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len() as u64, 4 * XINO_RECORD_SIZE);
    let start = (3 * XINO_RECORD_SIZE) as usize;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[start..start + 8]);
    assert_eq!(u64::from_ne_bytes(raw), 0x0102_0304);
    assert!(bytes[..start].iter().all(|b| *b == 0));
}

#[test]
fn test_concurrent_compaction_is_rejected() {
    let dir = tempdir().unwrap();
    let xino = XinoFile::open(&dir.path().join("xino"), false).unwrap();
    for h_ino in 1..=2000u64 {
        xino.write(h_ino, h_ino + 100).unwrap();
    }

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    xino.compact(|h_ino| {
                        thread::sleep(std::time::Duration::from_micros(10));
                        h_ino % 2 == 0
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert!(ok >= 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, StackfsError::Busy(_)), "unexpected error {}", e);
        }
    }
    assert!(!xino.is_truncating());
    assert_eq!(xino.read(2).unwrap(), Some(102));
    assert_eq!(xino.read(3).unwrap(), None);
}

#[test]
fn test_lookups_during_compaction_never_see_wrong_values() {
    let dir = tempdir().unwrap();
    let xino = XinoFile::open(&dir.path().join("xino"), false).unwrap();
    for h_ino in 1..=5000u64 {
        xino.write(h_ino * 3, h_ino + 1000).unwrap();
    }

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        for reader in 0..4u64 {
            let xino = &xino;
            let done = &done;
            s.spawn(move || {
                let mut h_ino = reader + 1;
                while !done.load(Ordering::Acquire) {
                    let value = xino.read(h_ino * 3).unwrap();
                    if h_ino % 2 == 0 {
                        // Live entries are never lost.
                        assert_eq!(value, Some(h_ino + 1000));
                    } else {
                        // Dead entries are either still there or gone, never wrong.
                        assert!(value.is_none() || value == Some(h_ino + 1000));
                    }
                    h_ino = h_ino % 5000 + 1;
                }
            });
        }

        for _ in 0..5 {
            xino.compact(|h_ino| (h_ino / 3) % 2 == 0).unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(xino.read(6).unwrap(), Some(1002));
    assert_eq!(xino.read(3).unwrap(), None);
}

#[test]
fn test_compaction_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("xino");
    {
        let xino = XinoFile::open(&path, false).unwrap();
        xino.write(10, 1).unwrap();
        xino.write(100_000, 2).unwrap();
        let stats = xino.compact(|h_ino| h_ino == 10).unwrap();
        assert_eq!((stats.kept, stats.dropped), (1, 1));
    }

    let xino = XinoFile::open(&path, false).unwrap();
    assert_eq!(xino.entries().unwrap(), vec![(10, 1)]);
}
