use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmhash::{AttachFlags, SegmentConfig, ShmError, ShmHashFile};
use tempfile::TempDir;

fn config() -> SegmentConfig {
    SegmentConfig::default()
        .with_capacity(4096)
        .with_slot_size(128)
        .with_lock_timeout(Duration::from_secs(10))
}

fn attached(dir: &TempDir, name: &str) -> ShmHashFile {
    let db = ShmHashFile::with_config(config());
    assert!(db.attach(dir.path(), name, AttachFlags::NONE));
    db
}

#[test]
fn test_handles_share_one_segment() {
    let dir = TempDir::new().unwrap();
    let a = attached(&dir, "shared");
    let b = attached(&dir, "shared");

    assert!(a.put(b"from-a", b"1", 0).unwrap());
    assert!(b.put(b"from-b", b"2", 0).unwrap());

    assert_eq!(b.get(b"from-a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(a.get(b"from-b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(a.count().unwrap(), 2);

    assert!(b.delete(b"from-a").unwrap());
    assert!(!a.exists(b"from-a").unwrap());
}

#[test]
fn test_detach_keeps_segment_for_others() {
    let dir = TempDir::new().unwrap();
    let a = attached(&dir, "persist");
    let b = attached(&dir, "persist");

    a.put(b"k", b"v", 0).unwrap();
    a.detach();
    assert!(!a.is_attached());
    assert!(matches!(a.get(b"k"), Err(ShmError::NotOpen)));
    assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));

    b.detach();
    let c = attached(&dir, "persist");
    assert_eq!(c.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_delete_on_detach_unlinks_but_mapping_survives() {
    let dir = TempDir::new().unwrap();
    let owner = ShmHashFile::with_config(config());
    assert!(owner.attach(dir.path(), "temp", AttachFlags::DELETE_ON_DETACH));
    let other = attached(&dir, "temp");

    owner.put(b"k", b"v", 0).unwrap();
    owner.detach();
    assert!(!dir.path().join("temp").exists());

    // the unlinked region stays usable for processes that still map it
    assert_eq!(other.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_count_tracks_inserts_and_deletes() {
    let dir = TempDir::new().unwrap();
    let db = attached(&dir, "count");

    let n = 500;
    let m = 173;
    for i in 0..n {
        assert!(db.put(format!("key_{i}").as_bytes(), b"v", 0).unwrap());
    }
    for i in 0..m {
        assert!(db.delete(format!("key_{i}").as_bytes()).unwrap());
    }
    assert_eq!(db.count().unwrap(), n - m);
    assert_eq!(db.keys().unwrap().len(), n - m);

    let mut keys: Vec<String> = db
        .keys()
        .unwrap()
        .into_iter()
        .map(|k| String::from_utf8(k).unwrap())
        .collect();
    keys.sort();
    let mut expected: Vec<String> = (m..n).map(|i| format!("key_{i}")).collect();
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn test_expiry_in_real_time() {
    let dir = TempDir::new().unwrap();
    let db = attached(&dir, "ttl");

    assert!(db.put(b"k", b"v", 1).unwrap());
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));

    thread::sleep(Duration::from_secs(2));
    assert_eq!(db.get(b"k").unwrap(), None);
    assert!(!db.exists(b"k").unwrap());
    assert!(db.keys().unwrap().is_empty());
}

#[test]
fn test_concurrent_access_through_one_handle() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(attached(&dir, "threads"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for j in 0..100 {
                    let key = format!("key_{i}_{j}");
                    let value = format!("value_{i}_{j}");
                    assert!(db.put(key.as_bytes(), value.as_bytes(), 0).unwrap());
                    assert_eq!(db.get(key.as_bytes()).unwrap(), Some(value.into_bytes()));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.count().unwrap(), 800);
}

#[test]
fn test_readers_never_see_torn_records() {
    let dir = TempDir::new().unwrap();
    let writer = attached(&dir, "torn");
    writer.put(b"shared", &[b'a'; 96], 0).unwrap();
    let writer = Arc::new(writer);

    let write_thread = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || {
            for round in 0..2000 {
                let (fill, len) = if round % 2 == 0 { (b'b', 40) } else { (b'a', 96) };
                assert!(writer.replace(b"shared", &vec![fill; len], 0).unwrap());
            }
        })
    };

    // readers use their own mappings, as separate processes would
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let reader = attached(&dir, "torn");
            thread::spawn(move || {
                for _ in 0..2000 {
                    let value = reader.get(b"shared").unwrap().unwrap();
                    let expected_len = if value[0] == b'a' { 96 } else { 40 };
                    assert_eq!(value.len(), expected_len);
                    assert!(value.iter().all(|b| *b == value[0]));
                }
            })
        })
        .collect();

    write_thread.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_concurrent_creation_agrees_on_one_segment() {
    let dir = Arc::new(TempDir::new().unwrap());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let dir = Arc::clone(&dir);
            thread::spawn(move || {
                let db = ShmHashFile::with_config(config());
                assert!(db.attach(dir.path(), "race", AttachFlags::NONE));
                assert!(db.put(format!("k{i}").as_bytes(), b"v", 0).unwrap());
                db
            })
        })
        .collect();

    let dbs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for db in &dbs {
        assert_eq!(db.count().unwrap(), 8);
    }
}

#[test]
fn test_full_segment_reports_false() {
    let dir = TempDir::new().unwrap();
    let db = ShmHashFile::with_config(SegmentConfig::default().with_capacity(4).with_slot_size(64));
    assert!(db.attach(dir.path(), "tiny", AttachFlags::NONE));

    for i in 0..4 {
        assert!(db.put(format!("k{i}").as_bytes(), b"v", 0).unwrap());
    }
    assert!(!db.put(b"one-too-many", b"v", 0).unwrap());
    assert!(!db.exists(b"one-too-many").unwrap());

    assert!(db.delete(b"k0").unwrap());
    assert!(db.put(b"one-too-many", b"v", 0).unwrap());
}
