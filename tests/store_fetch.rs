//! Core store/fetch/delete/iterate behavior, including bucket splits and
//! directory doubling under a small block size.

use burrow::{Database, Error, OpenMode, StoreMode};
use test_log::test;

fn new_db(dir: &tempfile::TempDir, name: &str) -> Database {
    Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .open(dir.path().join(name))
        .unwrap()
}

#[test]
fn tiny_put_get() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "tiny.db");

    db.store(b"alpha", b"1", StoreMode::Insert).unwrap();
    db.store(b"beta", b"2", StoreMode::Insert).unwrap();

    assert_eq!(db.fetch(b"alpha").unwrap(), b"1");
    assert_eq!(db.fetch(b"beta").unwrap(), b"2");
    assert_eq!(db.count().unwrap(), 2);
}

#[test]
fn fetch_missing_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "missing.db");

    assert!(matches!(db.fetch(b"nope"), Err(Error::ItemNotFound)));
    assert!(!db.exists(b"nope").unwrap());
    assert!(!db.needs_recovery());
}

#[test]
fn zero_length_values_are_legal_but_keys_are_not() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "zero.db");

    db.store(b"empty-value", b"", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"empty-value").unwrap(), b"");

    assert!(db.store(b"", b"x", StoreMode::Insert).is_err());
    assert!(!db.needs_recovery());
}

#[test]
fn replace_and_delete_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "replace.db");

    db.store(b"k", b"a", StoreMode::Insert).unwrap();
    assert!(matches!(
        db.store(b"k", b"b", StoreMode::Insert),
        Err(Error::CannotReplace)
    ));
    assert_eq!(db.fetch(b"k").unwrap(), b"a");

    db.store(b"k", b"b", StoreMode::Replace).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"b");

    db.delete(b"k").unwrap();
    assert!(matches!(db.fetch(b"k"), Err(Error::ItemNotFound)));
    assert!(!db.exists(b"k").unwrap());
    assert!(matches!(db.delete(b"k"), Err(Error::ItemNotFound)));
}

#[test]
fn splits_preserve_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "split.db");

    // block_size 512 gives 13-slot buckets and a 64-entry directory, so
    // 1200 keys force many splits and at least one directory doubling
    // (64 runs cannot hold more than 64 * 13 keys at depth 6)
    let n = 1200;
    for i in 0..n {
        let key = format!("k{i}");
        let value = format!("v{i}");
        db.store(key.as_bytes(), value.as_bytes(), StoreMode::Insert)
            .unwrap();
    }

    for i in 0..n {
        let key = format!("k{i}");
        let value = format!("v{i}");
        assert_eq!(db.fetch(key.as_bytes()).unwrap(), value.as_bytes(), "{key}");
    }
    assert_eq!(db.count().unwrap(), n);
    // split bookkeeping left the directory runs aligned and the avail
    // stack inside the file
    db.verify().unwrap();
    assert!(db.dir_bits() >= 7, "directory must have doubled");
    db.close().unwrap();

    // the relocated, doubled directory survives a reopen
    let mut db = Database::open(dir.path().join("split.db"), OpenMode::Reader).unwrap();
    assert_eq!(db.count().unwrap(), n);
    assert_eq!(db.fetch(b"k0").unwrap(), b"v0");
    assert_eq!(db.fetch(b"k1199").unwrap(), b"v1199");
}

#[test]
fn long_keys_survive_prefix_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "longkeys.db");

    // identical 12-byte inline prefixes, distinct tails
    for i in 0..50 {
        let key = format!("shared-prefix-{i:03}");
        db.store(key.as_bytes(), key.to_uppercase().as_bytes(), StoreMode::Insert)
            .unwrap();
    }
    for i in 0..50 {
        let key = format!("shared-prefix-{i:03}");
        assert_eq!(db.fetch(key.as_bytes()).unwrap(), key.to_uppercase().as_bytes());
    }
}

#[test]
fn iteration_visits_each_key_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "iter.db");

    let mut expected = std::collections::BTreeSet::new();
    for i in 0..10 {
        let key = format!("key-{i}");
        db.store(key.as_bytes(), b"v", StoreMode::Insert).unwrap();
        expected.insert(key.into_bytes());
    }

    let mut seen = std::collections::BTreeSet::new();
    let mut key = db.first_key().unwrap();
    loop {
        assert!(seen.insert(key.clone()), "key visited twice: {key:?}");
        match db.next_key(&key) {
            Ok(next) => key = next,
            Err(Error::ItemNotFound) => break,
            Err(e) => panic!("iteration failed: {e}"),
        }
    }
    assert_eq!(seen, expected);
}

#[test]
fn keys_iterator_matches_manual_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "keysiter.db");

    for i in 0..25 {
        db.store(format!("k{i}").as_bytes(), b"v", StoreMode::Insert)
            .unwrap();
    }

    let keys: Vec<_> = db.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(keys.len(), 25);

    let first = db.first_key().unwrap();
    assert_eq!(keys[0], first);
}

#[test]
fn empty_database_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "empty.db");

    assert!(matches!(db.first_key(), Err(Error::ItemNotFound)));
    assert_eq!(db.iter().count(), 0);
    assert_eq!(db.count().unwrap(), 0);
}

#[test]
fn count_matches_after_mixed_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "mixed.db");

    for i in 0..120 {
        db.store(format!("k{i}").as_bytes(), b"value", StoreMode::Insert)
            .unwrap();
    }
    for i in (0..120).step_by(3) {
        db.delete(format!("k{i}").as_bytes()).unwrap();
    }

    assert_eq!(db.count().unwrap(), 80);
    for i in 0..120 {
        let key = format!("k{i}");
        assert_eq!(db.exists(key.as_bytes()).unwrap(), i % 3 != 0, "{key}");
    }
}

#[test]
fn randomized_churn_stays_consistent() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "churn.db");
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut model = std::collections::HashMap::new();

    for round in 0..2000 {
        let key = format!("key-{}", rng.random_range(0..300));
        match rng.random_range(0..4) {
            0 => {
                let value = format!("value-{round}");
                db.store(key.as_bytes(), value.as_bytes(), StoreMode::Replace)
                    .unwrap();
                model.insert(key, value);
            }
            1 => match db.delete(key.as_bytes()) {
                Ok(()) => {
                    assert!(model.remove(&key).is_some(), "deleted a phantom {key}");
                }
                Err(Error::ItemNotFound) => assert!(!model.contains_key(&key)),
                Err(e) => panic!("delete failed: {e}"),
            },
            _ => match db.fetch(key.as_bytes()) {
                Ok(value) => assert_eq!(Some(&String::from_utf8(value).unwrap()), model.get(&key)),
                Err(Error::ItemNotFound) => assert!(!model.contains_key(&key)),
                Err(e) => panic!("fetch failed: {e}"),
            },
        }
    }

    assert_eq!(db.count().unwrap(), model.len() as u64);
    db.verify().unwrap();
}

#[test]
fn reader_handle_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reader.db");
    {
        let mut db = Database::options()
            .mode(OpenMode::NewDb)
            .block_size(512)
            .open(&path)
            .unwrap();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
        db.close().unwrap();
    }

    let mut db = Database::open(&path, OpenMode::Reader).unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    assert!(matches!(
        db.store(b"x", b"y", StoreMode::Insert),
        Err(Error::ReaderCannotStore)
    ));
    assert!(matches!(db.delete(b"k"), Err(Error::ReaderCannotDelete)));
    assert!(matches!(db.reorganize(), Err(Error::ReaderCannotReorganize)));
}

#[test]
fn writers_exclude_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");
    let db = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .open(&path)
        .unwrap();

    assert!(matches!(
        Database::open(&path, OpenMode::Writer),
        Err(Error::CannotLock)
    ));
    drop(db);

    // lock released on close
    Database::open(&path, OpenMode::Writer).unwrap();
}

#[test]
fn no_lock_skips_exclusion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nolock.db");
    let _a = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .no_lock()
        .open(&path)
        .unwrap();
    let _b = Database::options()
        .mode(OpenMode::Writer)
        .no_lock()
        .open(&path)
        .unwrap();
}

#[test]
fn wrcreate_creates_then_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrcreate.db");

    {
        let mut db = Database::options()
            .mode(OpenMode::WrCreate)
            .block_size(512)
            .open(&path)
            .unwrap();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
        db.close().unwrap();
    }
    {
        // second WrCreate must open the existing data, not truncate it
        let mut db = Database::options()
            .mode(OpenMode::WrCreate)
            .open(&path)
            .unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), b"v");
    }
}

#[test]
fn open_rejects_garbage_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0xAB; 4096]).unwrap();

    assert!(matches!(
        Database::open(&path, OpenMode::Reader),
        Err(Error::BadMagic(_))
    ));
}

#[test]
fn open_missing_file_as_reader_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        Database::open(dir.path().join("absent.db"), OpenMode::Reader),
        Err(Error::Io(_))
    ));
}

#[test]
fn large_values_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = new_db(&dir, "large.db");

    let value = vec![0x42u8; 100_000];
    db.store(b"big", &value, StoreMode::Insert).unwrap();
    db.store(b"small", b"s", StoreMode::Insert).unwrap();

    assert_eq!(db.fetch(b"big").unwrap(), value);
    assert_eq!(db.fetch(b"small").unwrap(), b"s");
}
