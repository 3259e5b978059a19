//! Crash-tolerant snapshot protocol: arming, per-sync cloning, and the
//! post-crash selection procedure.
//!
//! Reflink cloning needs filesystem support; tests that actually take
//! snapshots probe for it first and bail out quietly where the filesystem
//! cannot clone. The selection procedure itself only looks at permission
//! bits, header bytes, and mtimes, so those tests run anywhere.

use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use burrow::{latest_snapshot, Database, Error, OpenMode, SnapshotSelection, StoreMode};
use test_log::test;

/// Whether the filesystem under `dir` supports reflink cloning.
fn reflink_works(dir: &Path) -> bool {
    let src_path = dir.join("clone-probe-src");
    let dst_path = dir.join("clone-probe-dst");
    std::fs::write(&src_path, b"probe").unwrap();
    let src = OpenOptions::new().read(true).open(&src_path).unwrap();
    let dst = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&dst_path)
        .unwrap();
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), libc::FICLONE as _, src.as_raw_fd()) };
    let _ = std::fs::remove_file(&src_path);
    let _ = std::fs::remove_file(&dst_path);
    rc == 0
}

fn mode_of(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

fn set_mode(path: &Path, mode: u32) {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

/// Write a file that looks like a snapshot of an extended-format database
/// after `syncs` explicit syncs (the close adds one more, so the stored
/// counter is `syncs + 1`).
fn fake_snapshot(path: &Path, syncs: u32, mode: u32) {
    let mut db = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .numsync(true)
        .no_lock()
        .open(path)
        .unwrap();
    for _ in 0..syncs {
        db.sync().unwrap();
    }
    db.close().unwrap();
    set_mode(path, mode);
}

#[test]
fn arming_rejects_bad_usage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arm.db");
    let mut db = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .open(&path)
        .unwrap();

    // identical names
    let snap = dir.path().join("snap.even");
    assert!(matches!(
        db.set_failure_atomic(&snap, &snap),
        Err(Error::Usage)
    ));

    // existing file
    std::fs::write(dir.path().join("exists.odd"), b"x").unwrap();
    assert!(db
        .set_failure_atomic(dir.path().join("fresh.even"), dir.path().join("exists.odd"))
        .is_err());
    // the fresh name was cleaned up again
    assert!(!dir.path().join("fresh.even").exists());
    assert!(!db.failure_atomic());
}

#[test]
fn arming_requires_a_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");
    Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .open(&path)
        .unwrap()
        .close()
        .unwrap();

    let mut db = Database::open(&path, OpenMode::Reader).unwrap();
    assert!(matches!(
        db.set_failure_atomic(dir.path().join("e"), dir.path().join("o")),
        Err(Error::CannotBeReader)
    ));
}

#[test]
fn snapshot_cycle_leaves_one_readable_file() {
    let dir = tempfile::tempdir().unwrap();
    if !reflink_works(dir.path()) {
        eprintln!("skipping: filesystem does not support reflink");
        return;
    }
    let even = dir.path().join("snap.even");
    let odd = dir.path().join("snap.odd");

    let mut db = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .numsync(true)
        .open(dir.path().join("snap.db"))
        .unwrap();
    db.store(b"k", b"v1", StoreMode::Insert).unwrap();
    db.set_failure_atomic(&even, &odd).unwrap();
    assert!(db.failure_atomic());

    // arming took the first snapshot into `even`
    assert_eq!(mode_of(&even), 0o400);
    assert_eq!(mode_of(&odd), 0o200);
    assert_eq!(
        latest_snapshot(&even, &odd).unwrap(),
        SnapshotSelection::Chosen(even.clone())
    );

    // the next sync writes the other slot; both end up readable for a
    // moment, and numsync decides in favor of the fresher one
    db.store(b"k", b"v2", StoreMode::Replace).unwrap();
    db.sync().unwrap();
    assert_eq!(mode_of(&odd), 0o400);
    assert_eq!(mode_of(&even), 0o200);
    assert_eq!(
        latest_snapshot(&even, &odd).unwrap(),
        SnapshotSelection::Chosen(odd.clone())
    );

    // the chosen snapshot is a usable database with the synced content
    let mut recovered = Database::options()
        .mode(OpenMode::Reader)
        .no_lock()
        .open(&odd)
        .unwrap();
    assert_eq!(recovered.fetch(b"k").unwrap(), b"v2");
}

#[test]
fn crash_between_clone_and_commit_selects_the_other_file() {
    let dir = tempfile::tempdir().unwrap();
    if !reflink_works(dir.path()) {
        eprintln!("skipping: filesystem does not support reflink");
        return;
    }
    let even = dir.path().join("c.even");
    let odd = dir.path().join("c.odd");

    let mut db = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .numsync(true)
        .open(dir.path().join("c.db"))
        .unwrap();
    db.store(b"k", b"v1", StoreMode::Insert).unwrap();
    db.set_failure_atomic(&even, &odd).unwrap();
    db.store(b"k", b"v2", StoreMode::Replace).unwrap();
    db.sync().unwrap();
    // state now: even=0200 (stale v1), odd=0400 (v2)

    // simulate a crash inside the NEXT sync, after step 2 (clone written
    // into `even`) but before step 3 (chmod 0400): even stays write-only
    db.store(b"k", b"v3", StoreMode::Replace).unwrap();
    // the in-progress file is writable+unreadable, exactly as the
    // protocol leaves it mid-write
    assert_eq!(mode_of(&even), 0o200);

    let selection = latest_snapshot(&even, &odd).unwrap();
    assert_eq!(selection, SnapshotSelection::Chosen(odd.clone()));

    // and the survivor holds the last committed state (v2, not v3)
    let mut survivor = Database::options()
        .mode(OpenMode::Reader)
        .no_lock()
        .open(&odd)
        .unwrap();
    assert_eq!(survivor.fetch(b"k").unwrap(), b"v2");
}

#[test]
fn rearming_replaces_the_pair() {
    let dir = tempfile::tempdir().unwrap();
    if !reflink_works(dir.path()) {
        eprintln!("skipping: filesystem does not support reflink");
        return;
    }

    let mut db = Database::options()
        .mode(OpenMode::NewDb)
        .block_size(512)
        .open(dir.path().join("rearm.db"))
        .unwrap();
    db.store(b"k", b"v", StoreMode::Insert).unwrap();

    db.set_failure_atomic(dir.path().join("a.even"), dir.path().join("a.odd"))
        .unwrap();
    db.set_failure_atomic(dir.path().join("b.even"), dir.path().join("b.odd"))
        .unwrap();
    assert!(db.failure_atomic());

    // the database content is unaffected by re-arming
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    assert_eq!(mode_of(&dir.path().join("b.even")), 0o400);
}

#[test]
fn selection_neither_readable_is_bad() {
    let dir = tempfile::tempdir().unwrap();
    let even = dir.path().join("bad.even");
    let odd = dir.path().join("bad.odd");
    std::fs::write(&even, b"").unwrap();
    std::fs::write(&odd, b"").unwrap();
    set_mode(&even, 0o200);
    set_mode(&odd, 0o200);

    assert_eq!(latest_snapshot(&even, &odd).unwrap(), SnapshotSelection::Bad);
}

#[test]
fn selection_rejects_suspect_modes() {
    let dir = tempfile::tempdir().unwrap();
    let even = dir.path().join("m.even");
    let odd = dir.path().join("m.odd");
    std::fs::write(&even, b"").unwrap();
    std::fs::write(&odd, b"").unwrap();

    // both readable and writable is a state the protocol never produces
    set_mode(&even, 0o600);
    set_mode(&odd, 0o200);
    assert!(matches!(
        latest_snapshot(&even, &odd),
        Err(Error::FileMode)
    ));

    // an executable snapshot is likewise foreign
    set_mode(&even, 0o500);
    assert!(matches!(
        latest_snapshot(&even, &odd),
        Err(Error::FileMode)
    ));
}

#[test]
fn selection_with_numsync_counters() {
    let dir = tempfile::tempdir().unwrap();
    let even = dir.path().join("n.even");
    let odd = dir.path().join("n.odd");

    // two snapshots of consecutive syncs of one database
    fake_snapshot(&even, 3, 0o400);
    fake_snapshot(&odd, 4, 0o400);
    let selection = latest_snapshot(&even, &odd).unwrap();
    assert_eq!(selection, SnapshotSelection::Chosen(odd.clone()));

    // counters further than one apart are suspicious; mtime breaks the tie
    std::fs::remove_file(&odd).unwrap();
    fake_snapshot(&odd, 9, 0o400);
    match latest_snapshot(&even, &odd).unwrap() {
        SnapshotSelection::Suspicious(_) | SnapshotSelection::Same => {}
        other => panic!("expected a suspicious selection, got {other:?}"),
    }
}

#[test]
fn selection_wraps_around_counter_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let even = dir.path().join("w.even");
    let odd = dir.path().join("w.odd");

    // hand-build two minimal extended headers with counters u32::MAX and 0
    let build = |path: &Path, numsync: u32| {
        let mut db = Database::options()
            .mode(OpenMode::NewDb)
            .block_size(512)
            .numsync(true)
            .no_lock()
            .open(path)
            .unwrap();
        db.close().unwrap();
        // counter surgery directly in the header image
        let mut bytes = std::fs::read(path).unwrap();
        bytes[44..48].copy_from_slice(&numsync.to_ne_bytes());
        std::fs::write(path, &bytes).unwrap();
        set_mode(path, 0o400);
    };
    build(&even, u32::MAX);
    build(&odd, 0);

    // 0 is exactly one past u32::MAX
    assert_eq!(
        latest_snapshot(&even, &odd).unwrap(),
        SnapshotSelection::Chosen(odd.clone())
    );
}
