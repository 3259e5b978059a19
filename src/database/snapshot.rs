//! # Crash-Tolerant Snapshots
//!
//! Optional durability layer over two alternating snapshot files on a
//! reflink-capable filesystem. A snapshot file's permission bits are the
//! commit signal: mode `0200` (write-only) says "do not recover from me,
//! writing in progress or stale", mode `0400` (read-only) says "recover
//! from me". Each successful sync runs:
//!
//! 1. chmod the current slot to `0200`, fsync it
//! 2. reflink-clone the database file over it, fsync
//! 3. chmod it to `0400`, fsync
//! 4. chmod the previous slot down to `0200`, fsync it
//! 5. toggle the current slot
//!
//! A crash can therefore leave zero, one, or two readable snapshots, and
//! [`latest_snapshot`] sorts the cases out — with the extended format's
//! `numsync` counter breaking the two-readable tie (the counters of two
//! consecutive good snapshots differ by exactly one, modulo wrap).
//!
//! Arming requires both filenames to be fresh, on the database's
//! filesystem; the directories of all three files are fsync'd up to the
//! root so the names themselves survive a crash.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::storage::header;

/// The armed snapshot pair.
#[derive(Debug)]
pub(crate) struct SnapshotState {
    files: [File; 2],
    paths: [PathBuf; 2],
    /// Slot the next snapshot writes into.
    current: usize,
}

/// Outcome of the post-crash selection procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelection {
    /// Exactly one sound candidate.
    Chosen(PathBuf),
    /// Both readable but their sync counters do not differ by one; the
    /// younger file by mtime is offered, with reduced confidence.
    Suspicious(PathBuf),
    /// Both readable with identical mtimes; no basis to choose.
    Same,
    /// Neither snapshot is readable — the crash hit while arming.
    Bad,
}

fn fchmod(file: &File, mode: u32) -> Result<()> {
    // SAFETY: fchmod on an owned open descriptor.
    let rc = unsafe { libc::fchmod(file.as_raw_fd(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(Error::FileMode);
    }
    Ok(())
}

fn reflink(dst: &File, src: &File) -> Result<()> {
    // SAFETY: FICLONE takes the source descriptor as its argument; both
    // descriptors are owned and open.
    let rc = unsafe { libc::ioctl(dst.as_raw_fd(), libc::FICLONE as _, src.as_raw_fd()) };
    if rc != 0 {
        return Err(Error::SnapshotClone);
    }
    Ok(())
}

/// fsync every directory on the canonical path of `path`, up to the root,
/// so the directory entries referencing the file are durable.
fn fsync_to_root(path: &Path) -> Result<()> {
    let real = std::fs::canonicalize(path).map_err(|_| Error::Realpath)?;
    let mut dir = real.parent();
    while let Some(d) = dir {
        let handle = File::open(d)?;
        handle.sync_all()?;
        dir = d.parent();
    }
    Ok(())
}

impl Database {
    /// Arm crash-tolerant snapshots over the pair `(even, odd)`.
    ///
    /// Both names must not exist yet and must live on the same filesystem
    /// as the database. Re-arming an armed handle replaces the prior pair.
    /// The first snapshot is taken immediately.
    pub fn set_failure_atomic<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        even: P,
        odd: Q,
    ) -> Result<()> {
        self.check_consistency()?;
        let result = self.arm_snapshots(even.as_ref(), odd.as_ref());
        self.seal(result)
    }

    fn arm_snapshots(&mut self, even: &Path, odd: &Path) -> Result<()> {
        if !self.is_writer() {
            return Err(Error::CannotBeReader);
        }
        if even == odd {
            return Err(Error::Usage);
        }
        // re-arming replaces the prior pair
        self.snapshot = None;

        let open_snapshot = |path: &Path| -> Result<File> {
            Ok(OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o200)
                .open(path)?)
        };
        let even_file = open_snapshot(even)?;
        let odd_file = match open_snapshot(odd) {
            Ok(f) => f,
            Err(e) => {
                let _ = std::fs::remove_file(even);
                return Err(e);
            }
        };

        let armed = (|| -> Result<()> {
            // reflink cloning cannot cross filesystems
            let db_dev = self.file.file().metadata()?.dev();
            if even_file.metadata()?.dev() != db_dev || odd_file.metadata()?.dev() != db_dev {
                return Err(Error::SnapshotClone);
            }
            fsync_to_root(even)?;
            fsync_to_root(odd)?;
            fsync_to_root(&self.path)?;
            Ok(())
        })();

        if let Err(e) = armed {
            let _ = std::fs::remove_file(even);
            let _ = std::fs::remove_file(odd);
            return Err(e);
        }

        self.snapshot = Some(SnapshotState {
            files: [even_file, odd_file],
            paths: [even.to_path_buf(), odd.to_path_buf()],
            current: 0,
        });

        if let Err(e) = self.snapshot_step() {
            self.snapshot = None;
            let _ = std::fs::remove_file(even);
            let _ = std::fs::remove_file(odd);
            return Err(e);
        }
        log::debug!(
            "snapshots armed over {} / {}",
            even.display(),
            odd.display()
        );
        Ok(())
    }

    /// Produce one snapshot; no-op when unarmed. A failed clone disarms
    /// the protocol (the filesystem evidently cannot support it).
    pub(crate) fn snapshot_step(&mut self) -> Result<()> {
        let Some(snap) = &mut self.snapshot else {
            return Ok(());
        };
        let current = &snap.files[snap.current];
        let previous = &snap.files[1 - snap.current];

        // "do not recover from this: writing in progress"
        fchmod(current, 0o200)?;
        current.sync_all()?;

        if let Err(e) = reflink(current, self.file.file()) {
            log::warn!(
                "snapshot clone into {} failed; disarming",
                snap.paths[snap.current].display()
            );
            self.snapshot = None;
            return Err(e);
        }
        current.sync_all()?;

        // "recover from this: writing completed"
        fchmod(current, 0o400)?;
        current.sync_all()?;

        // demote the older snapshot
        fchmod(previous, 0o200)?;
        previous.sync_all()?;

        snap.current = 1 - snap.current;
        Ok(())
    }

    /// Whether the snapshot protocol is armed.
    pub fn failure_atomic(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// The permission checks of the selection procedure: a snapshot file must
/// be a regular file, not executable, and not both readable and writable.
fn snapshot_mode(path: &Path) -> Result<(bool, std::time::SystemTime)> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(Error::FileMode);
    }
    let mode = meta.permissions().mode();
    if mode & 0o100 != 0 {
        return Err(Error::FileMode);
    }
    let readable = mode & 0o400 != 0;
    let writable = mode & 0o200 != 0;
    if readable && writable {
        return Err(Error::FileMode);
    }
    // SAFETY: geteuid has no failure modes.
    if meta.uid() != unsafe { libc::geteuid() } {
        return Err(Error::FileOwner);
    }
    Ok((readable, meta.modified()?))
}

/// Read the `numsync` counter out of a snapshot's extended header, if the
/// snapshot carries one.
fn snapshot_numsync(path: &Path) -> Option<u32> {
    let mut buf = [0u8; 48];
    let mut file = File::open(path).ok()?;
    file.read_exact(&mut buf).ok()?;
    let magic = u32::from_ne_bytes(buf[..4].try_into().ok()?);
    if magic != header::NUMSYNC_MAGIC {
        return None;
    }
    Some(u32::from_ne_bytes(buf[44..48].try_into().ok()?))
}

/// Select the snapshot to recover from after a crash.
///
/// Exactly one readable file wins outright. When both are readable the
/// sync counters decide: the one exactly one ahead (modulo wrap) is the
/// younger committed state. Counters that are equal or further apart —
/// or absent, in the standard format — fall back to modification times.
pub fn latest_snapshot<P: AsRef<Path>, Q: AsRef<Path>>(
    even: P,
    odd: Q,
) -> Result<SnapshotSelection> {
    let even = even.as_ref();
    let odd = odd.as_ref();
    if even == odd {
        return Err(Error::Usage);
    }

    let (even_readable, even_mtime) = snapshot_mode(even)?;
    let (odd_readable, odd_mtime) = snapshot_mode(odd)?;

    match (even_readable, odd_readable) {
        (true, false) => return Ok(SnapshotSelection::Chosen(even.to_path_buf())),
        (false, true) => return Ok(SnapshotSelection::Chosen(odd.to_path_buf())),
        (false, false) => return Ok(SnapshotSelection::Bad),
        (true, true) => {}
    }

    if let (Some(even_sync), Some(odd_sync)) = (snapshot_numsync(even), snapshot_numsync(odd)) {
        if even_sync.wrapping_sub(odd_sync) == 1 {
            return Ok(SnapshotSelection::Chosen(even.to_path_buf()));
        }
        if odd_sync.wrapping_sub(even_sync) == 1 {
            return Ok(SnapshotSelection::Chosen(odd.to_path_buf()));
        }
        // counters out of step: something interfered with the protocol
        return Ok(match even_mtime.cmp(&odd_mtime) {
            std::cmp::Ordering::Greater => SnapshotSelection::Suspicious(even.to_path_buf()),
            std::cmp::Ordering::Less => SnapshotSelection::Suspicious(odd.to_path_buf()),
            std::cmp::Ordering::Equal => SnapshotSelection::Same,
        });
    }

    // standard format: modification time is all there is
    Ok(match even_mtime.cmp(&odd_mtime) {
        std::cmp::Ordering::Greater => SnapshotSelection::Chosen(even.to_path_buf()),
        std::cmp::Ordering::Less => SnapshotSelection::Chosen(odd.to_path_buf()),
        std::cmp::Ordering::Equal => SnapshotSelection::Same,
    })
}
