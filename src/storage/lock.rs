//! # Advisory Whole-File Locking
//!
//! Readers take a shared lock, writers an exclusive one, always without
//! blocking. Three mechanisms are tried in order — `flock`, `lockf`,
//! `fcntl` byte-range — because each is unavailable or unreliable on some
//! combination of platform and filesystem. A mechanism that reports the
//! file as locked by someone else ends the attempt; only "mechanism not
//! usable here" moves on to the next one.
//!
//! `lockf` demands a descriptor open for writing, so it is skipped for
//! shared (reader) requests.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Which mechanism succeeded; needed again to unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMethod {
    Flock,
    Lockf,
    Fcntl,
}

enum TryLock {
    Ok,
    Fail,
    Next,
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn try_flock(fd: i32, exclusive: bool) -> TryLock {
    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    // SAFETY: flock on a valid owned descriptor has no memory-safety
    // concerns; it only manipulates kernel lock state.
    let rc = unsafe { libc::flock(fd, op | libc::LOCK_NB) };
    if rc == 0 {
        TryLock::Ok
    } else if errno() == libc::EWOULDBLOCK {
        TryLock::Fail
    } else {
        TryLock::Next
    }
}

fn try_lockf(fd: i32, exclusive: bool) -> TryLock {
    if !exclusive {
        // lockf fails with EINVAL on read-only descriptors
        return TryLock::Next;
    }
    // SAFETY: as above; lockf only manipulates kernel lock state.
    let rc = unsafe { libc::lockf(fd, libc::F_TLOCK, 0) };
    if rc == 0 {
        return TryLock::Ok;
    }
    match errno() {
        libc::EACCES | libc::EAGAIN | libc::EDEADLK => TryLock::Fail,
        _ => TryLock::Next,
    }
}

fn try_fcntl(fd: i32, exclusive: bool) -> TryLock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = if exclusive {
        libc::F_WRLCK as libc::c_short
    } else {
        libc::F_RDLCK as libc::c_short
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    // SAFETY: fl is a fully initialized flock struct and fd is valid.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if rc == 0 {
        return TryLock::Ok;
    }
    match errno() {
        libc::EACCES | libc::EAGAIN | libc::EDEADLK => TryLock::Fail,
        _ => TryLock::Next,
    }
}

/// Acquire the advisory lock, shared or exclusive.
pub fn lock_file(file: &File, exclusive: bool) -> Result<LockMethod> {
    let fd = file.as_raw_fd();
    match try_flock(fd, exclusive) {
        TryLock::Ok => return Ok(LockMethod::Flock),
        TryLock::Fail => return Err(Error::CannotLock),
        TryLock::Next => {}
    }
    match try_lockf(fd, exclusive) {
        TryLock::Ok => return Ok(LockMethod::Lockf),
        TryLock::Fail => return Err(Error::CannotLock),
        TryLock::Next => {}
    }
    match try_fcntl(fd, exclusive) {
        TryLock::Ok => Ok(LockMethod::Fcntl),
        _ => Err(Error::CannotLock),
    }
}

/// Release a lock taken by [`lock_file`]. Errors are ignored; the
/// descriptor is about to be closed anyway.
pub fn unlock_file(file: &File, method: LockMethod) {
    let fd = file.as_raw_fd();
    match method {
        LockMethod::Flock => {
            // SAFETY: see try_flock.
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }
        LockMethod::Lockf => {
            // SAFETY: see try_lockf.
            unsafe {
                libc::lockf(fd, libc::F_ULOCK, 0);
            }
        }
        LockMethod::Fcntl => {
            let mut fl: libc::flock = unsafe { std::mem::zeroed() };
            fl.l_type = libc::F_UNLCK as libc::c_short;
            fl.l_whence = libc::SEEK_SET as libc::c_short;
            // SAFETY: see try_fcntl.
            unsafe {
                libc::fcntl(fd, libc::F_SETLK, &fl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (dir, file)
    }

    #[test]
    fn exclusive_lock_and_unlock() {
        let (_dir, file) = scratch();
        let method = lock_file(&file, true).unwrap();
        unlock_file(&file, method);
    }

    #[test]
    fn shared_locks_coexist() {
        let (dir, file) = scratch();
        let other = std::fs::File::open(dir.path().join("lock.db")).unwrap();

        let m1 = lock_file(&file, false).unwrap();
        let m2 = lock_file(&other, false).unwrap();

        unlock_file(&file, m1);
        unlock_file(&other, m2);
    }

    #[test]
    fn exclusive_excludes_other_descriptor() {
        let (dir, file) = scratch();
        let other = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("lock.db"))
            .unwrap();

        let method = lock_file(&file, true).unwrap();
        // flock locks are per open-file-description, so a separate open
        // must be refused
        assert!(matches!(lock_file(&other, true), Err(Error::CannotLock)));
        unlock_file(&file, method);
    }
}
