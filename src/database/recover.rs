//! # Recovery
//!
//! Rebuilds a consistent database out of a possibly-corrupt one. Every
//! bucket reachable from the directory is read with permissive checks,
//! every slot payload that still makes sense is copied into a fresh
//! database, and on success the fresh file atomically replaces the
//! original — optionally after renaming the original to a timestamped
//! backup. The handle is rebound to the rebuilt file.
//!
//! Counters track what was salvaged and what was not; the caller can cap
//! the tolerated damage, turning "too broken" into an error instead of a
//! silently thin result.

use std::path::PathBuf;

use crate::database::options::Config;
use crate::database::{Database, OpenMode, StoreMode};
use crate::error::{Error, Result};
use crate::storage::cache::CacheCapacity;
use crate::storage::Bucket;

/// Knobs for [`Database::recover`].
#[derive(Default)]
pub struct RecoverOptions<'a> {
    /// Rebuild even when the handle is not poisoned.
    pub force: bool,
    /// Keep the original file as `<name>.<YYYYMMDDHHMMSS>`.
    pub backup: bool,
    /// Abort when more keys than this fail to read.
    pub max_failed_keys: Option<u64>,
    /// Abort when more buckets than this fail to read.
    pub max_failed_buckets: Option<u64>,
    /// Abort on this many failures of any kind.
    pub max_failures: Option<u64>,
    /// Callback receiving a line per salvage problem.
    pub diagnostic: Option<&'a mut dyn FnMut(&str)>,
}

/// What recovery managed to salvage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered_keys: u64,
    pub recovered_buckets: u64,
    pub failed_keys: u64,
    pub failed_buckets: u64,
    pub duplicate_keys: u64,
    pub backup_path: Option<PathBuf>,
}

impl RecoveryReport {
    fn failures(&self) -> u64 {
        self.failed_keys + self.failed_buckets
    }

    fn within(&self, opts: &RecoverOptions<'_>) -> bool {
        opts.max_failed_keys.map_or(true, |m| self.failed_keys <= m)
            && opts
                .max_failed_buckets
                .map_or(true, |m| self.failed_buckets <= m)
            && opts.max_failures.map_or(true, |m| self.failures() <= m)
    }
}

impl Database {
    /// Path for a scratch rebuild next to the database.
    pub(crate) fn scratch_path(&self, tag: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}.{}", tag, std::process::id()));
        PathBuf::from(name)
    }

    /// Configuration for the scratch database a rebuild writes into.
    pub(crate) fn scratch_config(&self) -> Config {
        let mut config = self.config.clone();
        config.mode = OpenMode::NewDb;
        config.block_size = self.header.block_size();
        config.format = self.header.format();
        config.cache = CacheCapacity::Auto;
        config.locking = false;
        config.sync_mode = false;
        config
    }

    /// Swap the rebuilt file into place and rebind the handle to it.
    pub(crate) fn rebind(&mut self) -> Result<()> {
        let config = self.config.clone();
        let fresh = Database::open_with_config(&self.path, config)?;
        self.closed = true;
        let old = std::mem::replace(self, fresh);
        drop(old);
        Ok(())
    }

    /// Rebuild the database from whatever survives in the file.
    ///
    /// Without `force`, a healthy handle returns an empty report and the
    /// file is left alone.
    pub fn recover(&mut self, mut opts: RecoverOptions<'_>) -> Result<RecoveryReport> {
        if !self.is_writer() {
            return Err(self.record(Error::CannotBeReader));
        }
        if !self.need_recovery && !opts.force {
            return Ok(RecoveryReport::default());
        }

        let scratch = self.scratch_path("rcv");
        let result = self.salvage_into(&scratch, &mut opts);
        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                let _ = std::fs::remove_file(&scratch);
                return Err(self.record(e));
            }
        };

        // the rebuilt file replaces the original
        if opts.backup {
            let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
            let mut backup = self.path.as_os_str().to_os_string();
            backup.push(format!(".{stamp}"));
            let backup = PathBuf::from(backup);
            if std::fs::rename(&self.path, &backup).is_err() {
                let _ = std::fs::remove_file(&scratch);
                return Err(self.record(Error::BackupFailed));
            }
            report.backup_path = Some(backup);
        }
        if let Err(e) = std::fs::rename(&scratch, &self.path) {
            let _ = std::fs::remove_file(&scratch);
            return Err(self.record(Error::Io(e)));
        }

        self.rebind()?;
        log::debug!(
            "recovered {}: {} keys in {} buckets ({} keys, {} buckets lost, {} duplicates)",
            self.path.display(),
            report.recovered_keys,
            report.recovered_buckets,
            report.failed_keys,
            report.failed_buckets,
            report.duplicate_keys
        );
        Ok(report)
    }

    /// Copy every salvageable record into a fresh database at `scratch`.
    fn salvage_into(
        &mut self,
        scratch: &std::path::Path,
        opts: &mut RecoverOptions<'_>,
    ) -> Result<RecoveryReport> {
        let mut dest = Database::open_with_config(scratch, self.scratch_config())?;
        let mut report = RecoveryReport::default();

        let block_size = self.header.block_size() as u64;
        let bucket_size = self.header.bucket_size() as usize;
        let bucket_elems = self.header.bucket_elems();
        let dir_bits = self.header.dir_bits();
        let file_len = self.file.len();

        let mut index = 0;
        while index < self.dir.len() {
            let run_start = index;
            index = self.dir.next_distinct(index);

            let Some(adr) = self.dir.get(run_start) else {
                break;
            };
            let bucket = self.read_bucket_permissive(
                adr,
                block_size,
                bucket_size,
                bucket_elems,
                dir_bits,
                file_len,
            );
            let bucket = match bucket {
                Some(bucket) => bucket,
                None => {
                    report.failed_buckets += 1;
                    diagnose(opts, &format!("unreadable bucket at offset {adr}"));
                    if !report.within(opts) {
                        return Err(Error::MalformedData);
                    }
                    continue;
                }
            };

            for slot in bucket.slots() {
                if slot.is_empty() {
                    continue;
                }
                let key_size = slot.key_size() as u64;
                let data_size = slot.data_size() as u64;
                let start = slot.data_pointer();
                let sound = slot.key_size() > 0
                    && start >= block_size
                    && start
                        .checked_add(key_size + data_size)
                        .map_or(false, |end| end <= file_len);
                if !sound {
                    report.failed_keys += 1;
                    diagnose(opts, &format!("slot with unreadable payload at {start}"));
                    if !report.within(opts) {
                        return Err(Error::MalformedData);
                    }
                    continue;
                }

                let mut payload = vec![0u8; (key_size + data_size) as usize];
                if self.file.read_exact_at(start, &mut payload).is_err() {
                    report.failed_keys += 1;
                    diagnose(opts, &format!("short read of payload at {start}"));
                    if !report.within(opts) {
                        return Err(Error::MalformedData);
                    }
                    continue;
                }
                let (key, value) = payload.split_at(key_size as usize);

                match dest.store(key, value, StoreMode::Insert) {
                    Ok(()) => report.recovered_keys += 1,
                    Err(Error::CannotReplace) => {
                        report.duplicate_keys += 1;
                        diagnose(opts, "duplicate key dropped");
                    }
                    Err(e) => return Err(e),
                }
            }
            report.recovered_buckets += 1;
        }

        dest.sync()?;
        dest.close()?;
        Ok(report)
    }

    /// Read a bucket with only the checks salvage needs.
    fn read_bucket_permissive(
        &mut self,
        adr: u64,
        block_size: u64,
        bucket_size: usize,
        bucket_elems: u32,
        dir_bits: u32,
        file_len: u64,
    ) -> Option<Bucket> {
        if adr < block_size || adr + bucket_size as u64 > file_len {
            return None;
        }
        let mut buf = vec![0u8; bucket_size].into_boxed_slice();
        self.file.read_exact_at(adr, &mut buf).ok()?;
        let bucket = Bucket::from_bytes(buf).ok()?;
        (bucket.count() <= bucket_elems && bucket.bits() <= dir_bits).then_some(bucket)
    }
}

fn diagnose(opts: &mut RecoverOptions<'_>, message: &str) {
    if let Some(callback) = opts.diagnostic.as_deref_mut() {
        callback(message);
    }
}
