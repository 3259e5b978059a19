//! # Database Handle
//!
//! The single-writer handle over one database file. A lookup is three hops:
//! hash the key, index the directory with the top `dir_bits` bits, then
//! linear-probe the bucket the entry points at. Stores may split the
//! current bucket (repeatedly) and double the directory; deletes compact
//! the probe chain they punch a hole into.
//!
//! The handle owns the header block, the directory, the bucket cache, and
//! the avail pools for its whole lifetime. The *current bucket* is the MRU
//! cache entry; the free-space allocator prefers its avail table, which
//! keeps space recycling local to the bucket being mutated.
//!
//! ## Consistency
//!
//! A failed write-path I/O call or a structural validation failure poisons
//! the handle: every following mutation fails with `NeedRecovery` until
//! [`Database::recover`] rebuilds the file. The last error and the OS errno
//! that accompanied it stay readable through [`Database::last_error`] and
//! [`Database::last_errno`].

use std::path::{Path, PathBuf};

use smallvec::SmallVec;

use crate::error::{Error, ErrorCode, Result};
use crate::hash::{dir_index, hash_key, slot_index, HASH_BITS};
use crate::storage::avail::AvailElem;
use crate::storage::cache::LastFind;
use crate::storage::dir::Directory;
use crate::storage::header::Header;
use crate::storage::{
    Bucket, BucketCache, BucketElement, DbFile, LockMethod, KEY_START_LEN, MAX_DIR_SIZE,
};

use crate::database::options::Config;
use crate::database::snapshot::SnapshotState;

pub(crate) mod alloc;
pub(crate) mod iter;
pub(crate) mod options;
pub(crate) mod open;
pub(crate) mod recover;
pub(crate) mod reorg;
pub(crate) mod snapshot;
pub(crate) mod sync;

pub use iter::Keys;
pub use options::{DbOptions, SetOption};
pub use recover::{RecoverOptions, RecoveryReport};
pub use snapshot::{latest_snapshot, SnapshotSelection};

/// How a database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; the file must exist; mutating calls fail.
    Reader,
    /// Read-write; the file must exist.
    Writer,
    /// Read-write; create the file when absent.
    WrCreate,
    /// Read-write; truncate or create.
    NewDb,
}

impl OpenMode {
    pub fn is_writer(self) -> bool {
        !matches!(self, OpenMode::Reader)
    }
}

/// Store conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with `CannotReplace` when the key exists.
    Insert,
    /// Overwrite an existing value.
    Replace,
}

/// An open database.
pub struct Database {
    pub(crate) path: PathBuf,
    pub(crate) file: DbFile,
    pub(crate) header: Header,
    pub(crate) dir: Directory,
    pub(crate) cache: BucketCache,
    /// Cache index of the current bucket (the MRU entry).
    pub(crate) current: Option<usize>,
    /// Directory index the current bucket was reached through.
    pub(crate) bucket_dir: usize,
    pub(crate) config: Config,
    pub(crate) header_changed: bool,
    pub(crate) directory_changed: bool,
    pub(crate) need_recovery: bool,
    pub(crate) lock: Option<LockMethod>,
    pub(crate) snapshot: Option<SnapshotState>,
    pub(crate) last_error: Option<ErrorCode>,
    pub(crate) last_errno: Option<i32>,
    pub(crate) closed: bool,
}

impl Database {
    /// Start building open options.
    pub fn options() -> DbOptions {
        DbOptions::new()
    }

    /// Open with default options in the given mode.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        DbOptions::new().mode(mode).open(path)
    }

    /// Record an error on the handle; fatal kinds poison it.
    pub(crate) fn record(&mut self, err: Error) -> Error {
        self.last_error = Some(err.code());
        if let Some(errno) = err.errno() {
            self.last_errno = Some(errno);
        }
        if err.is_fatal() {
            self.need_recovery = true;
        }
        err
    }

    pub(crate) fn seal<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.record(e))
    }

    /// Poison the handle directly (structural failures spotted before an
    /// error value exists).
    pub(crate) fn poison(&mut self, err: Error) -> Error {
        self.need_recovery = true;
        self.record(err)
    }

    pub(crate) fn check_consistency(&self) -> Result<()> {
        if self.need_recovery {
            Err(Error::NeedRecovery)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_writer(&self) -> bool {
        self.config.mode.is_writer()
    }

    fn check_writer(&self, err: Error) -> Result<()> {
        if self.is_writer() {
            Ok(())
        } else {
            Err(err)
        }
    }

    /// The path the database was opened at.
    pub fn db_name(&self) -> &Path {
        &self.path
    }

    /// The mode the handle was opened in.
    pub fn open_mode(&self) -> OpenMode {
        self.config.mode
    }

    /// Last error recorded on this handle.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// OS errno accompanying the last recorded I/O error.
    pub fn last_errno(&self) -> Option<i32> {
        self.last_errno
    }

    /// Whether a fatal error has poisoned the handle.
    pub fn needs_recovery(&self) -> bool {
        self.need_recovery
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size()
    }

    pub fn dir_bits(&self) -> u32 {
        self.header.dir_bits()
    }

    // ------------------------------------------------------------------
    // Bucket plumbing
    // ------------------------------------------------------------------

    /// Make the bucket referenced by `dir_index` current, reading it from
    /// disk on a cache miss.
    pub(crate) fn get_bucket(&mut self, index: usize) -> Result<()> {
        let adr = self.dir.get(index).ok_or(Error::BadDirEntry)?;
        if adr < self.header.block_size() as u64 {
            return Err(self.poison(Error::BadDirEntry));
        }
        self.bucket_dir = index;

        if let Some(cur) = self.current {
            if self.cache.adr(cur) == adr {
                return Ok(());
            }
        }

        if let Some(idx) = self.cache.lookup(adr) {
            // promoting a clean entry over dirty ones would break the
            // dirty-prefix discipline
            if !self.cache.is_changed(idx) && self.cache.has_dirty() {
                self.flush_dirty()?;
            }
            self.cache.promote(idx);
            self.current = Some(idx);
            return Ok(());
        }

        self.make_cache_room()?;

        let size = self.header.bucket_size() as usize;
        let mut buf = vec![0u8; size].into_boxed_slice();
        if let Err(e) = self.file.read_exact_at(adr, &mut buf) {
            return Err(self.poison(e));
        }
        let mut bucket = Bucket::from_bytes(buf).map_err(|e| self.poison(e))?;
        bucket
            .validate(
                self.header.bucket_elems(),
                self.header.dir_bits(),
                self.header.block_size() as u64,
                self.header.next_block(),
                self.is_writer(),
            )
            .map_err(|e| self.poison(e))?;

        if self.cache.has_dirty() {
            self.flush_dirty()?;
        }
        let idx = self.cache.insert_head(adr, bucket, false);
        self.current = Some(idx);
        Ok(())
    }

    fn make_cache_room(&mut self) -> Result<()> {
        if !self.cache.is_full() {
            return Ok(());
        }
        let ceiling = 1usize
            .checked_shl(self.header.dir_bits())
            .unwrap_or(usize::MAX);
        if self.cache.grow(ceiling.max(self.cache.capacity())) {
            return Ok(());
        }
        let lru = self.cache.lru().expect("full cache has an LRU entry");
        self.evict(lru)
    }

    /// Evict one entry, writing it back first when dirty.
    pub(crate) fn evict(&mut self, idx: usize) -> Result<()> {
        if self.cache.is_changed(idx) {
            self.write_bucket(idx)?;
        }
        if self.current == Some(idx) {
            self.current = None;
        }
        self.cache.remove(idx);
        Ok(())
    }

    /// The only place a bucket is written.
    pub(crate) fn write_bucket(&mut self, idx: usize) -> Result<()> {
        let adr = self.cache.adr(idx);
        let result = self.file.write_all_at(adr, self.cache.bucket(idx).as_bytes());
        if let Err(e) = result {
            return Err(self.poison(e));
        }
        self.cache.set_changed(idx, false);
        self.cache.set_last_find(idx, None);
        Ok(())
    }

    /// Write the dirty prefix of the cache (head first, stops at the first
    /// clean entry).
    pub(crate) fn flush_dirty(&mut self) -> Result<()> {
        let mut cur = self.cache.mru();
        while let Some(idx) = cur {
            if !self.cache.is_changed(idx) {
                break;
            }
            self.write_bucket(idx)?;
            cur = self.cache.next_of(idx);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key lookup
    // ------------------------------------------------------------------

    /// Bounds-check a payload reference against the allocated file region.
    fn check_record(&mut self, offset: u64, len: u32) -> Result<()> {
        let end = offset.checked_add(len as u64);
        if offset < self.header.block_size() as u64
            || end.map_or(true, |end| end > self.header.next_block())
        {
            return Err(self.poison(Error::MalformedData));
        }
        Ok(())
    }

    fn read_record(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        self.check_record(offset, len)?;
        let mut buf = vec![0u8; len as usize];
        if let Err(e) = self.file.read_exact_at(offset, &mut buf) {
            return Err(self.poison(e));
        }
        Ok(buf)
    }

    fn write_record(&mut self, offset: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.file.write_all_at(offset, key)?;
        self.file.write_all_at(offset + key.len() as u64, value)?;
        Ok(())
    }

    /// Probe the current bucket for a key. Returns the slot index, or None
    /// when an empty slot terminates the chain.
    pub(crate) fn findkey(&mut self, key: &[u8], hash: i32) -> Result<Option<usize>> {
        let cur = self.current.expect("current bucket is established");

        if let Some(memo) = self.cache.last_find(cur) {
            if memo.hash == hash && memo.key == key {
                return Ok(Some(memo.loc));
            }
        }

        let n = self.header.bucket_elems() as usize;
        let mut loc = slot_index(hash, n as u32);
        for _ in 0..n {
            let slot = self.cache.bucket(cur).slots()[loc];
            if slot.is_empty() {
                return Ok(None);
            }
            if slot.matches_prefix(hash, key) {
                // the inline prefix covers short keys entirely; longer keys
                // need the stored bytes
                let matched = if key.len() <= KEY_START_LEN {
                    true
                } else {
                    let stored = self.read_record(slot.data_pointer(), slot.key_size())?;
                    stored == key
                };
                if matched {
                    self.cache.set_last_find(
                        cur,
                        Some(LastFind {
                            hash,
                            key: key.to_vec(),
                            loc,
                        }),
                    );
                    return Ok(Some(loc));
                }
            }
            loc = (loc + 1) % n;
        }
        Ok(None)
    }

    fn locate(&mut self, key: &[u8]) -> Result<Option<usize>> {
        let (hash, dindex, _) = hash_key(key, self.header.dir_bits(), self.header.bucket_elems());
        self.get_bucket(dindex)?;
        self.findkey(key, hash)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Fetch the value stored under `key` into a fresh buffer.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_consistency()?;
        let result = self.fetch_inner(key);
        self.seal(result)
    }

    fn fetch_inner(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let loc = self.locate(key)?.ok_or(Error::ItemNotFound)?;
        let cur = self.current.expect("current bucket is established");
        let slot = self.cache.bucket(cur).slots()[loc];
        let Some(offset) = slot.data_pointer().checked_add(slot.key_size() as u64) else {
            return Err(self.poison(Error::MalformedData));
        };
        self.read_record(offset, slot.data_size())
    }

    /// Whether `key` is present.
    pub fn exists(&mut self, key: &[u8]) -> Result<bool> {
        self.check_consistency()?;
        let result = self.locate(key).map(|loc| loc.is_some());
        self.seal(result)
    }

    /// Store a key/value pair.
    pub fn store(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.check_consistency()?;
        if let Err(e) = self.check_writer(Error::ReaderCannotStore) {
            return Err(self.record(e));
        }
        if key.is_empty() {
            return Err(self.record(Error::MalformedData));
        }
        if key.len().checked_add(value.len()).map_or(true, |n| n > u32::MAX as usize) {
            return Err(self.record(Error::MalformedData));
        }
        let result = self.store_inner(key, value, mode);
        self.seal(result)?;
        if self.config.sync_mode {
            let result = self.sync_inner();
            self.seal(result)?;
        }
        Ok(())
    }

    fn store_inner(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        let record_size = (key.len() + value.len()) as u32;
        match self.locate(key)? {
            Some(loc) => {
                if mode == StoreMode::Insert {
                    return Err(Error::CannotReplace);
                }
                let cur = self.current.expect("current bucket is established");
                let old = self.cache.bucket(cur).slots()[loc];
                self.free(old.data_pointer(), old.record_size())?;
                let adr = self.alloc(record_size)?;
                self.write_record(adr, key, value)?;
                let cur = self.current.expect("current bucket is established");
                self.cache.bucket_mut(cur).slots_mut()[loc].set_data(adr, value.len() as u32);
                self.cache.set_changed(cur, true);
                self.cache.set_last_find(cur, None);
            }
            None => {
                let cur = self.current.expect("current bucket is established");
                if self.cache.bucket(cur).is_full() {
                    let hash = crate::hash::key_hash(key);
                    self.split_bucket(hash)?;
                }
                let adr = self.alloc(record_size)?;
                self.write_record(adr, key, value)?;
                let hash = crate::hash::key_hash(key);
                let elem = BucketElement::new(hash, key, adr, value.len() as u32);
                let cur = self.current.expect("current bucket is established");
                self.cache.bucket_mut(cur).insert_element(elem)?;
                self.cache.set_changed(cur, true);
                self.cache.set_last_find(cur, None);
            }
        }
        debug_assert!(self.cache.dirty_prefix_is_contiguous());
        Ok(())
    }

    /// Remove a key.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_consistency()?;
        if let Err(e) = self.check_writer(Error::ReaderCannotDelete) {
            return Err(self.record(e));
        }
        let result = self.delete_inner(key);
        self.seal(result)?;
        if self.config.sync_mode {
            let result = self.sync_inner();
            self.seal(result)?;
        }
        Ok(())
    }

    fn delete_inner(&mut self, key: &[u8]) -> Result<()> {
        let loc = self.locate(key)?.ok_or(Error::ItemNotFound)?;
        let cur = self.current.expect("current bucket is established");
        let slot = self.cache.bucket(cur).slots()[loc];
        self.free(slot.data_pointer(), slot.record_size())?;
        let cur = self.current.expect("current bucket is established");
        self.cache.bucket_mut(cur).remove_slot(loc);
        self.cache.set_changed(cur, true);
        self.cache.set_last_find(cur, None);
        debug_assert!(self.cache.dirty_prefix_is_contiguous());
        Ok(())
    }

    /// Exact number of stored keys, by traversing every distinct bucket.
    pub fn count(&mut self) -> Result<u64> {
        self.check_consistency()?;
        let result = self.count_inner();
        self.seal(result)
    }

    fn count_inner(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let mut index = 0;
        while index < self.dir.len() {
            self.get_bucket(index)?;
            let cur = self.current.expect("current bucket is established");
            total += self.cache.bucket(cur).count() as u64;
            index = self.dir.next_distinct(index);
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    /// Split the current (full) bucket until the inserting key's bucket has
    /// room, doubling the directory when a bucket's depth catches up with
    /// it.
    pub(crate) fn split_bucket(&mut self, next_hash: i32) -> Result<()> {
        let bucket_size = self.header.bucket_size();
        let block_size = self.header.block_size();
        let elems = self.header.bucket_elems();
        let coalesce = self.config.coalesce_blocks;
        // directory regions replaced by doubling, freed after the loop
        let mut old_dirs: SmallVec<[(u64, u32); 4]> = SmallVec::new();

        loop {
            let cur = self.current.expect("current bucket is established");
            if !self.cache.bucket(cur).is_full() {
                break;
            }
            let new_bits = self.cache.bucket(cur).bits() + 1;

            let adr_0 = self.alloc(bucket_size)?;
            if self.cache.peek(adr_0).is_some() {
                return Err(self.poison(Error::BucketCacheCorrupted));
            }
            let e0 = self
                .cache
                .insert_after(adr_0, Bucket::new(elems, new_bits), true, cur);

            let adr_1 = self.alloc(bucket_size)?;
            if self.cache.peek(adr_1).is_some() {
                return Err(self.poison(Error::BucketCacheCorrupted));
            }
            let e1 = self
                .cache
                .insert_after(adr_1, Bucket::new(elems, new_bits), true, e0);

            // double the directory when the split outgrows it
            if self.header.dir_bits() == new_bits - 1 {
                if self.header.dir_size() as u64 >= MAX_DIR_SIZE / 2 {
                    return Err(self.record(Error::DirOverflow));
                }
                let new_dir_size = self.header.dir_size() * 2;
                let dir_adr = self.alloc(new_dir_size)?;
                old_dirs.push((self.header.dir(), self.header.dir_size()));
                self.dir.double();
                self.header.set_dir(dir_adr, new_dir_size, new_bits);
                self.bucket_dir *= 2;
                self.header_changed = true;
            }

            // rehash every slot of the old bucket into the pair
            let shift = HASH_BITS - new_bits;
            for i in 0..elems as usize {
                let slot = self.cache.bucket(cur).slots()[i];
                if slot.hash() < 0 {
                    return Err(self.poison(Error::BadBucket));
                }
                let target = if (slot.hash() as u32 >> shift) & 1 == 0 {
                    e0
                } else {
                    e1
                };
                self.cache.bucket_mut(target).insert_element(slot)?;
            }

            // the second bucket starts out with one fresh block of free
            // space; the first inherits the old bucket's avail table
            let fresh = self.alloc(block_size)?;
            {
                let header = self.cache.bucket_mut(e1).header_mut();
                header.avail_mut()[0] = AvailElem::new(block_size, fresh);
                header.set_av_count(1);
            }
            let (old_avail, old_avail_count) = {
                let header = self.cache.bucket(cur).header();
                (*header.avail(), header.av_count() as usize)
            };
            let mut start = 0;
            if old_avail_count == old_avail.len() {
                // full table: the smallest entry moves to the second bucket
                self.cache.bucket_mut(e1).put_avail(old_avail[0], coalesce);
                start = 1;
            }
            {
                let header = self.cache.bucket_mut(e0).header_mut();
                header.avail_mut()[..old_avail_count - start]
                    .copy_from_slice(&old_avail[start..old_avail_count]);
                header.set_av_count((old_avail_count - start) as u32);
            }

            // rewrite the directory run: lower half to adr_0, upper to adr_1
            self.dir
                .split_run(self.bucket_dir, self.header.dir_bits(), new_bits, adr_0, adr_1);
            self.directory_changed = true;

            // finalize the cache before the old bucket's region is recycled
            self.bucket_dir = dir_index(next_hash, self.header.dir_bits());
            let old_region = AvailElem::new(bucket_size, self.cache.adr(cur));
            self.current = None;
            self.cache.remove(cur);
            let target_adr = self
                .dir
                .get(self.bucket_dir)
                .ok_or(Error::BadDirEntry)?;
            let (target, other) = if target_adr == adr_0 { (e0, e1) } else { (e1, e0) };

            // the old bucket's file region feeds the non-current bucket
            if !self.cache.bucket_mut(other).put_avail(old_region, coalesce) {
                self.free_to_master(old_region)?;
            }

            self.cache.promote(target);
            self.current = Some(target);
            self.trim_cache(&[target, other])?;
            debug_assert!(self.cache.dirty_prefix_is_contiguous());
        }

        for (adr, size) in old_dirs {
            self.free(adr, size)?;
        }
        Ok(())
    }

    /// Evict down to capacity, sparing the named entries.
    fn trim_cache(&mut self, keep: &[usize]) -> Result<()> {
        while self.cache.len() > self.cache.capacity() {
            let ceiling = 1usize
                .checked_shl(self.header.dir_bits())
                .unwrap_or(usize::MAX);
            if self.cache.grow(ceiling.max(self.cache.capacity())) {
                break;
            }
            let Some(lru) = self.cache.lru() else { break };
            if keep.contains(&lru) || self.current == Some(lru) {
                break;
            }
            self.evict(lru)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cache tuning and diagnostics
    // ------------------------------------------------------------------

    /// Structural self-check: every directory run must be aligned and
    /// sized to its bucket's depth, and the avail stack must stay inside
    /// the allocated file region.
    pub fn verify(&mut self) -> Result<()> {
        self.check_consistency()?;
        let result = self.verify_inner();
        self.seal(result)
    }

    fn verify_inner(&mut self) -> Result<()> {
        let dir_bits = self.header.dir_bits();
        let mut index = 0;
        while index < self.dir.len() {
            let next = self.dir.next_distinct(index);
            self.get_bucket(index)?;
            let cur = self.current.expect("current bucket is established");
            let bits = self.cache.bucket(cur).bits();
            if bits > dir_bits {
                return Err(Error::BadBucket);
            }
            let run = 1usize << (dir_bits - bits);
            if next - index != run || index % run != 0 {
                return Err(Error::BadDirEntry);
            }
            index = next;
        }
        self.avail_verify()
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> crate::storage::CacheStats {
        self.cache.stats()
    }

    /// Per-entry `(bucket offset, hits)` in most-recently-used order.
    pub fn cache_entry_stats(&self) -> Vec<(u64, u64)> {
        self.cache.entry_stats()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("mode", &self.config.mode)
            .field("block_size", &self.header.block_size())
            .field("dir_bits", &self.header.dir_bits())
            .field("need_recovery", &self.need_recovery)
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed {
            // best-effort: a poisoned handle skips the flush
            let _ = self.shutdown();
        }
    }
}
