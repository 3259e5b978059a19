//! # Open Options and Runtime Tunables
//!
//! [`DbOptions`] is the builder handed out by [`Database::options`]; it
//! collects the open mode, geometry and behavioral flags, then opens the
//! file. A copy of the resolved configuration stays on the handle so
//! recovery and reorganization can rebind it to a rebuilt file with the
//! same settings.
//!
//! Runtime-changeable knobs go through [`Database::set_opt`]; flags that
//! only make sense at open time (locking, mmap, close-on-exec, file mode)
//! are builder-only.

use std::path::Path;

use crate::database::{Database, OpenMode};
use crate::error::{Error, Result};
use crate::storage::cache::CacheCapacity;
use crate::storage::header::FormatVersion;

/// Resolved open-time configuration, kept for rebinds.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub mode: OpenMode,
    pub block_size: u32,
    pub format: FormatVersion,
    pub cache: CacheCapacity,
    pub sync_mode: bool,
    pub central_free: bool,
    pub coalesce_blocks: bool,
    pub locking: bool,
    pub mmap: bool,
    pub max_map_size: usize,
    pub close_on_exec: bool,
    pub file_mode: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: OpenMode::Reader,
            block_size: 0,
            format: FormatVersion::Standard,
            cache: CacheCapacity::Auto,
            sync_mode: false,
            central_free: false,
            coalesce_blocks: false,
            locking: true,
            mmap: true,
            max_map_size: usize::MAX,
            close_on_exec: true,
            file_mode: 0o666,
        }
    }
}

/// Builder for opening a [`Database`].
#[derive(Debug, Clone, Default)]
pub struct DbOptions {
    config: Config,
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open mode (default: `Reader`).
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Block size for a database being created. Zero (the default) takes
    /// the filesystem's block size; other values are rounded up to a power
    /// of two and clamped to the supported range. Ignored when an existing
    /// database is opened.
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Create in the extended format carrying the sync counter.
    pub fn numsync(mut self, numsync: bool) -> Self {
        self.config.format = if numsync {
            FormatVersion::Numsync
        } else {
            FormatVersion::Standard
        };
        self
    }

    /// Bucket cache sizing (default: automatic growth).
    pub fn cache_size(mut self, cache: CacheCapacity) -> Self {
        self.config.cache = cache;
        self
    }

    /// fsync after every mutation instead of only on explicit syncs.
    pub fn sync_mode(mut self, on: bool) -> Self {
        self.config.sync_mode = on;
        self
    }

    /// Return freed blocks to the master avail pool instead of the
    /// per-bucket pool.
    pub fn central_free(mut self, on: bool) -> Self {
        self.config.central_free = on;
        self
    }

    /// Merge adjacent avail elements when freeing.
    pub fn coalesce_blocks(mut self, on: bool) -> Self {
        self.config.coalesce_blocks = on;
        self
    }

    /// Skip the advisory file lock; the caller takes responsibility for
    /// external mutual exclusion.
    pub fn no_lock(mut self) -> Self {
        self.config.locking = false;
        self
    }

    /// Skip the mmap fast path and use descriptor I/O only.
    pub fn no_mmap(mut self) -> Self {
        self.config.mmap = false;
        self
    }

    /// Cap for the mmap window.
    pub fn max_map_size(mut self, bytes: usize) -> Self {
        self.config.max_map_size = bytes;
        self
    }

    /// Whether the descriptor is closed across exec (default: true).
    pub fn close_on_exec(mut self, on: bool) -> Self {
        self.config.close_on_exec = on;
        self
    }

    /// Unix permission bits for a created database file.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = mode;
        self
    }

    /// Open the database at `path`.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Database> {
        Database::open_with_config(path.as_ref(), self.config)
    }
}

/// Tunables changeable on an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOption {
    /// Resize the bucket cache.
    CacheSize(CacheCapacity),
    /// fsync after every mutation.
    SyncMode(bool),
    /// Freed blocks go to the master avail pool.
    CentralFree(bool),
    /// Merge adjacent avail elements on free.
    CoalesceBlocks(bool),
    /// Cap for the mmap window.
    MaxMapSize(usize),
}

impl Database {
    /// Apply a runtime tunable.
    pub fn set_opt(&mut self, opt: SetOption) -> Result<()> {
        match opt {
            SetOption::CacheSize(capacity) => {
                if let CacheCapacity::Fixed(0) = capacity {
                    return Err(self.record(Error::OptBadVal));
                }
                // shrink first so the new policy's invariant holds
                if let CacheCapacity::Fixed(n) = capacity {
                    while self.cache.len() > n {
                        let Some(lru) = self.cache.lru() else { break };
                        let result = self.evict(lru);
                        self.seal(result)?;
                    }
                }
                self.cache.set_policy(capacity);
                self.config.cache = capacity;
            }
            SetOption::SyncMode(on) => self.config.sync_mode = on,
            SetOption::CentralFree(on) => self.config.central_free = on,
            SetOption::CoalesceBlocks(on) => self.config.coalesce_blocks = on,
            SetOption::MaxMapSize(bytes) => {
                self.file.set_max_map_size(bytes);
            }
        }
        Ok(())
    }

    /// Current bucket cache capacity in entries.
    pub fn cache_size(&self) -> usize {
        self.cache.capacity()
    }

    /// Whether every mutation is followed by a sync.
    pub fn sync_mode(&self) -> bool {
        self.config.sync_mode
    }

    /// Whether freed blocks bypass the per-bucket pools.
    pub fn central_free(&self) -> bool {
        self.config.central_free
    }

    /// Whether adjacent avail elements are merged on free.
    pub fn coalesce_blocks(&self) -> bool {
        self.config.coalesce_blocks
    }

    /// Current mmap window length in bytes.
    pub fn map_size(&self) -> usize {
        self.file.map_len()
    }

    /// Current mmap window cap.
    pub fn max_map_size(&self) -> usize {
        self.file.max_map_size()
    }
}
