//! # Open, Close, Format Conversion
//!
//! Opening resolves to one of two paths: initialize a fresh file (NewDb,
//! or WrCreate finding nothing) or load and validate an existing one.
//! Initialization lays the file out as header block, directory block, and
//! one empty bucket of depth zero allocated through the regular allocator.
//! Loading probes the magic and block size, reads and validates the whole
//! header block, pulls in the directory, verifies the avail stack on
//! writable handles, and establishes bucket 0 as current.
//!
//! Close syncs writer handles, then releases the lock, the snapshot
//! descriptors, and all memory. Both the explicit [`Database::close`] and
//! the `Drop` path funnel through one shutdown routine; a poisoned handle
//! skips the flush.

use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::database::options::Config;
use crate::database::{Database, OpenMode};
use crate::error::{Error, Result};
use crate::storage::dir::Directory;
use crate::storage::header::{self, FormatVersion, Header};
use crate::storage::{
    lock_file, normalize_block_size, unlock_file, Bucket, BucketCache, DbFile,
};

impl Database {
    pub(crate) fn open_with_config(path: &Path, config: Config) -> Result<Self> {
        let writable = config.mode.is_writer();

        let mut open_options = OpenOptions::new();
        open_options.read(true).mode(config.file_mode);
        match config.mode {
            OpenMode::Reader => {}
            OpenMode::Writer => {
                open_options.write(true);
            }
            OpenMode::WrCreate => {
                open_options.write(true).create(true);
            }
            OpenMode::NewDb => {
                open_options.write(true).create(true).truncate(true);
            }
        }

        let file = open_options.open(path)?;
        if !config.close_on_exec {
            // std always opens with O_CLOEXEC; drop it on request
            // SAFETY: plain descriptor-flag manipulation on an owned fd.
            unsafe {
                libc::fcntl(file.as_raw_fd(), libc::F_SETFD, 0);
            }
        }

        let lock = if config.locking {
            Some(lock_file(&file, writable)?)
        } else {
            None
        };

        let len = file.metadata()?.len();
        let create = match config.mode {
            OpenMode::NewDb => true,
            OpenMode::WrCreate => len == 0,
            OpenMode::Reader | OpenMode::Writer => false,
        };

        let result = if create {
            let fs_block = file.metadata()?.blksize() as u32;
            let requested = if config.block_size == 0 {
                fs_block
            } else {
                config.block_size
            };
            let block_size = normalize_block_size(requested);
            Self::initialize(path, file, lock, config, block_size)
        } else {
            Self::load(path, file, lock, config)
        };

        // the lock dies with the descriptor on the error path
        match result {
            Ok(db) => {
                log::debug!(
                    "opened {} ({:?}, block_size={}, dir_bits={})",
                    db.path.display(),
                    db.config.mode,
                    db.header.block_size(),
                    db.header.dir_bits()
                );
                Ok(db)
            }
            Err(e) => Err(e),
        }
    }

    fn initialize(
        path: &Path,
        file: std::fs::File,
        lock: Option<crate::storage::LockMethod>,
        config: Config,
        block_size: u32,
    ) -> Result<Self> {
        let file = DbFile::new(file, true, config.mmap, config.max_map_size)?;
        let header = Header::create(block_size, config.format);
        let bucket_size = header.bucket_size();
        let bucket_elems = header.bucket_elems();
        let dir_bits = header.dir_bits();

        let mut db = Database {
            path: path.to_path_buf(),
            file,
            header,
            dir: Directory::new_filled(dir_bits, 0),
            cache: BucketCache::new(config.cache),
            current: None,
            bucket_dir: 0,
            config,
            header_changed: true,
            directory_changed: true,
            need_recovery: false,
            lock,
            snapshot: None,
            last_error: None,
            last_errno: None,
            closed: false,
        };

        // the first bucket goes through the regular allocator, which
        // extends the file past the header and directory blocks
        let adr = db.alloc(bucket_size)?;
        db.dir = Directory::new_filled(dir_bits, adr);
        let idx = db.cache.insert_head(adr, Bucket::new(bucket_elems, 0), true);
        db.current = Some(idx);
        db.bucket_dir = 0;

        db.end_update()?;
        db.file.sync()?;
        Ok(db)
    }

    fn load(
        path: &Path,
        file: std::fs::File,
        lock: Option<crate::storage::LockMethod>,
        config: Config,
    ) -> Result<Self> {
        let writable = config.mode.is_writer();
        let mut file = DbFile::new(file, writable, config.mmap, config.max_map_size)?;
        if file.len() == 0 {
            return Err(Error::BadHeader("empty database file"));
        }

        let mut probe = [0u8; 8];
        file.read_exact_at(0, &mut probe)
            .map_err(|_| Error::BadHeader("file too small for a header"))?;
        let magic = u32::from_ne_bytes(probe[..4].try_into().expect("4-byte slice"));
        header::validate_magic(magic)?;
        let block_size = u32::from_ne_bytes(probe[4..8].try_into().expect("4-byte slice"));
        if !block_size.is_power_of_two()
            || !(crate::storage::MIN_BLOCK_SIZE..=crate::storage::MAX_BLOCK_SIZE)
                .contains(&block_size)
        {
            return Err(Error::BadHeader("block size out of range"));
        }

        let mut header_buf = vec![0u8; block_size as usize].into_boxed_slice();
        file.read_exact_at(0, &mut header_buf)
            .map_err(|_| Error::BadHeader("file too small for a header"))?;
        let mut header = Header::from_bytes(header_buf)?;
        header.validate(writable)?;

        let mut dir_buf = vec![0u8; header.dir_size() as usize];
        file.read_exact_at(header.dir(), &mut dir_buf)?;
        let dir = Directory::from_bytes(&dir_buf, header.dir_bits())?;

        let mut db = Database {
            path: path.to_path_buf(),
            file,
            header,
            dir,
            cache: BucketCache::new(config.cache),
            current: None,
            bucket_dir: 0,
            config,
            header_changed: false,
            directory_changed: false,
            need_recovery: false,
            lock,
            snapshot: None,
            last_error: None,
            last_errno: None,
            closed: false,
        };

        // writers walk the avail stack up front; a broken chain is better
        // found before the first allocation commits to it
        if writable {
            db.avail_verify()?;
        }

        db.get_bucket(0)?;
        Ok(db)
    }

    /// Sync (when writable) and release every resource. Idempotent.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    pub(crate) fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        if self.is_writer() && !self.need_recovery {
            let r = self.sync_inner();
            result = self.seal(r);
        }

        if let Some(method) = self.lock.take() {
            unlock_file(self.file.file(), method);
        }
        self.snapshot = None;
        result
    }

    /// Rewrite the header in the other format. Upgrading to the extended
    /// format shrinks the master avail table; entries that no longer fit
    /// are pushed back through the allocator (per-bucket pools or overflow
    /// blocks), losing no free space and no data.
    pub fn convert(&mut self, format: FormatVersion) -> Result<()> {
        self.check_consistency()?;
        if !self.is_writer() {
            return Err(self.record(Error::CannotBeReader));
        }
        if self.header.format() == format {
            return Ok(());
        }

        let (header, spilled) = self.header.convert(format);
        self.header = header;
        self.config.format = format;
        self.header_changed = true;
        log::debug!(
            "converted {} to {:?} format, {} avail entries spilled",
            self.path.display(),
            format,
            spilled.len()
        );

        for elem in spilled {
            let r = self.free(elem.adr(), elem.size());
            self.seal(r)?;
        }
        let r = self.sync_inner();
        self.seal(r)
    }

    /// Current on-disk format.
    pub fn format(&self) -> FormatVersion {
        self.header.format()
    }

    /// Value of the sync counter (extended format only).
    pub fn numsync(&self) -> Option<u32> {
        self.header.numsync()
    }
}
