//! # Durability
//!
//! The write-back order is fixed: dirty buckets first, then the directory
//! (fsync'd before the header can point at a relocated copy), then the
//! header block, then a file-wide sync. The file is explicitly extended to
//! the `next_block` watermark so allocations handed out past EOF exist on
//! disk before the header advertising them does.
//!
//! In the extended format every successful sync increments `numsync`
//! before the header is written; the crash-tolerant snapshot protocol
//! (see [`snapshot`](crate::database::snapshot)) compares these counters
//! when both snapshot files survive a crash readable.

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Write back everything that changed in memory: dirty buckets, the
    /// directory, the header. No fsync of its own; callers order one
    /// around it.
    pub(crate) fn end_update(&mut self) -> Result<()> {
        self.flush_dirty()?;

        if self.directory_changed {
            let buf = self.dir.to_bytes();
            let dir_adr = self.header.dir();
            if let Err(e) = self.file.write_all_at(dir_adr, &buf) {
                return Err(self.poison(e));
            }
            self.directory_changed = false;
        }

        if self.header_changed {
            let next_block = self.header.next_block();
            let result = self
                .file
                .write_all_at(0, self.header.as_bytes())
                .and_then(|()| self.file.extend_to(next_block));
            if let Err(e) = result {
                return Err(self.poison(e));
            }
            self.header_changed = false;
        }
        Ok(())
    }

    /// The full sync protocol; also runs after every mutation under
    /// `sync_mode`.
    pub(crate) fn sync_inner(&mut self) -> Result<()> {
        self.check_consistency()?;

        if self.header.is_extended() {
            self.header.bump_numsync();
            self.header_changed = true;
        }

        self.flush_dirty()?;

        if self.directory_changed {
            let buf = self.dir.to_bytes();
            let dir_adr = self.header.dir();
            let result = self
                .file
                .write_all_at(dir_adr, &buf)
                .and_then(|()| self.file.sync());
            if let Err(e) = result {
                return Err(self.poison(e));
            }
            self.directory_changed = false;
        }

        if self.header_changed {
            let next_block = self.header.next_block();
            let result = self
                .file
                .write_all_at(0, self.header.as_bytes())
                .and_then(|()| self.file.extend_to(next_block));
            if let Err(e) = result {
                return Err(self.poison(e));
            }
            self.header_changed = false;
        }

        if let Err(e) = self.file.sync() {
            return Err(self.poison(e));
        }

        self.snapshot_step()
    }

    /// Flush all in-memory state to disk and, when snapshots are armed,
    /// produce the next snapshot.
    pub fn sync(&mut self) -> Result<()> {
        let result = self.sync_inner();
        self.seal(result)
    }
}
