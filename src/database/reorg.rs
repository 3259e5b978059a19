//! # Reorganization
//!
//! Copies the live records into a fresh database laid out from scratch —
//! reclaiming every avail region, shrinking a directory bloated by old
//! splits back to its natural depth, and defragmenting payloads — then
//! atomically renames it over the original and rebinds the handle. Any
//! failure aborts and leaves the original untouched.

use crate::database::{Database, StoreMode};
use crate::error::{Error, Result};

impl Database {
    /// Rewrite the database compactly in place.
    pub fn reorganize(&mut self) -> Result<()> {
        self.check_consistency()?;
        if !self.is_writer() {
            return Err(self.record(Error::ReaderCannotReorganize));
        }

        let scratch = self.scratch_path("tmp");
        let result = self.copy_into(&scratch);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&scratch);
            return Err(self.record(e));
        }

        if let Err(e) = std::fs::rename(&scratch, &self.path) {
            let _ = std::fs::remove_file(&scratch);
            return Err(self.record(Error::Io(e)));
        }
        self.rebind()?;
        log::debug!("reorganized {}", self.path.display());
        Ok(())
    }

    fn copy_into(&mut self, scratch: &std::path::Path) -> Result<()> {
        let mut dest = Database::open_with_config(scratch, self.scratch_config())?;

        let elems = self.header.bucket_elems() as usize;
        let mut index = 0;
        while index < self.dir.len() {
            self.get_bucket(index)?;
            let cur = self.current.expect("current bucket is established");
            for slot in 0..elems {
                let element = self.cache.bucket(cur).slots()[slot];
                if element.is_empty() {
                    continue;
                }
                let key = self.read_record(element.data_pointer(), element.key_size())?;
                let Some(offset) = element.data_pointer().checked_add(element.key_size() as u64)
                else {
                    return Err(Error::MalformedData);
                };
                let value = self.read_record(offset, element.data_size())?;
                dest.store(&key, &value, StoreMode::Replace)?;
            }
            index = self.dir.next_distinct(index);
        }

        dest.sync()?;
        dest.close()
    }
}
