//! # Key Iteration
//!
//! Scan order: directory index ascending, visiting each bucket once (runs
//! of directory entries that reference the same bucket are skipped), and
//! slot index ascending inside a bucket. `next_key` re-locates the given
//! key by hash and resumes right behind its slot, so iteration needs no
//! cursor state on the handle.
//!
//! The order is an artifact of hashing and carries no meaning. Iteration
//! is not stable under concurrent mutation: a store that splits a bucket
//! in the traversed region can make the scan revisit or skip keys.

use crate::database::Database;
use crate::error::{Error, Result};

impl Database {
    /// The key in the first non-empty slot of the first non-empty bucket.
    pub fn first_key(&mut self) -> Result<Vec<u8>> {
        self.check_consistency()?;
        let result = self.scan_from(0, 0);
        self.seal(result)
    }

    /// The key following `key` in scan order.
    pub fn next_key(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_consistency()?;
        let result = self.next_key_inner(key);
        self.seal(result)
    }

    fn next_key_inner(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let loc = self.locate(key)?.ok_or(Error::ItemNotFound)?;
        self.scan_from(self.bucket_dir, loc + 1)
    }

    fn scan_from(&mut self, mut index: usize, mut slot: usize) -> Result<Vec<u8>> {
        let elems = self.header.bucket_elems() as usize;
        while index < self.dir.len() {
            self.get_bucket(index)?;
            let cur = self.current.expect("current bucket is established");
            while slot < elems {
                let element = self.cache.bucket(cur).slots()[slot];
                if !element.is_empty() {
                    return self.read_record(element.data_pointer(), element.key_size());
                }
                slot += 1;
            }
            index = self.dir.next_distinct(index);
            slot = 0;
        }
        Err(Error::ItemNotFound)
    }

    /// Iterate every key. Wraps `first_key`/`next_key`; errors other than
    /// exhaustion surface as `Some(Err(_))`.
    pub fn iter(&mut self) -> Keys<'_> {
        Keys {
            db: self,
            last: None,
            done: false,
        }
    }
}

/// Iterator over the keys of a database, in scan order.
pub struct Keys<'a> {
    db: &'a mut Database,
    last: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.last.take() {
            None => self.db.first_key(),
            Some(last) => self.db.next_key(&last),
        };
        match result {
            Ok(key) => {
                self.last = Some(key.clone());
                Some(Ok(key))
            }
            Err(Error::ItemNotFound) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
