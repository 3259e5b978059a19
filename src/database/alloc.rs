//! # Free-Space Allocator
//!
//! Two pools feed allocation: the current bucket's avail table and the
//! master avail block inline in the header, which chains to overflow
//! blocks when it fills. Allocation tries the bucket pool, then the
//! master (popping one overflow block into it when the master runs
//! empty), and finally extends the file at the `next_block` watermark.
//! The unused tail of whatever region was found goes straight back
//! through [`Database::free`].
//!
//! Freeing is directed by two tunables: `central_free` routes everything
//! to the master pool, and `coalesce_blocks` merges adjacent regions on
//! insert. A freed block the size of a whole block-size unit or larger
//! always goes to the master. When a bucket pool overflows, its smallest
//! entry spills to the master to make room.
//!
//! Overflow blocks are pushed when the master fills: half the elements
//! (every second one) move to a fresh block linked at the head of the
//! chain. Popping reverses this, merging the head block's elements back
//! and spilling whatever no longer fits into the current bucket's pool.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::storage::avail::{
    self, AvailBlock, AvailElem, OffsetSet, AVAIL_BLOCK_HEADER_SIZE, AVAIL_ELEM_SIZE,
};
use crate::storage::IGNORE_SIZE;

/// Sanity bound on the declared capacity of an overflow block (the
/// largest master table of any legal block size is well under this).
const MAX_AVAIL_BLOCK_ELEMS: usize = 8192;

impl Database {
    /// Allocate `size` bytes of file space.
    pub(crate) fn alloc(&mut self, size: u32) -> Result<u64> {
        // a region smaller than a descriptor could never be tracked again
        let size = size.max(AVAIL_ELEM_SIZE as u32);

        let mut found: Option<AvailElem> = None;
        if let Some(cur) = self.current {
            if let Some(elem) = self.cache.bucket_mut(cur).take_avail(size) {
                self.cache.set_changed(cur, true);
                found = Some(elem);
            }
        }

        let elem = match found {
            Some(elem) => elem,
            None => {
                let (count, chain) = {
                    let (header, _) = self.header.avail();
                    (header.count(), header.next_block())
                };
                if count == 0 && chain != 0 {
                    self.pop_avail_block()?;
                }
                let from_master = {
                    let (header, table) = self.header.avail_mut();
                    let mut count = header.count();
                    let taken = avail::remove_fit(table, &mut count, size);
                    header.set_count(count);
                    taken
                };
                self.header_changed = true;
                match from_master {
                    Some(elem) => elem,
                    None => {
                        // extend at the watermark
                        let adr = self.header.next_block();
                        self.header.set_next_block(adr + size as u64);
                        AvailElem::new(size, adr)
                    }
                }
            }
        };

        let adr = elem.adr();
        let rest = elem.size() - size;
        if rest > 0 {
            self.free(adr + size as u64, rest)?;
        }
        log::trace!("alloc {size} bytes at {adr}");
        Ok(adr)
    }

    /// Return `size` bytes at `adr` to the avail pools.
    pub(crate) fn free(&mut self, adr: u64, size: u32) -> Result<()> {
        if size < IGNORE_SIZE {
            return Ok(());
        }
        let elem = AvailElem::new(size, adr);
        let coalesce = self.config.coalesce_blocks;

        if self.config.central_free || size >= self.header.block_size() {
            return self.free_to_master(elem);
        }

        match self.current {
            Some(cur) => {
                if self.cache.bucket(cur).avail_is_full() {
                    // spill the smallest entry to make room
                    let spill = self
                        .cache
                        .bucket_mut(cur)
                        .take_smallest_avail()
                        .expect("full avail table has a smallest entry");
                    self.free_to_master(spill)?;
                }
                self.cache.bucket_mut(cur).put_avail(elem, coalesce);
                self.cache.set_changed(cur, true);
                Ok(())
            }
            None => self.free_to_master(elem),
        }
    }

    /// Insert into the master pool, pushing an overflow block first when
    /// the master is full.
    pub(crate) fn free_to_master(&mut self, elem: AvailElem) -> Result<()> {
        let coalesce = self.config.coalesce_blocks;
        let (count, capacity) = {
            let (header, _) = self.header.avail();
            (header.count(), header.size())
        };
        if count == capacity {
            self.push_avail_block()?;
        }
        {
            let (header, table) = self.header.avail_mut();
            let mut count = header.count();
            avail::put(table, &mut count, elem, coalesce);
            header.set_count(count);
        }
        self.header_changed = true;
        Ok(())
    }

    /// Byte size of a freshly pushed overflow block: room for half the
    /// master table.
    fn overflow_block_bytes(&self) -> usize {
        let capacity = self.header.avail().0.size() as usize;
        capacity * AVAIL_ELEM_SIZE / 2 + AVAIL_BLOCK_HEADER_SIZE
    }

    /// Read one overflow block. Blocks are self-describing: the 16-byte
    /// head carries the table capacity, which sizes the rest of the read —
    /// so a chain written before a format conversion changed the master
    /// capacity still reads back exactly.
    fn read_avail_block(&mut self, adr: u64) -> Result<(AvailBlock, usize)> {
        let mut head = [0u8; AVAIL_BLOCK_HEADER_SIZE];
        if let Err(e) = self.file.read_exact_at(adr, &mut head) {
            return Err(self.poison(e));
        }
        let (header, _) = avail::split_block(&head)
            .map_err(|e| self.poison(e))?;
        let capacity = header.size() as usize;
        if capacity <= 1 || capacity > (MAX_AVAIL_BLOCK_ELEMS) {
            return Err(self.poison(Error::BadAvail));
        }
        let bytes = AVAIL_BLOCK_HEADER_SIZE + capacity * AVAIL_ELEM_SIZE;
        let mut buf = vec![0u8; bytes].into_boxed_slice();
        if let Err(e) = self.file.read_exact_at(adr, &mut buf) {
            return Err(self.poison(e));
        }
        let mut block = AvailBlock::from_bytes(buf).map_err(|e| self.poison(e))?;
        block
            .validate(
                self.header.block_size() as u64,
                self.header.next_block(),
                self.is_writer(),
            )
            .map_err(|e| self.poison(e))?;
        Ok((block, bytes))
    }

    /// Move half of the full master table into a fresh overflow block
    /// linked at the head of the chain.
    fn push_avail_block(&mut self) -> Result<()> {
        let block_bytes = self.overflow_block_bytes();
        let block_capacity = AvailBlock::capacity_for(block_bytes);
        let chain = self.header.avail().0.next_block();

        // space for the block comes from the master itself, or the file end
        let region = {
            let (header, table) = self.header.avail_mut();
            let mut count = header.count();
            let taken = avail::remove_fit(table, &mut count, block_bytes as u32);
            header.set_count(count);
            taken
        };
        let region = match region {
            Some(elem) => elem,
            None => {
                let adr = self.header.next_block();
                self.header.set_next_block(adr + block_bytes as u64);
                AvailElem::new(block_bytes as u32, adr)
            }
        };
        let block_adr = region.adr();

        let mut block = AvailBlock::new(block_bytes, block_capacity, chain);
        let moved = {
            let (header, table) = self.header.avail_mut();
            let count = header.count() as usize;
            let block_table = block.table_mut();
            let mut moved = 0;
            for index in 1..count {
                if index & 1 == 1 {
                    block_table[moved] = table[index];
                    moved += 1;
                } else {
                    table[index >> 1] = table[index];
                }
            }
            header.set_count((count - moved) as u32);
            moved
        };
        block.header_mut().set_count(moved as u32);
        self.header.avail_mut().0.set_next_block(block_adr);
        self.header_changed = true;

        self.file.write_all_at(block_adr, block.as_bytes())?;
        log::trace!("pushed avail block at {block_adr} with {moved} elements");

        // slack of the region the block landed in
        let rest = region.size() - block_bytes as u32;
        if rest > 0 {
            self.free(block_adr + block_bytes as u64, rest)?;
        }
        Ok(())
    }

    /// Pop the head overflow block back into the master table.
    fn pop_avail_block(&mut self) -> Result<()> {
        let block_adr = self.header.avail().0.next_block();
        debug_assert_ne!(block_adr, 0);

        let (block, block_bytes) = self.read_avail_block(block_adr)?;

        self.header
            .avail_mut()
            .0
            .set_next_block(block.header().next_block());
        self.header_changed = true;

        let count = block.header().count() as usize;
        for index in 0..count {
            let elem = block.table()[index];
            let inserted = {
                let (header, table) = self.header.avail_mut();
                let mut c = header.count();
                let ok = avail::put(table, &mut c, elem, true);
                header.set_count(c);
                ok
            };
            if inserted {
                continue;
            }
            // master full again: spill into the current bucket's pool
            let mut spilled = false;
            if let Some(cur) = self.current {
                spilled = self.cache.bucket_mut(cur).put_avail(elem, true);
                if spilled {
                    self.cache.set_changed(cur, true);
                }
            }
            if !spilled {
                log::warn!(
                    "abandoning free region of {} bytes at {}: all avail pools full",
                    elem.size(),
                    elem.adr()
                );
            }
        }

        // coalescing inserts can clobber the sort order; restore it
        {
            let (header, table) = self.header.avail_mut();
            let count = header.count();
            avail::sort_table(table, count);
        }

        // the block's own region is free space now
        log::trace!("popped avail block at {block_adr}");
        self.free_to_master(AvailElem::new(block_bytes as u32, block_adr))
    }

    /// Walk the master avail block and its overflow chain, validating each
    /// block and failing on ranges that escape the file or on a cycle.
    pub fn avail_verify(&mut self) -> Result<()> {
        self.check_consistency()?;
        let result = self.avail_verify_inner();
        self.seal(result)
    }

    fn avail_verify_inner(&mut self) -> Result<()> {
        let block_size = self.header.block_size() as u64;
        let next_block = self.header.next_block();

        {
            let (header, table) = self.header.avail();
            avail::check_table(table, header.count(), block_size, next_block)?;
        }

        let mut visited = OffsetSet::new();
        visited.insert(0);
        let mut chain = self.header.avail().0.next_block();
        while chain != 0 {
            if !visited.insert(chain) {
                return Err(Error::BadAvail);
            }
            let (block, _) = self.read_avail_block(chain)?;
            chain = block.header().next_block();
        }
        Ok(())
    }
}
