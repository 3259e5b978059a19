//! # Free-Space Descriptors
//!
//! Free regions of the database file are tracked as `{av_size, av_adr}`
//! pairs in three places: the master avail table inline in the header block,
//! per-bucket avail tables (capacity [`BUCKET_AVAIL`](super::BUCKET_AVAIL)),
//! and overflow avail blocks chained from the master through `next_block`.
//!
//! Every table is kept sorted ascending by `av_size` so best-fit allocation
//! is a single forward scan. Coalescing merges an incoming region into an
//! adjacent table entry in place, which can clobber the sort order; readers
//! therefore re-check the order during validation and writable handles
//! restore it silently. Historical databases exist in which the order was
//! clobbered this way, so the repair path is mandatory, not defensive.
//!
//! Overflow-chain traversal records every visited offset in a sorted set;
//! revisiting an offset means the chain has a cycle and the stack is
//! reported as [`Error::BadAvail`].

use zerocopy::native_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// One free region of the file.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AvailElem {
    av_size: U32,
    av_adr: U64,
}

pub const AVAIL_ELEM_SIZE: usize = std::mem::size_of::<AvailElem>();
const _: () = assert!(AVAIL_ELEM_SIZE == 12);

impl AvailElem {
    pub fn new(size: u32, adr: u64) -> Self {
        Self {
            av_size: U32::new(size),
            av_adr: U64::new(adr),
        }
    }

    pub fn size(&self) -> u32 {
        self.av_size.get()
    }

    pub fn adr(&self) -> u64 {
        self.av_adr.get()
    }

    /// End offset of the region, or `None` on arithmetic overflow.
    pub fn end(&self) -> Option<u64> {
        self.adr().checked_add(self.size() as u64)
    }
}

/// Fixed head of an avail block (inline master or chained overflow block).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AvailBlockHeader {
    /// Capacity of the table in elements.
    size: U32,
    /// Number of live elements.
    count: U32,
    /// File offset of the next overflow block, 0 at the end of the chain.
    next_block: U64,
}

pub const AVAIL_BLOCK_HEADER_SIZE: usize = std::mem::size_of::<AvailBlockHeader>();
const _: () = assert!(AVAIL_BLOCK_HEADER_SIZE == 16);

impl AvailBlockHeader {
    pub fn new(size: u32, next_block: u64) -> Self {
        Self {
            size: U32::new(size),
            count: U32::new(0),
            next_block: U64::new(next_block),
        }
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = U32::new(size);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }

    pub fn next_block(&self) -> u64 {
        self.next_block.get()
    }

    pub fn set_next_block(&mut self, adr: u64) {
        self.next_block = U64::new(adr);
    }
}

/// Remove and return the smallest element satisfying `want` bytes.
///
/// The table is scanned in ascending size order; the first fit wins and the
/// tail is shifted down over the hole.
pub fn remove_fit(table: &mut [AvailElem], count: &mut u32, want: u32) -> Option<AvailElem> {
    let n = *count as usize;
    debug_assert!(n <= table.len());
    let mut index = 0;
    while index < n && table[index].size() < want {
        index += 1;
    }
    if index >= n {
        return None;
    }
    let found = table[index];
    table.copy_within(index + 1..n, index);
    *count = (n - 1) as u32;
    Some(found)
}

/// Insert an element, keeping the table sorted by size.
///
/// With `coalesce` set, an incoming region adjacent to an existing entry is
/// merged into that entry in place instead — this can leave the grown entry
/// out of order, which validation repairs lazily. Returns false when the
/// table is full and the element was not inserted.
pub fn put(table: &mut [AvailElem], count: &mut u32, elem: AvailElem, coalesce: bool) -> bool {
    let n = *count as usize;
    debug_assert!(n <= table.len());

    if coalesce {
        for entry in table[..n].iter_mut() {
            if entry.end() == Some(elem.adr()) {
                *entry = AvailElem::new(entry.size() + elem.size(), entry.adr());
                return true;
            }
            if elem.end() == Some(entry.adr()) {
                *entry = AvailElem::new(entry.size() + elem.size(), elem.adr());
                return true;
            }
        }
    }

    if n == table.len() {
        return false;
    }

    let mut index = 0;
    while index < n && table[index].size() < elem.size() {
        index += 1;
    }
    table.copy_within(index..n, index + 1);
    table[index] = elem;
    *count = (n + 1) as u32;
    true
}

/// Validate a table of `count` elements against the file geometry.
///
/// Every element must start past `min_adr`, must not overflow, and must end
/// at or before `next_block`. Returns whether the table needs re-sorting;
/// the caller decides whether it may repair (writable handles only).
pub fn check_table(
    table: &[AvailElem],
    count: u32,
    min_adr: u64,
    next_block: u64,
) -> Result<bool> {
    let n = count as usize;
    if n > table.len() {
        return Err(Error::BadAvail);
    }
    let mut needs_sort = false;
    let mut prev_size = 0u32;
    for elem in &table[..n] {
        let end = elem.end().ok_or(Error::BadAvail)?;
        if elem.adr() < min_adr || end > next_block {
            return Err(Error::BadAvail);
        }
        if elem.size() < prev_size {
            needs_sort = true;
        }
        prev_size = elem.size();
    }
    Ok(needs_sort)
}

/// Restore ascending size order after coalescing clobbered it.
pub fn sort_table(table: &mut [AvailElem], count: u32) {
    table[..count as usize].sort_unstable_by_key(AvailElem::size);
}

/// An avail block in its on-disk framing: header followed by the table.
///
/// The master block lives inline in the header block and is viewed through
/// [`split_block_mut`] over that buffer; overflow blocks read from the chain
/// own their buffer through this type.
#[derive(Debug)]
pub struct AvailBlock {
    buf: Box<[u8]>,
}

impl AvailBlock {
    /// Number of table elements that fit in a block of `bytes` total.
    pub fn capacity_for(bytes: usize) -> u32 {
        ((bytes - AVAIL_BLOCK_HEADER_SIZE) / AVAIL_ELEM_SIZE) as u32
    }

    /// A fresh zeroed block of `bytes` with the given chain link.
    pub fn new(bytes: usize, capacity: u32, next_block: u64) -> Self {
        debug_assert!(bytes >= AVAIL_BLOCK_HEADER_SIZE);
        let mut buf = vec![0u8; bytes].into_boxed_slice();
        let header = AvailBlockHeader::new(capacity, next_block);
        buf[..AVAIL_BLOCK_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Adopt a buffer read from disk. The caller must run [`validate`]
    /// before trusting the contents.
    ///
    /// [`validate`]: AvailBlock::validate
    pub fn from_bytes(buf: Box<[u8]>) -> Result<Self> {
        if buf.len() < AVAIL_BLOCK_HEADER_SIZE + AVAIL_ELEM_SIZE {
            return Err(Error::BadAvail);
        }
        Ok(Self { buf })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn header(&self) -> &AvailBlockHeader {
        let (header, _) = split_block(&self.buf).expect("buffer holds at least a block header");
        header
    }

    pub fn header_mut(&mut self) -> &mut AvailBlockHeader {
        let (header, _) =
            split_block_mut(&mut self.buf).expect("buffer holds at least a block header");
        header
    }

    pub fn table(&self) -> &[AvailElem] {
        let (_, table) = split_block(&self.buf).expect("buffer holds at least a block header");
        table
    }

    pub fn table_mut(&mut self) -> &mut [AvailElem] {
        let (_, table) =
            split_block_mut(&mut self.buf).expect("buffer holds at least a block header");
        table
    }

    /// Structural validation of a block read from the chain. Re-sorts a
    /// clobbered table when `writable`.
    pub fn validate(&mut self, min_adr: u64, next_block: u64, writable: bool) -> Result<()> {
        let (count, size) = {
            let header = self.header();
            (header.count(), header.size())
        };
        if size <= 1 || count > size {
            return Err(Error::BadAvail);
        }
        let needs_sort = {
            let table = self.table();
            if count as usize > table.len() {
                return Err(Error::BadAvail);
            }
            check_table(table, count, min_adr, next_block)?
        };
        if needs_sort && writable {
            log::warn!("restoring sort order of avail block table");
            sort_table(self.table_mut(), count);
        }
        Ok(())
    }
}

/// View a byte region as an avail block: header plus as many table elements
/// as the region can hold, capped at the header's declared capacity.
pub fn split_block(buf: &[u8]) -> Result<(&AvailBlockHeader, &[AvailElem])> {
    let (header, rest) = AvailBlockHeader::ref_from_prefix(buf).map_err(|_| Error::BadAvail)?;
    let elems = (rest.len() / AVAIL_ELEM_SIZE).min(header.size() as usize);
    let (table, _) =
        <[AvailElem]>::ref_from_prefix_with_elems(rest, elems).map_err(|_| Error::BadAvail)?;
    Ok((header, table))
}

/// Mutable variant of [`split_block`].
pub fn split_block_mut(buf: &mut [u8]) -> Result<(&mut AvailBlockHeader, &mut [AvailElem])> {
    let (header, rest) = AvailBlockHeader::mut_from_prefix(buf).map_err(|_| Error::BadAvail)?;
    let elems = (rest.len() / AVAIL_ELEM_SIZE).min(header.size() as usize);
    let (table, _) =
        <[AvailElem]>::mut_from_prefix_with_elems(rest, elems).map_err(|_| Error::BadAvail)?;
    Ok((header, table))
}

/// Sorted set of visited file offsets, for cycle detection while walking
/// the overflow chain.
#[derive(Debug, Default)]
pub struct OffsetSet {
    offsets: Vec<u64>,
}

impl OffsetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an offset; `false` means it was already present.
    pub fn insert(&mut self, offset: u64) -> bool {
        match self.offsets.binary_search(&offset) {
            Ok(_) => false,
            Err(pos) => {
                self.offsets.insert(pos, offset);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elems(spec: &[(u32, u64)]) -> Vec<AvailElem> {
        spec.iter().map(|&(s, a)| AvailElem::new(s, a)).collect()
    }

    #[test]
    fn remove_fit_takes_smallest_sufficient() {
        let mut table = elems(&[(8, 100), (16, 200), (64, 300), (0, 0)]);
        let mut count = 3;

        let got = remove_fit(&mut table, &mut count, 10).unwrap();

        assert_eq!(got, AvailElem::new(16, 200));
        assert_eq!(count, 2);
        assert_eq!(table[0], AvailElem::new(8, 100));
        assert_eq!(table[1], AvailElem::new(64, 300));
    }

    #[test]
    fn remove_fit_fails_when_nothing_fits() {
        let mut table = elems(&[(8, 100), (16, 200)]);
        let mut count = 2;

        assert!(remove_fit(&mut table, &mut count, 100).is_none());
        assert_eq!(count, 2);
    }

    #[test]
    fn put_keeps_size_order() {
        let mut table = vec![AvailElem::new(0, 0); 4];
        let mut count = 0;

        assert!(put(&mut table, &mut count, AvailElem::new(32, 100), false));
        assert!(put(&mut table, &mut count, AvailElem::new(8, 200), false));
        assert!(put(&mut table, &mut count, AvailElem::new(16, 300), false));

        assert_eq!(count, 3);
        assert_eq!(table[0].size(), 8);
        assert_eq!(table[1].size(), 16);
        assert_eq!(table[2].size(), 32);
    }

    #[test]
    fn put_reports_full_table() {
        let mut table = vec![AvailElem::new(0, 0); 2];
        let mut count = 0;

        assert!(put(&mut table, &mut count, AvailElem::new(8, 100), false));
        assert!(put(&mut table, &mut count, AvailElem::new(16, 200), false));
        assert!(!put(&mut table, &mut count, AvailElem::new(32, 300), false));
        assert_eq!(count, 2);
    }

    #[test]
    fn put_coalesces_with_following_region() {
        let mut table = elems(&[(16, 512), (0, 0)]);
        let mut count = 1;

        // 500..512 touches 512..528
        assert!(put(&mut table, &mut count, AvailElem::new(12, 500), true));

        assert_eq!(count, 1);
        assert_eq!(table[0], AvailElem::new(28, 500));
    }

    #[test]
    fn put_coalesces_with_preceding_region() {
        let mut table = elems(&[(16, 512), (0, 0)]);
        let mut count = 1;

        assert!(put(&mut table, &mut count, AvailElem::new(12, 528), true));

        assert_eq!(count, 1);
        assert_eq!(table[0], AvailElem::new(28, 512));
    }

    #[test]
    fn coalescing_can_break_order_and_check_detects_it() {
        let mut table = elems(&[(8, 512), (16, 1024), (0, 0)]);
        let mut count = 2;

        // merging into the first entry grows it past the second
        assert!(put(&mut table, &mut count, AvailElem::new(32, 520), true));
        assert_eq!(table[0], AvailElem::new(40, 512));

        let needs_sort = check_table(&table, count, 512, 1 << 20).unwrap();
        assert!(needs_sort);

        sort_table(&mut table, count);
        assert!(table[0].size() <= table[1].size());
    }

    #[test]
    fn check_table_rejects_out_of_range() {
        let table = elems(&[(8, 100)]);
        // starts below min_adr
        assert!(matches!(
            check_table(&table, 1, 512, 4096),
            Err(Error::BadAvail)
        ));

        let table = elems(&[(8, 4090)]);
        // ends past next_block
        assert!(matches!(
            check_table(&table, 1, 512, 4096),
            Err(Error::BadAvail)
        ));

        let table = elems(&[(u32::MAX, u64::MAX)]);
        assert!(matches!(
            check_table(&table, 1, 512, 4096),
            Err(Error::BadAvail)
        ));
    }

    #[test]
    fn block_roundtrip_through_bytes() {
        let mut block = AvailBlock::new(256, AvailBlock::capacity_for(256), 9000);
        let mut count = 0;
        assert!(put(block.table_mut(), &mut count, AvailElem::new(64, 2048), false));
        block.header_mut().set_count(count);

        let bytes = block.as_bytes().to_vec().into_boxed_slice();
        let mut reread = AvailBlock::from_bytes(bytes).unwrap();
        reread.validate(512, 1 << 20, false).unwrap();

        assert_eq!(reread.header().count(), 1);
        assert_eq!(reread.header().next_block(), 9000);
        assert_eq!(reread.table()[0], AvailElem::new(64, 2048));
    }

    #[test]
    fn offset_set_detects_repeat() {
        let mut set = OffsetSet::new();
        assert!(set.insert(512));
        assert!(set.insert(4096));
        assert!(set.insert(1024));
        assert!(!set.insert(4096));
    }
}
