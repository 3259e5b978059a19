//! # Hash Buckets
//!
//! A bucket is a fixed-size block holding a header (local depth, live count,
//! per-bucket avail table) followed by a slot table of
//! `bucket_elems` entries. Collisions are resolved by linear probing with
//! step +1 modulo the table size; an empty slot (`hash_value == -1`)
//! terminates every probe chain, so deletion must compact the chain after
//! clearing a slot (see [`Bucket::remove_slot`]).
//!
//! The bucket is kept as one contiguous buffer, exactly its on-disk image,
//! and all field access goes through zerocopy views over that buffer. This
//! makes write-back a single full write of the buffer.

use zerocopy::native_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::avail::{self, AvailElem};
use super::{BUCKET_AVAIL, KEY_START_LEN};
use crate::error::{Error, Result};
use crate::hash::EMPTY_HASH;

/// Fixed head of a bucket: avail table, local depth, live count.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BucketHeader {
    av_count: U32,
    bucket_avail: [AvailElem; BUCKET_AVAIL],
    bucket_bits: U32,
    count: U32,
}

pub const BUCKET_HEADER_SIZE: usize = std::mem::size_of::<BucketHeader>();
const _: () = assert!(BUCKET_HEADER_SIZE == 84);

impl BucketHeader {
    pub fn av_count(&self) -> u32 {
        self.av_count.get()
    }

    pub fn set_av_count(&mut self, count: u32) {
        self.av_count = U32::new(count);
    }

    pub fn avail(&self) -> &[AvailElem; BUCKET_AVAIL] {
        &self.bucket_avail
    }

    pub fn avail_mut(&mut self) -> &mut [AvailElem; BUCKET_AVAIL] {
        &mut self.bucket_avail
    }

    pub fn bits(&self) -> u32 {
        self.bucket_bits.get()
    }

    pub fn set_bits(&mut self, bits: u32) {
        self.bucket_bits = U32::new(bits);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }
}

/// One slot of the bucket's hash table.
///
/// `data_pointer` addresses the key bytes in the file; the value bytes
/// follow the key directly. The first [`KEY_START_LEN`] bytes of the key are
/// inlined so most non-matching probes never touch the payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BucketElement {
    hash_value: I32,
    key_start: [u8; KEY_START_LEN],
    data_pointer: U64,
    key_size: U32,
    data_size: U32,
}

pub const BUCKET_ELEMENT_SIZE: usize = std::mem::size_of::<BucketElement>();
const _: () = assert!(BUCKET_ELEMENT_SIZE == 32);

impl BucketElement {
    pub fn new(hash: i32, key: &[u8], data_pointer: u64, data_size: u32) -> Self {
        let mut key_start = [0u8; KEY_START_LEN];
        let prefix = key.len().min(KEY_START_LEN);
        key_start[..prefix].copy_from_slice(&key[..prefix]);
        Self {
            hash_value: I32::new(hash),
            key_start,
            data_pointer: U64::new(data_pointer),
            key_size: U32::new(key.len() as u32),
            data_size: U32::new(data_size),
        }
    }

    pub fn empty() -> Self {
        Self {
            hash_value: I32::new(EMPTY_HASH),
            key_start: [0u8; KEY_START_LEN],
            data_pointer: U64::new(0),
            key_size: U32::new(0),
            data_size: U32::new(0),
        }
    }

    pub fn hash(&self) -> i32 {
        self.hash_value.get()
    }

    pub fn is_empty(&self) -> bool {
        self.hash() == EMPTY_HASH
    }

    pub fn key_size(&self) -> u32 {
        self.key_size.get()
    }

    pub fn data_size(&self) -> u32 {
        self.data_size.get()
    }

    pub fn data_pointer(&self) -> u64 {
        self.data_pointer.get()
    }

    pub fn set_data(&mut self, data_pointer: u64, data_size: u32) {
        self.data_pointer = U64::new(data_pointer);
        self.data_size = U32::new(data_size);
    }

    /// Total payload length (key followed by value).
    pub fn record_size(&self) -> u32 {
        self.key_size.get().saturating_add(self.data_size.get())
    }

    /// Fast negative match: hash, length and inlined prefix.
    pub fn matches_prefix(&self, hash: i32, key: &[u8]) -> bool {
        if self.hash() != hash || self.key_size() as usize != key.len() {
            return false;
        }
        let prefix = key.len().min(KEY_START_LEN);
        self.key_start[..prefix] == key[..prefix]
    }
}

/// In-memory image of one bucket.
#[derive(Debug)]
pub struct Bucket {
    buf: Box<[u8]>,
}

impl Bucket {
    /// Bucket byte size for a slot-table capacity.
    pub fn size_for(bucket_elems: u32) -> usize {
        BUCKET_HEADER_SIZE + bucket_elems as usize * BUCKET_ELEMENT_SIZE
    }

    /// Slot-table capacity that fits a block of `block_size` bytes.
    pub fn elems_for(block_size: u32) -> u32 {
        ((block_size as usize - BUCKET_HEADER_SIZE) / BUCKET_ELEMENT_SIZE) as u32
    }

    /// A fresh bucket with every slot empty and the given local depth.
    pub fn new(bucket_elems: u32, bits: u32) -> Self {
        let mut bucket = Self {
            buf: vec![0u8; Self::size_for(bucket_elems)].into_boxed_slice(),
        };
        bucket.header_mut().set_bits(bits);
        for slot in bucket.slots_mut() {
            *slot = BucketElement::empty();
        }
        bucket
    }

    /// Adopt a buffer read from disk; `validate` must run before the
    /// contents are trusted.
    pub fn from_bytes(buf: Box<[u8]>) -> Result<Self> {
        if buf.len() < BUCKET_HEADER_SIZE + BUCKET_ELEMENT_SIZE
            || (buf.len() - BUCKET_HEADER_SIZE) % BUCKET_ELEMENT_SIZE != 0
        {
            return Err(Error::BadBucket);
        }
        Ok(Self { buf })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn header(&self) -> &BucketHeader {
        let (header, _) = BucketHeader::ref_from_prefix(&self.buf)
            .expect("bucket buffer holds at least a header");
        header
    }

    pub fn header_mut(&mut self) -> &mut BucketHeader {
        let (header, _) = BucketHeader::mut_from_prefix(&mut self.buf)
            .expect("bucket buffer holds at least a header");
        header
    }

    pub fn slots(&self) -> &[BucketElement] {
        <[BucketElement]>::ref_from_bytes(&self.buf[BUCKET_HEADER_SIZE..])
            .expect("slot region is a whole number of elements")
    }

    pub fn slots_mut(&mut self) -> &mut [BucketElement] {
        <[BucketElement]>::mut_from_bytes(&mut self.buf[BUCKET_HEADER_SIZE..])
            .expect("slot region is a whole number of elements")
    }

    pub fn bucket_elems(&self) -> u32 {
        ((self.buf.len() - BUCKET_HEADER_SIZE) / BUCKET_ELEMENT_SIZE) as u32
    }

    pub fn bits(&self) -> u32 {
        self.header().bits()
    }

    pub fn count(&self) -> u32 {
        self.header().count()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.bucket_elems()
    }

    /// Validation run on every bucket read from disk: count and depth in
    /// range, avail table well-formed. Restores avail sort order when
    /// `writable`.
    pub fn validate(
        &mut self,
        bucket_elems: u32,
        dir_bits: u32,
        min_adr: u64,
        next_block: u64,
        writable: bool,
    ) -> Result<()> {
        if self.bucket_elems() != bucket_elems {
            return Err(Error::BadBucket);
        }
        let header = self.header();
        if header.count() > bucket_elems || header.bits() > dir_bits {
            return Err(Error::BadBucket);
        }
        let av_count = header.av_count();
        if av_count as usize > BUCKET_AVAIL {
            return Err(Error::BadAvail);
        }
        let needs_sort = avail::check_table(header.avail(), av_count, min_adr, next_block)?;
        if needs_sort && writable {
            log::warn!("restoring sort order of bucket avail table");
            avail::sort_table(self.header_mut().avail_mut(), av_count);
        }
        Ok(())
    }

    pub fn avail_count(&self) -> u32 {
        self.header().av_count()
    }

    pub fn avail_is_full(&self) -> bool {
        self.avail_count() as usize == BUCKET_AVAIL
    }

    /// Insert into the per-bucket avail table; false when the table is full
    /// and no coalescing merge applied.
    pub fn put_avail(&mut self, elem: AvailElem, coalesce: bool) -> bool {
        let header = self.header_mut();
        let mut count = header.av_count();
        let inserted = avail::put(header.avail_mut(), &mut count, elem, coalesce);
        header.set_av_count(count);
        inserted
    }

    /// Best-fit removal from the per-bucket avail table.
    pub fn take_avail(&mut self, want: u32) -> Option<AvailElem> {
        let header = self.header_mut();
        let mut count = header.av_count();
        let taken = avail::remove_fit(header.avail_mut(), &mut count, want);
        header.set_av_count(count);
        taken
    }

    /// Remove the smallest tracked region (the spill victim when the table
    /// overflows).
    pub fn take_smallest_avail(&mut self) -> Option<AvailElem> {
        self.take_avail(0)
    }

    /// Place an element by linear probing from its home slot.
    ///
    /// The caller guarantees at least one free slot; a full table here means
    /// the bucket header lied about its count.
    pub fn insert_element(&mut self, elem: BucketElement) -> Result<usize> {
        let n = self.bucket_elems() as usize;
        let hash = elem.hash();
        if hash < 0 {
            return Err(Error::BadHashEntry);
        }
        let slots = self.slots_mut();
        let mut loc = hash as usize % n;
        let mut probes = 0;
        while !slots[loc].is_empty() {
            loc = (loc + 1) % n;
            probes += 1;
            if probes > n {
                return Err(Error::BadHashTable);
            }
        }
        slots[loc] = elem;
        let count = self.count() + 1;
        self.header_mut().set_count(count);
        Ok(loc)
    }

    /// Clear a slot and compact the probe chain behind it.
    ///
    /// After clearing slot `loc`, every following occupied slot whose home
    /// position is not cyclically inside `(gap, slot]` is reachable only
    /// through the gap; it is moved back into the gap and the gap advances.
    /// The scan stops at the first empty slot.
    pub fn remove_slot(&mut self, loc: usize) {
        let n = self.bucket_elems() as usize;
        let slots = self.slots_mut();
        debug_assert!(!slots[loc].is_empty());
        slots[loc] = BucketElement::empty();

        let mut gap = loc;
        let mut probe = (loc + 1) % n;
        while probe != gap && !slots[probe].is_empty() {
            let home = slots[probe].hash() as usize % n;
            let reachable = if gap < probe {
                gap < home && home <= probe
            } else {
                home > gap || home <= probe
            };
            if !reachable {
                slots[gap] = slots[probe];
                slots[probe] = BucketElement::empty();
                gap = probe;
            }
            probe = (probe + 1) % n;
        }

        let count = self.count() - 1;
        self.header_mut().set_count(count);
    }
}
