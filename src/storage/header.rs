//! # Header Block
//!
//! The first `block_size` bytes of the database file. A fixed field group
//! (magic, geometry, allocation watermark) is followed by the inline master
//! avail block, which grows to fill the remainder of the block.
//!
//! Two formats share the layout:
//!
//! - **standard** (`MAGIC`): fixed fields only
//! - **extended** (`NUMSYNC_MAGIC`): appends `{version, numsync}` plus two
//!   reserved words before the avail block; `numsync` counts successful
//!   syncs and is what the snapshot selection procedure compares
//!
//! The header is kept in memory as the exact on-disk image, so writing it
//! back is a single full-block write. Databases are native-endian: the four
//! byte-swapped magic forms are recognized and rejected explicitly, and the
//! original pre-standard magic is refused as unsupported.

use zerocopy::native_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::avail::{
    self, AvailBlockHeader, AvailElem, AVAIL_BLOCK_HEADER_SIZE, AVAIL_ELEM_SIZE,
};
use super::bucket::Bucket;
use super::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{Error, Result};

/// Magic of the original, pre-standard format. Recognized but refused.
pub const OMAGIC: u32 = 0x13579ace;

/// Magic of the standard format.
pub const MAGIC: u32 = 0x13579acd;

/// Magic of the extended ("numsync") format.
pub const NUMSYNC_MAGIC: u32 = 0x13579acf;

const OMAGIC_SWAP: u32 = OMAGIC.swap_bytes();
const MAGIC_SWAP: u32 = MAGIC.swap_bytes();
const NUMSYNC_MAGIC_SWAP: u32 = NUMSYNC_MAGIC.swap_bytes();

/// Version stored in extended headers.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed fields shared by both formats.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct StdFields {
    magic: U32,
    block_size: U32,
    dir: U64,
    dir_size: U32,
    dir_bits: U32,
    bucket_size: U32,
    bucket_elems: U32,
    next_block: U64,
}

const STD_FIELDS_SIZE: usize = std::mem::size_of::<StdFields>();
const _: () = assert!(STD_FIELDS_SIZE == 40);

/// Extension appended by the numsync format.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ExtFields {
    version: U32,
    numsync: U32,
    reserved: [U32; 2],
}

const EXT_FIELDS_SIZE: usize = std::mem::size_of::<ExtFields>();
const _: () = assert!(STD_FIELDS_SIZE + EXT_FIELDS_SIZE == 56);

/// Classify a magic word; `Ok(true)` means the extended format.
pub fn validate_magic(magic: u32) -> Result<bool> {
    match magic {
        MAGIC => Ok(false),
        NUMSYNC_MAGIC => Ok(true),
        OMAGIC => Err(Error::BadHeader("original-format database not supported")),
        OMAGIC_SWAP | MAGIC_SWAP | NUMSYNC_MAGIC_SWAP => Err(Error::ByteSwapped),
        other => Err(Error::BadMagic(other)),
    }
}

/// The database file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Fixed header fields only.
    Standard,
    /// Extended header carrying the `numsync` counter.
    Numsync,
}

/// In-memory image of the header block.
#[derive(Debug)]
pub struct Header {
    buf: Box<[u8]>,
    extended: bool,
}

impl Header {
    /// Build the header for a freshly created database.
    ///
    /// Geometry: the directory initially fills exactly one block
    /// (`dir_bits = log2(block_size / 8)`), buckets fill as much of a block
    /// as whole slots allow, and `next_block` starts past the header and
    /// directory blocks. The first bucket is allocated by the caller
    /// through the regular allocator.
    pub fn create(block_size: u32, format: FormatVersion) -> Self {
        debug_assert!(block_size.is_power_of_two());
        debug_assert!((MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size));

        let extended = format == FormatVersion::Numsync;
        let mut buf = vec![0u8; block_size as usize].into_boxed_slice();

        let dir_bits = (block_size / std::mem::size_of::<u64>() as u32).trailing_zeros();
        let bucket_elems = Bucket::elems_for(block_size);
        let fields = StdFields {
            magic: U32::new(if extended { NUMSYNC_MAGIC } else { MAGIC }),
            block_size: U32::new(block_size),
            dir: U64::new(block_size as u64),
            dir_size: U32::new(block_size),
            dir_bits: U32::new(dir_bits),
            bucket_size: U32::new(Bucket::size_for(bucket_elems) as u32),
            bucket_elems: U32::new(bucket_elems),
            next_block: U64::new(2 * block_size as u64),
        };
        buf[..STD_FIELDS_SIZE].copy_from_slice(fields.as_bytes());

        let avail_offset = if extended {
            let ext = ExtFields {
                version: U32::new(FORMAT_VERSION),
                numsync: U32::new(0),
                reserved: [U32::new(0); 2],
            };
            buf[STD_FIELDS_SIZE..STD_FIELDS_SIZE + EXT_FIELDS_SIZE]
                .copy_from_slice(ext.as_bytes());
            STD_FIELDS_SIZE + EXT_FIELDS_SIZE
        } else {
            STD_FIELDS_SIZE
        };

        let capacity = ((block_size as usize - avail_offset - AVAIL_BLOCK_HEADER_SIZE)
            / AVAIL_ELEM_SIZE) as u32;
        let avail_header = AvailBlockHeader::new(capacity, 0);
        buf[avail_offset..avail_offset + AVAIL_BLOCK_HEADER_SIZE]
            .copy_from_slice(avail_header.as_bytes());

        Self { buf, extended }
    }

    /// Adopt a header block read from disk. Detects the format from the
    /// magic word; byte-swapped and original-format databases are refused.
    pub fn from_bytes(buf: Box<[u8]>) -> Result<Self> {
        if buf.len() < STD_FIELDS_SIZE {
            return Err(Error::BadHeader("header block too small"));
        }
        let magic = u32::from_ne_bytes(buf[..4].try_into().expect("4-byte slice"));
        let extended = validate_magic(magic)?;
        Ok(Self { buf, extended })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn format(&self) -> FormatVersion {
        if self.extended {
            FormatVersion::Numsync
        } else {
            FormatVersion::Standard
        }
    }

    fn fields(&self) -> &StdFields {
        let (fields, _) =
            StdFields::ref_from_prefix(&self.buf).expect("header buffer holds fixed fields");
        fields
    }

    fn fields_mut(&mut self) -> &mut StdFields {
        let (fields, _) =
            StdFields::mut_from_prefix(&mut self.buf).expect("header buffer holds fixed fields");
        fields
    }

    fn ext_fields(&self) -> Option<&ExtFields> {
        if !self.extended {
            return None;
        }
        let (ext, _) = ExtFields::ref_from_prefix(&self.buf[STD_FIELDS_SIZE..])
            .expect("extended header holds extension fields");
        Some(ext)
    }

    fn ext_fields_mut(&mut self) -> Option<&mut ExtFields> {
        if !self.extended {
            return None;
        }
        let (ext, _) = ExtFields::mut_from_prefix(&mut self.buf[STD_FIELDS_SIZE..])
            .expect("extended header holds extension fields");
        Some(ext)
    }

    pub fn block_size(&self) -> u32 {
        self.fields().block_size.get()
    }

    pub fn dir(&self) -> u64 {
        self.fields().dir.get()
    }

    pub fn set_dir(&mut self, adr: u64, size: u32, bits: u32) {
        let fields = self.fields_mut();
        fields.dir = U64::new(adr);
        fields.dir_size = U32::new(size);
        fields.dir_bits = U32::new(bits);
    }

    pub fn dir_size(&self) -> u32 {
        self.fields().dir_size.get()
    }

    pub fn dir_bits(&self) -> u32 {
        self.fields().dir_bits.get()
    }

    pub fn bucket_size(&self) -> u32 {
        self.fields().bucket_size.get()
    }

    pub fn bucket_elems(&self) -> u32 {
        self.fields().bucket_elems.get()
    }

    pub fn next_block(&self) -> u64 {
        self.fields().next_block.get()
    }

    pub fn set_next_block(&mut self, next_block: u64) {
        self.fields_mut().next_block = U64::new(next_block);
    }

    pub fn version(&self) -> Option<u32> {
        self.ext_fields().map(|e| e.version.get())
    }

    pub fn numsync(&self) -> Option<u32> {
        self.ext_fields().map(|e| e.numsync.get())
    }

    /// Advance the sync counter (extended format only); wraps at 2^32.
    pub fn bump_numsync(&mut self) {
        if let Some(ext) = self.ext_fields_mut() {
            ext.numsync = U32::new(ext.numsync.get().wrapping_add(1));
        }
    }

    fn avail_offset(&self) -> usize {
        if self.extended {
            STD_FIELDS_SIZE + EXT_FIELDS_SIZE
        } else {
            STD_FIELDS_SIZE
        }
    }

    /// The inline master avail block: `(header, table)` views.
    pub fn avail(&self) -> (&AvailBlockHeader, &[AvailElem]) {
        avail::split_block(&self.buf[self.avail_offset()..])
            .expect("header block holds the master avail block")
    }

    /// Mutable views of the inline master avail block.
    pub fn avail_mut(&mut self) -> (&mut AvailBlockHeader, &mut [AvailElem]) {
        let offset = self.avail_offset();
        avail::split_block_mut(&mut self.buf[offset..])
            .expect("header block holds the master avail block")
    }

    /// Validate all header invariants against the file. Restores the master
    /// avail sort order when `writable`.
    pub fn validate(&mut self, writable: bool) -> Result<()> {
        let block_size = self.block_size();
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::BadHeader("block size out of range"));
        }
        if self.buf.len() != block_size as usize {
            return Err(Error::BadHeader("header block size mismatch"));
        }

        let fields = self.fields();
        let dir_bits = fields.dir_bits.get();
        let dir_size = fields.dir_size.get();
        if dir_bits >= 32
            || (dir_size as u64) != (1u64 << dir_bits) * std::mem::size_of::<u64>() as u64
        {
            return Err(Error::BadHeader("directory size and depth disagree"));
        }
        let dir = fields.dir.get();
        let next_block = fields.next_block.get();
        let dir_end = dir
            .checked_add(dir_size as u64)
            .ok_or(Error::BadHeader("directory offset overflow"))?;
        if dir < block_size as u64 || dir_end > next_block {
            return Err(Error::BadHeader("directory outside allocated file"));
        }

        let bucket_elems = fields.bucket_elems.get();
        let bucket_size = fields.bucket_size.get();
        if bucket_elems == 0
            || bucket_elems != Bucket::elems_for(block_size)
            || bucket_size as usize != Bucket::size_for(bucket_elems)
            || bucket_size > block_size
        {
            return Err(Error::BadHeader("bucket geometry disagrees with block size"));
        }

        let (avail_count, avail_size) = {
            let (header, _) = self.avail();
            (header.count(), header.size())
        };
        let expected_capacity = ((block_size as usize
            - self.avail_offset()
            - AVAIL_BLOCK_HEADER_SIZE)
            / AVAIL_ELEM_SIZE) as u32;
        if avail_size <= 1 || avail_size != expected_capacity || avail_count > avail_size {
            return Err(Error::BadAvail);
        }
        let needs_sort = {
            let (_, table) = self.avail();
            avail::check_table(table, avail_count, block_size as u64, next_block)?
        };
        if needs_sort && writable {
            log::warn!("restoring sort order of master avail table");
            let (header, table) = self.avail_mut();
            let count = header.count();
            avail::sort_table(table, count);
        }
        Ok(())
    }

    /// Rewrite the header in the other format, preserving every field.
    ///
    /// Upgrading shrinks the master avail capacity; entries that no longer
    /// fit are returned so the caller can push them back through the
    /// allocator. Downgrading never spills.
    pub fn convert(&self, format: FormatVersion) -> (Header, Vec<AvailElem>) {
        let mut converted = Header::create(self.block_size(), format);
        {
            let src = self.fields();
            let dst = converted.fields_mut();
            dst.dir = src.dir;
            dst.dir_size = src.dir_size;
            dst.dir_bits = src.dir_bits;
            dst.next_block = src.next_block;
        }
        if let (Some(numsync), Some(ext)) = (self.numsync(), converted.ext_fields_mut()) {
            ext.numsync = U32::new(numsync);
        }

        let (src_header, src_table) = self.avail();
        let src_count = src_header.count() as usize;
        let next_block = src_header.next_block();
        let (dst_header, dst_table) = converted.avail_mut();
        dst_header.set_next_block(next_block);

        let keep = src_count.min(dst_table.len());
        dst_table[..keep].copy_from_slice(&src_table[..keep]);
        dst_header.set_count(keep as u32);

        let spilled = src_table[keep..src_count].to_vec();
        (converted, spilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::avail::put;

    #[test]
    fn create_standard_geometry() {
        let header = Header::create(512, FormatVersion::Standard);

        assert!(!header.is_extended());
        assert_eq!(header.block_size(), 512);
        assert_eq!(header.dir(), 512);
        assert_eq!(header.dir_size(), 512);
        assert_eq!(header.dir_bits(), 6);
        assert_eq!(header.bucket_elems(), 13);
        assert_eq!(header.bucket_size(), 500);
        assert_eq!(header.next_block(), 1024);
        assert_eq!(header.numsync(), None);

        let (avail_header, table) = header.avail();
        assert_eq!(avail_header.count(), 0);
        assert_eq!(avail_header.size() as usize, table.len());
        // (512 - 40 - 16) / 12
        assert_eq!(avail_header.size(), 38);
    }

    #[test]
    fn create_extended_geometry() {
        let header = Header::create(512, FormatVersion::Numsync);

        assert!(header.is_extended());
        assert_eq!(header.version(), Some(FORMAT_VERSION));
        assert_eq!(header.numsync(), Some(0));
        // (512 - 56 - 16) / 12
        assert_eq!(header.avail().0.size(), 36);
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut header = Header::create(1024, FormatVersion::Numsync);
        header.set_next_block(1 << 16);
        header.bump_numsync();

        let buf = header.as_bytes().to_vec().into_boxed_slice();
        let mut reread = Header::from_bytes(buf).unwrap();
        reread.validate(false).unwrap();

        assert!(reread.is_extended());
        assert_eq!(reread.next_block(), 1 << 16);
        assert_eq!(reread.numsync(), Some(1));
    }

    #[test]
    fn from_bytes_detects_byte_swap() {
        let header = Header::create(512, FormatVersion::Standard);
        let mut buf = header.as_bytes().to_vec();
        buf[..4].reverse();
        assert!(matches!(
            Header::from_bytes(buf.into_boxed_slice()),
            Err(Error::ByteSwapped)
        ));
    }

    #[test]
    fn from_bytes_rejects_unknown_magic() {
        let mut buf = vec![0u8; 512];
        buf[..4].copy_from_slice(&0xdead_beefu32.to_ne_bytes());
        assert!(matches!(
            Header::from_bytes(buf.into_boxed_slice()),
            Err(Error::BadMagic(0xdead_beef))
        ));
    }

    #[test]
    fn from_bytes_refuses_original_format() {
        let mut buf = vec![0u8; 512];
        buf[..4].copy_from_slice(&OMAGIC.to_ne_bytes());
        assert!(matches!(
            Header::from_bytes(buf.into_boxed_slice()),
            Err(Error::BadHeader(_))
        ));
    }

    #[test]
    fn validate_rejects_directory_mismatch() {
        let mut header = Header::create(512, FormatVersion::Standard);
        header.set_dir(512, 512, 7);
        assert!(matches!(
            header.validate(false),
            Err(Error::BadHeader(_))
        ));
    }

    #[test]
    fn numsync_wraps() {
        let mut header = Header::create(512, FormatVersion::Numsync);
        let ext = header.ext_fields_mut().unwrap();
        ext.numsync = U32::new(u32::MAX);
        header.bump_numsync();
        assert_eq!(header.numsync(), Some(0));
    }

    #[test]
    fn convert_upgrade_spills_excess_avail() {
        let mut header = Header::create(512, FormatVersion::Standard);
        header.set_next_block(1 << 20);
        let capacity = {
            let (avail_header, table) = header.avail_mut();
            let capacity = avail_header.size();
            let mut count = 0;
            for i in 0..capacity {
                assert!(put(
                    table,
                    &mut count,
                    AvailElem::new(16 + i * 4, 4096 + i as u64 * 256),
                    false
                ));
            }
            avail_header.set_count(count);
            capacity
        };

        let (upgraded, spilled) = header.convert(FormatVersion::Numsync);

        assert!(upgraded.is_extended());
        assert_eq!(upgraded.next_block(), 1 << 20);
        let kept = upgraded.avail().0.count();
        assert_eq!(kept, upgraded.avail().0.size());
        assert_eq!(kept + spilled.len() as u32, capacity);
        // the spill takes the largest entries, which sort last
        assert!(spilled.iter().all(|e| e.size() >= 16));
    }

    #[test]
    fn convert_downgrade_keeps_everything() {
        let mut header = Header::create(512, FormatVersion::Numsync);
        header.set_next_block(1 << 20);
        {
            let (avail_header, table) = header.avail_mut();
            let mut count = 0;
            assert!(put(table, &mut count, AvailElem::new(64, 4096), false));
            avail_header.set_count(count);
        }
        header.bump_numsync();

        let (downgraded, spilled) = header.convert(FormatVersion::Standard);

        assert!(!downgraded.is_extended());
        assert!(spilled.is_empty());
        assert_eq!(downgraded.avail().0.count(), 1);
        assert_eq!(downgraded.avail().1[0], AvailElem::new(64, 4096));
    }
}
