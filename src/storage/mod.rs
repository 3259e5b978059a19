//! # Storage Layer
//!
//! On-disk structures and the machinery that moves them between memory and
//! the database file:
//!
//! - `header`: block 0 — fixed header fields plus the inline master avail
//!   block filling the remainder of the block
//! - `avail`: free-space descriptors and the sorted avail tables
//! - `bucket`: fixed-size hash buckets with inline linear-probe slot tables
//! - `dir`: the directory array indexed by the top bits of the key hash
//! - `cache`: bounded MRU bucket cache with the dirty-prefix discipline
//! - `file`: descriptor-level I/O shim with full-read/full-write retry
//! - `mmap`: windowed memory-map over the same shim interface
//! - `lock`: whole-file advisory locking
//!
//! ## File layout
//!
//! ```text
//! +--------------------------+  offset 0
//! | header block             |  block_size bytes, master avail inline
//! +--------------------------+  offset header.dir
//! | directory                |  2^dir_bits offsets (u64 each)
//! +--------------------------+
//! | buckets / payloads /     |  allocated upward from next_block,
//! | overflow avail blocks    |  recycled through the avail pools
//! +--------------------------+
//! ```
//!
//! All multi-byte fields are stored in host byte order; a database moved to
//! an opposite-endian host is detected via the swapped magic word and
//! rejected. Structures are viewed in place with zerocopy over the
//! `native_endian` wrapper types, which tolerate the unaligned offsets that
//! arise inside block buffers.

pub mod avail;
pub mod bucket;
pub mod cache;
pub mod dir;
pub mod file;
pub mod header;
pub mod lock;
pub mod mmap;

pub use avail::{AvailBlock, AvailBlockHeader, AvailElem};
pub use bucket::{Bucket, BucketElement, BucketHeader};
pub use cache::{BucketCache, CacheCapacity, CacheStats};
pub use dir::Directory;
pub use file::DbFile;
pub use header::{Header, MAGIC, NUMSYNC_MAGIC, OMAGIC};
pub use lock::{lock_file, unlock_file, LockMethod};

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

/// Bytes of the key inlined in each slot for fast negative matching.
pub const KEY_START_LEN: usize = 12;

/// Capacity of the per-bucket avail table.
pub const BUCKET_AVAIL: usize = 6;

/// Freed regions smaller than this are abandoned rather than tracked.
pub const IGNORE_SIZE: u32 = 4;

/// Directory doubling refuses to grow the directory past half of this.
pub const MAX_DIR_SIZE: u64 = i32::MAX as u64;

/// Round a requested block size up to the next power of two within the
/// supported range.
pub fn normalize_block_size(requested: u32) -> u32 {
    requested
        .next_power_of_two()
        .clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_normalization() {
        assert_eq!(normalize_block_size(0), MIN_BLOCK_SIZE);
        assert_eq!(normalize_block_size(512), 512);
        assert_eq!(normalize_block_size(513), 1024);
        assert_eq!(normalize_block_size(4096), 4096);
        assert_eq!(normalize_block_size(1 << 20), MAX_BLOCK_SIZE);
    }

    #[test]
    fn every_block_size_is_a_slot_multiple() {
        let mut bs = MIN_BLOCK_SIZE;
        while bs <= MAX_BLOCK_SIZE {
            assert_eq!(bs as usize % std::mem::size_of::<BucketElement>(), 0);
            bs *= 2;
        }
    }
}
