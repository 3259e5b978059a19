//! # burrow — embedded single-file key/value store
//!
//! burrow keeps an entire key/value store in one regular file laid out as
//! an extensible (dynamic) hash table: a header block, a directory indexed
//! by the top bits of a 31-bit key hash, fixed-size buckets holding
//! linear-probe slot tables, and payloads allocated out of a free-space
//! stack with per-bucket recycling. One writer *or* many readers share a
//! file, serialized by a whole-file advisory lock.
//!
//! ## Quick start
//!
//! ```ignore
//! use burrow::{Database, OpenMode, StoreMode};
//!
//! let mut db = Database::options()
//!     .mode(OpenMode::NewDb)
//!     .block_size(4096)
//!     .open("data.db")?;
//!
//! db.store(b"alpha", b"1", StoreMode::Insert)?;
//! let value = db.fetch(b"alpha")?;
//! db.sync()?;
//! db.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Database (handle, find/store/delete)     │
//! ├──────────────┬──────────────┬───────────┤
//! │ split +      │ free-space   │ sync +    │
//! │ directory    │ allocator    │ snapshots │
//! ├──────────────┴──────────────┴───────────┤
//! │ bucket cache (MRU, dirty prefix)         │
//! ├─────────────────────────────────────────┤
//! │ header · directory · buckets · avail     │
//! ├─────────────────────────────────────────┤
//! │ file I/O shim (fd + mmap window) · lock  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A store that fills a bucket splits it — rehashing its slots into two
//! buckets one bit deeper and doubling the directory when a bucket's
//! depth catches up with it. Deletes recycle payload space through avail
//! pools kept sorted for best-fit allocation. `sync` writes dirty buckets,
//! the directory, and the header in that order; with the snapshot
//! protocol armed ([`Database::set_failure_atomic`]) every sync also
//! reflink-clones the file into one of two alternating snapshot files
//! whose permission bits encode crash-recovery eligibility.
//!
//! ## Durability and errors
//!
//! Databases are native-endian; a file written on an opposite-endian host
//! is rejected as [`Error::ByteSwapped`]. Fatal I/O or structural errors
//! poison the handle (`NeedRecovery`) until [`Database::recover`] rebuilds
//! the file from whatever survives.

pub mod database;
pub mod error;
pub mod hash;
pub mod storage;

pub use database::{
    latest_snapshot, Database, DbOptions, Keys, OpenMode, RecoverOptions, RecoveryReport,
    SetOption, SnapshotSelection, StoreMode,
};
pub use error::{Error, ErrorCode, Result};
pub use storage::cache::{CacheCapacity, CacheStats};
pub use storage::header::FormatVersion;
