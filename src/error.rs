//! # Error Taxonomy
//!
//! Every fallible operation in burrow returns [`Result`] with a closed
//! [`Error`] enum. Callers are expected to match on the precise kind:
//! `ItemNotFound` and `CannotReplace` are ordinary control flow for lookups
//! and insert-mode stores, while the structural kinds (`BadBucket`,
//! `BadAvail`, ...) indicate on-disk corruption and usually poison the handle
//! (see [`Database::needs_recovery`](crate::Database::needs_recovery)).
//!
//! I/O failures keep the underlying [`std::io::Error`], so the OS errno stays
//! observable through [`Error::errno`] and the per-handle
//! [`Database::last_errno`](crate::Database::last_errno) accessor.

use thiserror::Error;

/// Errors reported by burrow operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying I/O failure (open, seek, read, write, truncate, sync,
    /// stat, clone).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Premature end of file while reading a structure the header promised.
    #[error("unexpected end of file")]
    FileEof,

    /// The file does not start with a recognized magic word.
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),

    /// The magic word matches a database written on a platform with the
    /// opposite byte order. Databases are native-endian and cannot be
    /// opened cross-endian.
    #[error("database is byte-swapped (written on an opposite-endian host)")]
    ByteSwapped,

    /// A header field violates the format invariants.
    #[error("malformed database file header: {0}")]
    BadHeader(&'static str),

    /// The combination of open flags is not valid.
    #[error("invalid open flags")]
    BadOpenFlags,

    /// Advisory lock could not be acquired.
    #[error("database file is locked by another process")]
    CannotLock,

    /// An avail table or avail block failed validation.
    #[error("malformed avail data")]
    BadAvail,

    /// A bucket read from disk failed validation.
    #[error("malformed hash bucket")]
    BadBucket,

    /// The in-memory slot table is inconsistent with the bucket header.
    #[error("malformed hash table")]
    BadHashTable,

    /// A directory entry does not point into the allocated file region.
    #[error("malformed directory entry")]
    BadDirEntry,

    /// A slot carries a hash value the hash function can never produce.
    #[error("malformed hash table entry")]
    BadHashEntry,

    /// Doubling the directory would exceed the representable size.
    #[error("hash directory overflow")]
    DirOverflow,

    /// The bucket cache lost track of an entry it created.
    #[error("bucket cache corrupted")]
    BucketCacheCorrupted,

    /// Stored payload data is inconsistent with the slot that points at it.
    #[error("malformed database content")]
    MalformedData,

    /// The requested key is not in the database.
    #[error("item not found")]
    ItemNotFound,

    /// Insert-mode store of a key that already exists.
    #[error("cannot replace existing item")]
    CannotReplace,

    /// Store attempted through a reader handle.
    #[error("reader cannot store")]
    ReaderCannotStore,

    /// Delete attempted through a reader handle.
    #[error("reader cannot delete")]
    ReaderCannotDelete,

    /// Reorganize attempted through a reader handle.
    #[error("reader cannot reorganize")]
    ReaderCannotReorganize,

    /// The operation requires a writer handle.
    #[error("operation not permitted on a reader handle")]
    CannotBeReader,

    /// The operation requires a reader handle.
    #[error("operation not permitted on a writer handle")]
    CannotBeWriter,

    /// A snapshot file is not owned by the effective user.
    #[error("snapshot file has wrong owner")]
    FileOwner,

    /// A snapshot file carries permission bits the protocol never produces.
    #[error("snapshot file has unexpected mode")]
    FileMode,

    /// Reflink cloning of the database into a snapshot failed.
    #[error("failed to clone database file into snapshot")]
    SnapshotClone,

    /// A path could not be canonicalized while arming snapshots.
    #[error("failed to resolve real path")]
    Realpath,

    /// A fatal error was recorded earlier; the database must be recovered
    /// before further mutation.
    #[error("database needs recovery")]
    NeedRecovery,

    /// The pre-recovery backup rename failed; the original file is intact.
    #[error("failed to create backup copy")]
    BackupFailed,

    /// The option was already set and cannot be changed.
    #[error("option already set")]
    OptAlreadySet,

    /// The option value is out of range or otherwise invalid.
    #[error("bad option value")]
    OptBadVal,

    /// The call violates the API contract (e.g. identical snapshot names).
    #[error("usage error")]
    Usage,
}

/// Fieldless mirror of [`Error`], recorded per handle as "the last error".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    Io,
    FileEof,
    BadMagic,
    ByteSwapped,
    BadHeader,
    BadOpenFlags,
    CannotLock,
    BadAvail,
    BadBucket,
    BadHashTable,
    BadDirEntry,
    BadHashEntry,
    DirOverflow,
    BucketCacheCorrupted,
    MalformedData,
    ItemNotFound,
    CannotReplace,
    ReaderCannotStore,
    ReaderCannotDelete,
    ReaderCannotReorganize,
    CannotBeReader,
    CannotBeWriter,
    FileOwner,
    FileMode,
    SnapshotClone,
    Realpath,
    NeedRecovery,
    BackupFailed,
    OptAlreadySet,
    OptBadVal,
    Usage,
}

impl Error {
    /// The fieldless code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::Io,
            Error::FileEof => ErrorCode::FileEof,
            Error::BadMagic(_) => ErrorCode::BadMagic,
            Error::ByteSwapped => ErrorCode::ByteSwapped,
            Error::BadHeader(_) => ErrorCode::BadHeader,
            Error::BadOpenFlags => ErrorCode::BadOpenFlags,
            Error::CannotLock => ErrorCode::CannotLock,
            Error::BadAvail => ErrorCode::BadAvail,
            Error::BadBucket => ErrorCode::BadBucket,
            Error::BadHashTable => ErrorCode::BadHashTable,
            Error::BadDirEntry => ErrorCode::BadDirEntry,
            Error::BadHashEntry => ErrorCode::BadHashEntry,
            Error::DirOverflow => ErrorCode::DirOverflow,
            Error::BucketCacheCorrupted => ErrorCode::BucketCacheCorrupted,
            Error::MalformedData => ErrorCode::MalformedData,
            Error::ItemNotFound => ErrorCode::ItemNotFound,
            Error::CannotReplace => ErrorCode::CannotReplace,
            Error::ReaderCannotStore => ErrorCode::ReaderCannotStore,
            Error::ReaderCannotDelete => ErrorCode::ReaderCannotDelete,
            Error::ReaderCannotReorganize => ErrorCode::ReaderCannotReorganize,
            Error::CannotBeReader => ErrorCode::CannotBeReader,
            Error::CannotBeWriter => ErrorCode::CannotBeWriter,
            Error::FileOwner => ErrorCode::FileOwner,
            Error::FileMode => ErrorCode::FileMode,
            Error::SnapshotClone => ErrorCode::SnapshotClone,
            Error::Realpath => ErrorCode::Realpath,
            Error::NeedRecovery => ErrorCode::NeedRecovery,
            Error::BackupFailed => ErrorCode::BackupFailed,
            Error::OptAlreadySet => ErrorCode::OptAlreadySet,
            Error::OptBadVal => ErrorCode::OptBadVal,
            Error::Usage => ErrorCode::Usage,
        }
    }

    /// The OS errno carried by this error, if it wraps an I/O failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// True for errors that poison the handle and require recovery before
    /// further mutation. `MalformedData` is not in the list: it also
    /// reports rejected inputs (zero-length keys), and the read paths that
    /// detect on-disk malformation poison the handle at the detection
    /// site.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::FileEof
                | Error::BadAvail
                | Error::BadBucket
                | Error::BadHashTable
                | Error::BadDirEntry
                | Error::BadHashEntry
                | Error::BucketCacheCorrupted
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
