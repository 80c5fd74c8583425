//! The synchronous operation contract every VFS backend implements.
//!
//! The embedded engine invokes these operations on one logical thread and
//! never tolerates suspension: anything that genuinely needs async I/O must
//! happen either in a backend's `attach` readiness phase or behind a
//! write-behind scheduler the call path never awaits.

use bitflags::bitflags;
use thiserror::Error;

/// Atomic I/O granularity the engine assumes, in bytes.
pub const SECTOR_SIZE: u32 = 4096;

/// Chunk/block size shared by the remote-store backends.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Slots provisioned by the handle pool when its directory is empty.
pub const DEFAULT_POOL_CAPACITY: u32 = 6;

/// Open-file ceiling for the remote-store backends.
pub const DEFAULT_MAX_OPEN_FILES: usize = 100;

/// File descriptor, chosen by the caller at `open` time.
pub type Fd = u64;

bitflags! {
    /// Open-flag bitmask, interpreted identically by every backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READONLY        = 0x0000_0001;
        const READWRITE       = 0x0000_0002;
        const CREATE          = 0x0000_0004;
        const DELETE_ON_CLOSE = 0x0000_0008;
        const MAIN_DB         = 0x0000_0100;
        const TEMP_DB         = 0x0000_0200;
        const MAIN_JOURNAL    = 0x0000_0800;
        const SUPER_JOURNAL   = 0x0000_4000;
        const WAL             = 0x0008_0000;
    }
}

impl OpenFlags {
    /// File types that must survive a VFS restart.
    pub const PERSISTENT_TYPES: OpenFlags = OpenFlags::MAIN_DB
        .union(OpenFlags::MAIN_JOURNAL)
        .union(OpenFlags::SUPER_JOURNAL)
        .union(OpenFlags::WAL);

    /// Whether a file opened with these flags outlives the VFS instance.
    /// Delete-on-close always loses, even for a persistent type.
    pub fn is_persistent(self) -> bool {
        self.intersects(Self::PERSISTENT_TYPES) && !self.contains(Self::DELETE_ON_CLOSE)
    }
}

bitflags! {
    /// Device characteristics reported to the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCharacteristics: u32 {
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
    }
}

/// Durability level requested by `sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFlags {
    Normal,
    Full,
}

/// How much of a read request the backend could satisfy.
///
/// `ShortRead` means the tail of the caller's buffer was zero-filled; the
/// engine treats it as reading past end-of-file, not as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Complete,
    ShortRead,
}

impl ReadOutcome {
    pub fn status(self) -> StatusCode {
        match self {
            ReadOutcome::Complete => StatusCode::Ok,
            ReadOutcome::ShortRead => StatusCode::IoErrShortRead,
        }
    }
}

/// Status vocabulary surfaced to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    CantOpen,
    IoErr,
    IoErrShortRead,
}

/// Per-operation failure. Never crosses the operation boundary as a panic;
/// every backend catches its own backing-store errors and maps them here.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("cannot open {path}: {reason}")]
    CantOpen { path: String, reason: String },

    #[error("unknown or closed file descriptor {0}")]
    BadFd(Fd),

    #[error("i/o error: {context}")]
    Io { context: String },
}

impl VfsError {
    pub fn cant_open(path: impl Into<String>, reason: impl Into<String>) -> Self {
        VfsError::CantOpen {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>) -> Self {
        VfsError::Io {
            context: context.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            VfsError::CantOpen { .. } => StatusCode::CantOpen,
            VfsError::BadFd(_) | VfsError::Io { .. } => StatusCode::IoErr,
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

/// The operation set the embedded engine calls on every registered backend.
///
/// All methods are synchronous and must not block on remote I/O. Offsets are
/// absolute byte positions within the logical file. `fd` values are chosen
/// by the caller; several fds may alias one path and must observe each
/// other's writes immediately.
pub trait Vfs {
    /// Open or create the logical file at `path` under descriptor `fd`.
    /// Returns the effective flags recorded for the open.
    fn open(&mut self, path: &str, fd: Fd, flags: OpenFlags) -> VfsResult<OpenFlags>;

    /// Close `fd`, releasing backing storage if it was opened
    /// delete-on-close.
    fn close(&mut self, fd: Fd) -> VfsResult<()>;

    /// Fill `buf` from `offset`. A request past what the backing store can
    /// supply zero-fills the remainder and reports `ShortRead`.
    fn read(&mut self, fd: Fd, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome>;

    /// Write all of `data` at `offset`, extending the file as needed.
    fn write(&mut self, fd: Fd, data: &[u8], offset: u64) -> VfsResult<()>;

    fn truncate(&mut self, fd: Fd, size: u64) -> VfsResult<()>;

    fn sync(&mut self, fd: Fd, flags: SyncFlags) -> VfsResult<()>;

    fn file_size(&self, fd: Fd) -> VfsResult<u64>;

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::UNDELETABLE_WHEN_OPEN
    }

    /// Whether `path` currently exists in this backend.
    fn access(&self, path: &str) -> VfsResult<bool>;

    /// Remove `path` and its backing bytes. `sync_dir` asks for the
    /// containing directory to be durably updated where that applies.
    fn delete(&mut self, path: &str, sync_dir: bool) -> VfsResult<()>;
}
