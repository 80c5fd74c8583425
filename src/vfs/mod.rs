//! VFS operation contract
//!
//! Responsibilities:
//! - Define the synchronous operation set the embedded engine calls on every
//!   registered backend, with the shared flag bitmask and status vocabulary.
//! - Keep the contract backend-agnostic: the pool, SQL and chunk-store
//!   backends all implement the same `Vfs` trait and are interchangeable
//!   from the engine's point of view.
//!
//! Submodules:
//! - `api`: flags, status codes, errors and the `Vfs` trait itself

pub mod api;

pub use api::{
    DeviceCharacteristics, Fd, OpenFlags, ReadOutcome, StatusCode, SyncFlags, Vfs, VfsError,
    VfsResult, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_OPEN_FILES, DEFAULT_POOL_CAPACITY, SECTOR_SIZE,
};
