//! Backing-store adapters
//!
//! Submodules:
//! - `kv`: asynchronous key-value object store trait plus in-memory and
//!   local-directory implementations
//! - `sql`: synchronous SQL execution trait plus the rusqlite implementation
//!
//! The VFS backends only ever talk to these seams; swapping a real remote
//! store in means implementing one trait, not touching the VFS logic.

pub mod kv;
pub mod sql;

pub use kv::{InMemoryKvBackend, KvBackend, KvError, LocalFsKvBackend};
pub use sql::{RusqliteBackend, SqlExec, SqlExecError, SqlValue};
