// blockvfs: VFS backends that present an embedded engine's synchronous
// byte-addressable file contract on top of stores that are not files —
// a pool of pre-provisioned local handles, a synchronous relational block
// store, and an asynchronous key-value chunk store.

pub mod backend;
pub mod block;
pub mod chunkstore;
pub mod pool;
pub mod sqlblock;
pub mod vfs;

pub use block::BlockLayout;
pub use chunkstore::ChunkStoreVfs;
pub use pool::HandlePoolVfs;
pub use sqlblock::SqlBlockVfs;
pub use vfs::{Fd, OpenFlags, ReadOutcome, StatusCode, SyncFlags, Vfs, VfsError, VfsResult};
