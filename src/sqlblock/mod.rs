//! SQL block VFS: file bytes live as fixed-size blocks in two relational
//! tables behind a synchronous SQL backend. Every operation is a direct
//! statement; durability is the backend's own (each `exec` persists before
//! returning), so `sync` is a no-op.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::sql::{SqlExec, SqlExecError, SqlValue};
use crate::block::BlockLayout;
use crate::vfs::{
    Fd, OpenFlags, ReadOutcome, SyncFlags, Vfs, VfsError, VfsResult, DEFAULT_MAX_OPEN_FILES,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
  path TEXT PRIMARY KEY,
  size INTEGER NOT NULL,
  flags INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  modified_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS blocks (
  path TEXT NOT NULL,
  block_id INTEGER NOT NULL,
  data BLOB NOT NULL,
  created_at INTEGER NOT NULL,
  PRIMARY KEY (path, block_id),
  FOREIGN KEY (path) REFERENCES files(path) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS blocks_path_block_idx ON blocks (path, block_id);
";

/// Schema creation failing at attach is fatal: there is no degraded mode
/// for a VFS without its backing tables.
#[derive(Debug, Error)]
pub enum SqlBlockError {
    #[error("schema init: {0}")]
    Schema(#[from] SqlExecError),
}

#[derive(Debug, Clone)]
pub struct SqlBlockOptions {
    pub layout: BlockLayout,
    pub max_open_files: usize,
}

impl Default for SqlBlockOptions {
    fn default() -> Self {
        Self {
            layout: BlockLayout::default(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

struct SqlOpenFile {
    path: String,
    flags: OpenFlags,
}

pub struct SqlBlockVfs<C: SqlExec> {
    conn: C,
    layout: BlockLayout,
    max_open_files: usize,
    open_files: HashMap<Fd, SqlOpenFile>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn io_err(e: SqlExecError) -> VfsError {
    VfsError::io(e.to_string())
}

impl<C: SqlExec> SqlBlockVfs<C> {
    /// Idempotently create the schema, then drop rows left behind by a
    /// prior session's ephemeral files.
    pub fn attach(conn: C, options: SqlBlockOptions) -> Result<Self, SqlBlockError> {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            conn.exec(stmt, &[])?;
        }

        let stale = conn.exec("SELECT path, flags FROM files", &[])?;
        for row in stale {
            let (Some(SqlValue::Text(path)), Some(flags)) = (row.first(), row.get(1)) else {
                continue;
            };
            let flags = OpenFlags::from_bits_retain(flags.as_i64().unwrap_or(0) as u32);
            if !flags.is_persistent() {
                warn!(%path, ?flags, "removing stale ephemeral file");
                conn.exec(
                    "DELETE FROM files WHERE path = ?1",
                    &[SqlValue::Text(path.clone())],
                )?;
            }
        }
        debug!("sql block vfs attached");

        Ok(Self {
            conn,
            layout: options.layout,
            max_open_files: options.max_open_files,
            open_files: HashMap::new(),
        })
    }

    fn open_file(&self, fd: Fd) -> VfsResult<&SqlOpenFile> {
        self.open_files.get(&fd).ok_or(VfsError::BadFd(fd))
    }

    fn meta_size(&self, path: &str) -> VfsResult<Option<u64>> {
        let rows = self
            .conn
            .exec(
                "SELECT size FROM files WHERE path = ?1",
                &[SqlValue::Text(path.to_string())],
            )
            .map_err(io_err)?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_i64())
            .map(|v| v as u64))
    }

    fn load_blocks(&self, path: &str, ids: &[u64]) -> VfsResult<HashMap<u64, Vec<u8>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = (0..ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT block_id, data FROM blocks WHERE path = ?1 AND block_id IN ({placeholders})"
        );
        let mut params = Vec::with_capacity(ids.len() + 1);
        params.push(SqlValue::Text(path.to_string()));
        params.extend(ids.iter().map(|&id| SqlValue::Integer(id as i64)));
        let rows = self.conn.exec(&sql, &params).map_err(io_err)?;

        let mut out = HashMap::with_capacity(rows.len());
        for mut row in rows {
            if row.len() != 2 {
                continue;
            }
            let data = row.pop().expect("row arity checked");
            let id = row.pop().expect("row arity checked");
            if let (Some(id), SqlValue::Blob(data)) = (id.as_i64(), data) {
                out.insert(id as u64, data);
            }
        }
        Ok(out)
    }

    fn store_block(&self, path: &str, block_id: u64, data: Vec<u8>) -> VfsResult<()> {
        self.conn
            .exec(
                "INSERT OR REPLACE INTO blocks (path, block_id, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::Text(path.to_string()),
                    SqlValue::Integer(block_id as i64),
                    SqlValue::Blob(data),
                    SqlValue::Integer(now_millis()),
                ],
            )
            .map_err(io_err)?;
        Ok(())
    }

    fn update_size(&self, path: &str, size: u64) -> VfsResult<()> {
        self.conn
            .exec(
                "UPDATE files SET size = ?2, modified_at = ?3 WHERE path = ?1",
                &[
                    SqlValue::Text(path.to_string()),
                    SqlValue::Integer(size as i64),
                    SqlValue::Integer(now_millis()),
                ],
            )
            .map_err(io_err)?;
        Ok(())
    }
}

impl<C: SqlExec> Vfs for SqlBlockVfs<C> {
    fn open(&mut self, path: &str, fd: Fd, flags: OpenFlags) -> VfsResult<OpenFlags> {
        if self.open_files.contains_key(&fd) {
            return Err(VfsError::io(format!("fd {fd} already in use")));
        }
        if self.meta_size(path)?.is_none() {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(VfsError::cant_open(path, "file not found"));
            }
            if self.open_files.len() >= self.max_open_files {
                return Err(VfsError::cant_open(path, "too many open files"));
            }
            let now = now_millis();
            self.conn
                .exec(
                    "INSERT INTO files (path, size, flags, created_at, modified_at) \
                     VALUES (?1, 0, ?2, ?3, ?3)",
                    &[
                        SqlValue::Text(path.to_string()),
                        SqlValue::Integer(flags.bits() as i64),
                        SqlValue::Integer(now),
                    ],
                )
                .map_err(|e| VfsError::cant_open(path, e.to_string()))?;
        }
        self.open_files.insert(
            fd,
            SqlOpenFile {
                path: path.to_string(),
                flags,
            },
        );
        Ok(flags)
    }

    fn close(&mut self, fd: Fd) -> VfsResult<()> {
        let open = self.open_files.remove(&fd).ok_or(VfsError::BadFd(fd))?;
        if open.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            let path = open.path;
            self.conn
                .exec(
                    "DELETE FROM files WHERE path = ?1",
                    &[SqlValue::Text(path)],
                )
                .map_err(io_err)?;
        }
        Ok(())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome> {
        let path = self.open_file(fd)?.path.clone();
        if buf.is_empty() {
            return Ok(ReadOutcome::Complete);
        }
        let size = self
            .meta_size(&path)?
            .ok_or_else(|| VfsError::io(format!("{path} deleted while open")))?;
        if offset >= size {
            buf.fill(0);
            return Ok(ReadOutcome::ShortRead);
        }

        let range = self.layout.range(offset, buf.len());
        let ids: Vec<u64> = (range.start_block..=range.end_block).collect();
        let blocks = self.load_blocks(&path, &ids)?;
        let assembled = self.layout.assemble(&blocks, offset, buf.len());
        buf.copy_from_slice(&assembled);

        let available = (size - offset) as usize;
        if available < buf.len() {
            buf[available..].fill(0);
            return Ok(ReadOutcome::ShortRead);
        }
        Ok(ReadOutcome::Complete)
    }

    fn write(&mut self, fd: Fd, data: &[u8], offset: u64) -> VfsResult<()> {
        let path = self.open_file(fd)?.path.clone();
        if data.is_empty() {
            return Ok(());
        }
        let size = self
            .meta_size(&path)?
            .ok_or_else(|| VfsError::io(format!("{path} deleted while open")))?;

        for slice in self.layout.split_for_write(offset, data) {
            let block = if slice.is_full_block(self.layout) {
                slice.data.to_vec()
            } else {
                let existing = self.load_blocks(&path, &[slice.block_id])?;
                self.layout.merge_into_block(
                    existing.get(&slice.block_id).map(|v| v.as_slice()),
                    slice.offset_in_block,
                    slice.data,
                )
            };
            self.store_block(&path, slice.block_id, block)?;
        }

        let end = offset + data.len() as u64;
        if end > size {
            self.update_size(&path, end)?;
        }
        Ok(())
    }

    fn truncate(&mut self, fd: Fd, size: u64) -> VfsResult<()> {
        let path = self.open_file(fd)?.path.clone();
        let bs = self.layout.block_size as u64;
        // First block id with no surviving bytes.
        let first_dead = self.layout.blocks_for(size);
        self.conn
            .exec(
                "DELETE FROM blocks WHERE path = ?1 AND block_id >= ?2",
                &[
                    SqlValue::Text(path.clone()),
                    SqlValue::Integer(first_dead as i64),
                ],
            )
            .map_err(io_err)?;

        if size % bs != 0 {
            // Zero the dead tail of the boundary block.
            let boundary = size / bs;
            let keep = (size % bs) as usize;
            if let Some(existing) = self.load_blocks(&path, &[boundary])?.remove(&boundary) {
                let mut block = existing;
                block.resize(self.layout.block_size as usize, 0);
                block[keep..].fill(0);
                self.store_block(&path, boundary, block)?;
            }
        }
        self.update_size(&path, size)
    }

    fn sync(&mut self, fd: Fd, _flags: SyncFlags) -> VfsResult<()> {
        // The backend persists on every exec return.
        self.open_file(fd)?;
        Ok(())
    }

    fn file_size(&self, fd: Fd) -> VfsResult<u64> {
        let path = &self.open_file(fd)?.path;
        self.meta_size(path)?
            .ok_or_else(|| VfsError::io(format!("{path} deleted while open")))
    }

    fn access(&self, path: &str) -> VfsResult<bool> {
        Ok(self.meta_size(path)?.is_some())
    }

    fn delete(&mut self, path: &str, _sync_dir: bool) -> VfsResult<()> {
        self.conn
            .exec(
                "DELETE FROM files WHERE path = ?1",
                &[SqlValue::Text(path.to_string())],
            )
            .map_err(io_err)?;
        Ok(())
    }
}
