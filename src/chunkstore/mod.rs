//! Chunked VFS over an asynchronous key-value store.
//!
//! The operation contract is synchronous but the backing store is not, so
//! reads are answered from an in-memory chunk cache (misses short-read and
//! trigger a background preload) and mutations update authoritative
//! in-memory metadata before handing durability to the write-behind
//! scheduler. A crash between a successful `write` and the completion of
//! its scheduled persistence loses that write; callers that need a stronger
//! checkpoint use `flush_pending`.
//!
//! Key scheme: `file:{path}:meta`, `file:{path}:{chunkIndex}`,
//! `index:files`.
//!
//! Submodules:
//! - `cache`: bounded chunk cache serving the synchronous read path
//! - `scheduler`: per-path write-behind durability

pub mod cache;
pub mod scheduler;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::kv::{KvBackend, KvError};
use crate::block::BlockLayout;
use crate::vfs::{
    Fd, OpenFlags, ReadOutcome, SyncFlags, Vfs, VfsError, VfsResult, DEFAULT_MAX_OPEN_FILES,
};
use cache::ChunkCache;
use scheduler::{PersistOp, WriteScheduler};

pub(crate) const INDEX_KEY: &str = "index:files";

/// How many chunk keys to sweep when healing a file whose metadata (and so
/// its real chunk count) is lost.
const HEAL_SWEEP_CHUNKS: u64 = 64;

pub(crate) fn meta_key(path: &str) -> String {
    format!("file:{path}:meta")
}

pub(crate) fn chunk_key(path: &str, chunk: u64) -> String {
    format!("file:{path}:{chunk}")
}

/// Per-file metadata record, authoritative in memory once attached.
/// `present_chunks` lists the chunks that actually exist in the backing
/// store; chunk indices below `chunk_count` that are absent here are holes
/// and read as zero without consulting the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub flags: u32,
    pub chunk_count: u64,
    pub created: u64,
    #[serde(default)]
    pub present_chunks: BTreeSet<u64>,
}

impl FileMeta {
    fn open_flags(&self) -> OpenFlags {
        OpenFlags::from_bits_retain(self.flags)
    }
}

/// Readiness failures are fatal; there is no degraded mode for a VFS that
/// cannot reach its backing store.
#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error(transparent)]
    Backend(#[from] KvError),
}

#[derive(Debug, Clone)]
pub struct ChunkStoreOptions {
    pub layout: BlockLayout,
    /// Chunk cache bound, in entries.
    pub cache_entries: u64,
    pub max_open_files: usize,
}

impl Default for ChunkStoreOptions {
    fn default() -> Self {
        Self {
            layout: BlockLayout::default(),
            cache_entries: 256,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

struct ChunkOpenFile {
    path: String,
    flags: OpenFlags,
}

pub struct ChunkStoreVfs<B: KvBackend> {
    backend: Arc<B>,
    layout: BlockLayout,
    cache: ChunkCache,
    scheduler: WriteScheduler<B>,
    /// Authoritative metadata for every active path; also the active-file
    /// set the index key mirrors.
    metas: HashMap<String, FileMeta>,
    open_files: HashMap<Fd, ChunkOpenFile>,
    max_open_files: usize,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<B: KvBackend> ChunkStoreVfs<B> {
    /// Readiness phase: load the active-file index, eagerly pull each file's
    /// metadata and first chunk (the common sequential-scan warm-up), heal
    /// malformed records, drop ephemeral leftovers, and persist the
    /// corrected index.
    pub async fn attach(
        backend: Arc<B>,
        options: ChunkStoreOptions,
    ) -> Result<Self, ChunkStoreError> {
        let cache = ChunkCache::new(options.cache_entries);

        let paths: Vec<String> = match backend.get(INDEX_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "malformed file index, starting empty");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let loads = paths.iter().map(|path| {
            let backend = backend.clone();
            async move {
                let meta = backend.get(&meta_key(path)).await?;
                let first_chunk = backend.get(&chunk_key(path, 0)).await?;
                Ok::<_, KvError>((path.clone(), meta, first_chunk))
            }
        });
        let loaded = futures::future::try_join_all(loads).await?;

        let mut metas = HashMap::new();
        for (path, raw_meta, first_chunk) in loaded {
            let meta: FileMeta = match raw_meta.as_deref().map(serde_json::from_slice) {
                Some(Ok(meta)) => meta,
                Some(Err(e)) => {
                    warn!(%path, error = %e, "malformed metadata record, dropping file");
                    backend.delete(&meta_key(&path)).await?;
                    for chunk in 0..HEAL_SWEEP_CHUNKS {
                        backend.delete(&chunk_key(&path, chunk)).await?;
                    }
                    continue;
                }
                None => {
                    warn!(%path, "indexed file has no metadata record, dropping");
                    for chunk in 0..HEAL_SWEEP_CHUNKS {
                        backend.delete(&chunk_key(&path, chunk)).await?;
                    }
                    continue;
                }
            };
            if !meta.open_flags().is_persistent() {
                debug!(%path, "removing ephemeral file from previous session");
                backend.delete(&meta_key(&path)).await?;
                for chunk in 0..meta.chunk_count {
                    backend.delete(&chunk_key(&path, chunk)).await?;
                }
                continue;
            }
            if let Some(chunk0) = first_chunk {
                cache.insert(&path, 0, chunk0);
            }
            metas.insert(path, meta);
        }

        let mut index: Vec<String> = metas.keys().cloned().collect();
        index.sort_unstable();
        let encoded = serde_json::to_vec(&index).map_err(|e| KvError(e.to_string()))?;
        backend.put(INDEX_KEY, Bytes::from(encoded)).await?;
        debug!(files = metas.len(), "chunk store vfs attached");

        Ok(Self {
            scheduler: WriteScheduler::new(backend.clone()),
            backend,
            layout: options.layout,
            cache,
            metas,
            open_files: HashMap::new(),
            max_open_files: options.max_open_files,
        })
    }

    fn open_file(&self, fd: Fd) -> VfsResult<&ChunkOpenFile> {
        self.open_files.get(&fd).ok_or(VfsError::BadFd(fd))
    }

    fn meta_of(&self, path: &str) -> VfsResult<&FileMeta> {
        self.metas
            .get(path)
            .ok_or_else(|| VfsError::io(format!("{path} deleted while open")))
    }

    fn schedule_index(&self) {
        let mut paths: Vec<String> = self.metas.keys().cloned().collect();
        paths.sort_unstable();
        self.scheduler.schedule(INDEX_KEY, PersistOp::Index { paths });
    }

    /// Pull one chunk from the backing store into the cache. Reads that
    /// miss spawn this in the background; tests call it directly to make
    /// miss-then-hit sequences deterministic.
    pub async fn preload(&self, path: &str, chunk: u64) -> Result<(), KvError> {
        Self::preload_into(&*self.backend, &self.cache, path, chunk).await
    }

    async fn preload_into(
        backend: &B,
        cache: &ChunkCache,
        path: &str,
        chunk: u64,
    ) -> Result<(), KvError> {
        if let Some(data) = backend.get(&chunk_key(path, chunk)).await? {
            cache.insert(path, chunk, data);
        }
        Ok(())
    }

    /// Wait for all scheduled durability work to reach the backing store.
    pub async fn flush_pending(&self) {
        self.scheduler.flush_pending().await;
    }
}

impl<B: KvBackend> Vfs for ChunkStoreVfs<B> {
    fn open(&mut self, path: &str, fd: Fd, flags: OpenFlags) -> VfsResult<OpenFlags> {
        if self.open_files.contains_key(&fd) {
            return Err(VfsError::io(format!("fd {fd} already in use")));
        }
        if !self.metas.contains_key(path) {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(VfsError::cant_open(path, "file not found"));
            }
            if self.metas.len() >= self.max_open_files {
                return Err(VfsError::cant_open(path, "too many active files"));
            }
            let meta = FileMeta {
                size: 0,
                flags: flags.bits(),
                chunk_count: 0,
                created: now_millis(),
                present_chunks: BTreeSet::new(),
            };
            self.metas.insert(path.to_string(), meta.clone());
            self.scheduler.schedule(
                path,
                PersistOp::Upsert {
                    meta,
                    chunks: HashMap::new(),
                    delete_chunks: vec![],
                    zero_tail: None,
                },
            );
            self.schedule_index();
        }
        self.open_files.insert(
            fd,
            ChunkOpenFile {
                path: path.to_string(),
                flags,
            },
        );
        Ok(flags)
    }

    fn close(&mut self, fd: Fd) -> VfsResult<()> {
        let open = self.open_files.remove(&fd).ok_or(VfsError::BadFd(fd))?;
        if open.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            self.delete(&open.path, false)?;
        }
        Ok(())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome> {
        let path = self.open_file(fd)?.path.clone();
        if buf.is_empty() {
            return Ok(ReadOutcome::Complete);
        }
        let meta = self.meta_of(&path)?;
        let size = meta.size;
        if offset >= size {
            buf.fill(0);
            return Ok(ReadOutcome::ShortRead);
        }

        let effective = ((size - offset) as usize).min(buf.len());
        let range = self.layout.range(offset, effective);
        let mut chunks: HashMap<u64, Bytes> = HashMap::new();
        let mut missed = false;
        for chunk in range.start_block..=range.end_block {
            match self.cache.get(&path, chunk) {
                Some(data) => {
                    chunks.insert(chunk, data);
                }
                // A hole chunk was never written; it assembles as zero and
                // is not a miss.
                None if !meta.present_chunks.contains(&chunk) => {}
                None => {
                    // Serve zeroes now; warm the cache for the retry.
                    missed = true;
                    let backend = self.backend.clone();
                    let cache = self.cache.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::preload_into(&*backend, &cache, &path, chunk).await
                        {
                            warn!(%path, chunk, error = %e, "chunk preload failed");
                        }
                    });
                }
            }
        }

        let assembled = self.layout.assemble(&chunks, offset, effective);
        buf[..effective].copy_from_slice(&assembled);
        buf[effective..].fill(0);
        if missed || effective < buf.len() {
            Ok(ReadOutcome::ShortRead)
        } else {
            Ok(ReadOutcome::Complete)
        }
    }

    fn write(&mut self, fd: Fd, data: &[u8], offset: u64) -> VfsResult<()> {
        let path = self.open_file(fd)?.path.clone();
        if data.is_empty() {
            return Ok(());
        }
        let mut meta = self.meta_of(&path)?.clone();

        let mut modified: HashMap<u64, Bytes> = HashMap::new();
        for slice in self.layout.split_for_write(offset, data) {
            let merged = if slice.is_full_block(self.layout) {
                Bytes::copy_from_slice(slice.data)
            } else {
                let existing = self.cache.get(&path, slice.block_id);
                Bytes::from(self.layout.merge_into_block(
                    existing.as_deref(),
                    slice.offset_in_block,
                    slice.data,
                ))
            };
            self.cache.insert(&path, slice.block_id, merged.clone());
            modified.insert(slice.block_id, merged);
        }

        meta.size = meta.size.max(offset + data.len() as u64);
        meta.chunk_count = self.layout.blocks_for(meta.size);
        meta.present_chunks.extend(modified.keys().copied());
        self.metas.insert(path.clone(), meta.clone());
        self.scheduler.schedule(
            &path,
            PersistOp::Upsert {
                meta,
                chunks: modified,
                delete_chunks: vec![],
                zero_tail: None,
            },
        );
        Ok(())
    }

    fn truncate(&mut self, fd: Fd, size: u64) -> VfsResult<()> {
        let path = self.open_file(fd)?.path.clone();
        let mut meta = self.meta_of(&path)?.clone();

        let new_count = self.layout.blocks_for(size);
        let mut delete_chunks = Vec::new();
        for chunk in new_count..meta.chunk_count {
            self.cache.invalidate(&path, chunk);
            delete_chunks.push(chunk);
        }

        let mut rewritten: HashMap<u64, Bytes> = HashMap::new();
        let mut zero_tail = None;
        let bs = self.layout.block_size as u64;
        if size % bs != 0 && size < meta.size {
            // Zero the dead tail of the boundary chunk.
            let boundary = size / bs;
            let keep = (size % bs) as usize;
            if let Some(existing) = self.cache.get(&path, boundary) {
                let mut block = self.layout.merge_into_block(Some(existing.as_ref()), 0, &[]);
                block[keep..].fill(0);
                let block = Bytes::from(block);
                self.cache.insert(&path, boundary, block.clone());
                rewritten.insert(boundary, block);
            } else if meta.present_chunks.contains(&boundary) {
                // Durable but not cached: the background task fetches and
                // zeroes it so the cut bytes cannot resurface after a
                // later extend.
                zero_tail = Some((boundary, keep));
            }
        }

        meta.size = size;
        meta.chunk_count = new_count;
        meta.present_chunks.retain(|&chunk| chunk < new_count);
        self.metas.insert(path.clone(), meta.clone());
        self.scheduler.schedule(
            &path,
            PersistOp::Upsert {
                meta,
                chunks: rewritten,
                delete_chunks,
                zero_tail,
            },
        );
        Ok(())
    }

    fn sync(&mut self, fd: Fd, _flags: SyncFlags) -> VfsResult<()> {
        // Write-behind by contract; `flush_pending` is the real checkpoint.
        self.open_file(fd)?;
        Ok(())
    }

    fn file_size(&self, fd: Fd) -> VfsResult<u64> {
        let path = &self.open_file(fd)?.path;
        Ok(self.meta_of(path)?.size)
    }

    fn access(&self, path: &str) -> VfsResult<bool> {
        Ok(self.metas.contains_key(path))
    }

    fn delete(&mut self, path: &str, _sync_dir: bool) -> VfsResult<()> {
        let Some(meta) = self.metas.remove(path) else {
            return Ok(());
        };
        self.cache.invalidate_file(path, meta.chunk_count);
        self.scheduler.schedule(
            path,
            PersistOp::Remove {
                chunk_count: meta.chunk_count,
            },
        );
        self.schedule_index();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kv::InMemoryKvBackend;
    use crate::vfs::StatusCode;

    fn rw_create() -> OpenFlags {
        OpenFlags::MAIN_DB | OpenFlags::READWRITE | OpenFlags::CREATE
    }

    async fn fresh() -> ChunkStoreVfs<InMemoryKvBackend> {
        ChunkStoreVfs::attach(
            Arc::new(InMemoryKvBackend::new()),
            ChunkStoreOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_cross_chunk_boundary() {
        let mut v = fresh().await;
        v.open("/t.db", 1, rw_create()).unwrap();

        let cs = v.layout.block_size as u64;
        let mut data = vec![0u8; 1000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        // 500 bytes on each side of the chunk boundary.
        v.write(1, &data, cs - 500).unwrap();
        let mut out = vec![0u8; 1000];
        assert_eq!(
            v.read(1, &mut out, cs - 500).unwrap(),
            ReadOutcome::Complete
        );
        assert_eq!(out, data);
        assert_eq!(v.file_size(1).unwrap(), cs + 500);
    }

    #[tokio::test]
    async fn test_pattern_scan_five_chunks() {
        let mut v = fresh().await;
        v.open("/t.db", 1, rw_create()).unwrap();
        let cs = v.layout.block_size as usize;
        let data: Vec<u8> = (0..cs * 5).map(|i| ((i * 7) % 256) as u8).collect();
        v.write(1, &data, 0).unwrap();
        assert_eq!(v.file_size(1).unwrap(), 327_680);

        for chunk in 0..5u64 {
            let mut out = vec![0u8; cs];
            assert_eq!(
                v.read(1, &mut out, chunk * cs as u64).unwrap(),
                ReadOutcome::Complete
            );
            assert_eq!(out, data[chunk as usize * cs..(chunk as usize + 1) * cs]);
        }
    }

    #[tokio::test]
    async fn test_restart_persists_flushed_writes() {
        let backend = Arc::new(InMemoryKvBackend::new());
        {
            let mut v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
                .await
                .unwrap();
            v.open("/t.db", 1, rw_create()).unwrap();
            v.write(1, b"SQLite format 3\0", 0).unwrap();
            v.close(1).unwrap();
            v.flush_pending().await;
        }
        let mut v = ChunkStoreVfs::attach(backend, ChunkStoreOptions::default())
            .await
            .unwrap();
        assert!(v.access("/t.db").unwrap());
        v.open("/t.db", 2, OpenFlags::MAIN_DB | OpenFlags::READWRITE)
            .unwrap();
        // Chunk 0 was preloaded at attach, so this read is already warm.
        let mut buf = [0u8; 16];
        assert_eq!(v.read(2, &mut buf, 0).unwrap(), ReadOutcome::Complete);
        assert_eq!(&buf, b"SQLite format 3\0");
    }

    #[tokio::test]
    async fn test_cache_miss_short_reads_then_preload_completes() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let cs;
        {
            let mut v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
                .await
                .unwrap();
            cs = v.layout.block_size as u64;
            v.open("/t.db", 1, rw_create()).unwrap();
            v.write(1, &vec![7u8; cs as usize * 2], 0).unwrap();
            v.flush_pending().await;
        }
        // Fresh attach preloads only chunk 0; chunk 1 misses.
        let mut v = ChunkStoreVfs::attach(backend, ChunkStoreOptions::default())
            .await
            .unwrap();
        v.open("/t.db", 1, OpenFlags::MAIN_DB | OpenFlags::READWRITE)
            .unwrap();
        let mut out = vec![0xffu8; 64];
        assert_eq!(v.read(1, &mut out, cs).unwrap(), ReadOutcome::ShortRead);
        assert!(out.iter().all(|&b| b == 0));

        v.preload("/t.db", 1).await.unwrap();
        assert_eq!(v.read(1, &mut out, cs).unwrap(), ReadOutcome::Complete);
        assert!(out.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn test_read_past_eof_short_reads() {
        let mut v = fresh().await;
        v.open("/t.db", 1, rw_create()).unwrap();
        v.write(1, &[5u8; 10], 0).unwrap();
        let mut out = [0xffu8; 20];
        assert_eq!(v.read(1, &mut out, 0).unwrap(), ReadOutcome::ShortRead);
        assert_eq!(&out[..10], &[5u8; 10]);
        assert_eq!(&out[10..], &[0u8; 10]);

        // Zero-length reads always succeed.
        let mut empty = [0u8; 0];
        assert_eq!(v.read(1, &mut empty, 999).unwrap(), ReadOutcome::Complete);
    }

    #[tokio::test]
    async fn test_truncate_monotonicity() {
        let mut v = fresh().await;
        v.open("/t.db", 1, rw_create()).unwrap();
        let cs = v.layout.block_size as usize;
        let data: Vec<u8> = (0..cs * 2).map(|i| (i % 251) as u8).collect();
        v.write(1, &data, 0).unwrap();

        let cut = cs as u64 + 100;
        v.truncate(1, cut).unwrap();
        assert_eq!(v.file_size(1).unwrap(), cut);

        let mut head = vec![0u8; cut as usize];
        assert_eq!(v.read(1, &mut head, 0).unwrap(), ReadOutcome::Complete);
        assert_eq!(head, data[..cut as usize]);

        // Extending again exposes zeroes, not the old bytes.
        v.truncate(1, cs as u64 * 2).unwrap();
        let mut tail = vec![0xffu8; cs - 100];
        assert_eq!(v.read(1, &mut tail, cut).unwrap(), ReadOutcome::Complete);
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_ephemeral_files_do_not_survive_restart() {
        let backend = Arc::new(InMemoryKvBackend::new());
        {
            let mut v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
                .await
                .unwrap();
            v.open("/keep.db", 1, rw_create()).unwrap();
            v.write(1, &[1u8; 8], 0).unwrap();
            v.open("/tmp.db", 2, OpenFlags::TEMP_DB | OpenFlags::CREATE)
                .unwrap();
            v.write(2, &[2u8; 8], 0).unwrap();
            v.flush_pending().await;
        }
        let v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
            .await
            .unwrap();
        assert!(v.access("/keep.db").unwrap());
        assert!(!v.access("/tmp.db").unwrap());
        // The ephemeral file's keys were swept from the store too.
        assert_eq!(backend.get("file:/tmp.db:meta").await.unwrap(), None);
        assert_eq!(backend.get("file:/tmp.db:0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_on_close_cleans_up() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let mut v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
            .await
            .unwrap();
        v.open(
            "/t.db-journal",
            1,
            OpenFlags::MAIN_JOURNAL | OpenFlags::CREATE | OpenFlags::DELETE_ON_CLOSE,
        )
        .unwrap();
        v.write(1, &[3u8; 100], 0).unwrap();
        v.close(1).unwrap();
        assert!(!v.access("/t.db-journal").unwrap());
        v.flush_pending().await;
        assert_eq!(backend.get("file:/t.db-journal:meta").await.unwrap(), None);
        assert_eq!(backend.get("file:/t.db-journal:0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_active_file_ceiling() {
        let mut v = ChunkStoreVfs::attach(
            Arc::new(InMemoryKvBackend::new()),
            ChunkStoreOptions {
                max_open_files: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        v.open("/a.db", 1, rw_create()).unwrap();
        v.open("/b.db", 2, rw_create()).unwrap();
        let err = v.open("/c.db", 3, rw_create()).unwrap_err();
        assert_eq!(err.status(), StatusCode::CantOpen);

        v.close(1).unwrap();
        v.delete("/a.db", false).unwrap();
        v.open("/c.db", 3, rw_create()).unwrap();
    }

    #[tokio::test]
    async fn test_cross_handle_visibility() {
        let mut v = fresh().await;
        v.open("/t.db", 1, rw_create()).unwrap();
        v.open("/t.db", 2, OpenFlags::MAIN_DB | OpenFlags::READWRITE)
            .unwrap();
        v.write(1, b"shared", 0).unwrap();
        let mut out = [0u8; 6];
        assert_eq!(v.read(2, &mut out, 0).unwrap(), ReadOutcome::Complete);
        assert_eq!(&out, b"shared");
    }

    #[tokio::test]
    async fn test_superseding_writes_latest_wins_durably() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let mut v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
            .await
            .unwrap();
        v.open("/t.db", 1, rw_create()).unwrap();
        for round in 0..20u8 {
            v.write(1, &[round; 32], 0).unwrap();
        }
        v.flush_pending().await;
        let chunk = backend.get("file:/t.db:0").await.unwrap().unwrap();
        assert!(chunk[..32].iter().all(|&b| b == 19));
    }

    #[tokio::test]
    async fn test_truncate_zeroes_uncached_boundary_chunk() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let cs;
        {
            let mut v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
                .await
                .unwrap();
            cs = v.layout.block_size as u64;
            v.open("/t.db", 1, rw_create()).unwrap();
            v.write(1, &vec![0xaau8; cs as usize * 2], 0).unwrap();
            v.flush_pending().await;
        }
        // Fresh attach caches only chunk 0, so the boundary chunk of the
        // truncate below is durable but uncached.
        let mut v = ChunkStoreVfs::attach(backend, ChunkStoreOptions::default())
            .await
            .unwrap();
        v.open("/t.db", 1, OpenFlags::MAIN_DB | OpenFlags::READWRITE)
            .unwrap();
        v.truncate(1, cs + 100).unwrap();
        v.truncate(1, cs * 2).unwrap();
        v.flush_pending().await;

        v.preload("/t.db", 1).await.unwrap();
        let mut out = vec![0xffu8; 8];
        assert_eq!(v.read(1, &mut out, cs + 100).unwrap(), ReadOutcome::Complete);
        assert!(
            out.iter().all(|&b| b == 0),
            "bytes past the truncate point must read zero, got {out:?}"
        );
        // Bytes below the cut survive.
        assert_eq!(v.read(1, &mut out, cs).unwrap(), ReadOutcome::Complete);
        assert!(out.iter().all(|&b| b == 0xaa));
    }

    #[tokio::test]
    async fn test_hole_chunks_read_zero_complete() {
        let mut v = fresh().await;
        v.open("/t.db", 1, rw_create()).unwrap();
        let cs = v.layout.block_size as u64;
        // Chunks 1 and 2 are never written.
        v.write(1, b"head", 0).unwrap();
        v.write(1, b"tail", cs * 3).unwrap();
        assert_eq!(v.file_size(1).unwrap(), cs * 3 + 4);

        let mut out = vec![0xffu8; 64];
        assert_eq!(v.read(1, &mut out, cs + 10).unwrap(), ReadOutcome::Complete);
        assert!(out.iter().all(|&b| b == 0));

        // A span crossing two hole chunks is still complete and zero.
        let mut span = vec![0xffu8; cs as usize];
        assert_eq!(
            v.read(1, &mut span, cs + cs / 2).unwrap(),
            ReadOutcome::Complete
        );
        assert!(span.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_attach_sweeps_orphan_chunks_of_broken_files() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let index = serde_json::to_vec(&vec!["/bad.db"]).unwrap();
        backend.put(INDEX_KEY, Bytes::from(index)).await.unwrap();
        backend
            .put("file:/bad.db:meta", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        backend
            .put("file:/bad.db:0", Bytes::from(vec![1u8; 8]))
            .await
            .unwrap();
        backend
            .put("file:/bad.db:2", Bytes::from(vec![2u8; 8]))
            .await
            .unwrap();

        let v = ChunkStoreVfs::attach(backend.clone(), ChunkStoreOptions::default())
            .await
            .unwrap();
        assert!(!v.access("/bad.db").unwrap());
        assert_eq!(backend.get("file:/bad.db:meta").await.unwrap(), None);
        assert_eq!(backend.get("file:/bad.db:0").await.unwrap(), None);
        assert_eq!(backend.get("file:/bad.db:2").await.unwrap(), None);
    }
}
