//! Per-path write-behind scheduler.
//!
//! Every mutation returns synchronously after updating the in-memory caches;
//! durability happens here, in background tasks. Invariants:
//! - at most one in-flight task per path, so two puts for one path never
//!   overlap on the backing store;
//! - at most one queued op per path, into which newer ops merge — the queued
//!   snapshot is always the latest in-memory state, so the last write wins;
//! - a background failure is logged and dropped, never surfaced to the
//!   synchronous caller (the documented durability gap of this design).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::warn;

use crate::backend::kv::KvBackend;

use super::{chunk_key, meta_key, FileMeta, INDEX_KEY};

/// One scheduled durability operation for a path.
#[derive(Debug, Clone)]
pub enum PersistOp {
    /// Write the metadata record plus the given chunks; remove the listed
    /// chunk keys (truncate tails). `zero_tail` is a deferred boundary
    /// rewrite for a chunk that was durable but not cached at truncate
    /// time: the background task fetches it and zeroes everything from the
    /// given byte offset.
    Upsert {
        meta: FileMeta,
        chunks: HashMap<u64, Bytes>,
        delete_chunks: Vec<u64>,
        zero_tail: Option<(u64, usize)>,
    },
    /// Remove the metadata record and all `chunk_count` chunk keys.
    Remove { chunk_count: u64 },
    /// Rewrite the active-file index.
    Index { paths: Vec<String> },
}

/// Fold `newer` into an already-queued op for the same path.
fn merge(older: PersistOp, newer: PersistOp) -> PersistOp {
    match (older, newer) {
        (
            PersistOp::Upsert {
                chunks: mut merged,
                delete_chunks: old_del,
                zero_tail: old_zero,
                ..
            },
            PersistOp::Upsert {
                meta,
                chunks,
                delete_chunks,
                zero_tail,
            },
        ) => {
            // A pending deferred zero is obsolete once the newer op rewrites
            // or deletes that chunk outright.
            let old_zero = old_zero.filter(|(id, _)| {
                !chunks.contains_key(id) && !delete_chunks.contains(id)
            });
            merged.extend(chunks);
            for id in &delete_chunks {
                merged.remove(id);
            }
            let mut del: Vec<u64> = old_del
                .into_iter()
                .chain(delete_chunks)
                .filter(|id| !merged.contains_key(id))
                .collect();
            del.sort_unstable();
            del.dedup();
            PersistOp::Upsert {
                meta,
                chunks: merged,
                delete_chunks: del,
                zero_tail: zero_tail.or(old_zero),
            }
        }
        (
            PersistOp::Remove { chunk_count },
            PersistOp::Upsert {
                meta,
                chunks,
                mut delete_chunks,
                zero_tail,
            },
        ) => {
            // Recreated before the removal ran: still sweep the old chunks
            // the new file does not rewrite.
            delete_chunks.extend((0..chunk_count).filter(|id| !chunks.contains_key(id)));
            delete_chunks.sort_unstable();
            delete_chunks.dedup();
            PersistOp::Upsert {
                meta,
                chunks,
                delete_chunks,
                zero_tail,
            }
        }
        // A removal supersedes anything queued; index rewrites replace each
        // other wholesale.
        (_, newer) => newer,
    }
}

struct PathState {
    queued: Option<PersistOp>,
}

pub struct WriteScheduler<B: KvBackend> {
    backend: Arc<B>,
    // A key is present iff a task for that path is in flight.
    state: Arc<Mutex<HashMap<String, PathState>>>,
    drained: Arc<Notify>,
}

impl<B: KvBackend> Clone for WriteScheduler<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            state: self.state.clone(),
            drained: self.drained.clone(),
        }
    }
}

async fn perform<B: KvBackend>(backend: &B, path: &str, op: PersistOp) {
    let outcome = async {
        match op {
            PersistOp::Upsert {
                meta,
                chunks,
                delete_chunks,
                zero_tail,
            } => {
                let encoded = serde_json::to_vec(&meta)
                    .map_err(|e| crate::backend::kv::KvError(e.to_string()))?;
                backend.put(&meta_key(path), Bytes::from(encoded)).await?;
                for (id, data) in chunks {
                    backend.put(&chunk_key(path, id), data).await?;
                }
                for id in delete_chunks {
                    backend.delete(&chunk_key(path, id)).await?;
                }
                if let Some((id, keep)) = zero_tail {
                    if let Some(existing) = backend.get(&chunk_key(path, id)).await? {
                        if keep < existing.len() {
                            let mut block = existing.to_vec();
                            block[keep..].fill(0);
                            backend.put(&chunk_key(path, id), Bytes::from(block)).await?;
                        }
                    }
                }
                Ok(())
            }
            PersistOp::Remove { chunk_count } => {
                backend.delete(&meta_key(path)).await?;
                for id in 0..chunk_count {
                    backend.delete(&chunk_key(path, id)).await?;
                }
                Ok(())
            }
            PersistOp::Index { paths } => {
                let encoded = serde_json::to_vec(&paths)
                    .map_err(|e| crate::backend::kv::KvError(e.to_string()))?;
                backend.put(INDEX_KEY, Bytes::from(encoded)).await
            }
        }
    }
    .await;
    if let Err(e) = outcome {
        warn!(%path, error = %e, "write-behind persistence failed, data remains in memory only");
    }
}

impl<B: KvBackend> WriteScheduler<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(HashMap::new())),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Queue a durability op for `path`. Supersedes (merges into) any op
    /// already queued for the same path. Never blocks on the backing store.
    pub fn schedule(&self, path: &str, op: PersistOp) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        if let Some(ps) = state.get_mut(path) {
            ps.queued = Some(match ps.queued.take() {
                Some(older) => merge(older, op),
                None => op,
            });
            return;
        }
        state.insert(path.to_string(), PathState { queued: None });
        drop(state);

        let backend = self.backend.clone();
        let state = self.state.clone();
        let drained = self.drained.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let mut op = op;
            loop {
                perform(&*backend, &path, op).await;
                let next = {
                    let mut st = state.lock().expect("scheduler state poisoned");
                    match st.get_mut(&path).and_then(|ps| ps.queued.take()) {
                        Some(next) => Some(next),
                        None => {
                            st.remove(&path);
                            None
                        }
                    }
                };
                match next {
                    Some(next) => op = next,
                    None => break,
                }
            }
            drained.notify_waiters();
        });
    }

    /// Wait until every scheduled op has been pushed to the backing store.
    /// The explicit durability checkpoint for callers that need more than
    /// write-behind semantics.
    pub async fn flush_pending(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register with `notify_waiters` before checking emptiness, or a
            // task draining between the check and the await is never seen.
            notified.as_mut().enable();
            if self
                .state
                .lock()
                .expect("scheduler state poisoned")
                .is_empty()
            {
                return;
            }
            notified.await;
        }
    }

    /// Number of paths with unfinished durability work; test observability.
    pub fn pending_paths(&self) -> usize {
        self.state.lock().expect("scheduler state poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kv::InMemoryKvBackend;
    use crate::vfs::OpenFlags;

    fn meta(size: u64) -> FileMeta {
        FileMeta {
            size,
            flags: OpenFlags::MAIN_DB.bits(),
            chunk_count: size.div_ceil(64 * 1024),
            created: 0,
            present_chunks: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_flush_is_durable() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let sched = WriteScheduler::new(backend.clone());
        let mut chunks = HashMap::new();
        chunks.insert(0u64, Bytes::from_static(b"chunk0"));
        sched.schedule(
            "/t.db",
            PersistOp::Upsert {
                meta: meta(6),
                chunks,
                delete_chunks: vec![],
                zero_tail: None,
            },
        );
        sched.flush_pending().await;
        assert_eq!(
            backend.get("file:/t.db:0").await.unwrap(),
            Some(Bytes::from_static(b"chunk0"))
        );
        assert!(backend.get("file:/t.db:meta").await.unwrap().is_some());
        assert_eq!(sched.pending_paths(), 0);
    }

    #[tokio::test]
    async fn test_superseding_write_wins() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let sched = WriteScheduler::new(backend.clone());
        for round in 0..10u8 {
            let mut chunks = HashMap::new();
            chunks.insert(0u64, Bytes::from(vec![round; 8]));
            sched.schedule(
                "/t.db",
                PersistOp::Upsert {
                    meta: meta(8),
                    chunks,
                    delete_chunks: vec![],
                    zero_tail: None,
                },
            );
        }
        sched.flush_pending().await;
        assert_eq!(
            backend.get("file:/t.db:0").await.unwrap(),
            Some(Bytes::from(vec![9u8; 8]))
        );
    }

    #[tokio::test]
    async fn test_remove_supersedes_upsert() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let sched = WriteScheduler::new(backend.clone());
        let mut chunks = HashMap::new();
        chunks.insert(0u64, Bytes::from_static(b"data"));
        sched.schedule(
            "/t.db",
            PersistOp::Upsert {
                meta: meta(4),
                chunks,
                delete_chunks: vec![],
                zero_tail: None,
            },
        );
        sched.schedule("/t.db", PersistOp::Remove { chunk_count: 1 });
        sched.flush_pending().await;
        assert_eq!(backend.get("file:/t.db:meta").await.unwrap(), None);
        assert_eq!(backend.get("file:/t.db:0").await.unwrap(), None);
    }

    #[test]
    fn test_merge_write_after_truncate_undeletes_chunk() {
        let older = PersistOp::Upsert {
            meta: meta(0),
            chunks: HashMap::new(),
            delete_chunks: vec![3, 4],
            zero_tail: None,
        };
        let mut chunks = HashMap::new();
        chunks.insert(3u64, Bytes::from_static(b"rewritten"));
        let merged = merge(
            older,
            PersistOp::Upsert {
                meta: meta(4 * 64 * 1024),
                chunks,
                delete_chunks: vec![],
                zero_tail: None,
            },
        );
        let PersistOp::Upsert {
            chunks,
            delete_chunks,
            ..
        } = merged
        else {
            panic!("expected upsert");
        };
        assert!(chunks.contains_key(&3));
        assert_eq!(delete_chunks, vec![4]);
    }

    #[test]
    fn test_merge_upsert_after_remove_sweeps_stale_chunks() {
        let older = PersistOp::Remove { chunk_count: 3 };
        let mut chunks = HashMap::new();
        chunks.insert(0u64, Bytes::from_static(b"new"));
        let merged = merge(
            older,
            PersistOp::Upsert {
                meta: meta(3),
                chunks,
                delete_chunks: vec![],
                zero_tail: None,
            },
        );
        let PersistOp::Upsert { delete_chunks, .. } = merged else {
            panic!("expected upsert");
        };
        assert_eq!(delete_chunks, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_zero_tail_rewrites_durable_chunk() {
        let backend = Arc::new(InMemoryKvBackend::new());
        backend
            .put("file:/t.db:1", Bytes::from(vec![0xaa; 16]))
            .await
            .unwrap();
        let sched = WriteScheduler::new(backend.clone());
        sched.schedule(
            "/t.db",
            PersistOp::Upsert {
                meta: meta(64 * 1024 + 4),
                chunks: HashMap::new(),
                delete_chunks: vec![],
                zero_tail: Some((1, 4)),
            },
        );
        sched.flush_pending().await;
        let chunk = backend.get("file:/t.db:1").await.unwrap().unwrap();
        assert!(chunk[..4].iter().all(|&b| b == 0xaa));
        assert!(chunk[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_merge_drops_zero_tail_once_chunk_is_rewritten() {
        let older = PersistOp::Upsert {
            meta: meta(0),
            chunks: HashMap::new(),
            delete_chunks: vec![],
            zero_tail: Some((1, 100)),
        };
        let mut chunks = HashMap::new();
        chunks.insert(1u64, Bytes::from_static(b"fresh"));
        let merged = merge(
            older,
            PersistOp::Upsert {
                meta: meta(5),
                chunks,
                delete_chunks: vec![],
                zero_tail: None,
            },
        );
        let PersistOp::Upsert { zero_tail, .. } = merged else {
            panic!("expected upsert");
        };
        assert_eq!(zero_tail, None);
    }

    // Exercises the wakeup path where a task drains between the emptiness
    // check and the await; would hang without waiter pre-registration.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_pending_on_multi_thread_runtime() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let sched = WriteScheduler::new(backend.clone());
        for round in 0..200u32 {
            let mut chunks = HashMap::new();
            chunks.insert(0u64, Bytes::from(round.to_be_bytes().to_vec()));
            sched.schedule(
                &format!("/f{}.db", round % 4),
                PersistOp::Upsert {
                    meta: meta(4),
                    chunks,
                    delete_chunks: vec![],
                    zero_tail: None,
                },
            );
            if round % 16 == 0 {
                sched.flush_pending().await;
            }
        }
        sched.flush_pending().await;
        assert_eq!(sched.pending_paths(), 0);
        assert!(backend.get("file:/f3.db:0").await.unwrap().is_some());
    }
}
