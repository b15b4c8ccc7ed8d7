// quarry-core/src/cursor.rs
//! Server-side cursors.
//!
//! `find` and `aggregate` return their first batch directly; whatever is
//! left is parked here under a cursor id until `getMore` drains it or
//! `killCursors` (or the idle timeout) removes it. A parked cursor keeps its
//! read snapshot registered, so the versions it still needs survive GC.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::interrupt::OperationContext;
use crate::metrics::Metrics;
use crate::pipeline::PipelineExecutor;
use crate::query::PlanExecutor;
use crate::{log_debug, log_trace};

pub type CursorId = i64;

/// What a cursor reads from.
pub enum CursorSource {
    Find(PlanExecutor),
    Aggregate(PipelineExecutor),
}

impl CursorSource {
    fn next(&mut self, shared: &EngineShared, op: &OperationContext) -> Result<Option<Document>> {
        match self {
            CursorSource::Find(executor) => executor.next_document(shared, op),
            CursorSource::Aggregate(executor) => executor.next(shared, op),
        }
    }

    fn is_eof(&self) -> bool {
        match self {
            CursorSource::Find(executor) => executor.is_eof(),
            CursorSource::Aggregate(executor) => executor.is_eof(),
        }
    }

    fn is_tailable(&self) -> bool {
        match self {
            CursorSource::Find(_) => false,
            CursorSource::Aggregate(executor) => executor.is_tailable(),
        }
    }
}

/// One batch pulled from a cursor.
#[derive(Debug, Default)]
pub struct Batch {
    pub documents: Vec<Document>,
    /// No more results will ever come; the cursor can be closed.
    pub exhausted: bool,
}

pub struct ClientCursor {
    ns: String,
    source: CursorSource,
    /// A document that did not fit the previous batch.
    stash: Option<Document>,
    /// Session the cursor was opened in, if any.
    session: Option<String>,
    last_used: Instant,
    returned: u64,
}

impl ClientCursor {
    pub fn new(ns: impl Into<String>, source: CursorSource, session: Option<String>) -> Self {
        ClientCursor {
            ns: ns.into(),
            source,
            stash: None,
            session,
            last_used: Instant::now(),
            returned: 0,
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn returned(&self) -> u64 {
        self.returned
    }

    /// Pull up to `batch_size` documents (unbounded when `None`), stopping
    /// early once the batch reaches `maxBatchBytes`. A single document over
    /// `maxDocumentBytes` fails the batch.
    pub fn next_batch(
        &mut self,
        shared: &EngineShared,
        op: &OperationContext,
        batch_size: Option<usize>,
    ) -> Result<Batch> {
        self.last_used = Instant::now();
        let max_document = shared.params.max_document_bytes() as usize;
        let max_batch = shared.params.max_batch_bytes() as usize;
        let mut documents = Vec::new();
        let mut bytes = 0usize;
        loop {
            if batch_size.map_or(false, |limit| documents.len() >= limit) {
                break;
            }
            let doc = match self.stash.take() {
                Some(doc) => doc,
                None => match self.source.next(shared, op)? {
                    Some(doc) => doc,
                    None => break,
                },
            };
            let size = doc.bson_size();
            if size > max_document {
                return Err(QuarryError::BsonObjectTooLarge {
                    size,
                    limit: max_document,
                });
            }
            if !documents.is_empty() && bytes + size > max_batch {
                self.stash = Some(doc);
                break;
            }
            bytes += size;
            documents.push(doc);
        }
        self.returned += documents.len() as u64;
        shared.metrics.documents_returned.add(documents.len() as u64);
        let exhausted = self.stash.is_none() && self.source.is_eof() && !self.source.is_tailable();
        Ok(Batch { documents, exhausted })
    }
}

/// Open cursors by id.
pub struct CursorManager {
    cursors: DashMap<CursorId, Arc<Mutex<ClientCursor>>>,
    next_id: AtomicI64,
    metrics: Arc<Metrics>,
}

impl CursorManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        // Random start so ids from a previous process are not reused.
        let start = rand::thread_rng().gen_range(1..i64::MAX / 2);
        CursorManager {
            cursors: DashMap::new(),
            next_id: AtomicI64::new(start),
            metrics,
        }
    }

    /// Park `cursor` and return its id.
    pub fn register(&self, cursor: ClientCursor) -> CursorId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log_trace!("cursor {} opened on {}", id, cursor.ns);
        self.cursors.insert(id, Arc::new(Mutex::new(cursor)));
        self.metrics.cursors_opened.incr();
        id
    }

    pub fn get(&self, id: CursorId) -> Result<Arc<Mutex<ClientCursor>>> {
        self.cursors
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QuarryError::new(ErrorCode::CursorNotFound, format!("cursor id {} not found", id)))
    }

    pub fn remove(&self, id: CursorId) -> bool {
        self.cursors.remove(&id).is_some()
    }

    /// Kill `ids`, returning `(killed, not_found)`.
    pub fn kill(&self, ids: &[CursorId]) -> (Vec<CursorId>, Vec<CursorId>) {
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            if self.remove(*id) {
                killed.push(*id);
            } else {
                not_found.push(*id);
            }
        }
        (killed, not_found)
    }

    /// Close every cursor opened in `session`.
    pub fn kill_session(&self, session: &str) -> usize {
        let before = self.cursors.len();
        self.cursors
            .retain(|_, cursor| cursor.try_lock().map_or(true, |c| c.session() != Some(session)));
        before - self.cursors.len()
    }

    /// Drop cursors idle for longer than `timeout`. Cursors currently in use
    /// are skipped.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let before = self.cursors.len();
        self.cursors.retain(|_, cursor| match cursor.try_lock() {
            Some(c) => now.duration_since(c.last_used) < timeout,
            None => true,
        });
        let reaped = before - self.cursors.len();
        if reaped > 0 {
            self.metrics.cursors_timed_out.add(reaped as u64);
            log_debug!("timed out {} idle cursors", reaped);
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::Engine;
    use crate::query::{plan_find, FindQuery};

    fn seeded(n: i32) -> Engine {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        crate::ddl::ensure_collection(shared, "test.c", &op).unwrap();
        with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, "test.c")?;
            for i in 0..n {
                writer.insert(doc!({"_id": i, "pad": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}))?;
            }
            Ok(())
        })
        .unwrap();
        engine
    }

    fn cursor(shared: &EngineShared) -> ClientCursor {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let mut executor = plan_find(shared, shared.catalog.get("test.c"), &FindQuery::default(), txn.view(), &op).unwrap();
        executor.attach_snapshot(txn);
        ClientCursor::new("test.c", CursorSource::Find(executor), None)
    }

    #[test]
    fn test_batches_respect_batch_size() {
        let engine = seeded(5);
        let shared = engine.shared();
        let op = OperationContext::new();
        let mut c = cursor(shared);
        let first = c.next_batch(shared, &op, Some(2)).unwrap();
        assert_eq!(first.documents.len(), 2);
        assert!(!first.exhausted);
        let rest = c.next_batch(shared, &op, None).unwrap();
        assert_eq!(rest.documents.len(), 3);
        assert!(rest.exhausted);
        assert_eq!(c.returned(), 5);
    }

    #[test]
    fn test_batches_respect_byte_limit() {
        let engine = seeded(10);
        let shared = engine.shared();
        shared.params.set("maxBatchBytes", &serde_json::json!(150)).unwrap();
        let op = OperationContext::new();
        let mut c = cursor(shared);
        let batch = c.next_batch(shared, &op, None).unwrap();
        assert!(!batch.documents.is_empty());
        assert!(batch.documents.len() < 10);
        let mut total = batch.documents.len();
        loop {
            let batch = c.next_batch(shared, &op, None).unwrap();
            total += batch.documents.len();
            if batch.exhausted {
                break;
            }
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn test_oversized_document_fails() {
        let engine = seeded(1);
        let shared = engine.shared();
        shared.params.set("maxDocumentBytes", &serde_json::json!(16)).unwrap();
        let op = OperationContext::new();
        let err = cursor(shared).next_batch(shared, &op, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BsonObjectTooLarge);
    }

    #[test]
    fn test_kill_and_reap() {
        let engine = seeded(3);
        let shared = engine.shared();
        let manager = CursorManager::new(shared.metrics.clone());
        let a = manager.register(cursor(shared));
        let b = manager.register(cursor(shared));
        let (killed, missing) = manager.kill(&[a, 42]);
        assert_eq!(killed, vec![a]);
        assert_eq!(missing, vec![42]);
        assert_eq!(manager.get(a).err().map(|e| e.code()), Some(ErrorCode::CursorNotFound));
        assert!(manager.get(b).is_ok());
        assert_eq!(manager.reap_idle(Duration::ZERO), 1);
        assert!(manager.is_empty());
        assert_eq!(shared.metrics.cursors_timed_out.get(), 1);
    }
}
