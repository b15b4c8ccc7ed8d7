// quarry-core/src/pipeline/change_stream.rs
//! `$changeStream`: change events read from the oplog.
//!
//! The stream only reads entries at or below the all-committed timestamp, so
//! it never reports a write that could still be followed by an earlier one.
//! Positions are `(ts, seq)` pairs; the event `_id` is that pair and can be
//! handed back as `resumeAfter`.

use std::collections::VecDeque;

use crate::collection::find_by_id;
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::oplog::{OpKind, OplogEntry};
use crate::txn::{ReadView, Timestamp};
use crate::value::Value;
use crate::log_trace;

use super::{stage_doc, DocumentSource, PipelineContext};

/// Oplog entries fetched per refill.
const FETCH_BATCH: usize = 256;

/// Prefix of collections `$out` writes through.
const TEMP_OUT_PREFIX: &str = "tmp.agg_out.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullDocument {
    Default,
    UpdateLookup,
}

#[derive(Debug, Clone)]
pub struct ChangeStreamSpec {
    /// Resume strictly after this position.
    pub resume_after: Option<(Timestamp, u32)>,
    pub full_document: FullDocument,
    spec: Document,
}

fn resume_token(value: &Value) -> Result<(Timestamp, u32)> {
    let doc = value
        .as_document()
        .ok_or_else(|| QuarryError::TypeMismatch("resume token must be an object".into()))?;
    let ts = doc.get("ts").and_then(Value::as_i64);
    let seq = doc.get("seq").and_then(Value::as_i64);
    match (ts, seq) {
        (Some(ts), Some(seq)) if ts >= 0 && (0..=u32::MAX as i64).contains(&seq) => Ok((ts as Timestamp, seq as u32)),
        _ => Err(QuarryError::BadValue(format!("malformed resume token {}", value))),
    }
}

impl ChangeStreamSpec {
    pub fn parse(spec: &Document) -> Result<Self> {
        let mut resume_after = None;
        let mut full_document = FullDocument::Default;
        for (key, value) in spec.iter() {
            match key.as_str() {
                "resumeAfter" | "startAfter" => {
                    if resume_after.is_some() {
                        return Err(QuarryError::BadValue(
                            "only one of resumeAfter, startAfter and startAtOperationTime may be given".into(),
                        ));
                    }
                    resume_after = Some(resume_token(value)?);
                }
                "startAtOperationTime" => {
                    if resume_after.is_some() {
                        return Err(QuarryError::BadValue(
                            "only one of resumeAfter, startAfter and startAtOperationTime may be given".into(),
                        ));
                    }
                    let ts = match value {
                        Value::Document(doc) => doc.get("ts").and_then(Value::as_i64),
                        other => other.as_i64(),
                    }
                    .filter(|ts| *ts >= 0)
                    .ok_or_else(|| QuarryError::TypeMismatch("startAtOperationTime must be a timestamp".into()))?;
                    // Inclusive start: resume after the last entry of ts - 1.
                    resume_after = Some(((ts as Timestamp).saturating_sub(1), u32::MAX));
                }
                "fullDocument" => {
                    full_document = match value.as_str() {
                        Some("default") => FullDocument::Default,
                        Some("updateLookup") => FullDocument::UpdateLookup,
                        _ => {
                            return Err(QuarryError::BadValue(format!(
                                "unsupported fullDocument option {}",
                                value
                            )))
                        }
                    }
                }
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unrecognized $changeStream option '{}'", other),
                    ))
                }
            }
        }
        Ok(ChangeStreamSpec {
            resume_after,
            full_document,
            spec: spec.clone(),
        })
    }
}

/// What the stream watches.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Collection { db: String, coll: String },
    Database { db: String },
}

impl Scope {
    fn db(&self) -> &str {
        match self {
            Scope::Collection { db, .. } | Scope::Database { db } => db,
        }
    }
}

fn split_ns(ns: &str) -> (&str, &str) {
    ns.split_once('.').unwrap_or((ns, ""))
}

fn ns_document(ns: &str) -> Document {
    let (db, coll) = split_ns(ns);
    let mut doc = Document::new();
    doc.insert("db", db);
    doc.insert("coll", coll);
    doc
}

pub struct ChangeStreamSource {
    scope: Scope,
    spec: ChangeStreamSpec,
    position: Option<(Timestamp, u32)>,
    pending: VecDeque<Document>,
    invalidated: bool,
}

impl ChangeStreamSource {
    /// Open a stream over `scope`, either `db.coll` or a bare database name.
    pub fn new(shared: &EngineShared, scope: &str, spec: ChangeStreamSpec) -> Result<Self> {
        let scope = match scope.split_once('.') {
            Some((db, coll)) => Scope::Collection {
                db: db.to_string(),
                coll: coll.to_string(),
            },
            None => Scope::Database { db: scope.to_string() },
        };
        let position = match spec.resume_after {
            Some(position) => position,
            None => (shared.coordinator.all_committed(), u32::MAX),
        };
        Ok(ChangeStreamSource {
            scope,
            spec,
            position: Some(position),
            pending: VecDeque::new(),
            invalidated: false,
        })
    }

    fn event_base(entry: &OplogEntry, operation: &str) -> Document {
        let mut id = Document::new();
        id.insert("ts", Value::Int64(entry.ts as i64));
        id.insert("seq", Value::Int32(entry.seq as i32));
        let mut event = Document::new();
        event.insert("_id", id);
        event.insert("operationType", operation);
        event.insert("clusterTime", Value::Int64(entry.ts as i64));
        event.insert("wallTime", Value::Date(entry.wall));
        if let Some(txn) = entry.txn_id {
            event.insert("txnNumber", Value::Int64(txn as i64));
        }
        event
    }

    fn watches_data(&self, ns: &str) -> bool {
        let (db, coll) = split_ns(ns);
        match &self.scope {
            Scope::Collection { db: d, coll: c } => db == d && coll == c,
            Scope::Database { db: d } => db == d && coll != "$cmd" && !coll.starts_with(TEMP_OUT_PREFIX),
        }
    }

    /// Events produced by one oplog entry.
    fn events_for(&mut self, shared: &EngineShared, entry: &OplogEntry) -> Result<Vec<Document>> {
        let mut events = Vec::new();
        match entry.op {
            OpKind::Insert if self.watches_data(&entry.ns) => {
                let mut event = Self::event_base(entry, "insert");
                event.insert("ns", ns_document(&entry.ns));
                let mut key = Document::new();
                if let Some(id) = entry.o.id() {
                    key.insert("_id", id.clone());
                }
                event.insert("documentKey", key);
                event.insert("fullDocument", entry.o.clone());
                events.push(event);
            }
            OpKind::Update if self.watches_data(&entry.ns) => {
                let mut event = Self::event_base(entry, "update");
                event.insert("ns", ns_document(&entry.ns));
                let key = entry.o2.clone().unwrap_or_default();
                if self.spec.full_document == FullDocument::UpdateLookup {
                    let current = match (shared.catalog.get(&entry.ns), key.id()) {
                        (Some(coll), Some(id)) => {
                            let view = ReadView {
                                read_ts: shared.coordinator.all_committed(),
                                reader: None,
                            };
                            find_by_id(&coll, id, &view)?.map(|(_, doc)| Value::Document((*doc).clone()))
                        }
                        _ => None,
                    };
                    event.insert("fullDocument", current.unwrap_or(Value::Null));
                }
                event.insert("documentKey", key);
                events.push(event);
            }
            OpKind::Delete if self.watches_data(&entry.ns) => {
                let mut event = Self::event_base(entry, "delete");
                event.insert("ns", ns_document(&entry.ns));
                event.insert("documentKey", entry.o.clone());
                events.push(event);
            }
            OpKind::Command if split_ns(&entry.ns).0 == self.scope.db() => {
                let db = self.scope.db().to_string();
                if let Some(dropped) = entry.o.get("drop").and_then(Value::as_str) {
                    let ns = format!("{}.{}", db, dropped);
                    let watched = match &self.scope {
                        Scope::Collection { coll, .. } => coll == dropped,
                        Scope::Database { .. } => !dropped.starts_with(TEMP_OUT_PREFIX),
                    };
                    if watched {
                        let mut event = Self::event_base(entry, "drop");
                        event.insert("ns", ns_document(&ns));
                        events.push(event);
                        self.invalidate_collection(entry, &mut events);
                    }
                } else if let Some(from) = entry.o.get("renameCollection").and_then(Value::as_str) {
                    let to = entry.o.get("to").and_then(Value::as_str).unwrap_or_default();
                    let watched = match &self.scope {
                        Scope::Collection { .. } => self.watches_data(from),
                        Scope::Database { .. } => !split_ns(from).1.starts_with(TEMP_OUT_PREFIX),
                    };
                    if watched {
                        let mut event = Self::event_base(entry, "rename");
                        event.insert("ns", ns_document(from));
                        event.insert("to", ns_document(to));
                        events.push(event);
                        self.invalidate_collection(entry, &mut events);
                    }
                }
            }
            _ => {}
        }
        Ok(events)
    }

    /// A collection stream ends after its collection goes away.
    fn invalidate_collection(&mut self, entry: &OplogEntry, events: &mut Vec<Document>) {
        if let Scope::Collection { .. } = self.scope {
            events.push(Self::event_base(entry, "invalidate"));
            self.invalidated = true;
        }
    }

    fn refill(&mut self, shared: &EngineShared) -> Result<()> {
        let up_to = shared.coordinator.all_committed();
        let entries = shared
            .coordinator
            .oplog()
            .entries_between(self.position, up_to, None, FETCH_BATCH);
        for entry in &entries {
            self.position = Some((entry.ts, entry.seq));
            let events = self.events_for(shared, entry)?;
            self.pending.extend(events);
            if self.invalidated {
                break;
            }
        }
        if !entries.is_empty() {
            log_trace!("change stream read {} oplog entries up to {}", entries.len(), up_to);
        }
        Ok(())
    }
}

impl DocumentSource for ChangeStreamSource {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.invalidated {
                return Ok(None);
            }
            let before = self.position;
            self.refill(ctx.shared)?;
            if self.pending.is_empty() && self.position == before {
                return Ok(None);
            }
            ctx.op.check_for_interrupt()?;
        }
    }

    fn name(&self) -> &'static str {
        "$changeStream"
    }

    fn explain(&self) -> Document {
        stage_doc("$changeStream", self.spec.spec.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::Engine;
    use crate::interrupt::OperationContext;
    use crate::pipeline::{AggregateRequest, PipelineExecutor};

    fn insert(shared: &EngineShared, ns: &str, doc: Document) {
        let op = OperationContext::new();
        crate::ddl::ensure_collection(shared, ns, &op).unwrap();
        with_write_retry(shared, &op, |txn| {
            CollectionWriter::open(shared, txn, &op, ns)?.insert(doc.clone())?;
            Ok(())
        })
        .unwrap();
    }

    fn open(shared: &EngineShared, ns: &str, stage: serde_json::Value) -> PipelineExecutor {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let request = AggregateRequest {
            ns: ns.to_string(),
            pipeline: vec![Value::Document(stage_doc("$changeStream", Value::from_json(&stage).unwrap()))],
            ..AggregateRequest::default()
        };
        PipelineExecutor::prepare(shared, &request, txn.view(), &op).unwrap()
    }

    fn drain(shared: &EngineShared, stream: &mut PipelineExecutor) -> Vec<Document> {
        let op = OperationContext::new();
        let mut out = Vec::new();
        while let Some(event) = stream.next(shared, &op).unwrap() {
            out.push(event);
        }
        out
    }

    fn types(events: &[Document]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.get("operationType").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn test_stream_starts_now_and_tails() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        insert(shared, "test.c", doc!({"_id": 1}));
        let mut stream = open(shared, "test.c", serde_json::json!({}));
        assert!(stream.is_tailable());
        assert!(drain(shared, &mut stream).is_empty());

        insert(shared, "test.c", doc!({"_id": 2}));
        insert(shared, "test.other", doc!({"_id": 3}));
        let events = drain(shared, &mut stream);
        assert_eq!(types(&events), vec!["insert"]);
        assert_eq!(events[0].get("fullDocument"), Some(&Value::Document(doc!({"_id": 2}))));
        assert!(!stream.is_eof());
    }

    #[test]
    fn test_resume_after_token() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let mut stream = open(shared, "test.c", serde_json::json!({}));
        insert(shared, "test.c", doc!({"_id": 1}));
        insert(shared, "test.c", doc!({"_id": 2}));
        let events = drain(shared, &mut stream);
        assert_eq!(events.len(), 2);
        let token = events[0].get("_id").cloned().unwrap();

        let mut resumed = open(shared, "test.c", serde_json::json!({ "resumeAfter": token.to_json() }));
        let events = drain(shared, &mut resumed);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get_path("documentKey._id").and_then(Value::as_i64), Some(2));
    }

    #[test]
    fn test_drop_invalidates_collection_stream() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        insert(shared, "test.c", doc!({"_id": 1}));
        let mut coll_stream = open(shared, "test.c", serde_json::json!({}));
        let mut db_stream = open(shared, "test.$cmd.aggregate", serde_json::json!({}));
        insert(shared, "test.d", doc!({"_id": 5}));
        crate::ddl::drop_collection(shared, "test.c", &OperationContext::new()).unwrap();

        assert_eq!(types(&drain(shared, &mut coll_stream)), vec!["drop", "invalidate"]);
        assert_eq!(types(&drain(shared, &mut db_stream)), vec!["insert", "drop"]);
    }

    #[test]
    fn test_rejects_bad_options() {
        assert!(ChangeStreamSpec::parse(&doc!({"fullDocument": "required"})).is_err());
        let err = ChangeStreamSpec::parse(&doc!({"bogus": 1})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownField);
        assert!(ChangeStreamSpec::parse(&doc!({"resumeAfter": {"ts": 1}})).is_err());
    }
}
