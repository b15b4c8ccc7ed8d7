// quarry-core/src/command.rs
//! Command documents in, reply documents out.
//!
//! The command name is the first field of the document; `$db` picks the
//! database (default `test`). Every command declares the fields it accepts,
//! and anything else fails with `UnknownField`.
//!
//! Multi-document transactions live in sessions keyed by `lsid`:
//!
//! ```text
//! {insert: "c", ..., lsid, txnNumber: 1, startTransaction: true, autocommit: false}
//! {find: "c",   ..., lsid, txnNumber: 1, autocommit: false}
//! {commitTransaction: 1, lsid, txnNumber: 1, autocommit: false}
//! ```
//!
//! Without `autocommit: false` every write runs in its own transaction and is
//! retried on write conflicts.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use crate::collation::Collation;
use crate::collection::{in_transaction, with_write_retry, CollectionWriter};
use crate::cursor::{ClientCursor, CursorId, CursorSource};
use crate::ddl;
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::interrupt::OperationContext;
use crate::pipeline::{AggregateRequest, PipelineExecutor, COLLECTIONLESS};
use crate::query::{distinct, plan_find, FindQuery, Matcher, UpdateSpec};
use crate::storage::RecordId;
use crate::txn::{ReadView, Transaction, TxnState};
use crate::value::Value;
use crate::{log_debug, log_info};

const DEFAULT_DB: &str = "test";

/// Fields every command accepts.
const GENERIC_FIELDS: &[&str] = &[
    "$db",
    "lsid",
    "txnNumber",
    "startTransaction",
    "autocommit",
    "maxTimeMS",
    "comment",
    "readConcern",
    "writeConcern",
];

// ========== SESSIONS ==========

#[derive(Default)]
struct Session {
    txn_number: Option<i64>,
    txn: Option<Transaction>,
    /// The transaction numbered `txn_number` committed.
    committed: bool,
}

impl Session {
    /// Start transaction `number`, or continue it when `start` is false.
    fn begin_or_continue(&mut self, shared: &EngineShared, number: i64, start: bool) -> Result<&Transaction> {
        if start {
            match self.txn_number {
                Some(current) if number < current => {
                    return Err(QuarryError::new(
                        ErrorCode::NoSuchTransaction,
                        format!("txnNumber {} is older than the session's {}", number, current),
                    ))
                }
                Some(current) if number == current => {
                    return Err(QuarryError::new(
                        ErrorCode::ConflictingOperationInProgress,
                        format!("transaction {} has already been started", number),
                    ))
                }
                _ => {}
            }
            if let Some(previous) = self.txn.take() {
                match previous.state() {
                    TxnState::Prepared => {
                        self.txn = Some(previous);
                        return Err(QuarryError::new(
                            ErrorCode::PreparedTransactionInProgress,
                            "cannot start a new transaction while the previous one is prepared",
                        ));
                    }
                    TxnState::Active => previous.abort()?,
                    _ => {}
                }
            }
            self.txn_number = Some(number);
            self.committed = false;
            self.txn = Some(shared.coordinator.begin(true));
        } else if self.txn_number != Some(number) {
            return Err(no_such_transaction(number));
        }
        let txn = self.txn.as_ref().ok_or_else(|| no_such_transaction(number))?;
        txn.ensure_active()?;
        Ok(txn)
    }

    /// The transaction `number`, in whatever state it is.
    fn current(&self, number: i64) -> Result<&Transaction> {
        if self.txn_number != Some(number) {
            return Err(no_such_transaction(number));
        }
        self.txn.as_ref().ok_or_else(|| no_such_transaction(number))
    }
}

fn no_such_transaction(number: i64) -> QuarryError {
    QuarryError::new(
        ErrorCode::NoSuchTransaction,
        format!("transaction {} has been aborted or does not exist", number),
    )
}

/// Sessions by `lsid`.
#[derive(Default)]
pub struct SessionCatalog {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionCatalog {
    pub fn new() -> Self {
        SessionCatalog::default()
    }

    fn checkout(&self, key: &str) -> Arc<Mutex<Session>> {
        self.sessions.entry(key.to_string()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions with a transaction that is still active or prepared.
    pub fn open_transactions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| {
                s.value()
                    .try_lock()
                    .map_or(true, |s| s.txn.as_ref().map_or(false, |t| matches!(t.state(), TxnState::Active | TxnState::Prepared)))
            })
            .count()
    }
}

/// Transaction fields of a command.
struct TxnArgs {
    lsid: Option<String>,
    txn_number: Option<i64>,
    start: bool,
    autocommit: Option<bool>,
}

impl TxnArgs {
    fn parse(cmd: &Document) -> Result<TxnArgs> {
        let args = TxnArgs {
            lsid: cmd.get("lsid").map(|lsid| lsid.to_string()),
            txn_number: field_i64(cmd, "txnNumber")?,
            start: field_bool(cmd, "startTransaction")?.unwrap_or(false),
            autocommit: field_bool(cmd, "autocommit")?,
        };
        if args.autocommit == Some(true) {
            return Err(QuarryError::InvalidOptions("autocommit can only be false".into()));
        }
        if args.start && args.autocommit.is_none() {
            return Err(QuarryError::InvalidOptions("startTransaction requires autocommit: false".into()));
        }
        if args.autocommit.is_some() && (args.lsid.is_none() || args.txn_number.is_none()) {
            return Err(QuarryError::InvalidOptions("transactions require lsid and txnNumber".into()));
        }
        Ok(args)
    }

    fn in_transaction(&self) -> bool {
        self.autocommit == Some(false)
    }

    /// Session key and transaction number of a transactional command.
    fn session(&self) -> Result<(&str, i64)> {
        match (&self.lsid, self.txn_number) {
            (Some(lsid), Some(number)) if self.in_transaction() => Ok((lsid.as_str(), number)),
            _ => Err(QuarryError::InvalidOptions(
                "transaction commands require lsid, txnNumber and autocommit: false".into(),
            )),
        }
    }
}

// ========== DISPATCH ==========

type Handler = fn(&Invocation<'_>) -> Result<Document>;

struct CommandSpec {
    name: &'static str,
    /// Accepted fields besides the name and [`GENERIC_FIELDS`]; `None`
    /// accepts anything.
    fields: Option<&'static [&'static str]>,
    /// May run inside a multi-document transaction.
    in_txn: bool,
    /// Resolves transactions itself.
    txn_control: bool,
    run: Handler,
}

const fn command(name: &'static str, fields: &'static [&'static str], in_txn: bool, run: Handler) -> CommandSpec {
    CommandSpec {
        name,
        fields: Some(fields),
        in_txn,
        txn_control: false,
        run,
    }
}

static COMMANDS: &[CommandSpec] = &[
    command("insert", &["documents", "ordered", "bypassDocumentValidation"], true, handle_insert),
    command(
        "find",
        &[
            "filter",
            "sort",
            "projection",
            "skip",
            "limit",
            "batchSize",
            "singleBatch",
            "hint",
            "collation",
            "allowDiskUse",
        ],
        true,
        handle_find,
    ),
    command("getMore", &["collection", "batchSize"], true, handle_get_more),
    command("killCursors", &["cursors"], true, handle_kill_cursors),
    command(
        "aggregate",
        &["pipeline", "cursor", "collation", "allowDiskUse", "let", "explain", "hint"],
        true,
        handle_aggregate,
    ),
    command("count", &["query", "skip", "limit", "hint", "collation"], true, handle_count),
    command("distinct", &["key", "query", "collation"], true, handle_distinct),
    command("update", &["updates", "ordered", "bypassDocumentValidation"], true, handle_update),
    command("delete", &["deletes", "ordered"], true, handle_delete),
    command("create", &["collation"], false, handle_create),
    command("drop", &[], false, handle_drop),
    command("listCollections", &["filter", "nameOnly", "cursor"], false, handle_list_collections),
    command("createIndexes", &["indexes"], false, handle_create_indexes),
    command("dropIndexes", &["index"], false, handle_drop_indexes),
    command("listIndexes", &["cursor"], false, handle_list_indexes),
    command("planCacheClear", &[], false, handle_plan_cache_clear),
    command("explain", &["verbosity"], false, handle_explain),
    command("serverStatus", &[], false, handle_server_status),
    CommandSpec {
        name: "setParameter",
        fields: None,
        in_txn: false,
        txn_control: false,
        run: handle_set_parameter,
    },
    CommandSpec {
        name: "getParameter",
        fields: None,
        in_txn: false,
        txn_control: false,
        run: handle_get_parameter,
    },
    command("killOp", &["op"], false, handle_kill_op),
    CommandSpec {
        name: "commitTransaction",
        fields: Some(&["commitTimestamp", "txnId"]),
        in_txn: true,
        txn_control: true,
        run: handle_commit_transaction,
    },
    CommandSpec {
        name: "abortTransaction",
        fields: Some(&["txnId"]),
        in_txn: true,
        txn_control: true,
        run: handle_abort_transaction,
    },
    CommandSpec {
        name: "prepareTransaction",
        fields: Some(&[]),
        in_txn: true,
        txn_control: true,
        run: handle_prepare_transaction,
    },
];

fn lookup(name: &str) -> Result<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| QuarryError::new(ErrorCode::CommandNotFound, format!("no such command: '{}'", name)))
}

fn check_fields(cmd: &Document, spec: &CommandSpec) -> Result<()> {
    let Some(fields) = spec.fields else {
        return Ok(());
    };
    for key in cmd.keys().skip(1) {
        if !GENERIC_FIELDS.contains(&key.as_str()) && !fields.contains(&key.as_str()) {
            return Err(QuarryError::new(
                ErrorCode::UnknownField,
                format!("{} command: unrecognized field '{}'", spec.name, key),
            ));
        }
    }
    Ok(())
}

/// Run `cmd`, returning the reply with `ok: 1` on success.
pub fn run_command(shared: &EngineShared, cmd: &Document) -> Result<Document> {
    let name = cmd
        .keys()
        .next()
        .cloned()
        .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "empty command document"))?;
    shared
        .cursors
        .reap_idle(Duration::from_millis(shared.params.cursor_timeout_millis()));
    let result = dispatch(shared, &name, cmd);
    shared.metrics.record_command(&name, result.is_ok());
    match result {
        Ok(mut reply) => {
            reply.insert("ok", 1.0);
            Ok(reply)
        }
        Err(err) => {
            log_debug!("command {} failed: {} ({})", name, err, err.code_name());
            Err(err)
        }
    }
}

/// Run a JSON command and render the reply, errors included.
pub fn execute(shared: &EngineShared, command: &JsonValue) -> JsonValue {
    let outcome = Document::from_json(command).and_then(|cmd| run_command(shared, &cmd));
    match outcome {
        Ok(reply) => reply.to_json(),
        Err(err) => {
            let mut reply = err.to_reply();
            let in_txn = command.get("autocommit") == Some(&JsonValue::Bool(false));
            if in_txn && err.is_transient() {
                reply["errorLabels"] = json!(["TransientTransactionError"]);
            }
            reply
        }
    }
}

fn dispatch(shared: &EngineShared, name: &str, cmd: &Document) -> Result<Document> {
    let spec = lookup(name)?;
    check_fields(cmd, spec)?;
    let db = match cmd.get("$db") {
        None => DEFAULT_DB.to_string(),
        Some(Value::String(db)) if !db.is_empty() && !db.contains('.') => db.clone(),
        Some(other) => {
            return Err(QuarryError::new(
                ErrorCode::InvalidNamespace,
                format!("invalid database name {}", other),
            ))
        }
    };
    let mut op = shared.register_operation();
    if let Some(ms) = field_u64(cmd, "maxTimeMS")? {
        if ms > 0 {
            op = op.with_max_time(Duration::from_millis(ms));
        }
    }
    let args = TxnArgs::parse(cmd)?;
    let invoke = |txn: Option<&Transaction>, session: Option<&str>| {
        let inv = Invocation {
            shared,
            db: &db,
            cmd,
            op: &op,
            txn,
            session,
            args: &args,
        };
        (spec.run)(&inv)
    };

    if spec.txn_control || !args.in_transaction() {
        return invoke(None, None);
    }
    if !spec.in_txn {
        return Err(QuarryError::new(
            ErrorCode::OperationNotSupportedInTransaction,
            format!("cannot run '{}' in a multi-document transaction", name),
        ));
    }
    let (key, number) = args.session()?;
    let session = shared.sessions.checkout(key);
    let mut session = session.lock();
    let txn = session.begin_or_continue(shared, number, args.start)?;
    let result = invoke(Some(txn), Some(key));
    if result.is_err() && txn.state() == TxnState::Active {
        txn.abort()?;
    }
    result
}

/// One command being run.
struct Invocation<'a> {
    shared: &'a EngineShared,
    db: &'a str,
    cmd: &'a Document,
    op: &'a OperationContext,
    /// The multi-document transaction the command runs in.
    txn: Option<&'a Transaction>,
    /// Session owning `txn`; cursors opened inside it are tagged with it.
    session: Option<&'a str>,
    args: &'a TxnArgs,
}

impl<'a> Invocation<'a> {
    /// Same command context over another command document.
    fn with_command<'b>(&'b self, cmd: &'b Document) -> Invocation<'b> {
        Invocation {
            shared: self.shared,
            db: self.db,
            cmd,
            op: self.op,
            txn: self.txn,
            session: self.session,
            args: self.args,
        }
    }

    /// `db.coll` from the collection name in the command's first field.
    fn target_ns(&self) -> Result<String> {
        let (name, value) = self
            .cmd
            .iter()
            .next()
            .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "empty command document"))?;
        match value.as_str() {
            Some(coll) if !coll.is_empty() => Ok(format!("{}.{}", self.db, coll)),
            _ => Err(QuarryError::new(
                ErrorCode::InvalidNamespace,
                format!("collection name for '{}' must be a non-empty string", name),
            )),
        }
    }

    /// The view a read runs at, plus the snapshot that keeps it alive when
    /// the read is not part of a multi-document transaction. A
    /// `readConcern.atClusterTime` outside a transaction reads at that time.
    fn read_snapshot(&self) -> Result<(ReadView, Option<Transaction>)> {
        let at = cluster_time(self.cmd)?;
        match (self.txn, at) {
            (Some(_), Some(_)) => Err(QuarryError::InvalidOptions(
                "readConcern.atClusterTime is not supported inside a transaction".into(),
            )),
            (Some(txn), None) => Ok((txn.view(), None)),
            (None, Some(ts)) => {
                let snapshot = self.shared.coordinator.begin_at(ts, false)?;
                Ok((snapshot.view(), Some(snapshot)))
            }
            (None, None) => {
                let snapshot = self.shared.coordinator.begin(false);
                Ok((snapshot.view(), Some(snapshot)))
            }
        }
    }

    fn collection_at(&self, ns: &str, view: ReadView) -> Option<Arc<crate::catalog::CollectionEntry>> {
        self.shared.catalog.get(ns).filter(|e| e.visible_at(view.read_ts))
    }

    /// Run `body` in the command's transaction, or in retried auto-commit
    /// transactions when there is none.
    fn write<T, F>(&self, body: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        match self.txn {
            Some(txn) => in_transaction(self.shared, txn, body),
            None => with_write_retry(self.shared, self.op, body),
        }
    }

    /// Make sure `ns` exists before writing to it.
    fn writable_collection(&self, ns: &str) -> Result<()> {
        if self.shared.catalog.get(ns).is_some() {
            return Ok(());
        }
        if self.txn.is_some() {
            return Err(QuarryError::new(
                ErrorCode::OperationNotSupportedInTransaction,
                format!("cannot create namespace {} in a multi-document transaction", ns),
            ));
        }
        ddl::ensure_collection(self.shared, ns, self.op)?;
        Ok(())
    }

    /// Record a per-statement write failure. Inside a transaction, and for
    /// interruptions, the whole command fails instead.
    fn write_failure(&self, index: usize, err: QuarryError, errors: &mut Vec<Value>) -> Result<()> {
        if self.txn.is_some() || err.is_interruption() {
            return Err(err);
        }
        errors.push(write_error(index, &err));
        Ok(())
    }

    /// Pull the first batch from `source` and park the rest.
    fn open_cursor(&self, ns: &str, source: CursorSource, batch_size: Option<usize>, single_batch: bool) -> Result<Document> {
        let mut cursor = ClientCursor::new(ns, source, self.session.map(str::to_string));
        let batch = cursor.next_batch(self.shared, self.op, batch_size)?;
        let id = if batch.exhausted || single_batch {
            0
        } else {
            self.shared.cursors.register(cursor)
        };
        Ok(cursor_reply(id, ns, "firstBatch", batch.documents))
    }
}

// ========== FIELD HELPERS ==========

fn type_mismatch(field: &str, expected: &str, got: &Value) -> QuarryError {
    QuarryError::TypeMismatch(format!("field '{}' must be {}, got {}", field, expected, got.type_name()))
}

fn field_bool(cmd: &Document, field: &str) -> Result<Option<bool>> {
    match cmd.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(v) if v.is_number() => Ok(Some(v.truthy())),
        Some(other) => Err(type_mismatch(field, "a boolean", other)),
    }
}

fn field_i64(cmd: &Document, field: &str) -> Result<Option<i64>> {
    match cmd.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Double(d)) if d.fract() == 0.0 => Ok(Some(*d as i64)),
        Some(v @ (Value::Int32(_) | Value::Int64(_))) => Ok(v.as_i64()),
        Some(other) => Err(type_mismatch(field, "an integer", other)),
    }
}

fn field_u64(cmd: &Document, field: &str) -> Result<Option<u64>> {
    match field_i64(cmd, field)? {
        None => Ok(None),
        Some(n) => u64::try_from(n)
            .map(Some)
            .map_err(|_| QuarryError::BadValue(format!("field '{}' must not be negative", field))),
    }
}

/// `readConcern: {atClusterTime: ts}`, with `ts` an integer or `{ts: n}`.
fn cluster_time(cmd: &Document) -> Result<Option<u64>> {
    let concern = match cmd.get("readConcern") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Document(concern)) => concern,
        Some(other) => return Err(type_mismatch("readConcern", "an object", other)),
    };
    for key in concern.keys() {
        if key != "level" && key != "atClusterTime" {
            return Err(QuarryError::new(
                ErrorCode::UnknownField,
                format!("readConcern: unrecognized field '{}'", key),
            ));
        }
    }
    match concern.get("atClusterTime") {
        Some(Value::Document(ts)) => field_u64(ts, "ts"),
        _ => field_u64(concern, "atClusterTime"),
    }
}

fn field_str<'d>(cmd: &'d Document, field: &str) -> Result<Option<&'d str>> {
    match cmd.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(type_mismatch(field, "a string", other)),
    }
}

fn field_doc<'d>(cmd: &'d Document, field: &str) -> Result<Option<&'d Document>> {
    match cmd.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Document(d)) => Ok(Some(d)),
        Some(other) => Err(type_mismatch(field, "an object", other)),
    }
}

fn field_docs<'d>(cmd: &'d Document, field: &str) -> Result<Vec<&'d Document>> {
    let items = match cmd.get(field) {
        Some(Value::Array(items)) => items,
        Some(other) => return Err(type_mismatch(field, "an array", other)),
        None => return Err(QuarryError::new(ErrorCode::FailedToParse, format!("missing required field '{}'", field))),
    };
    items
        .iter()
        .map(|item| item.as_document().ok_or_else(|| type_mismatch(field, "an array of objects", item)))
        .collect()
}

fn field_collation(cmd: &Document) -> Result<Option<Collation>> {
    cmd.get("collation").map(Collation::from_value).transpose()
}

fn batch_size(cmd: &Document) -> Result<Option<usize>> {
    Ok(field_u64(cmd, "batchSize")?.map(|n| n as usize))
}

fn cursor_reply(id: CursorId, ns: &str, batch_field: &str, documents: Vec<Document>) -> Document {
    let mut cursor = Document::new();
    cursor.insert("id", Value::Int64(id));
    cursor.insert("ns", ns);
    cursor.insert(batch_field, Value::Array(documents.into_iter().map(Value::Document).collect()));
    let mut reply = Document::new();
    reply.insert("cursor", cursor);
    reply
}

fn write_error(index: usize, err: &QuarryError) -> Value {
    let mut doc = Document::new();
    doc.insert("index", index as i64);
    doc.insert("code", err.code().as_i32());
    doc.insert("codeName", err.code_name());
    doc.insert("errmsg", err.to_string());
    if let Some(key) = err.to_reply().get("keyValue").filter(|k| !k.is_null()) {
        doc.insert("keyValue", Value::from_json(key).unwrap_or(Value::Null));
    }
    Value::Document(doc)
}

/// Parse the find-style fields of `cmd`. A negative limit asks for a single
/// batch of at most that many documents.
fn parse_find(cmd: &Document, filter_field: &str) -> Result<(FindQuery, bool)> {
    let mut single_batch = false;
    let limit = match field_i64(cmd, "limit")? {
        Some(n) if n < 0 => {
            single_batch = true;
            Some(n.unsigned_abs())
        }
        Some(n) => Some(n as u64),
        None => None,
    };
    let hint = match cmd.get("hint") {
        None => None,
        Some(v @ (Value::String(_) | Value::Document(_))) => Some(v.clone()),
        Some(other) => return Err(type_mismatch("hint", "a string or an object", other)),
    };
    let query = FindQuery {
        filter: field_doc(cmd, filter_field)?.cloned().unwrap_or_default(),
        sort: field_doc(cmd, "sort")?.cloned(),
        projection: field_doc(cmd, "projection")?.cloned(),
        skip: field_u64(cmd, "skip")?.unwrap_or(0),
        limit,
        hint,
        collation: field_collation(cmd)?,
        allow_disk_use: field_bool(cmd, "allowDiskUse")?.unwrap_or(false),
    };
    Ok((query, single_batch))
}

// ========== WRITES ==========

fn handle_insert(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let documents = field_docs(inv.cmd, "documents")?;
    if documents.is_empty() {
        return Err(QuarryError::BadValue("write batch must contain at least one document".into()));
    }
    let ordered = field_bool(inv.cmd, "ordered")?.unwrap_or(true);
    inv.writable_collection(&ns)?;

    let mut n = 0i64;
    let mut errors = Vec::new();
    for (index, doc) in documents.into_iter().enumerate() {
        inv.shared.metrics.op_insert.incr();
        let outcome = inv.write(|txn| CollectionWriter::open(inv.shared, txn, inv.op, &ns)?.insert(doc.clone()));
        match outcome {
            Ok(_) => n += 1,
            Err(err) => {
                inv.write_failure(index, err, &mut errors)?;
                if ordered {
                    break;
                }
            }
        }
    }
    let mut reply = Document::new();
    reply.insert("n", n);
    if !errors.is_empty() {
        reply.insert("writeErrors", Value::Array(errors));
    }
    Ok(reply)
}

struct UpdateStatement {
    filter: Document,
    spec: UpdateSpec,
    upsert: bool,
    multi: bool,
    collation: Option<Collation>,
    hint: Option<Value>,
}

impl UpdateStatement {
    fn parse(stmt: &Document) -> Result<Self> {
        for key in stmt.keys() {
            if !["q", "u", "upsert", "multi", "collation", "hint"].contains(&key.as_str()) {
                return Err(QuarryError::new(
                    ErrorCode::UnknownField,
                    format!("update statement: unrecognized field '{}'", key),
                ));
            }
        }
        let update = match stmt.get("u") {
            Some(Value::Document(u)) => u,
            Some(Value::Array(_)) => {
                return Err(QuarryError::new(ErrorCode::FailedToParse, "pipeline-style updates are not supported"))
            }
            Some(other) => return Err(type_mismatch("u", "an object", other)),
            None => return Err(QuarryError::new(ErrorCode::FailedToParse, "update statement is missing 'u'")),
        };
        let spec = UpdateSpec::parse(update)?;
        let multi = field_bool(stmt, "multi")?.unwrap_or(false);
        if multi && spec.is_replacement() {
            return Err(QuarryError::new(
                ErrorCode::FailedToParse,
                "multi update is not supported for replacement-style update",
            ));
        }
        Ok(UpdateStatement {
            filter: field_doc(stmt, "q")?.cloned().unwrap_or_default(),
            spec,
            upsert: field_bool(stmt, "upsert")?.unwrap_or(false),
            multi,
            collation: field_collation(stmt)?,
            hint: stmt.get("hint").cloned(),
        })
    }

    fn query(&self, multi: bool) -> FindQuery {
        FindQuery {
            filter: self.filter.clone(),
            limit: if multi { None } else { Some(1) },
            hint: self.hint.clone(),
            collation: self.collation.clone(),
            ..FindQuery::default()
        }
    }
}

#[derive(Default)]
struct UpdateResult {
    matched: i64,
    modified: i64,
    upserted: Option<Value>,
}

/// Records `query` selects at the transaction's view, with their current
/// contents. Gathered up front so updated documents are not revisited.
fn matching_records(
    inv: &Invocation<'_>,
    writer: &CollectionWriter<'_>,
    txn: &Transaction,
    query: &FindQuery,
) -> Result<Vec<(RecordId, Arc<Document>)>> {
    let mut executor = plan_find(inv.shared, Some(writer.entry().clone()), query, txn.view(), inv.op)?;
    let mut targets = Vec::new();
    while let Some(member) = executor.next(inv.shared, inv.op)? {
        if let (Some(rid), Some(doc)) = (member.rid, member.doc) {
            targets.push((rid, doc));
        }
    }
    Ok(targets)
}

fn run_update(inv: &Invocation<'_>, ns: &str, stmt: &UpdateStatement, txn: &Transaction) -> Result<UpdateResult> {
    let writer = CollectionWriter::open(inv.shared, txn, inv.op, ns)?;
    let collation = stmt.collation.clone().or_else(|| writer.entry().collation.clone());
    let mut result = UpdateResult::default();
    for (rid, old) in matching_records(inv, &writer, txn, &stmt.query(stmt.multi))? {
        result.matched += 1;
        let new = stmt.spec.apply(&old, false, collation.as_ref())?;
        if new == *old {
            continue;
        }
        writer.update(rid, &old, new)?;
        result.modified += 1;
    }
    if result.matched == 0 && stmt.upsert {
        let matcher = Matcher::new(&stmt.filter, collation.as_ref())?;
        let seed = UpdateSpec::upsert_seed(matcher.expr())?;
        let doc = stmt.spec.apply(&seed, true, collation.as_ref())?;
        result.upserted = Some(writer.insert(doc)?);
    }
    Ok(result)
}

fn handle_update(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let statements = field_docs(inv.cmd, "updates")?;
    let ordered = field_bool(inv.cmd, "ordered")?.unwrap_or(true);

    let mut matched = 0i64;
    let mut modified = 0i64;
    let mut upserted = Vec::new();
    let mut errors = Vec::new();
    for (index, raw) in statements.into_iter().enumerate() {
        inv.shared.metrics.op_update.incr();
        let outcome = UpdateStatement::parse(raw).and_then(|stmt| {
            if stmt.upsert {
                inv.writable_collection(&ns)?;
            } else if inv.shared.catalog.get(&ns).is_none() {
                return Ok(UpdateResult::default());
            }
            inv.write(|txn| run_update(inv, &ns, &stmt, txn))
        });
        match outcome {
            Ok(result) => {
                matched += result.matched;
                modified += result.modified;
                if let Some(id) = result.upserted {
                    let mut entry = Document::new();
                    entry.insert("index", index as i64);
                    entry.insert("_id", id);
                    upserted.push(Value::Document(entry));
                }
            }
            Err(err) => {
                inv.write_failure(index, err, &mut errors)?;
                if ordered {
                    break;
                }
            }
        }
    }
    let mut reply = Document::new();
    reply.insert("n", matched + upserted.len() as i64);
    reply.insert("nModified", modified);
    if !upserted.is_empty() {
        reply.insert("upserted", Value::Array(upserted));
    }
    if !errors.is_empty() {
        reply.insert("writeErrors", Value::Array(errors));
    }
    Ok(reply)
}

struct DeleteStatement {
    query: FindQuery,
}

impl DeleteStatement {
    fn parse(stmt: &Document) -> Result<Self> {
        for key in stmt.keys() {
            if !["q", "limit", "collation", "hint"].contains(&key.as_str()) {
                return Err(QuarryError::new(
                    ErrorCode::UnknownField,
                    format!("delete statement: unrecognized field '{}'", key),
                ));
            }
        }
        let limit = match field_i64(stmt, "limit")? {
            Some(0) | None => None,
            Some(1) => Some(1),
            Some(other) => {
                return Err(QuarryError::BadValue(format!(
                    "the limit field in delete objects must be 0 or 1, got {}",
                    other
                )))
            }
        };
        Ok(DeleteStatement {
            query: FindQuery {
                filter: field_doc(stmt, "q")?.cloned().unwrap_or_default(),
                limit,
                hint: stmt.get("hint").cloned(),
                collation: field_collation(stmt)?,
                ..FindQuery::default()
            },
        })
    }
}

fn handle_delete(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let statements = field_docs(inv.cmd, "deletes")?;
    let ordered = field_bool(inv.cmd, "ordered")?.unwrap_or(true);

    let mut n = 0i64;
    let mut errors = Vec::new();
    for (index, raw) in statements.into_iter().enumerate() {
        inv.shared.metrics.op_delete.incr();
        let outcome = DeleteStatement::parse(raw).and_then(|stmt| {
            if inv.shared.catalog.get(&ns).is_none() {
                return Ok(0);
            }
            inv.write(|txn| {
                let writer = CollectionWriter::open(inv.shared, txn, inv.op, &ns)?;
                let targets = matching_records(inv, &writer, txn, &stmt.query)?;
                for (rid, _) in &targets {
                    writer.delete(*rid)?;
                }
                Ok(targets.len() as i64)
            })
        });
        match outcome {
            Ok(deleted) => n += deleted,
            Err(err) => {
                inv.write_failure(index, err, &mut errors)?;
                if ordered {
                    break;
                }
            }
        }
    }
    let mut reply = Document::new();
    reply.insert("n", n);
    if !errors.is_empty() {
        reply.insert("writeErrors", Value::Array(errors));
    }
    Ok(reply)
}

// ========== READS ==========

fn handle_find(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let (query, negative_limit) = parse_find(inv.cmd, "filter")?;
    let single_batch = negative_limit || field_bool(inv.cmd, "singleBatch")?.unwrap_or(false);
    let batch_size = batch_size(inv.cmd)?.or(Some(inv.shared.params.default_batch_size() as usize));
    inv.shared.metrics.op_query.incr();

    let (view, snapshot) = inv.read_snapshot()?;
    let mut executor = plan_find(inv.shared, inv.collection_at(&ns, view), &query, view, inv.op)?;
    if let Some(snapshot) = snapshot {
        executor.attach_snapshot(snapshot);
    }
    inv.open_cursor(&ns, CursorSource::Find(executor), batch_size, single_batch)
}

fn handle_get_more(inv: &Invocation<'_>) -> Result<Document> {
    let id = inv
        .cmd
        .get("getMore")
        .and_then(Value::as_i64)
        .ok_or_else(|| QuarryError::TypeMismatch("getMore requires a numeric cursor id".into()))?;
    let coll = field_str(inv.cmd, "collection")?
        .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "getMore requires 'collection'"))?;
    let ns = format!("{}.{}", inv.db, coll);
    let batch_size = batch_size(inv.cmd)?;
    inv.shared.metrics.op_getmore.incr();

    let handle = inv.shared.cursors.get(id)?;
    let mut cursor = handle.lock();
    if cursor.ns() != ns {
        return Err(QuarryError::new(
            ErrorCode::IllegalOperation,
            format!("cursor {} was opened on {}, not {}", id, cursor.ns(), ns),
        ));
    }
    if cursor.session().is_some() && cursor.session() != inv.session {
        return Err(QuarryError::new(ErrorCode::CursorNotFound, format!("cursor id {} not found", id)));
    }
    match cursor.next_batch(inv.shared, inv.op, batch_size) {
        Ok(batch) => {
            let id = if batch.exhausted {
                inv.shared.cursors.remove(id);
                0
            } else {
                id
            };
            Ok(cursor_reply(id, &ns, "nextBatch", batch.documents))
        }
        Err(err) => {
            inv.shared.cursors.remove(id);
            Err(err)
        }
    }
}

fn handle_kill_cursors(inv: &Invocation<'_>) -> Result<Document> {
    inv.target_ns()?;
    let ids = match inv.cmd.get("cursors") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| type_mismatch("cursors", "an array of cursor ids", v)))
            .collect::<Result<Vec<CursorId>>>()?,
        Some(other) => return Err(type_mismatch("cursors", "an array", other)),
        None => return Err(QuarryError::new(ErrorCode::FailedToParse, "killCursors requires 'cursors'")),
    };
    let (killed, not_found) = inv.shared.cursors.kill(&ids);
    let ids_value = |ids: Vec<CursorId>| Value::Array(ids.into_iter().map(Value::Int64).collect());
    let mut reply = Document::new();
    reply.insert("cursorsKilled", ids_value(killed));
    reply.insert("cursorsNotFound", ids_value(not_found));
    reply.insert("cursorsAlive", Value::Array(Vec::new()));
    reply.insert("cursorsUnknown", Value::Array(Vec::new()));
    Ok(reply)
}

fn aggregate_request(inv: &Invocation<'_>) -> Result<AggregateRequest> {
    let ns = match inv.cmd.get("aggregate") {
        Some(v) if v.is_number() && v.as_i64() == Some(1) => format!("{}.{}", inv.db, COLLECTIONLESS),
        _ => inv.target_ns()?,
    };
    let pipeline = match inv.cmd.get("pipeline") {
        Some(Value::Array(stages)) => stages.clone(),
        Some(other) => return Err(type_mismatch("pipeline", "an array", other)),
        None => return Err(QuarryError::new(ErrorCode::FailedToParse, "aggregate requires 'pipeline'")),
    };
    Ok(AggregateRequest {
        ns,
        pipeline,
        collation: field_collation(inv.cmd)?,
        allow_disk_use: field_bool(inv.cmd, "allowDiskUse")?.unwrap_or(false),
        let_vars: field_doc(inv.cmd, "let")?.cloned(),
        explicit_txn: inv.txn.is_some(),
    })
}

fn handle_aggregate(inv: &Invocation<'_>) -> Result<Document> {
    let request = aggregate_request(inv)?;
    let explain = field_bool(inv.cmd, "explain")?.unwrap_or(false);
    let cursor_opts = match field_doc(inv.cmd, "cursor")? {
        Some(opts) => Some(opts),
        None if explain => None,
        None => {
            return Err(QuarryError::new(
                ErrorCode::FailedToParse,
                "the 'cursor' option is required, except for aggregate with the explain argument",
            ))
        }
    };
    let batch_size = match cursor_opts {
        Some(opts) => batch_size(opts)?,
        None => None,
    }
    .or(Some(inv.shared.params.default_batch_size() as usize));

    let (view, snapshot) = inv.read_snapshot()?;
    let mut executor = PipelineExecutor::prepare(inv.shared, &request, view, inv.op)?;
    if explain {
        return Ok(executor.explain());
    }
    if let Some(snapshot) = snapshot {
        executor.attach_snapshot(snapshot);
    }
    let ns = request.ns.clone();
    inv.open_cursor(&ns, CursorSource::Aggregate(executor), batch_size, false)
}

fn handle_count(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let (mut query, _) = parse_find(inv.cmd, "query")?;
    query.limit = query.limit.filter(|l| *l > 0);
    let (view, _snapshot) = inv.read_snapshot()?;
    let mut executor = plan_find(inv.shared, inv.collection_at(&ns, view), &query, view, inv.op)?;
    let mut n = 0i64;
    while executor.next(inv.shared, inv.op)?.is_some() {
        n += 1;
    }
    let mut reply = Document::new();
    reply.insert("n", n);
    Ok(reply)
}

fn handle_distinct(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let key = field_str(inv.cmd, "key")?
        .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "distinct requires 'key'"))?;
    if key.is_empty() || key.starts_with('$') {
        return Err(QuarryError::BadValue(format!("invalid distinct key '{}'", key)));
    }
    let query = FindQuery {
        filter: field_doc(inv.cmd, "query")?.cloned().unwrap_or_default(),
        collation: field_collation(inv.cmd)?,
        ..FindQuery::default()
    };
    let (view, _snapshot) = inv.read_snapshot()?;
    let (values, _) = distinct(inv.shared, inv.collection_at(&ns, view), key, &query, view, inv.op)?;
    let mut reply = Document::new();
    reply.insert("values", Value::Array(values));
    Ok(reply)
}

// ========== CATALOG ==========

fn handle_create(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let mut options = Document::new();
    for (key, value) in inv.cmd.iter().skip(1) {
        if !GENERIC_FIELDS.contains(&key.as_str()) {
            options.insert(key.clone(), value.clone());
        }
    }
    ddl::create_collection(inv.shared, &ns, &options, inv.op)?;
    Ok(Document::new())
}

fn handle_drop(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let indexes = inv.shared.catalog.get(&ns).map(|e| e.indexes.len());
    let mut reply = Document::new();
    if ddl::drop_collection(inv.shared, &ns, inv.op)? {
        reply.insert("ns", ns.as_str());
        if let Some(n) = indexes {
            reply.insert("nIndexesWas", n as i64);
        }
    }
    Ok(reply)
}

fn handle_list_collections(inv: &Invocation<'_>) -> Result<Document> {
    let filter = field_doc(inv.cmd, "filter")?
        .map(|f| Matcher::new(f, None))
        .transpose()?;
    let name_only = field_bool(inv.cmd, "nameOnly")?.unwrap_or(false);
    let (view, _snapshot) = inv.read_snapshot()?;
    let epoch = inv.shared.catalog.snapshot();
    let mut out = Vec::new();
    for entry in epoch.in_db(inv.db).filter(|e| e.visible_at(view.read_ts)) {
        let info = entry.info();
        if let Some(matcher) = &filter {
            if !matcher.matches(&info)? {
                continue;
            }
        }
        if name_only {
            let mut brief = Document::new();
            brief.insert("name", entry.coll());
            brief.insert("type", "collection");
            out.push(brief);
        } else {
            out.push(info);
        }
    }
    let ns = format!("{}.$cmd.listCollections", inv.db);
    Ok(cursor_reply(0, &ns, "firstBatch", out))
}

fn handle_create_indexes(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let specs: Vec<Document> = field_docs(inv.cmd, "indexes")?.into_iter().cloned().collect();
    let outcome = ddl::create_indexes(inv.shared, &ns, &specs, inv.op)?;
    let mut reply = Document::new();
    reply.insert("createdCollectionAutomatically", outcome.created_collection_automatically);
    reply.insert("numIndexesBefore", outcome.num_indexes_before as i64);
    reply.insert("numIndexesAfter", outcome.num_indexes_after as i64);
    if let Some(note) = outcome.note {
        reply.insert("note", note);
    }
    Ok(reply)
}

fn handle_drop_indexes(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let target = inv
        .cmd
        .get("index")
        .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "dropIndexes requires 'index'"))?;
    let was = ddl::drop_indexes(inv.shared, &ns, target, inv.op)?;
    let mut reply = Document::new();
    reply.insert("nIndexesWas", was as i64);
    Ok(reply)
}

fn handle_list_indexes(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let (view, _snapshot) = inv.read_snapshot()?;
    let entry = inv
        .collection_at(&ns, view)
        .ok_or_else(|| QuarryError::NamespaceNotFound(format!("ns does not exist: {}", ns)))?;
    let specs = entry
        .usable_indexes(view.read_ts)
        .map(|index| {
            let mut spec = Document::new();
            spec.insert("v", 2);
            for (k, v) in index.descriptor.to_spec() {
                spec.insert(k, v);
            }
            spec
        })
        .collect();
    Ok(cursor_reply(0, &ns, "firstBatch", specs))
}

// ========== ADMIN ==========

fn handle_plan_cache_clear(inv: &Invocation<'_>) -> Result<Document> {
    let ns = inv.target_ns()?;
    let evicted = inv.shared.plan_cache.evict_namespace(&ns);
    log_debug!("cleared {} plan cache entries for {}", evicted, ns);
    Ok(Document::new())
}

fn handle_explain(inv: &Invocation<'_>) -> Result<Document> {
    let inner = field_doc(inv.cmd, "explain")?
        .ok_or_else(|| QuarryError::TypeMismatch("explain requires a command object".into()))?;
    let with_stats = match field_str(inv.cmd, "verbosity")?.unwrap_or("queryPlanner") {
        "queryPlanner" => false,
        "executionStats" | "allPlansExecution" => true,
        other => return Err(QuarryError::BadValue(format!("unrecognized explain verbosity '{}'", other))),
    };
    let name = inner
        .keys()
        .next()
        .cloned()
        .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "explain requires a command"))?;
    let spec = lookup(&name)?;
    check_fields(inner, spec)?;
    let inv = inv.with_command(inner);
    let ns = inv.target_ns();
    match name.as_str() {
        "find" | "count" => {
            let ns = ns?;
            let filter_field = if name == "find" { "filter" } else { "query" };
            let (query, _) = parse_find(inner, filter_field)?;
            let (view, _snapshot) = inv.read_snapshot()?;
            let mut executor = plan_find(inv.shared, inv.collection_at(&ns, view), &query, view, inv.op)?;
            if with_stats {
                executor.collect_documents(inv.shared, inv.op)?;
            }
            Ok(executor.explain(with_stats))
        }
        "distinct" => {
            let ns = ns?;
            let key = field_str(inner, "key")?
                .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "distinct requires 'key'"))?;
            let query = FindQuery {
                filter: field_doc(inner, "query")?.cloned().unwrap_or_default(),
                collation: field_collation(inner)?,
                ..FindQuery::default()
            };
            let (view, _snapshot) = inv.read_snapshot()?;
            let (_, plan) = distinct(inv.shared, inv.collection_at(&ns, view), key, &query, view, inv.op)?;
            let mut planner = Document::new();
            planner.insert("namespace", ns.as_str());
            planner.insert("winningPlan", plan);
            let mut reply = Document::new();
            reply.insert("queryPlanner", planner);
            Ok(reply)
        }
        "aggregate" => {
            let request = aggregate_request(&inv)?;
            let (view, _snapshot) = inv.read_snapshot()?;
            Ok(PipelineExecutor::prepare(inv.shared, &request, view, inv.op)?.explain())
        }
        other => Err(QuarryError::new(
            ErrorCode::IllegalOperation,
            format!("explain is not supported for '{}'", other),
        )),
    }
}

fn handle_server_status(inv: &Invocation<'_>) -> Result<Document> {
    let mut status = inv.shared.server_status();
    status["sessions"] = json!({
        "active": inv.shared.sessions.len(),
        "openTransactions": inv.shared.sessions.open_transactions(),
    });
    status["operations"] = json!({"running": inv.shared.operations.running()});
    Document::from_json(&status)
}

fn parameter_fields(cmd: &Document) -> impl Iterator<Item = (&String, &Value)> {
    cmd.iter().skip(1).filter(|(k, _)| !GENERIC_FIELDS.contains(&k.as_str()))
}

fn handle_set_parameter(inv: &Invocation<'_>) -> Result<Document> {
    let mut reply = Document::new();
    for (name, value) in parameter_fields(inv.cmd) {
        let was = inv.shared.params.set(name, &value.to_json())?;
        log_info!("setParameter {} = {} (was {})", name, value, was);
        reply.insert("was", was as i64);
    }
    if reply.is_empty() {
        return Err(QuarryError::BadValue("no option found to set".into()));
    }
    Ok(reply)
}

fn handle_get_parameter(inv: &Invocation<'_>) -> Result<Document> {
    if inv.cmd.get("getParameter").and_then(Value::as_str) == Some("*") {
        return Document::from_json(&inv.shared.params.snapshot());
    }
    let mut reply = Document::new();
    for (name, _) in parameter_fields(inv.cmd) {
        reply.insert(name.clone(), inv.shared.params.get(name)? as i64);
    }
    if reply.is_empty() {
        return Err(QuarryError::BadValue("no option found to get".into()));
    }
    Ok(reply)
}

fn handle_kill_op(inv: &Invocation<'_>) -> Result<Document> {
    let op_id = field_u64(inv.cmd, "op")?
        .ok_or_else(|| QuarryError::new(ErrorCode::FailedToParse, "killOp requires 'op'"))?;
    let killed = inv.shared.operations.kill_op(op_id);
    if killed {
        inv.shared.metrics.interrupted_operations.incr();
    }
    let mut reply = Document::new();
    reply.insert("info", "attempting to kill op");
    reply.insert("killed", killed);
    Ok(reply)
}

// ========== TRANSACTIONS ==========

/// A prepared transaction addressed by id rather than through a session,
/// as left behind by recovery.
fn recovered_prepared(inv: &Invocation<'_>) -> Result<Option<Transaction>> {
    let Some(id) = field_u64(inv.cmd, "txnId")? else {
        return Ok(None);
    };
    inv.shared
        .coordinator
        .prepared_transaction(id)
        .map(Some)
        .ok_or_else(|| QuarryError::new(ErrorCode::NoSuchTransaction, format!("no prepared transaction {}", id)))
}

fn commit_timestamp(inv: &Invocation<'_>) -> Result<Option<u64>> {
    match inv.cmd.get("commitTimestamp") {
        Some(Value::Document(ts)) => field_u64(ts, "ts"),
        _ => field_u64(inv.cmd, "commitTimestamp"),
    }
}

fn handle_commit_transaction(inv: &Invocation<'_>) -> Result<Document> {
    let commit_ts = commit_timestamp(inv)?;
    let mut reply = Document::new();
    if let Some(txn) = recovered_prepared(inv)? {
        let ts = txn.commit(commit_ts)?;
        reply.insert("commitTimestamp", ts as i64);
        return Ok(reply);
    }
    let (key, number) = inv.args.session()?;
    let session = inv.shared.sessions.checkout(key);
    let mut session = session.lock();
    if session.txn_number == Some(number) && session.committed {
        return Ok(reply);
    }
    let txn = session.current(number)?;
    if txn.state() == TxnState::Active && commit_ts.is_some() {
        return Err(QuarryError::InvalidOptions(
            "commitTimestamp is only valid for a prepared transaction".into(),
        ));
    }
    let outcome = txn.commit(commit_ts);
    let state = txn.state();
    if state != TxnState::Active && state != TxnState::Prepared {
        session.txn = None;
        session.committed = state == TxnState::Committed;
        inv.shared.cursors.kill_session(key);
    }
    let ts = outcome?;
    reply.insert("commitTimestamp", ts as i64);
    Ok(reply)
}

fn handle_abort_transaction(inv: &Invocation<'_>) -> Result<Document> {
    if let Some(txn) = recovered_prepared(inv)? {
        txn.abort()?;
        return Ok(Document::new());
    }
    let (key, number) = inv.args.session()?;
    let session = inv.shared.sessions.checkout(key);
    let mut session = session.lock();
    let txn = session.current(number)?;
    match txn.state() {
        TxnState::Active | TxnState::Prepared => txn.abort()?,
        TxnState::Committed => {
            return Err(QuarryError::new(
                ErrorCode::TransactionCommitted,
                format!("transaction {} has been committed", number),
            ))
        }
        TxnState::Aborted => return Err(no_such_transaction(number)),
    }
    session.txn = None;
    inv.shared.cursors.kill_session(key);
    Ok(Document::new())
}

fn handle_prepare_transaction(inv: &Invocation<'_>) -> Result<Document> {
    let (key, number) = inv.args.session()?;
    let session = inv.shared.sessions.checkout(key);
    let session = session.lock();
    let txn = session.current(number)?;
    let ts = txn.prepare()?;
    let mut reply = Document::new();
    reply.insert("prepareTimestamp", ts as i64);
    reply.insert("txnId", txn.id() as i64);
    Ok(reply)
}
