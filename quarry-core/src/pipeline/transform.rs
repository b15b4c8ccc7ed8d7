// quarry-core/src/pipeline/transform.rs
//! Streaming stages: one document in, at most a few out, no buffering.

use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::query::{Matcher, PlanExecutor, Projection};
use crate::value::Value;

use super::expression::Expression;
use super::{expect_document, stage_doc, DocumentSource, PipelineContext};

// ========== $cursor ==========

/// Leaf stage feeding a pipeline from a planned collection scan.
pub struct CursorSource {
    executor: PlanExecutor,
}

impl CursorSource {
    pub fn new(executor: PlanExecutor) -> Self {
        CursorSource { executor }
    }
}

impl DocumentSource for CursorSource {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        ctx.op.check_for_interrupt()?;
        self.executor.next_document(ctx.shared, ctx.op)
    }

    fn name(&self) -> &'static str {
        "$cursor"
    }

    fn explain(&self) -> Document {
        stage_doc("$cursor", self.executor.explain(false))
    }
}

// ========== $match ==========

pub struct MatchStage {
    source: Box<dyn DocumentSource>,
    matcher: Matcher,
}

impl MatchStage {
    pub fn new(source: Box<dyn DocumentSource>, matcher: Matcher) -> Self {
        MatchStage { source, matcher }
    }
}

impl DocumentSource for MatchStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        while let Some(doc) = self.source.get_next(ctx)? {
            if self.matcher.matches_with_vars(&doc, ctx.vars())? {
                return Ok(Some(doc));
            }
            ctx.op.check_periodically()?;
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "$match"
    }

    fn explain(&self) -> Document {
        stage_doc("$match", self.matcher.filter().clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $project / $unset ==========

pub struct ProjectStage {
    source: Box<dyn DocumentSource>,
    name: &'static str,
    projection: Projection,
    spec: Value,
}

impl ProjectStage {
    pub fn new(source: Box<dyn DocumentSource>, name: &'static str, projection: Projection, spec: Value) -> Self {
        ProjectStage {
            source,
            name,
            projection,
            spec,
        }
    }
}

impl DocumentSource for ProjectStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        match self.source.get_next(ctx)? {
            Some(doc) => Ok(Some(self.projection.apply(&doc, ctx.vars())?)),
            None => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn explain(&self) -> Document {
        stage_doc(self.name, self.spec.clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $addFields / $set ==========

pub struct AddFieldsStage {
    source: Box<dyn DocumentSource>,
    fields: Vec<(String, Expression)>,
    spec: Value,
}

impl AddFieldsStage {
    pub fn new(source: Box<dyn DocumentSource>, fields: Vec<(String, Expression)>, spec: Value) -> Self {
        AddFieldsStage { source, fields, spec }
    }
}

/// Evaluate every field against the input document, then assign. A field
/// whose expression is missing is removed.
pub(crate) fn add_fields(doc: Document, fields: &[(String, Expression)], ctx: &PipelineContext<'_>) -> Result<Document> {
    let mut values = Vec::with_capacity(fields.len());
    for (path, expr) in fields {
        values.push((path, expr.evaluate_opt(&doc, ctx.vars())?));
    }
    let mut out = doc;
    for (path, value) in values {
        match value {
            Some(value) => out.set_path(path, value)?,
            None => {
                out.remove_path(path);
            }
        }
    }
    Ok(out)
}

impl DocumentSource for AddFieldsStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        match self.source.get_next(ctx)? {
            Some(doc) => Ok(Some(add_fields(doc, &self.fields, ctx)?)),
            None => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        "$addFields"
    }

    fn explain(&self) -> Document {
        stage_doc("$addFields", self.spec.clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $replaceRoot ==========

pub struct ReplaceRootStage {
    source: Box<dyn DocumentSource>,
    new_root: Expression,
    spec: Value,
}

impl ReplaceRootStage {
    pub fn new(source: Box<dyn DocumentSource>, new_root: Expression, spec: Value) -> Self {
        ReplaceRootStage { source, new_root, spec }
    }
}

pub(crate) fn replace_root(doc: &Document, new_root: &Expression, ctx: &PipelineContext<'_>) -> Result<Document> {
    match new_root.evaluate_opt(doc, ctx.vars())? {
        Some(Value::Document(root)) => Ok(root),
        Some(other) => Err(QuarryError::BadValue(format!(
            "'newRoot' expression must evaluate to an object, but resulting value was of type {}",
            other.type_name()
        ))),
        None => Err(QuarryError::BadValue(
            "'newRoot' expression must evaluate to an object, but resulting value was missing".into(),
        )),
    }
}

impl DocumentSource for ReplaceRootStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        match self.source.get_next(ctx)? {
            Some(doc) => Ok(Some(replace_root(&doc, &self.new_root, ctx)?)),
            None => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        "$replaceRoot"
    }

    fn explain(&self) -> Document {
        let mut spec = Document::new();
        spec.insert("newRoot", self.spec.clone());
        stage_doc("$replaceRoot", spec)
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $unwind ==========

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty: bool,
}

fn unwind_path(value: &Value) -> Result<String> {
    let path = value
        .as_str()
        .ok_or_else(|| QuarryError::TypeMismatch("expected a string as the path for $unwind stage".into()))?;
    match path.strip_prefix('$') {
        Some(rest) if !rest.is_empty() && !rest.starts_with('$') => Ok(rest.to_string()),
        _ => Err(QuarryError::BadValue(format!(
            "path option to $unwind stage should be prefixed with a '$': {}",
            path
        ))),
    }
}

impl UnwindSpec {
    pub fn parse(spec: &Value) -> Result<Self> {
        if let Value::String(_) = spec {
            return Ok(UnwindSpec {
                path: unwind_path(spec)?,
                include_array_index: None,
                preserve_null_and_empty: false,
            });
        }
        let doc = expect_document("$unwind", spec)?;
        let mut path = None;
        let mut include_array_index = None;
        let mut preserve_null_and_empty = false;
        for (key, value) in doc.iter() {
            match key.as_str() {
                "path" => path = Some(unwind_path(value)?),
                "includeArrayIndex" => {
                    let name = value.as_str().ok_or_else(|| {
                        QuarryError::TypeMismatch("expected a non-empty string for the includeArrayIndex option".into())
                    })?;
                    if name.is_empty() || name.starts_with('$') {
                        return Err(QuarryError::BadValue(
                            "includeArrayIndex option to $unwind stage should not be prefixed with a '$'".into(),
                        ));
                    }
                    include_array_index = Some(name.to_string());
                }
                "preserveNullAndEmptyArrays" => {
                    preserve_null_and_empty = value.as_bool().ok_or_else(|| {
                        QuarryError::TypeMismatch("expected a boolean for the preserveNullAndEmptyArrays option".into())
                    })?;
                }
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unrecognized option to $unwind stage: {}", other),
                    ))
                }
            }
        }
        let path = path.ok_or_else(|| QuarryError::BadValue("no path specified to $unwind stage".into()))?;
        Ok(UnwindSpec {
            path,
            include_array_index,
            preserve_null_and_empty,
        })
    }

    /// Expand one input document.
    pub fn expand(&self, doc: Document) -> Result<Vec<Document>> {
        let value = doc.get_path(&self.path).cloned();
        let mut out = Vec::new();
        match value {
            Some(Value::Array(items)) if !items.is_empty() => {
                out.reserve(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let mut expanded = doc.clone();
                    expanded.set_path(&self.path, item)?;
                    if let Some(field) = &self.include_array_index {
                        expanded.set_path(field, Value::Int64(i as i64))?;
                    }
                    out.push(expanded);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if self.preserve_null_and_empty {
                    let mut kept = doc;
                    if let Some(Value::Array(_)) = kept.get_path(&self.path) {
                        kept.remove_path(&self.path);
                    }
                    if let Some(field) = &self.include_array_index {
                        kept.set_path(field, Value::Null)?;
                    }
                    out.push(kept);
                }
            }
            Some(_) => {
                // A scalar unwinds to itself.
                let mut kept = doc;
                if let Some(field) = &self.include_array_index {
                    kept.set_path(field, Value::Null)?;
                }
                out.push(kept);
            }
        }
        Ok(out)
    }

    fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("path", format!("${}", self.path));
        if let Some(field) = &self.include_array_index {
            doc.insert("includeArrayIndex", field.as_str());
        }
        if self.preserve_null_and_empty {
            doc.insert("preserveNullAndEmptyArrays", true);
        }
        doc
    }
}

pub struct UnwindStage {
    source: Box<dyn DocumentSource>,
    spec: UnwindSpec,
    pending: std::collections::VecDeque<Document>,
}

impl UnwindStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: UnwindSpec) -> Self {
        UnwindStage {
            source,
            spec,
            pending: std::collections::VecDeque::new(),
        }
    }
}

impl DocumentSource for UnwindStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.pending.pop_front() {
                return Ok(Some(doc));
            }
            match self.source.get_next(ctx)? {
                Some(doc) => self.pending.extend(self.spec.expand(doc)?),
                None => return Ok(None),
            }
        }
    }

    fn name(&self) -> &'static str {
        "$unwind"
    }

    fn explain(&self) -> Document {
        stage_doc("$unwind", self.spec.to_document())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $skip / $limit ==========

pub struct SkipStage {
    source: Box<dyn DocumentSource>,
    remaining: u64,
    amount: u64,
}

impl SkipStage {
    pub fn new(source: Box<dyn DocumentSource>, amount: u64) -> Self {
        SkipStage {
            source,
            remaining: amount,
            amount,
        }
    }
}

impl DocumentSource for SkipStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        while self.remaining > 0 {
            if self.source.get_next(ctx)?.is_none() {
                return Ok(None);
            }
            self.remaining -= 1;
        }
        self.source.get_next(ctx)
    }

    fn name(&self) -> &'static str {
        "$skip"
    }

    fn explain(&self) -> Document {
        stage_doc("$skip", self.amount as i64)
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

pub struct LimitStage {
    source: Box<dyn DocumentSource>,
    remaining: u64,
    amount: u64,
}

impl LimitStage {
    pub fn new(source: Box<dyn DocumentSource>, amount: u64) -> Self {
        LimitStage {
            source,
            remaining: amount,
            amount,
        }
    }
}

impl DocumentSource for LimitStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let next = self.source.get_next(ctx)?;
        if next.is_some() {
            self.remaining -= 1;
        }
        Ok(next)
    }

    fn name(&self) -> &'static str {
        "$limit"
    }

    fn explain(&self) -> Document {
        stage_doc("$limit", self.amount as i64)
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $count ==========

pub struct CountStage {
    source: Box<dyn DocumentSource>,
    field: String,
    done: bool,
}

impl CountStage {
    pub fn new(source: Box<dyn DocumentSource>, field: String) -> Self {
        CountStage {
            source,
            field,
            done: false,
        }
    }
}

impl DocumentSource for CountStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut n: i64 = 0;
        while self.source.get_next(ctx)?.is_some() {
            n += 1;
            ctx.op.check_periodically()?;
        }
        if n == 0 {
            return Ok(None);
        }
        let value = match i32::try_from(n) {
            Ok(small) => Value::Int32(small),
            Err(_) => Value::Int64(n),
        };
        let mut doc = Document::new();
        doc.insert(self.field.as_str(), value);
        Ok(Some(doc))
    }

    fn name(&self) -> &'static str {
        "$count"
    }

    fn explain(&self) -> Document {
        stage_doc("$count", self.field.as_str())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_unwind_variants() {
        let plain = UnwindSpec::parse(&Value::from("$a")).unwrap();
        let out = plain.expand(doc!({"_id": 1, "a": [1, 2, 3]})).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], doc!({"_id": 1, "a": 3}));
        assert!(plain.expand(doc!({"_id": 1, "a": []})).unwrap().is_empty());
        assert!(plain.expand(doc!({"_id": 1})).unwrap().is_empty());
        assert_eq!(plain.expand(doc!({"_id": 1, "a": 5})).unwrap(), vec![doc!({"_id": 1, "a": 5})]);

        let spec = Value::Document(doc!({"path": "$a", "includeArrayIndex": "i", "preserveNullAndEmptyArrays": true}));
        let full = UnwindSpec::parse(&spec).unwrap();
        let out = full.expand(doc!({"_id": 1, "a": ["x", "y"]})).unwrap();
        assert_eq!(out[1], doc!({"_id": 1, "a": "y", "i": 1}));
        let out = full.expand(doc!({"_id": 2, "a": []})).unwrap();
        assert_eq!(out, vec![doc!({"_id": 2, "i": null})]);
    }

    #[test]
    fn test_unwind_rejects_bad_specs() {
        assert!(UnwindSpec::parse(&Value::from("a")).is_err());
        let unknown = Value::Document(doc!({"path": "$a", "bogus": 1}));
        assert_eq!(UnwindSpec::parse(&unknown).unwrap_err().code(), ErrorCode::UnknownField);
    }
}
