// quarry-core/src/query/update.rs
//! Update documents: operator updates and whole-document replacement.

use std::cmp::Ordering;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::pipeline::expression::{arithmetic, Op};
use crate::value::{compare_values, Value};

use super::matcher::MatchExpr;
use super::operators::Predicate;

#[derive(Debug, Clone)]
pub enum UpdateOp {
    Set(String, Value),
    SetOnInsert(String, Value),
    Unset(String),
    Inc(String, Value),
    Push { path: String, values: Vec<Value> },
    AddToSet { path: String, values: Vec<Value> },
}

impl UpdateOp {
    fn path(&self) -> &str {
        match self {
            UpdateOp::Set(p, _)
            | UpdateOp::SetOnInsert(p, _)
            | UpdateOp::Unset(p)
            | UpdateOp::Inc(p, _)
            | UpdateOp::Push { path: p, .. }
            | UpdateOp::AddToSet { path: p, .. } => p,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Replacement(Document),
    Operators(Vec<UpdateOp>),
}

fn each_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Document(doc) if doc.contains_key("$each") => match doc.get("$each") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        },
        other => vec![other.clone()],
    }
}

fn conflicts(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{}.", b)) || b.starts_with(&format!("{}.", a))
}

impl UpdateSpec {
    pub fn parse(update: &Document) -> Result<Self> {
        let first = update.keys().next().map(|k| k.starts_with('$'));
        match first {
            None => Ok(UpdateSpec::Replacement(Document::new())),
            Some(false) => {
                if update.keys().any(|k| k.starts_with('$')) {
                    return Err(QuarryError::BadValue("replacement document must not contain update operators".into()));
                }
                Ok(UpdateSpec::Replacement(update.clone()))
            }
            Some(true) => {
                let mut ops: Vec<UpdateOp> = Vec::new();
                for (name, arg) in update.iter() {
                    let fields = arg.as_document().ok_or_else(|| {
                        QuarryError::BadValue(format!("modifiers operate on fields but we found a non-object for {}", name))
                    })?;
                    for (path, value) in fields.iter() {
                        let op = match name.as_str() {
                            "$set" => UpdateOp::Set(path.clone(), value.clone()),
                            "$setOnInsert" => UpdateOp::SetOnInsert(path.clone(), value.clone()),
                            "$unset" => UpdateOp::Unset(path.clone()),
                            "$inc" => {
                                if !value.is_number() {
                                    return Err(QuarryError::TypeMismatch(format!(
                                        "cannot increment with non-numeric argument: {{{}: {}}}",
                                        path, value
                                    )));
                                }
                                UpdateOp::Inc(path.clone(), value.clone())
                            }
                            "$push" => UpdateOp::Push {
                                path: path.clone(),
                                values: each_values(value),
                            },
                            "$addToSet" => UpdateOp::AddToSet {
                                path: path.clone(),
                                values: each_values(value),
                            },
                            other => return Err(QuarryError::BadValue(format!("unknown modifier: {}", other))),
                        };
                        if let Some(existing) = ops.iter().find(|o| conflicts(o.path(), op.path())) {
                            return Err(QuarryError::BadValue(format!(
                                "updating the path '{}' would create a conflict at '{}'",
                                op.path(),
                                existing.path()
                            )));
                        }
                        ops.push(op);
                    }
                }
                Ok(UpdateSpec::Operators(ops))
            }
        }
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self, UpdateSpec::Replacement(_))
    }

    /// Produce the post-image of `doc`. `inserting` enables `$setOnInsert`.
    /// The caller enforces `_id` immutability.
    pub fn apply(&self, doc: &Document, inserting: bool, collation: Option<&Collation>) -> Result<Document> {
        match self {
            UpdateSpec::Replacement(replacement) => {
                let mut out = Document::with_capacity(replacement.len() + 1);
                if let Some(id) = replacement.get("_id").or_else(|| doc.get("_id")) {
                    out.insert("_id", id.clone());
                }
                for (k, v) in replacement.iter().filter(|(k, _)| k.as_str() != "_id") {
                    out.insert(k.clone(), v.clone());
                }
                Ok(out)
            }
            UpdateSpec::Operators(ops) => {
                let mut out = doc.clone();
                for op in ops {
                    apply_op(&mut out, op, inserting, collation)?;
                }
                Ok(out)
            }
        }
    }

    /// Seed document for an upsert: equality fields of the query.
    pub fn upsert_seed(filter: &MatchExpr) -> Result<Document> {
        let mut seed = Document::new();
        for clause in filter.conjuncts() {
            if let MatchExpr::Field {
                path,
                predicate: Predicate::Eq(value),
            } = clause
            {
                if !path.contains('$') {
                    seed.set_path(path, value.clone())?;
                }
            }
        }
        Ok(seed)
    }
}

fn apply_op(doc: &mut Document, op: &UpdateOp, inserting: bool, collation: Option<&Collation>) -> Result<()> {
    match op {
        UpdateOp::Set(path, value) => doc.set_path(path, value.clone()),
        UpdateOp::SetOnInsert(path, value) => {
            if inserting {
                doc.set_path(path, value.clone())?;
            }
            Ok(())
        }
        UpdateOp::Unset(path) => {
            doc.remove_path(path);
            Ok(())
        }
        UpdateOp::Inc(path, delta) => {
            let next = match doc.get_path(path) {
                None => delta.clone(),
                Some(current) if current.is_number() => arithmetic(Op::Add, current, delta)?,
                Some(current) => {
                    return Err(QuarryError::TypeMismatch(format!(
                        "cannot apply $inc to a value of non-numeric type {}",
                        current.type_name()
                    )))
                }
            };
            doc.set_path(path, next)
        }
        UpdateOp::Push { path, values } => {
            let mut items = existing_array(doc, path, "$push")?;
            items.extend(values.iter().cloned());
            doc.set_path(path, Value::Array(items))
        }
        UpdateOp::AddToSet { path, values } => {
            let mut items = existing_array(doc, path, "$addToSet")?;
            for value in values {
                if !items.iter().any(|i| compare_values(i, value, collation) == Ordering::Equal) {
                    items.push(value.clone());
                }
            }
            doc.set_path(path, Value::Array(items))
        }
    }
}

fn existing_array(doc: &Document, path: &str, op: &str) -> Result<Vec<Value>> {
    match doc.get_path(path) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(QuarryError::BadValue(format!(
            "the field '{}' must be an array for {} but is of type {}",
            path,
            op,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::query::matcher::parse_filter;

    #[test]
    fn test_operator_update() {
        let spec = UpdateSpec::parse(&doc!({
            "$set": {"a.b": 1},
            "$inc": {"n": 2},
            "$push": {"tags": {"$each": ["x", "y"]}},
            "$unset": {"gone": ""}
        }))
        .unwrap();
        let out = spec.apply(&doc!({"_id": 1, "n": 1, "gone": true, "tags": ["w"]}), false, None).unwrap();
        assert_eq!(out, doc!({"_id": 1, "n": 3, "tags": ["w", "x", "y"], "a": {"b": 1}}));
    }

    #[test]
    fn test_inc_on_string_fails() {
        let spec = UpdateSpec::parse(&doc!({"$inc": {"s": 1}})).unwrap();
        assert!(spec.apply(&doc!({"s": "x"}), false, None).is_err());
        assert!(UpdateSpec::parse(&doc!({"$inc": {"s": "1"}})).is_err());
    }

    #[test]
    fn test_conflicting_paths_rejected() {
        assert!(UpdateSpec::parse(&doc!({"$set": {"a": 1}, "$inc": {"a.b": 1}})).is_err());
        assert!(UpdateSpec::parse(&doc!({"$rename": {"a": "b"}})).is_err());
    }

    #[test]
    fn test_replacement_keeps_id() {
        let spec = UpdateSpec::parse(&doc!({"x": 5})).unwrap();
        let out = spec.apply(&doc!({"_id": 7, "y": 1}), false, None).unwrap();
        assert_eq!(out, doc!({"_id": 7, "x": 5}));
    }

    #[test]
    fn test_upsert_seed_and_set_on_insert() {
        let filter = parse_filter(&doc!({"k": "a", "n": {"$gt": 3}})).unwrap();
        let seed = UpdateSpec::upsert_seed(&filter).unwrap();
        assert_eq!(seed, doc!({"k": "a"}));
        let spec = UpdateSpec::parse(&doc!({"$setOnInsert": {"created": true}})).unwrap();
        assert_eq!(spec.apply(&seed, true, None).unwrap(), doc!({"k": "a", "created": true}));
        assert_eq!(spec.apply(&seed, false, None).unwrap(), doc!({"k": "a"}));
    }
}
