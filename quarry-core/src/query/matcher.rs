// quarry-core/src/query/matcher.rs
//! Filter documents and their evaluation.
//!
//! A filter is parsed into a [`MatchExpr`] tree. Top-level `$and`, `$or`,
//! `$nor` and `$expr` become logical nodes; every `{field: ...}` entry
//! becomes one `Field` node per operator, ANDed together.

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::pipeline::expression::{Expression, Variables};
use crate::value::Value;

use super::operators::{parse_operator_document, Candidate, Predicate, QueryRegex};

#[derive(Debug, Clone)]
pub enum MatchExpr {
    And(Vec<MatchExpr>),
    Or(Vec<MatchExpr>),
    Nor(Vec<MatchExpr>),
    Field { path: String, predicate: Predicate },
    Expr(Expression),
    AlwaysTrue,
}

/// Parse a filter document.
pub fn parse_filter(filter: &Document) -> Result<MatchExpr> {
    let mut clauses = Vec::with_capacity(filter.len());
    for (key, value) in filter.iter() {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let items = value
                    .as_array()
                    .filter(|items| !items.is_empty())
                    .ok_or_else(|| QuarryError::BadValue(format!("{} must be a nonempty array", key)))?;
                let mut children = Vec::with_capacity(items.len());
                for item in items {
                    let doc = item.as_document().ok_or_else(|| {
                        QuarryError::BadValue(format!("{} argument's entries must be objects", key))
                    })?;
                    children.push(parse_filter(doc)?);
                }
                clauses.push(match key.as_str() {
                    "$and" => MatchExpr::And(children),
                    "$or" => MatchExpr::Or(children),
                    _ => MatchExpr::Nor(children),
                });
            }
            "$expr" => clauses.push(MatchExpr::Expr(Expression::parse(value)?)),
            "$comment" => {}
            "$where" => return Err(QuarryError::BadValue("$where is not supported".into())),
            other if other.starts_with('$') => {
                return Err(QuarryError::BadValue(format!("unknown top level operator: {}", other)))
            }
            path => parse_field(path, value, &mut clauses)?,
        }
    }
    Ok(match clauses.len() {
        0 => MatchExpr::AlwaysTrue,
        1 => clauses.pop().unwrap_or(MatchExpr::AlwaysTrue),
        _ => MatchExpr::And(clauses),
    })
}

fn parse_field(path: &str, value: &Value, out: &mut Vec<MatchExpr>) -> Result<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(QuarryError::BadValue(format!("invalid field path '{}'", path)));
    }
    let operator_doc = match value {
        Value::Document(doc) => doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false),
        _ => false,
    };
    if !operator_doc {
        out.push(MatchExpr::Field {
            path: path.to_string(),
            predicate: Predicate::Eq(value.clone()),
        });
        return Ok(());
    }
    if let Some(regex) = QueryRegex::from_value(value)? {
        let rest = value
            .as_document()
            .map(|doc| {
                doc.iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "$regex" | "$options"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Document>()
            })
            .unwrap_or_default();
        out.push(MatchExpr::Field {
            path: path.to_string(),
            predicate: Predicate::Regex(regex),
        });
        for predicate in parse_operator_document(&rest)? {
            out.push(MatchExpr::Field {
                path: path.to_string(),
                predicate,
            });
        }
        return Ok(());
    }
    if let Value::Document(doc) = value {
        for predicate in parse_operator_document(doc)? {
            out.push(MatchExpr::Field {
                path: path.to_string(),
                predicate,
            });
        }
    }
    Ok(())
}

// ========== CANDIDATE TRAVERSAL ==========

const MISSING: Candidate<'static> = Candidate {
    value: None,
    element: false,
};

/// Every value `path` reaches in `doc`. Arrays of documents along the path
/// are traversed element-wise, numeric components also index positionally,
/// and a terminal array contributes itself plus its elements.
pub fn candidates<'a>(doc: &'a Document, path: &str) -> Vec<Candidate<'a>> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    match doc.get(parts[0]) {
        Some(value) => walk(value, &parts[1..], &mut out),
        None => out.push(MISSING),
    }
    if out.is_empty() {
        out.push(MISSING);
    }
    out
}

fn walk<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<Candidate<'a>>) {
    let Some((head, tail)) = rest.split_first() else {
        out.push(Candidate {
            value: Some(value),
            element: false,
        });
        if let Value::Array(items) = value {
            out.extend(items.iter().map(|item| Candidate {
                value: Some(item),
                element: true,
            }));
        }
        return;
    };
    match value {
        Value::Document(doc) => match doc.get(head) {
            Some(inner) => walk(inner, tail, out),
            None => out.push(MISSING),
        },
        Value::Array(items) => {
            if let Ok(position) = head.parse::<usize>() {
                if let Some(item) = items.get(position) {
                    walk(item, tail, out);
                }
            }
            let mut saw_document = false;
            for item in items {
                if let Value::Document(_) = item {
                    saw_document = true;
                    walk(item, rest, out);
                }
            }
            if !saw_document {
                out.push(MISSING);
            }
        }
        _ => out.push(MISSING),
    }
}

// ========== EVALUATION ==========

impl MatchExpr {
    pub fn evaluate(&self, doc: &Document, collation: Option<&Collation>, vars: Option<&Variables>) -> Result<bool> {
        match self {
            MatchExpr::AlwaysTrue => Ok(true),
            MatchExpr::And(children) => {
                for child in children {
                    if !child.evaluate(doc, collation, vars)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchExpr::Or(children) => {
                for child in children {
                    if child.evaluate(doc, collation, vars)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            MatchExpr::Nor(children) => {
                for child in children {
                    if child.evaluate(doc, collation, vars)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchExpr::Field { path, predicate } => predicate.matches(&candidates(doc, path), collation),
            MatchExpr::Expr(expr) => {
                let value = match vars {
                    Some(vars) => expr.evaluate(doc, vars)?,
                    None => expr.evaluate(doc, &Variables::new(collation.cloned()))?,
                };
                Ok(value.truthy())
            }
        }
    }

    /// Top-level conjuncts.
    pub fn conjuncts(&self) -> Vec<&MatchExpr> {
        match self {
            MatchExpr::And(children) => children.iter().flat_map(MatchExpr::conjuncts).collect(),
            MatchExpr::AlwaysTrue => Vec::new(),
            other => vec![other],
        }
    }

    pub fn contains_expr(&self) -> bool {
        match self {
            MatchExpr::Expr(_) => true,
            MatchExpr::And(c) | MatchExpr::Or(c) | MatchExpr::Nor(c) => c.iter().any(MatchExpr::contains_expr),
            MatchExpr::Field { predicate, .. } => matches!(predicate, Predicate::ElemMatchObject(e) if e.contains_expr()),
            MatchExpr::AlwaysTrue => false,
        }
    }
}

/// A parsed filter bound to a collation.
#[derive(Debug, Clone)]
pub struct Matcher {
    filter: Document,
    expr: MatchExpr,
    collation: Option<Collation>,
}

impl Matcher {
    pub fn new(filter: &Document, collation: Option<&Collation>) -> Result<Self> {
        Ok(Matcher {
            filter: filter.clone(),
            expr: parse_filter(filter)?,
            collation: collation.filter(|c| !c.is_simple()).cloned(),
        })
    }

    pub fn filter(&self) -> &Document {
        &self.filter
    }

    pub fn expr(&self) -> &MatchExpr {
        &self.expr
    }

    pub fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self.expr, MatchExpr::AlwaysTrue)
    }

    pub fn matches(&self, doc: &Document) -> Result<bool> {
        self.expr.evaluate(doc, self.collation.as_ref(), None)
    }

    /// Evaluate with `let` variables in scope for `$expr`.
    pub fn matches_with_vars(&self, doc: &Document, vars: &Variables) -> Result<bool> {
        self.expr.evaluate(doc, self.collation.as_ref(), Some(vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn matches(filter: Document, doc: Document) -> bool {
        Matcher::new(&filter, None).unwrap().matches(&doc).unwrap()
    }

    #[test]
    fn test_equality_reaches_array_elements() {
        assert!(matches(doc!({"tags": "a"}), doc!({"tags": ["b", "a"]})));
        assert!(matches(doc!({"tags": ["b", "a"]}), doc!({"tags": ["b", "a"]})));
        assert!(!matches(doc!({"tags": "c"}), doc!({"tags": ["b", "a"]})));
        assert!(matches(doc!({"items.qty": 5}), doc!({"items": [{"qty": 1}, {"qty": 5}]})));
        assert!(matches(doc!({"items.1.qty": 5}), doc!({"items": [{"qty": 1}, {"qty": 5}]})));
    }

    #[test]
    fn test_null_matches_missing_but_not_empty_array() {
        assert!(matches(doc!({"a": null}), doc!({"b": 1})));
        assert!(matches(doc!({"a": null}), doc!({"a": null})));
        assert!(!matches(doc!({"a": null}), doc!({"a": []})));
        assert!(matches(doc!({"a": {"$exists": true}}), doc!({"a": []})));
    }

    #[test]
    fn test_logical_operators() {
        let doc = doc!({"a": 1, "b": 2});
        assert!(matches(doc!({"$or": [{"a": 5}, {"b": 2}]}), doc.clone()));
        assert!(!matches(doc!({"$nor": [{"a": 1}]}), doc.clone()));
        assert!(matches(doc!({"a": {"$gte": 1, "$lt": 2}, "b": {"$in": [2, 3]}}), doc.clone()));
        assert!(matches(doc!({"a": {"$not": {"$gt": 5}}}), doc.clone()));
        assert!(Matcher::new(&doc!({"$or": []}), None).is_err());
    }

    #[test]
    fn test_elem_match_and_size() {
        let doc = doc!({"scores": [{"s": 3, "t": "x"}, {"s": 9, "t": "y"}], "nums": [1, 7]});
        assert!(matches(doc!({"scores": {"$elemMatch": {"s": {"$gt": 5}, "t": "y"}}}), doc.clone()));
        assert!(!matches(doc!({"scores": {"$elemMatch": {"s": {"$gt": 5}, "t": "x"}}}), doc.clone()));
        assert!(matches(doc!({"nums": {"$elemMatch": {"$gt": 5, "$lt": 8}}}), doc.clone()));
        assert!(matches(doc!({"nums": {"$size": 2}}), doc.clone()));
        assert!(matches(doc!({"nums": {"$all": [7, 1]}}), doc.clone()));
    }

    #[test]
    fn test_regex_and_collation() {
        assert!(matches(doc!({"name": {"$regex": "^ab", "$options": "i"}}), doc!({"name": "ABC"})));
        let collation = Collation::from_document(&doc!({"locale": "en", "strength": 2})).unwrap();
        let matcher = Matcher::new(&doc!({"name": "abc"}), Some(&collation)).unwrap();
        assert!(matcher.matches(&doc!({"name": "ABC"})).unwrap());
    }

    #[test]
    fn test_expr_uses_variables() {
        let matcher = Matcher::new(&doc!({"$expr": {"$eq": ["$k", "$$key"]}}), None).unwrap();
        let vars = Variables::default().bind("key", Value::Int32(4));
        assert!(matcher.matches_with_vars(&doc!({"k": 4}), &vars).unwrap());
        assert!(!matcher.matches_with_vars(&doc!({"k": 5}), &vars).unwrap());
    }

    #[test]
    fn test_rejected_operators() {
        assert!(Matcher::new(&doc!({"$where": "this.a > 1"}), None).is_err());
        assert!(Matcher::new(&doc!({"loc": {"$near": [1, 2]}}), None).is_err());
        assert!(Matcher::new(&doc!({"$comment": "ok", "a": 1}), None).is_ok());
    }
}
