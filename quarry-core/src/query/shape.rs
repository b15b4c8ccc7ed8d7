// quarry-core/src/query/shape.rs
// Query shapes: the filter/sort/projection skeleton with literals abstracted.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::collation::Collation;
use crate::document::Document;
use crate::value::Value;

use super::operators::is_field_operator;

/// Normalized description of a query, used as the plan cache key. Two
/// queries differing only in their literal values share a shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryShape {
    pub ns: String,
    key: String,
}

impl QueryShape {
    pub fn new(
        ns: &str,
        command: &str,
        filter: &Document,
        sort: Option<&Document>,
        projection: Option<&Document>,
        collation: Option<&Collation>,
    ) -> Self {
        let mut key = String::with_capacity(64);
        key.push_str(command);
        key.push('|');
        push_filter(&mut key, filter);
        if let Some(sort) = sort {
            key.push_str("|sort");
            key.push_str(&sort.to_string());
        }
        if let Some(projection) = projection {
            key.push_str("|proj");
            push_projection(&mut key, projection);
        }
        if let Some(collation) = collation.filter(|c| !c.is_simple()) {
            key.push_str("|coll");
            key.push_str(&collation.to_document().to_string());
        }
        QueryShape { ns: ns.to_string(), key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Short stable hash shown in explain output.
    pub fn hash_hex(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.ns.hash(&mut hasher);
        self.key.hash(&mut hasher);
        format!("{:08X}", hasher.finish() as u32)
    }
}

fn push_filter(out: &mut String, filter: &Document) {
    let mut fields: Vec<(&String, &Value)> = filter.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (i, (name, value)) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(name);
        out.push(':');
        match name.as_str() {
            "$and" | "$or" | "$nor" => match value {
                Value::Array(clauses) => {
                    let mut parts: Vec<String> = clauses
                        .iter()
                        .map(|c| {
                            let mut s = String::new();
                            match c {
                                Value::Document(d) => push_filter(&mut s, d),
                                _ => s.push('?'),
                            }
                            s
                        })
                        .collect();
                    parts.sort();
                    out.push('[');
                    out.push_str(&parts.join(","));
                    out.push(']');
                }
                _ => out.push('?'),
            },
            "$expr" => out.push_str(&value.to_string()),
            _ => push_condition(out, value),
        }
    }
    out.push('}');
}

fn push_condition(out: &mut String, value: &Value) {
    match value {
        Value::Document(doc) if doc.keys().next().map(|k| is_field_operator(k)).unwrap_or(false) => {
            let mut ops: Vec<(&String, &Value)> = doc.iter().collect();
            ops.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (op, arg)) in ops.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(op);
                out.push(':');
                match (op.as_str(), arg) {
                    ("$elemMatch", Value::Document(inner)) => push_filter(out, inner),
                    ("$not", Value::Document(_)) => push_condition(out, arg),
                    // Regex options change which plans are eligible.
                    ("$options", Value::String(s)) => out.push_str(s),
                    ("$in" | "$nin", Value::Array(items)) => {
                        out.push('[');
                        if items.iter().any(|v| matches!(v, Value::Document(d) if d.contains_key("$regex"))) {
                            out.push('/');
                        }
                        out.push(']');
                    }
                    _ => out.push('?'),
                }
            }
            out.push('}');
        }
        _ => out.push('?'),
    }
}

fn push_projection(out: &mut String, projection: &Document) {
    let mut fields: Vec<(&String, &Value)> = projection.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (name, value) in fields {
        out.push_str(name);
        out.push(':');
        match value {
            v if v.is_number() || matches!(v, Value::Bool(_)) => out.push(if v.truthy() { '1' } else { '0' }),
            other => out.push_str(&other.to_string()),
        }
        out.push(',');
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn shape(filter: Document) -> QueryShape {
        QueryShape::new("test.c", "find", &filter, None, None, None)
    }

    #[test]
    fn test_literals_are_abstracted() {
        assert_eq!(shape(doc!({"a": 1, "b": {"$gt": 5}})), shape(doc!({"b": {"$gt": 99}, "a": "x"})));
        assert_ne!(shape(doc!({"a": 1})), shape(doc!({"a": {"$gt": 1}})));
    }

    #[test]
    fn test_sort_and_collation_distinguish_shapes() {
        let filter = doc!({"a": 1});
        let plain = QueryShape::new("test.c", "find", &filter, None, None, None);
        let sorted = QueryShape::new("test.c", "find", &filter, Some(&doc!({"b": 1})), None, None);
        assert_ne!(plain, sorted);
        let collation = Collation::from_document(&doc!({"locale": "en", "strength": 2})).unwrap();
        let collated = QueryShape::new("test.c", "find", &filter, None, None, Some(&collation));
        assert_ne!(plain, collated);
        assert_eq!(plain.hash_hex().len(), 8);
    }
}
