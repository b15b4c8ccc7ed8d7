// quarry-core/src/index/keygen.rs
// Key extraction: one key per array expansion point.

use std::collections::BTreeSet;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::value::Value;

use super::key::{IndexKey, KeyPart, KeyPattern};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedKeys {
    /// Distinct keys in ascending order.
    pub keys: Vec<IndexKey>,
    /// Whether any keyed path went through an array.
    pub multikey: bool,
}

#[derive(Default)]
struct PathValues {
    values: Vec<Value>,
    through_array: bool,
    present: bool,
}

fn collect(value: &Value, parts: &[&str], out: &mut PathValues) {
    let Some((head, rest)) = parts.split_first() else {
        out.present = true;
        match value {
            Value::Array(items) => {
                out.through_array = true;
                if items.is_empty() {
                    out.values.push(Value::Array(Vec::new()));
                } else {
                    out.values.extend(items.iter().cloned());
                }
            }
            other => out.values.push(other.clone()),
        }
        return;
    };
    match value {
        Value::Document(doc) => match doc.get(head) {
            Some(inner) => collect(inner, rest, out),
            None => out.values.push(Value::Null),
        },
        Value::Array(items) => {
            if let Ok(position) = head.parse::<usize>() {
                match items.get(position) {
                    Some(inner) => collect(inner, rest, out),
                    None => out.values.push(Value::Null),
                }
                return;
            }
            out.through_array = true;
            if items.is_empty() {
                out.values.push(Value::Null);
            }
            for item in items {
                match item {
                    Value::Document(_) => collect(item, parts, out),
                    _ => out.values.push(Value::Null),
                }
            }
        }
        _ => out.values.push(Value::Null),
    }
}

/// Values a dotted path reaches, expanding arrays along the way, and whether
/// an array was traversed.
pub fn path_values(doc: &Document, path: &str) -> (Vec<Value>, bool) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = PathValues::default();
    collect(&Value::Document(doc.clone()), &parts, &mut out);
    (out.values, out.through_array)
}

pub fn generate_keys(
    doc: &Document,
    pattern: &KeyPattern,
    sparse: bool,
    collation: Option<&Collation>,
) -> Result<GeneratedKeys> {
    let mut per_field: Vec<Vec<Value>> = Vec::with_capacity(pattern.len());
    let mut array_fields: Vec<&str> = Vec::new();
    let mut any_present = false;

    for (field, _) in pattern.fields() {
        let parts: Vec<&str> = field.split('.').collect();
        let mut out = PathValues::default();
        match doc.get(parts[0]) {
            Some(top) => collect(top, &parts[1..], &mut out),
            None => out.values.push(Value::Null),
        }
        if out.through_array {
            array_fields.push(field);
        }
        any_present |= out.present;
        let mut values = out.values;
        if let Some(collation) = collation {
            values = values.iter().map(|v| collation.comparison_key(v)).collect();
        }
        values.sort();
        values.dedup();
        per_field.push(values);
    }

    if sparse && !any_present {
        return Ok(GeneratedKeys::default());
    }
    if array_fields.len() > 1 {
        return Err(QuarryError::new(
            ErrorCode::CannotIndexParallelArrays,
            format!(
                "cannot index parallel arrays [{}] [{}]",
                array_fields[0], array_fields[1]
            ),
        ));
    }

    let mut keys: BTreeSet<IndexKey> = BTreeSet::new();
    let mut partial: Vec<Vec<KeyPart>> = vec![Vec::with_capacity(pattern.len())];
    for ((_, direction), values) in pattern.fields().iter().zip(per_field) {
        let mut next = Vec::with_capacity(partial.len() * values.len());
        for prefix in &partial {
            for value in &values {
                let mut key = prefix.clone();
                key.push(KeyPart::new(value.clone(), *direction));
                next.push(key);
            }
        }
        partial = next;
    }
    keys.extend(partial.into_iter().map(IndexKey));

    Ok(GeneratedKeys {
        keys: keys.into_iter().collect(),
        multikey: !array_fields.is_empty(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::index::key::Direction;

    fn pattern(spec: Document) -> KeyPattern {
        KeyPattern::parse(&spec).unwrap()
    }

    fn firsts(keys: &GeneratedKeys) -> Vec<Value> {
        keys.keys.iter().map(|k| k.first().cloned().unwrap()).collect()
    }

    #[test]
    fn test_scalar_and_missing() {
        let p = pattern(doc!({"a": 1}));
        let keys = generate_keys(&doc!({"a": 5}), &p, false, None).unwrap();
        assert_eq!(firsts(&keys), vec![Value::Int32(5)]);
        assert!(!keys.multikey);

        let keys = generate_keys(&doc!({"b": 5}), &p, false, None).unwrap();
        assert_eq!(firsts(&keys), vec![Value::Null]);
        assert!(generate_keys(&doc!({"b": 5}), &p, true, None).unwrap().keys.is_empty());
    }

    #[test]
    fn test_array_expansion_is_multikey() {
        let p = pattern(doc!({"a": 1}));
        let keys = generate_keys(&doc!({"a": [3, 1, 3]}), &p, false, None).unwrap();
        assert_eq!(firsts(&keys), vec![Value::Int32(1), Value::Int32(3)]);
        assert!(keys.multikey);

        let keys = generate_keys(&doc!({"a": []}), &p, false, None).unwrap();
        assert_eq!(firsts(&keys), vec![Value::Array(vec![])]);
        assert!(keys.multikey);
    }

    #[test]
    fn test_nested_path_through_array() {
        let p = pattern(doc!({"a.b": 1}));
        let keys = generate_keys(&doc!({"a": [{"b": 2}, {"c": 1}, {"b": [7, 8]}]}), &p, false, None).unwrap();
        assert_eq!(
            firsts(&keys),
            vec![Value::Null, Value::Int32(2), Value::Int32(7), Value::Int32(8)]
        );
        assert!(keys.multikey);
    }

    #[test]
    fn test_compound_cartesian_and_parallel_arrays() {
        let p = pattern(doc!({"a": 1, "b": -1}));
        let keys = generate_keys(&doc!({"a": [1, 2], "b": "x"}), &p, false, None).unwrap();
        assert_eq!(keys.keys.len(), 2);
        assert_eq!(keys.keys[0].0[1], KeyPart::new(Value::from("x"), Direction::Descending));

        let err = generate_keys(&doc!({"a": [1, 2], "b": [3]}), &p, false, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CannotIndexParallelArrays);
    }

    #[test]
    fn test_collation_keys() {
        let p = pattern(doc!({"s": 1}));
        let collation = Collation::from_document(&doc!({"locale": "en", "strength": 2})).unwrap();
        let a = generate_keys(&doc!({"s": "ABC"}), &p, false, Some(&collation)).unwrap();
        let b = generate_keys(&doc!({"s": "abc"}), &p, false, Some(&collation)).unwrap();
        assert_eq!(a, b);
    }
}
