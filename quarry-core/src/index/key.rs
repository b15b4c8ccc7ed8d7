// quarry-core/src/index/key.rs
// Index keys and key patterns.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::value::Value;

/// One component of an index key. Descending components reverse the value
/// order so a single ascending traversal of the tree yields the pattern's
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Asc(Value),
    Desc(Value),
}

impl KeyPart {
    pub fn new(value: Value, direction: Direction) -> Self {
        match direction {
            Direction::Ascending => KeyPart::Asc(value),
            Direction::Descending => KeyPart::Desc(value),
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            KeyPart::Asc(v) | KeyPart::Desc(v) => v,
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Asc(a), KeyPart::Asc(b)) => a.cmp(b),
            (KeyPart::Desc(a), KeyPart::Desc(b)) => b.cmp(a),
            (KeyPart::Asc(_), KeyPart::Desc(_)) => Ordering::Less,
            (KeyPart::Desc(_), KeyPart::Asc(_)) => Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<KeyPart>);

impl IndexKey {
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(KeyPart::value)
    }

    pub fn first(&self) -> Option<&Value> {
        self.0.first().map(KeyPart::value)
    }

    /// Render as `{ field: value, ... }` for error messages.
    pub fn describe(&self, pattern: &KeyPattern) -> String {
        let mut doc = Document::new();
        for ((field, _), part) in pattern.fields().iter().zip(self.0.iter()) {
            doc.insert(field.clone(), part.value().clone());
        }
        doc.to_json().to_string()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.values().map(|v| v.to_string()).collect();
        write!(f, "[{}]", values.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }

    pub fn reverse(self) -> Direction {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

/// Ordered list of `(field path, direction)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<(String, Direction)>,
}

impl KeyPattern {
    pub fn new(fields: Vec<(String, Direction)>) -> Self {
        KeyPattern { fields }
    }

    pub fn id() -> Self {
        KeyPattern::new(vec![("_id".to_string(), Direction::Ascending)])
    }

    pub fn parse(spec: &Document) -> Result<Self> {
        if spec.is_empty() {
            return Err(QuarryError::BadValue("index key pattern must not be empty".into()));
        }
        let mut fields = Vec::with_capacity(spec.len());
        for (field, value) in spec.iter() {
            if field.is_empty() || field.starts_with('$') {
                return Err(QuarryError::BadValue(format!("invalid index key field '{}'", field)));
            }
            let direction = match value.as_f64() {
                Some(d) if d > 0.0 => Direction::Ascending,
                Some(d) if d < 0.0 => Direction::Descending,
                _ => {
                    return Err(QuarryError::BadValue(format!(
                        "unsupported index key value {} for field '{}'",
                        value, field
                    )))
                }
            };
            fields.push((field.clone(), direction));
        }
        Ok(KeyPattern { fields })
    }

    pub fn fields(&self) -> &[(String, Direction)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn first_field(&self) -> &str {
        self.fields.first().map(|(f, _)| f.as_str()).unwrap_or("")
    }

    pub fn position(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|(f, _)| f == field)
    }

    pub fn is_id(&self) -> bool {
        self.fields.len() == 1 && self.fields[0].0 == "_id"
    }

    /// `a_1_b_-1`
    pub fn default_name(&self) -> String {
        self.fields
            .iter()
            .map(|(f, d)| format!("{}_{}", f, d.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        for (field, direction) in &self.fields {
            doc.insert(field.clone(), Value::Int32(direction.as_i32()));
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_descending_parts_reverse_order() {
        let a = IndexKey(vec![KeyPart::Asc(Value::Int32(1)), KeyPart::Desc(Value::Int32(5))]);
        let b = IndexKey(vec![KeyPart::Asc(Value::Int32(1)), KeyPart::Desc(Value::Int32(3))]);
        let c = IndexKey(vec![KeyPart::Asc(Value::Int32(2)), KeyPart::Desc(Value::Int32(9))]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_parse_and_name() {
        let pattern = KeyPattern::parse(&doc!({"a": 1, "b.c": -1})).unwrap();
        assert_eq!(pattern.default_name(), "a_1_b.c_-1");
        assert_eq!(pattern.to_document(), doc!({"a": 1, "b.c": -1}));
        assert!(KeyPattern::parse(&doc!({"a": "text"})).is_err());
        assert!(KeyPattern::parse(&doc!({})).is_err());
    }
}
