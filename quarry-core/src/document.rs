// quarry-core/src/document.rs
//! Ordered documents with dotted-path access.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{QuarryError, Result};
use crate::value::{compare_documents, ObjectId, Value};

/// Ordered mapping of field name to value. Field order is preserved.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

/// Build a [`Document`] from a JSON literal (panics on a non-object literal).
#[macro_export]
macro_rules! doc {
    ($($json:tt)+) => {
        $crate::document::Document::from_json(&serde_json::json!($($json)+))
            .expect("doc! literal must be a JSON object")
    };
}

impl Document {
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Document {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.iter().map(|(k, _)| k)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    /// Set a top-level field, replacing in place or appending. Returns the old value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    /// The `_id` field, if present.
    pub fn id(&self) -> Option<&Value> {
        self.get("_id")
    }

    /// Ensure `_id` exists and is the first field, generating an ObjectId if absent.
    pub fn ensure_id(&mut self) -> Value {
        let id = self.remove("_id").unwrap_or_else(|| Value::ObjectId(ObjectId::new()));
        self.fields.insert(0, ("_id".to_string(), id.clone()));
        id
    }

    // ========== DOTTED PATHS ==========

    /// Strict path lookup. Numeric components index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Document(doc) => doc.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a nested field, creating intermediate documents as needed.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        match path.split_once('.') {
            None => {
                self.insert(path, value);
                Ok(())
            }
            Some((head, rest)) => {
                if !self.contains_key(head) {
                    self.insert(head, Document::new());
                }
                match self.get_mut(head) {
                    Some(Value::Document(inner)) => inner.set_path(rest, value),
                    Some(Value::Array(items)) => {
                        let (index, tail) = match rest.split_once('.') {
                            Some((i, t)) => (i, Some(t)),
                            None => (rest, None),
                        };
                        let index: usize = index.parse().map_err(|_| {
                            QuarryError::BadValue(format!("cannot create field '{}' in array '{}'", index, head))
                        })?;
                        while items.len() <= index {
                            items.push(Value::Null);
                        }
                        match tail {
                            None => {
                                items[index] = value;
                                Ok(())
                            }
                            Some(tail) => {
                                if !matches!(items[index], Value::Document(_)) {
                                    items[index] = Value::Document(Document::new());
                                }
                                match &mut items[index] {
                                    Value::Document(inner) => inner.set_path(tail, value),
                                    _ => unreachable!("element replaced by a document above"),
                                }
                            }
                        }
                    }
                    Some(other) => Err(QuarryError::BadValue(format!(
                        "cannot create field '{}' in element {{{}: {}}}",
                        rest, head, other
                    ))),
                    None => unreachable!("field inserted above"),
                }
            }
        }
    }

    /// Remove a nested field. Missing intermediate fields are not an error.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head)? {
                Value::Document(inner) => inner.remove_path(rest),
                _ => None,
            },
        }
    }

    /// Approximate BSON encoded size.
    pub fn bson_size(&self) -> usize {
        5 + self
            .fields
            .iter()
            .map(|(k, v)| 1 + k.len() + 1 + v.bson_size())
            .sum::<usize>()
    }

    // ========== JSON ==========

    pub fn from_json(json: &JsonValue) -> Result<Document> {
        match json {
            JsonValue::Object(map) => Document::from_json_map(map),
            other => Err(QuarryError::TypeMismatch(format!(
                "expected an object, found {}",
                other
            ))),
        }
    }

    pub fn from_json_map(map: &serde_json::Map<String, JsonValue>) -> Result<Document> {
        let mut doc = Document::with_capacity(map.len());
        for (k, v) in map {
            doc.fields.push((k.clone(), Value::from_json(v)?));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json());
        }
        JsonValue::Object(map)
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        compare_documents(self, other, None) == Ordering::Equal
    }
}

impl Eq for Document {}

impl PartialOrd for Document {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Document {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_documents(self, other, None)
    }
}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fields.len().hash(state);
        for (k, v) in &self.fields {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_preserves_order() {
        let mut doc = Document::new();
        doc.insert("b", 1);
        doc.insert("a", 2);
        doc.insert("b", 3);
        let keys: Vec<_> = doc.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(doc.get("b"), Some(&Value::Int32(3)));
    }

    #[test]
    fn test_ensure_id_moves_to_front() {
        let mut doc = doc!({"x": 1, "_id": 5});
        let id = doc.ensure_id();
        assert_eq!(id, Value::Int32(5));
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));

        let mut fresh = doc!({"x": 1});
        assert!(matches!(fresh.ensure_id(), Value::ObjectId(_)));
    }

    #[test]
    fn test_nested_paths() {
        let mut doc = doc!({"a": {"b": [10, {"c": 1}]}});
        assert_eq!(doc.get_path("a.b.0"), Some(&Value::Int32(10)));
        assert_eq!(doc.get_path("a.b.1.c"), Some(&Value::Int32(1)));
        assert_eq!(doc.get_path("a.x"), None);

        doc.set_path("a.d.e", Value::Bool(true)).unwrap();
        assert_eq!(doc.get_path("a.d.e"), Some(&Value::Bool(true)));
        doc.set_path("a.b.3", Value::Int32(4)).unwrap();
        assert_eq!(doc.get_path("a.b.2"), Some(&Value::Null));

        assert!(doc.set_path("a.b.0.z", Value::Null).is_ok());
        assert_eq!(doc.remove_path("a.d.e"), Some(Value::Bool(true)));
        assert_eq!(doc.remove_path("nope.x"), None);
    }

    #[test]
    fn test_set_path_through_scalar_fails() {
        let mut doc = doc!({"a": 1});
        assert!(doc.set_path("a.b", Value::Null).is_err());
    }

    #[test]
    fn test_bson_size_matches_encoding() {
        // {"a": 1} => 4 (len) + 1 (type) + 2 ("a\0") + 4 (int32) + 1 (terminator)
        assert_eq!(doc!({"a": 1}).bson_size(), 12);
        assert_eq!(Document::new().bson_size(), 5);
    }

    #[test]
    fn test_json_round_trip() {
        let src = json!({"z": 1, "a": [true, null, "s"], "m": {"n": 2.5}});
        assert_eq!(Document::from_json(&src).unwrap().to_json(), src);
        assert!(Document::from_json(&json!([1])).is_err());
    }
}
