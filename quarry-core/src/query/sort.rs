// quarry-core/src/query/sort.rs
// Sort specifications and the sort keys derived from documents.

use std::cmp::Ordering;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::index::{Direction, IndexKey, KeyPart, KeyPattern};
use crate::value::{compare_values, Value};

use super::matcher::candidates;

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    fields: Vec<(String, Direction)>,
}

impl SortSpec {
    pub fn parse(spec: &Document) -> Result<Self> {
        if spec.is_empty() {
            return Err(QuarryError::BadValue("sort specification must not be empty".into()));
        }
        let mut fields = Vec::with_capacity(spec.len());
        for (path, value) in spec.iter() {
            let direction = match value {
                v if v.is_number() && v.as_f64() == Some(1.0) => Direction::Ascending,
                v if v.is_number() && v.as_f64() == Some(-1.0) => Direction::Descending,
                Value::Document(meta) if meta.contains_key("$meta") => {
                    return Err(QuarryError::BadValue(format!("$meta sort on '{}' is not supported", path)))
                }
                other => {
                    return Err(QuarryError::BadValue(format!(
                        "$sort key ordering must be 1 (for ascending) or -1 (for descending), got {} for '{}'",
                        other, path
                    )))
                }
            };
            if path.is_empty() || path.starts_with('$') {
                return Err(QuarryError::BadValue(format!("invalid sort field '{}'", path)));
            }
            fields.push((path.clone(), direction));
        }
        Ok(SortSpec { fields })
    }

    pub fn fields(&self) -> &[(String, Direction)] {
        &self.fields
    }

    pub fn to_document(&self) -> Document {
        self.fields
            .iter()
            .map(|(path, d)| (path.clone(), Value::Int32(d.as_i32())))
            .collect()
    }

    /// Whether scanning an index with `pattern` yields this order, and in
    /// which direction (`true` = forward).
    pub fn provided_by(&self, pattern: &KeyPattern) -> Option<bool> {
        if self.fields.len() > pattern.len() {
            return None;
        }
        let same = self
            .fields
            .iter()
            .zip(pattern.fields())
            .all(|((a, da), (b, db))| a == b && da == db);
        if same {
            return Some(true);
        }
        let reversed = self
            .fields
            .iter()
            .zip(pattern.fields())
            .all(|((a, da), (b, db))| a == b && da.reverse() == *db);
        reversed.then_some(false)
    }

    /// Key whose natural order is this sort's order. Arrays sort by their
    /// smallest element ascending and their largest descending.
    pub fn key(&self, doc: &Document, collation: Option<&Collation>) -> IndexKey {
        IndexKey(
            self.fields
                .iter()
                .map(|(path, direction)| {
                    let value = sort_value(doc, path, *direction, collation);
                    let value = match collation {
                        Some(c) => c.comparison_key(&value),
                        None => value,
                    };
                    KeyPart::new(value, *direction)
                })
                .collect(),
        )
    }

    pub fn compare(&self, a: &Document, b: &Document, collation: Option<&Collation>) -> Ordering {
        self.key(a, collation).cmp(&self.key(b, collation))
    }
}

fn sort_value(doc: &Document, path: &str, direction: Direction, collation: Option<&Collation>) -> Value {
    let found = candidates(doc, path);
    let mut best: Option<&Value> = None;
    let mut saw_array = false;
    for candidate in &found {
        let Some(value) = candidate.value else { continue };
        if let Value::Array(items) = value {
            saw_array = true;
            if !items.is_empty() || candidate.element {
                continue;
            }
        }
        best = match best {
            None => Some(value),
            Some(current) => {
                let ord = compare_values(value, current, collation);
                let better = match direction {
                    Direction::Ascending => ord == Ordering::Less,
                    Direction::Descending => ord == Ordering::Greater,
                };
                Some(if better { value } else { current })
            }
        };
    }
    match best {
        Some(Value::Array(items)) if items.is_empty() => Value::Null,
        Some(value) => value.clone(),
        None if saw_array => Value::Null,
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_array_sorts_by_min_or_max() {
        let asc = SortSpec::parse(&doc!({"a": 1})).unwrap();
        let desc = SortSpec::parse(&doc!({"a": -1})).unwrap();
        let arr = doc!({"a": [5, 1, 9]});
        let four = doc!({"a": 4});
        assert_eq!(asc.compare(&arr, &four, None), Ordering::Less);
        assert_eq!(desc.compare(&arr, &four, None), Ordering::Less);
    }

    #[test]
    fn test_missing_sorts_as_null() {
        let asc = SortSpec::parse(&doc!({"a": 1})).unwrap();
        assert_eq!(asc.compare(&doc!({}), &doc!({"a": null}), None), Ordering::Equal);
        assert_eq!(asc.compare(&doc!({}), &doc!({"a": 0}), None), Ordering::Less);
    }

    #[test]
    fn test_provided_by_index() {
        let spec = SortSpec::parse(&doc!({"a": -1, "b": 1})).unwrap();
        let pattern = KeyPattern::parse(&doc!({"a": 1, "b": -1, "c": 1})).unwrap();
        assert_eq!(spec.provided_by(&pattern), Some(false));
        let other = KeyPattern::parse(&doc!({"b": 1})).unwrap();
        assert_eq!(spec.provided_by(&other), None);
        assert!(SortSpec::parse(&doc!({"a": 2})).is_err());
    }

    #[test]
    fn test_numeric_ordering_collation() {
        let collation = Collation::from_document(&doc!({"locale": "en", "numericOrdering": true})).unwrap();
        let asc = SortSpec::parse(&doc!({"n": 1})).unwrap();
        assert_eq!(asc.compare(&doc!({"n": "10"}), &doc!({"n": "9"}), Some(&collation)), Ordering::Greater);
        assert_eq!(asc.compare(&doc!({"n": "10"}), &doc!({"n": "9"}), None), Ordering::Less);
    }
}
