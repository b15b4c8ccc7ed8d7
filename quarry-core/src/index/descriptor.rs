// quarry-core/src/index/descriptor.rs
// Parsed index specification: key pattern plus options.

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::query::matcher::Matcher;
use crate::value::Value;

use super::key::{IndexKey, KeyPattern};
use super::keygen::{generate_keys, GeneratedKeys};

pub const ID_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub pattern: KeyPattern,
    pub unique: bool,
    pub sparse: bool,
    pub partial_filter: Option<Document>,
    partial_matcher: Option<Matcher>,
    pub collation: Option<Collation>,
}

impl IndexDescriptor {
    /// The mandatory unique `_id` index.
    pub fn id_index(collation: Option<&Collation>) -> Self {
        IndexDescriptor {
            name: ID_INDEX_NAME.to_string(),
            pattern: KeyPattern::id(),
            unique: true,
            sparse: false,
            partial_filter: None,
            partial_matcher: None,
            collation: collation.filter(|c| !c.is_simple()).cloned(),
        }
    }

    /// Parse one entry of `createIndexes.indexes`. Indexes without an
    /// explicit collation inherit the collection default.
    pub fn from_spec(spec: &Document, default_collation: Option<&Collation>) -> Result<Self> {
        let mut pattern = None;
        let mut name = None;
        let mut unique = false;
        let mut sparse = false;
        let mut partial_filter = None;
        let mut collation = default_collation.cloned();

        for (field, value) in spec.iter() {
            match field.as_str() {
                "key" => {
                    let doc = value
                        .as_document()
                        .ok_or_else(|| QuarryError::TypeMismatch("index 'key' must be an object".into()))?;
                    pattern = Some(KeyPattern::parse(doc)?);
                }
                "name" => {
                    let s = value
                        .as_str()
                        .ok_or_else(|| QuarryError::TypeMismatch("index 'name' must be a string".into()))?;
                    if s.is_empty() {
                        return Err(QuarryError::BadValue("index name must not be empty".into()));
                    }
                    name = Some(s.to_string());
                }
                "unique" => unique = value.truthy(),
                "sparse" => sparse = value.truthy(),
                "partialFilterExpression" => {
                    let doc = value.as_document().ok_or_else(|| {
                        QuarryError::TypeMismatch("partialFilterExpression must be an object".into())
                    })?;
                    partial_filter = Some(doc.clone());
                }
                "collation" => {
                    let parsed = Collation::from_value(value)?;
                    collation = (!parsed.is_simple()).then_some(parsed);
                }
                "v" | "background" => {}
                other => {
                    return Err(QuarryError::InvalidOptions(format!(
                        "the field '{}' is not valid for an index specification",
                        other
                    )))
                }
            }
        }

        let pattern = pattern.ok_or_else(|| {
            QuarryError::new(ErrorCode::FailedToParse, "index specification must contain 'key'")
        })?;
        if pattern.is_id() {
            if partial_filter.is_some() || sparse {
                return Err(QuarryError::InvalidOptions(
                    "the _id index cannot be sparse or partial".into(),
                ));
            }
            unique = true;
        }
        if partial_filter.is_some() && sparse {
            return Err(QuarryError::InvalidOptions(
                "cannot mix 'partialFilterExpression' and 'sparse'".into(),
            ));
        }
        let name = match name {
            Some(name) => name,
            None if pattern.is_id() => ID_INDEX_NAME.to_string(),
            None => pattern.default_name(),
        };
        let partial_matcher = match &partial_filter {
            Some(filter) => Some(Matcher::new(filter, collation.as_ref())?),
            None => None,
        };
        Ok(IndexDescriptor {
            name,
            pattern,
            unique,
            sparse,
            partial_filter,
            partial_matcher,
            collation,
        })
    }

    pub fn is_id(&self) -> bool {
        self.name == ID_INDEX_NAME
    }

    pub fn is_partial(&self) -> bool {
        self.partial_filter.is_some()
    }

    pub fn to_spec(&self) -> Document {
        let mut spec = Document::new();
        spec.insert("v", Value::Int32(2));
        spec.insert("key", self.pattern.to_document());
        spec.insert("name", self.name.as_str());
        if self.unique && !self.is_id() {
            spec.insert("unique", true);
        }
        if self.sparse {
            spec.insert("sparse", true);
        }
        if let Some(filter) = &self.partial_filter {
            spec.insert("partialFilterExpression", filter.clone());
        }
        if let Some(collation) = &self.collation {
            spec.insert("collation", collation.to_document());
        }
        spec
    }

    /// Whether `doc` belongs in a partial index.
    pub fn should_index(&self, doc: &Document) -> Result<bool> {
        match &self.partial_matcher {
            Some(matcher) => matcher.matches(doc),
            None => Ok(true),
        }
    }

    /// Keys for `doc`, empty when the document falls outside the partial
    /// filter.
    pub fn keys(&self, doc: &Document) -> Result<GeneratedKeys> {
        if !self.should_index(doc)? {
            return Ok(GeneratedKeys::default());
        }
        generate_keys(doc, &self.pattern, self.sparse, self.collation.as_ref())
    }

    pub fn describe_key(&self, key: &IndexKey) -> String {
        key.describe(&self.pattern)
    }

    fn same_options(&self, other: &IndexDescriptor) -> bool {
        self.unique == other.unique
            && self.sparse == other.sparse
            && self.partial_filter == other.partial_filter
            && self.collation == other.collation
    }

    /// Decide how a requested index relates to an existing one: `Ok(true)`
    /// when it already exists, `Ok(false)` when unrelated, an error when the
    /// two conflict.
    pub fn check_against(&self, existing: &IndexDescriptor) -> Result<bool> {
        let same_name = self.name == existing.name;
        let same_key = self.pattern == existing.pattern;
        match (same_name, same_key) {
            (true, true) if self.same_options(existing) => Ok(true),
            (true, _) => Err(QuarryError::new(
                ErrorCode::IndexOptionsConflict,
                format!(
                    "an index named '{}' already exists with a different specification",
                    existing.name
                ),
            )),
            (false, true) if self.collation == existing.collation && self.partial_filter == existing.partial_filter => {
                Err(QuarryError::new(
                    ErrorCode::IndexOptionsConflict,
                    format!(
                        "index with key {} already exists with a different name: {}",
                        existing.pattern.to_document(),
                        existing.name
                    ),
                ))
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_parse_defaults_and_round_trip() {
        let desc = IndexDescriptor::from_spec(&doc!({"key": {"a": 1, "b": -1}, "unique": true}), None).unwrap();
        assert_eq!(desc.name, "a_1_b_-1");
        assert!(desc.unique);
        let again = IndexDescriptor::from_spec(&desc.to_spec(), None).unwrap();
        assert!(again.check_against(&desc).unwrap());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = IndexDescriptor::from_spec(&doc!({"key": {"a": 1}, "bogus": 1}), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOptions);
        let err = IndexDescriptor::from_spec(&doc!({"name": "x"}), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedToParse);
    }

    #[test]
    fn test_partial_filter_skips_documents() {
        let desc = IndexDescriptor::from_spec(
            &doc!({"key": {"a": 1}, "partialFilterExpression": {"b": {"$gt": 5}}}),
            None,
        )
        .unwrap();
        assert!(desc.keys(&doc!({"a": 1, "b": 1})).unwrap().keys.is_empty());
        assert_eq!(desc.keys(&doc!({"a": 1, "b": 9})).unwrap().keys.len(), 1);
    }

    #[test]
    fn test_conflicts() {
        let existing = IndexDescriptor::from_spec(&doc!({"key": {"a": 1}}), None).unwrap();
        let renamed = IndexDescriptor::from_spec(&doc!({"key": {"a": 1}, "name": "other"}), None).unwrap();
        assert_eq!(renamed.check_against(&existing).unwrap_err().code(), ErrorCode::IndexOptionsConflict);
        let unique = IndexDescriptor::from_spec(&doc!({"key": {"a": 1}, "unique": true}), None).unwrap();
        assert_eq!(unique.check_against(&existing).unwrap_err().code(), ErrorCode::IndexOptionsConflict);
        let unrelated = IndexDescriptor::from_spec(&doc!({"key": {"b": 1}}), None).unwrap();
        assert!(!unrelated.check_against(&existing).unwrap());
    }
}
