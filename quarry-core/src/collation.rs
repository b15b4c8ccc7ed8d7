// quarry-core/src/collation.rs
//! String comparison rules.
//!
//! `simple` compares strings by their UTF-8 bytes. Any other locale compares
//! through a comparison key: case folded at strength 1 and 2, with lower case
//! ordered before upper case as a tie-break at strength 3 and above, and with
//! digit runs compared by numeric value when `numericOrdering` is set.
//!
//! Comparison keys are plain strings whose byte order equals the collated
//! order, so collated values can be stored in ordered indexes and hash tables.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::value::Value;

const SIMPLE_LOCALE: &str = "simple";

/// Separates the primary key from the case tie-break in a comparison key.
const LEVEL_SEPARATOR: char = '\u{0}';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    pub strength: u8,
    pub numeric_ordering: bool,
    pub case_level: bool,
}

impl Default for Collation {
    fn default() -> Self {
        Collation::simple()
    }
}

impl Collation {
    pub fn simple() -> Self {
        Collation {
            locale: SIMPLE_LOCALE.to_string(),
            strength: 3,
            numeric_ordering: false,
            case_level: false,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.locale == SIMPLE_LOCALE
    }

    /// Parse a collation document such as `{locale: "en_US", numericOrdering: true}`.
    pub fn from_document(spec: &Document) -> Result<Self> {
        let mut collation = Collation::simple();
        let mut saw_locale = false;
        for (key, value) in spec.iter() {
            match key.as_str() {
                "locale" => {
                    collation.locale = value
                        .as_str()
                        .ok_or_else(|| QuarryError::TypeMismatch("collation locale must be a string".into()))?
                        .to_string();
                    saw_locale = true;
                }
                "strength" => {
                    let strength = value
                        .as_i64()
                        .ok_or_else(|| QuarryError::TypeMismatch("collation strength must be a number".into()))?;
                    if !(1..=5).contains(&strength) {
                        return Err(QuarryError::BadValue(format!(
                            "collation strength must be between 1 and 5, got {}",
                            strength
                        )));
                    }
                    collation.strength = strength as u8;
                }
                "numericOrdering" => collation.numeric_ordering = bool_option(key, value)?,
                "caseLevel" => collation.case_level = bool_option(key, value)?,
                // Accepted for compatibility; they do not change ordering here.
                "caseFirst" | "alternate" | "maxVariable" | "normalization" | "backwards"
                | "version" => {}
                other => {
                    return Err(QuarryError::BadValue(format!(
                        "unknown collation option '{}'",
                        other
                    )))
                }
            }
        }
        if !saw_locale {
            return Err(QuarryError::BadValue("collation must specify a locale".into()));
        }
        if collation.is_simple() && (collation.numeric_ordering || collation.strength != 3) {
            return Err(QuarryError::BadValue(
                "the simple locale does not accept other collation options".into(),
            ));
        }
        Ok(collation)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Document(doc) => Collation::from_document(doc),
            other => Err(QuarryError::TypeMismatch(format!(
                "collation must be an object, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("locale", self.locale.clone());
        if !self.is_simple() {
            doc.insert("strength", self.strength as i32);
            doc.insert("numericOrdering", self.numeric_ordering);
            doc.insert("caseLevel", self.case_level);
        }
        doc
    }

    pub fn compare_str(&self, a: &str, b: &str) -> Ordering {
        if self.is_simple() {
            a.as_bytes().cmp(b.as_bytes())
        } else {
            self.string_key(a).cmp(&self.string_key(b))
        }
    }

    /// Comparison key whose byte order is this collation's order.
    pub fn string_key(&self, s: &str) -> String {
        if self.is_simple() {
            return s.to_string();
        }
        let mut key = String::with_capacity(s.len() + 4);
        let folded = s.to_lowercase();
        if self.numeric_ordering {
            push_numeric_runs(&mut key, &folded);
        } else {
            key.push_str(&folded);
        }
        if self.strength >= 3 || self.case_level {
            key.push(LEVEL_SEPARATOR);
            for c in s.chars() {
                key.push(if c.is_uppercase() { '1' } else { '0' });
            }
        }
        key
    }

    /// Replace every string inside `value` by its comparison key.
    pub fn comparison_key(&self, value: &Value) -> Value {
        if self.is_simple() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.string_key(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.comparison_key(v)).collect()),
            Value::Document(doc) => Value::Document(
                doc.iter()
                    .map(|(k, v)| (k.clone(), self.comparison_key(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn bool_option(key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| QuarryError::TypeMismatch(format!("collation {} must be a boolean", key)))
}

/// Encode each ASCII digit run as a length marker followed by the digits
/// without leading zeros, so shorter numbers sort first.
fn push_numeric_runs(key: &mut String, s: &str) {
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if !c.is_ascii_digit() {
            key.push(c);
            continue;
        }
        let mut digits = String::new();
        digits.push(c);
        while let Some(&next) = chars.peek() {
            if !next.is_ascii_digit() {
                break;
            }
            digits.push(next);
            chars.next();
        }
        let trimmed = digits.trim_start_matches('0');
        let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
        let marker = 0x01 + trimmed.len().min(0x1E) as u32;
        key.push(char::from_u32(marker).unwrap_or('\u{1F}'));
        key.push_str(trimmed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn numeric() -> Collation {
        Collation::from_document(&doc!({"locale": "en_US", "numericOrdering": true})).unwrap()
    }

    #[test]
    fn test_simple_is_binary() {
        let c = Collation::simple();
        assert_eq!(c.compare_str("B", "a"), Ordering::Less);
        assert_eq!(c.compare_str("10", "9"), Ordering::Less);
    }

    #[test]
    fn test_numeric_ordering() {
        let c = numeric();
        assert_eq!(c.compare_str("9", "10"), Ordering::Less);
        assert_eq!(c.compare_str("100", "50"), Ordering::Greater);
        assert_eq!(c.compare_str("a2", "a10"), Ordering::Less);
    }

    #[test]
    fn test_case_insensitive_strength() {
        let c = Collation::from_document(&doc!({"locale": "fr", "strength": 2})).unwrap();
        assert_eq!(c.compare_str("ABC", "abc"), Ordering::Equal);
        assert_eq!(c.string_key("Hello"), c.string_key("hELLO"));
    }

    #[test]
    fn test_tertiary_orders_lower_before_upper() {
        let c = Collation::from_document(&doc!({"locale": "en"})).unwrap();
        assert_eq!(c.compare_str("a", "A"), Ordering::Less);
        assert_eq!(c.compare_str("A", "b"), Ordering::Less);
    }

    #[test]
    fn test_rejects_bad_specs() {
        assert!(Collation::from_document(&doc!({"strength": 2})).is_err());
        assert!(Collation::from_document(&doc!({"locale": "en", "strength": 9})).is_err());
        assert!(Collation::from_document(&doc!({"locale": "en", "bogus": 1})).is_err());
        assert!(Collation::from_document(&doc!({"locale": "simple", "numericOrdering": true})).is_err());
    }

    #[test]
    fn test_comparison_key_recurses() {
        let c = Collation::from_document(&doc!({"locale": "en", "strength": 1})).unwrap();
        let a = c.comparison_key(&Value::Array(vec!["X".into(), Value::Int32(1)]));
        let b = c.comparison_key(&Value::Array(vec!["x".into(), Value::Int32(1)]));
        assert_eq!(a, b);
    }
}
