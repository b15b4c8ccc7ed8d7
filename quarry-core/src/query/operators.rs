// quarry-core/src/query/operators.rs
//! Field-level query operators.
//!
//! ```text
//! { field: { $op: arg, ... } }
//!            │
//!            ▼
//!   OPERATOR_REGISTRY["$op"](arg) ──> Predicate
//! ```
//!
//! A predicate is evaluated against every *candidate* a field path reaches
//! in a document (see `matcher::candidates`): the value itself, and for a
//! terminal array each of its elements.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{QuarryError, Result};
use crate::value::{compare_values, type_rank, Value};

use super::matcher::{parse_filter, MatchExpr};

// ========== REGEX ==========

const REGEX_CACHE_CAPACITY: usize = 100;

lazy_static! {
    /// Compiled patterns keyed by "pattern:options".
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> = Mutex::new(LruCache::new(
        NonZeroUsize::new(REGEX_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN)
    ));
}

/// A regular expression together with the pattern and options it came from.
#[derive(Debug, Clone)]
pub struct QueryRegex {
    pub pattern: String,
    pub options: String,
    regex: Regex,
}

impl QueryRegex {
    pub fn new(pattern: &str, options: &str) -> Result<Self> {
        for c in options.chars() {
            if !matches!(c, 'i' | 'm' | 's' | 'x') {
                return Err(QuarryError::BadValue(format!("invalid flag in regex options: {}", c)));
            }
        }
        let cache_key = format!("{}:{}", pattern, options);
        if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
            return Ok(QueryRegex {
                pattern: pattern.to_string(),
                options: options.to_string(),
                regex: regex.clone(),
            });
        }
        let source = if options.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", options, pattern)
        };
        let regex = Regex::new(&source)
            .map_err(|e| QuarryError::BadValue(format!("invalid regular expression '{}': {}", pattern, e)))?;
        REGEX_CACHE.lock().put(cache_key, regex.clone());
        Ok(QueryRegex {
            pattern: pattern.to_string(),
            options: options.to_string(),
            regex,
        })
    }

    /// `{$regex: "...", $options: "..."}` as a value.
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        let Some(doc) = value.as_document() else {
            return Ok(None);
        };
        match doc.get("$regex") {
            Some(Value::String(pattern)) => {
                let options = match doc.get("$options") {
                    Some(Value::String(o)) => o.as_str(),
                    Some(_) => return Err(QuarryError::BadValue("$options has to be a string".into())),
                    None => "",
                };
                QueryRegex::new(pattern, options).map(Some)
            }
            Some(_) => Err(QuarryError::BadValue("$regex has to be a string".into())),
            None => Ok(None),
        }
    }

    pub fn is_match(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.regex.is_match(s),
            _ => false,
        }
    }

    /// Literal prefix a matching string must start with, if the pattern is
    /// anchored and case sensitive.
    pub fn literal_prefix(&self) -> Option<String> {
        if self.options.contains('i') || self.options.contains('x') {
            return None;
        }
        let rest = self.pattern.strip_prefix('^')?;
        let prefix: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
            .collect();
        (!prefix.is_empty()).then_some(prefix)
    }
}

// ========== CANDIDATES ==========

/// One value a field path reaches. `element` marks values produced by
/// expanding a terminal array.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub value: Option<&'a Value>,
    pub element: bool,
}

// ========== PREDICATES ==========

#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In { values: Vec<Value>, regexes: Vec<QueryRegex> },
    Nin { values: Vec<Value>, regexes: Vec<QueryRegex> },
    Exists(bool),
    /// Type codes; `"number"` expands to every numeric code.
    Type(Vec<i32>),
    Size(usize),
    All(Vec<Value>),
    Mod { divisor: i64, remainder: i64 },
    ElemMatchObject(Box<MatchExpr>),
    ElemMatchValue(Vec<Predicate>),
    Regex(QueryRegex),
    Not(Vec<Predicate>),
}

type ParseFn = fn(&Value) -> Result<Predicate>;

lazy_static! {
    static ref OPERATOR_REGISTRY: HashMap<&'static str, ParseFn> = {
        let mut m: HashMap<&'static str, ParseFn> = HashMap::new();
        m.insert("$eq", |v| Ok(Predicate::Eq(v.clone())));
        m.insert("$ne", |v| Ok(Predicate::Ne(v.clone())));
        m.insert("$gt", |v| Ok(Predicate::Gt(v.clone())));
        m.insert("$gte", |v| Ok(Predicate::Gte(v.clone())));
        m.insert("$lt", |v| Ok(Predicate::Lt(v.clone())));
        m.insert("$lte", |v| Ok(Predicate::Lte(v.clone())));
        m.insert("$in", |v| parse_in_list("$in", v).map(|(values, regexes)| Predicate::In { values, regexes }));
        m.insert("$nin", |v| parse_in_list("$nin", v).map(|(values, regexes)| Predicate::Nin { values, regexes }));
        m.insert("$exists", |v| Ok(Predicate::Exists(v.truthy())));
        m.insert("$type", parse_type);
        m.insert("$size", parse_size);
        m.insert("$all", parse_all);
        m.insert("$mod", parse_mod);
        m.insert("$elemMatch", parse_elem_match);
        m
    };
}

/// Whether `name` is a recognized field operator.
pub fn is_field_operator(name: &str) -> bool {
    OPERATOR_REGISTRY.contains_key(name) || matches!(name, "$regex" | "$options" | "$not")
}

/// Parse an operator document such as `{$gt: 1, $lt: 5}` into predicates.
pub fn parse_operator_document(doc: &Document) -> Result<Vec<Predicate>> {
    let mut predicates = Vec::with_capacity(doc.len());
    for (name, arg) in doc.iter() {
        match name.as_str() {
            "$regex" => {
                if let Some(regex) = QueryRegex::from_value(&Value::Document(doc.clone()))? {
                    predicates.push(Predicate::Regex(regex));
                }
            }
            "$options" => {
                if !doc.contains_key("$regex") {
                    return Err(QuarryError::BadValue("$options needs a $regex".into()));
                }
            }
            "$not" => predicates.push(parse_not(arg)?),
            "$where" => return Err(QuarryError::BadValue("$where is not supported".into())),
            other => {
                let parse = OPERATOR_REGISTRY
                    .get(other)
                    .ok_or_else(|| QuarryError::BadValue(format!("unknown operator: {}", other)))?;
                predicates.push(parse(arg)?);
            }
        }
    }
    Ok(predicates)
}

fn parse_in_list(op: &str, value: &Value) -> Result<(Vec<Value>, Vec<QueryRegex>)> {
    let items = value
        .as_array()
        .ok_or_else(|| QuarryError::BadValue(format!("{} needs an array", op)))?;
    let mut values = Vec::with_capacity(items.len());
    let mut regexes = Vec::new();
    for item in items {
        match QueryRegex::from_value(item)? {
            Some(regex) => regexes.push(regex),
            None => {
                if let Value::Document(d) = item {
                    if d.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) {
                        return Err(QuarryError::BadValue(format!("cannot nest $ under {}", op)));
                    }
                }
                values.push(item.clone());
            }
        }
    }
    Ok((values, regexes))
}

fn type_codes_for(value: &Value) -> Result<Vec<i32>> {
    match value {
        Value::String(alias) => Ok(match alias.as_str() {
            "number" => vec![1, 16, 18, 19],
            "double" => vec![1],
            "string" => vec![2],
            "object" => vec![3],
            "array" => vec![4],
            "binData" => vec![5],
            "objectId" => vec![7],
            "bool" => vec![8],
            "date" => vec![9],
            "null" => vec![10],
            "int" => vec![16],
            "long" => vec![18],
            "decimal" => vec![19],
            "minKey" => vec![-1],
            "maxKey" => vec![127],
            other => return Err(QuarryError::BadValue(format!("unknown type name alias: {}", other))),
        }),
        v => match v.as_i64() {
            Some(code) => Ok(vec![code as i32]),
            None => Err(QuarryError::TypeMismatch("type must be represented as a number or a string".into())),
        },
    }
}

fn parse_type(value: &Value) -> Result<Predicate> {
    let codes = match value {
        Value::Array(items) => {
            let mut codes = Vec::new();
            for item in items {
                codes.extend(type_codes_for(item)?);
            }
            codes
        }
        single => type_codes_for(single)?,
    };
    Ok(Predicate::Type(codes))
}

fn parse_size(value: &Value) -> Result<Predicate> {
    match value.as_i64() {
        Some(n) if n >= 0 => Ok(Predicate::Size(n as usize)),
        _ => Err(QuarryError::BadValue("$size needs a non-negative integer".into())),
    }
}

fn parse_all(value: &Value) -> Result<Predicate> {
    match value {
        Value::Array(items) => Ok(Predicate::All(items.clone())),
        _ => Err(QuarryError::BadValue("$all needs an array".into())),
    }
}

fn parse_mod(value: &Value) -> Result<Predicate> {
    let items = value
        .as_array()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| QuarryError::BadValue("malformed mod, needs to be an array of 2 numbers".into()))?;
    let divisor = items[0]
        .as_f64()
        .ok_or_else(|| QuarryError::BadValue("malformed mod, divisor not a number".into()))? as i64;
    let remainder = items[1]
        .as_f64()
        .ok_or_else(|| QuarryError::BadValue("malformed mod, remainder not a number".into()))? as i64;
    if divisor == 0 {
        return Err(QuarryError::BadValue("divisor cannot be 0".into()));
    }
    Ok(Predicate::Mod { divisor, remainder })
}

fn parse_elem_match(value: &Value) -> Result<Predicate> {
    let doc = value
        .as_document()
        .ok_or_else(|| QuarryError::BadValue("$elemMatch needs an Object".into()))?;
    let operator_form = doc
        .keys()
        .next()
        .map(|k| k.starts_with('$') && is_field_operator(k))
        .unwrap_or(false);
    if operator_form {
        Ok(Predicate::ElemMatchValue(parse_operator_document(doc)?))
    } else {
        Ok(Predicate::ElemMatchObject(Box::new(parse_filter(doc)?)))
    }
}

fn parse_not(value: &Value) -> Result<Predicate> {
    if let Some(regex) = QueryRegex::from_value(value)? {
        return Ok(Predicate::Not(vec![Predicate::Regex(regex)]));
    }
    match value {
        Value::Document(doc) if !doc.is_empty() => Ok(Predicate::Not(parse_operator_document(doc)?)),
        _ => Err(QuarryError::BadValue("$not needs a regex or a document".into())),
    }
}

// ========== EVALUATION ==========

fn equals(candidate: Option<&Value>, target: &Value, collation: Option<&Collation>) -> bool {
    match candidate {
        None => target.is_null(),
        Some(v) => compare_values(v, target, collation) == Ordering::Equal,
    }
}

/// Type-bracketed comparison; MinKey and MaxKey compare against anything.
fn compare_bracketed(candidate: Option<&Value>, target: &Value, collation: Option<&Collation>) -> Option<Ordering> {
    let value = match candidate {
        Some(v) => v,
        None if target.is_null() => return Some(Ordering::Equal),
        None => return None,
    };
    let any_type = matches!(target, Value::MinKey | Value::MaxKey);
    if !any_type && type_rank(value) != type_rank(target) {
        return None;
    }
    Some(compare_values(value, target, collation))
}

fn type_matches(value: &Value, codes: &[i32]) -> bool {
    codes.contains(&value.type_code())
}

impl Predicate {
    /// Whether any candidate satisfies the predicate; negations hold when no
    /// candidate satisfies their positive form.
    pub fn matches(&self, candidates: &[Candidate<'_>], collation: Option<&Collation>) -> Result<bool> {
        let any = |f: &dyn Fn(Option<&Value>) -> bool| candidates.iter().any(|c| f(c.value));
        let whole_arrays = || {
            candidates
                .iter()
                .filter(|c| !c.element)
                .filter_map(|c| c.value.and_then(Value::as_array))
        };
        Ok(match self {
            Predicate::Eq(target) => any(&|v| equals(v, target, collation)),
            Predicate::Ne(target) => !any(&|v| equals(v, target, collation)),
            Predicate::Gt(t) => any(&|v| compare_bracketed(v, t, collation) == Some(Ordering::Greater)),
            Predicate::Gte(t) => any(&|v| {
                matches!(compare_bracketed(v, t, collation), Some(Ordering::Greater | Ordering::Equal))
            }),
            Predicate::Lt(t) => any(&|v| compare_bracketed(v, t, collation) == Some(Ordering::Less)),
            Predicate::Lte(t) => any(&|v| {
                matches!(compare_bracketed(v, t, collation), Some(Ordering::Less | Ordering::Equal))
            }),
            Predicate::In { values, regexes } => in_list(candidates, values, regexes, collation),
            Predicate::Nin { values, regexes } => !in_list(candidates, values, regexes, collation),
            Predicate::Exists(expected) => any(&|v| v.is_some()) == *expected,
            Predicate::Type(codes) => any(&|v| v.map(|v| type_matches(v, codes)).unwrap_or(false)),
            Predicate::Size(n) => whole_arrays().any(|items| items.len() == *n),
            Predicate::All(targets) => {
                !targets.is_empty() && targets.iter().all(|t| any(&|v| equals(v, t, collation)))
            }
            Predicate::Mod { divisor, remainder } => any(&|v| {
                v.and_then(|v| v.as_f64())
                    .map(|f| (f as i64) % divisor == *remainder)
                    .unwrap_or(false)
            }),
            Predicate::Regex(regex) => any(&|v| v.map(|v| regex.is_match(v)).unwrap_or(false)),
            Predicate::ElemMatchObject(expr) => {
                for items in whole_arrays() {
                    for item in items {
                        if let Value::Document(doc) = item {
                            if expr.evaluate(doc, collation, None)? {
                                return Ok(true);
                            }
                        }
                    }
                }
                false
            }
            Predicate::ElemMatchValue(predicates) => {
                for items in whole_arrays() {
                    for item in items {
                        let single = [Candidate {
                            value: Some(item),
                            element: false,
                        }];
                        let mut all = true;
                        for predicate in predicates {
                            if !predicate.matches(&single, collation)? {
                                all = false;
                                break;
                            }
                        }
                        if all {
                            return Ok(true);
                        }
                    }
                }
                false
            }
            Predicate::Not(predicates) => {
                for predicate in predicates {
                    if !predicate.matches(candidates, collation)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }
}

fn in_list(candidates: &[Candidate<'_>], values: &[Value], regexes: &[QueryRegex], collation: Option<&Collation>) -> bool {
    candidates.iter().any(|c| {
        values.iter().any(|t| equals(c.value, t, collation))
            || c.value.map(|v| regexes.iter().any(|r| r.is_match(v))).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn one(value: &Value) -> Vec<Candidate<'_>> {
        vec![Candidate {
            value: Some(value),
            element: false,
        }]
    }

    #[test]
    fn test_regex_options_and_cache() {
        let regex = QueryRegex::new("^abc", "i").unwrap();
        assert!(regex.is_match(&Value::from("ABCdef")));
        assert!(QueryRegex::new("^abc", "i").is_ok());
        assert!(QueryRegex::new("x", "q").is_err());
        assert_eq!(QueryRegex::new("^abc", "").unwrap().literal_prefix(), Some("abc".into()));
        assert_eq!(regex.literal_prefix(), None);
    }

    #[test]
    fn test_comparisons_are_type_bracketed() {
        let preds = parse_operator_document(&doc!({"$gt": 5})).unwrap();
        assert!(preds[0].matches(&one(&Value::Int32(6)), None).unwrap());
        assert!(!preds[0].matches(&one(&Value::from("z")), None).unwrap());
        let min = Predicate::Gt(Value::MinKey);
        assert!(min.matches(&one(&Value::from("z")), None).unwrap());
    }

    #[test]
    fn test_missing_counts_as_null() {
        let missing = [Candidate {
            value: None,
            element: false,
        }];
        assert!(Predicate::Eq(Value::Null).matches(&missing, None).unwrap());
        assert!(Predicate::Gte(Value::Null).matches(&missing, None).unwrap());
        assert!(!Predicate::Exists(true).matches(&missing, None).unwrap());
        assert!(Predicate::Ne(Value::Int32(1)).matches(&missing, None).unwrap());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = parse_operator_document(&doc!({"$near": [0, 0]})).unwrap_err();
        assert!(err.to_string().contains("unknown operator"));
        assert!(parse_operator_document(&doc!({"$options": "i"})).is_err());
    }

    #[test]
    fn test_type_aliases() {
        let pred = parse_type(&Value::from("number")).unwrap();
        assert!(pred.matches(&one(&Value::Double(1.5)), None).unwrap());
        assert!(!pred.matches(&one(&Value::from("1")), None).unwrap());
    }
}
