// quarry-core/src/pipeline/accumulator.rs
//! Group accumulators.
//!
//! An [`Accumulator`] is the parsed `{$op: <expression>}` of one output field;
//! its running value lives in an [`AccState`]. States are serializable so
//! `$group` can spill partial groups and merge them back later.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::value::{compare_values, Value};

use super::expression::{arithmetic, Expression, Op, Variables};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

impl AccumulatorOp {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            "$count" => AccumulatorOp::Count,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorOp::Sum => "$sum",
            AccumulatorOp::Avg => "$avg",
            AccumulatorOp::Min => "$min",
            AccumulatorOp::Max => "$max",
            AccumulatorOp::First => "$first",
            AccumulatorOp::Last => "$last",
            AccumulatorOp::Push => "$push",
            AccumulatorOp::AddToSet => "$addToSet",
            AccumulatorOp::Count => "$count",
        }
    }
}

/// One `field: {$op: expr}` entry of `$group` (or of a window output).
#[derive(Debug, Clone)]
pub struct Accumulator {
    pub field: String,
    pub op: AccumulatorOp,
    pub arg: Expression,
    spec: Value,
}

impl Accumulator {
    pub fn parse(field: &str, spec: &Value) -> Result<Self> {
        if field.contains('.') {
            return Err(QuarryError::BadValue(format!(
                "the group aggregate field name '{}' cannot contain '.'",
                field
            )));
        }
        let doc = spec
            .as_document()
            .filter(|d| d.len() == 1)
            .ok_or_else(|| QuarryError::BadValue(format!("the field '{}' must be an accumulator object", field)))?;
        let (name, arg) = doc
            .iter()
            .next()
            .ok_or_else(|| QuarryError::BadValue(format!("the field '{}' must be an accumulator object", field)))?;
        let op = AccumulatorOp::parse(name).ok_or_else(|| {
            QuarryError::new(
                ErrorCode::InvalidPipelineOperator,
                format!("unknown group operator '{}'", name),
            )
        })?;
        let arg = match op {
            AccumulatorOp::Count => {
                if !matches!(arg, Value::Document(d) if d.is_empty()) {
                    return Err(QuarryError::BadValue("$count takes no arguments, i.e. $count:{}".into()));
                }
                Expression::constant(Value::Int32(1))
            }
            _ => Expression::parse(arg)?,
        };
        Ok(Accumulator {
            field: field.to_string(),
            op,
            arg,
            spec: spec.clone(),
        })
    }

    pub fn spec(&self) -> &Value {
        &self.spec
    }

    pub fn init(&self) -> AccState {
        AccState::new(self.op)
    }

    /// Feed `doc` into `state`. Returns roughly how many bytes the state grew.
    pub fn process(&self, state: &mut AccState, doc: &Document, vars: &Variables) -> Result<usize> {
        let value = self.arg.evaluate_opt(doc, vars)?;
        state.process(value, vars.collation())
    }
}

/// Running value of one accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccState {
    Sum(Value),
    Avg { sum: Value, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    /// Keyed by collation comparison key.
    AddToSet(BTreeMap<Value, Value>),
    Count(i64),
}

/// Replace `current` with `value` when it orders `want` relative to it.
/// Nulls and missing values never participate.
fn keep_extremum(current: &mut Option<Value>, value: Option<Value>, want: Ordering, collation: Option<&Collation>) -> usize {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return 0;
    };
    let replace = match current {
        Some(existing) => compare_values(&value, existing, collation) == want,
        None => true,
    };
    if !replace {
        return 0;
    }
    let size = value.bson_size();
    *current = Some(value);
    size
}

fn add_numbers(total: &Value, value: &Value) -> Result<Value> {
    arithmetic(Op::Add, total, value)
}

impl AccState {
    pub fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Sum => AccState::Sum(Value::Int32(0)),
            AccumulatorOp::Avg => AccState::Avg {
                sum: Value::Int32(0),
                count: 0,
            },
            AccumulatorOp::Min => AccState::Min(None),
            AccumulatorOp::Max => AccState::Max(None),
            AccumulatorOp::First => AccState::First(None),
            AccumulatorOp::Last => AccState::Last(None),
            AccumulatorOp::Push => AccState::Push(Vec::new()),
            AccumulatorOp::AddToSet => AccState::AddToSet(BTreeMap::new()),
            AccumulatorOp::Count => AccState::Count(0),
        }
    }

    pub fn process(&mut self, value: Option<Value>, collation: Option<&Collation>) -> Result<usize> {
        match self {
            AccState::Sum(total) => {
                if let Some(v) = value.filter(Value::is_number) {
                    *total = add_numbers(total, &v)?;
                }
                Ok(0)
            }
            AccState::Avg { sum, count } => {
                if let Some(v) = value.filter(Value::is_number) {
                    *sum = add_numbers(sum, &v)?;
                    *count += 1;
                }
                Ok(0)
            }
            AccState::Min(current) => Ok(keep_extremum(current, value, Ordering::Less, collation)),
            AccState::Max(current) => Ok(keep_extremum(current, value, Ordering::Greater, collation)),
            AccState::First(first) => {
                if first.is_none() {
                    let v = value.unwrap_or(Value::Null);
                    let size = v.bson_size();
                    *first = Some(v);
                    return Ok(size);
                }
                Ok(0)
            }
            AccState::Last(last) => {
                let v = value.unwrap_or(Value::Null);
                let size = v.bson_size();
                *last = Some(v);
                Ok(size)
            }
            AccState::Push(items) => match value {
                Some(v) => {
                    let size = v.bson_size();
                    items.push(v);
                    Ok(size)
                }
                None => Ok(0),
            },
            AccState::AddToSet(set) => match value {
                Some(v) => {
                    let key = match collation {
                        Some(c) => c.comparison_key(&v),
                        None => v.clone(),
                    };
                    if set.contains_key(&key) {
                        return Ok(0);
                    }
                    let size = v.bson_size() * 2;
                    set.insert(key, v);
                    Ok(size)
                }
                None => Ok(0),
            },
            AccState::Count(n) => {
                *n += 1;
                Ok(0)
            }
        }
    }

    /// Fold in `later`, a partial state built from documents that came after
    /// this state's documents.
    pub fn merge(&mut self, later: AccState, collation: Option<&Collation>) -> Result<()> {
        match (self, later) {
            (AccState::Sum(total), AccState::Sum(other)) => *total = add_numbers(total, &other)?,
            (AccState::Avg { sum, count }, AccState::Avg { sum: s2, count: c2 }) => {
                *sum = add_numbers(sum, &s2)?;
                *count += c2;
            }
            (AccState::Min(current), AccState::Min(other)) => {
                keep_extremum(current, other, Ordering::Less, collation);
            }
            (AccState::Max(current), AccState::Max(other)) => {
                keep_extremum(current, other, Ordering::Greater, collation);
            }
            (AccState::First(first), AccState::First(other)) => {
                if first.is_none() {
                    *first = other;
                }
            }
            (AccState::Last(last), AccState::Last(other)) => {
                if other.is_some() {
                    *last = other;
                }
            }
            (AccState::Push(items), AccState::Push(other)) => items.extend(other),
            (AccState::AddToSet(set), AccState::AddToSet(other)) => {
                for (key, value) in other {
                    set.entry(key).or_insert(value);
                }
            }
            (AccState::Count(n), AccState::Count(other)) => *n += other,
            _ => {
                return Err(QuarryError::new(
                    ErrorCode::InternalError,
                    "cannot merge accumulator states of different kinds",
                ))
            }
        }
        Ok(())
    }

    pub fn finalize(self) -> Value {
        match self {
            AccState::Sum(total) => total,
            AccState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    match sum {
                        Value::Decimal128(d) => Value::Decimal128(crate::value::Decimal128::from_f64(
                            d.to_f64() / count as f64,
                        )),
                        other => Value::Double(other.as_f64().unwrap_or(0.0) / count as f64),
                    }
                }
            }
            AccState::Min(v) | AccState::Max(v) | AccState::First(v) | AccState::Last(v) => v.unwrap_or(Value::Null),
            AccState::Push(items) => Value::Array(items),
            AccState::AddToSet(set) => Value::Array(set.into_values().collect()),
            AccState::Count(n) => match i32::try_from(n) {
                Ok(small) => Value::Int32(small),
                Err(_) => Value::Int64(n),
            },
        }
    }
}

/// Parse the accumulator fields of a `$group`-like spec, skipping `skip`.
pub fn parse_accumulators(spec: &Document, skip: &str) -> Result<Vec<Accumulator>> {
    spec.iter()
        .filter(|(k, _)| k.as_str() != skip)
        .map(|(field, value)| Accumulator::parse(field, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn run(spec: serde_json::Value, docs: &[Document]) -> Value {
        let acc = Accumulator::parse("out", &Value::from_json(&spec).unwrap()).unwrap();
        let vars = Variables::default();
        let mut state = acc.init();
        for doc in docs {
            acc.process(&mut state, doc, &vars).unwrap();
        }
        state.finalize()
    }

    fn docs() -> Vec<Document> {
        vec![
            doc!({"x": 1, "s": "b"}),
            doc!({"x": 2.5, "s": "a"}),
            doc!({"x": "nan", "s": "b"}),
            doc!({"s": null}),
        ]
    }

    #[test]
    fn test_numeric_accumulators() {
        assert_eq!(run(serde_json::json!({"$sum": "$x"}), &docs()), Value::Double(3.5));
        assert_eq!(run(serde_json::json!({"$avg": "$x"}), &docs()), Value::Double(1.75));
        assert_eq!(run(serde_json::json!({"$sum": 1}), &docs()), Value::Int32(4));
        assert_eq!(run(serde_json::json!({"$count": {}}), &docs()), Value::Int32(4));
        assert_eq!(run(serde_json::json!({"$avg": "$missing"}), &docs()), Value::Null);
    }

    #[test]
    fn test_min_max_ignore_nulls() {
        assert_eq!(run(serde_json::json!({"$min": "$s"}), &docs()), Value::from("a"));
        assert_eq!(run(serde_json::json!({"$max": "$s"}), &docs()), Value::from("b"));
    }

    #[test]
    fn test_first_last_push_add_to_set() {
        assert_eq!(run(serde_json::json!({"$first": "$s"}), &docs()), Value::from("b"));
        assert_eq!(run(serde_json::json!({"$last": "$s"}), &docs()), Value::Null);
        let pushed = run(serde_json::json!({"$push": "$s"}), &docs());
        assert_eq!(pushed.as_array().map(Vec::len), Some(4));
        let set = run(serde_json::json!({"$addToSet": "$s"}), &docs());
        assert_eq!(set.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_merge_partial_states() {
        let acc = Accumulator::parse("out", &Value::from_json(&serde_json::json!({"$first": "$s"})).unwrap()).unwrap();
        let vars = Variables::default();
        let mut early = acc.init();
        acc.process(&mut early, &doc!({"s": "early"}), &vars).unwrap();
        let mut late = acc.init();
        acc.process(&mut late, &doc!({"s": "late"}), &vars).unwrap();
        early.merge(late, None).unwrap();
        assert_eq!(early.finalize(), Value::from("early"));

        let mut a = AccState::new(AccumulatorOp::Avg);
        a.process(Some(Value::Int32(2)), None).unwrap();
        let mut b = AccState::new(AccumulatorOp::Avg);
        b.process(Some(Value::Int32(4)), None).unwrap();
        a.merge(b, None).unwrap();
        assert_eq!(a.finalize(), Value::Double(3.0));
    }

    #[test]
    fn test_rejects_unknown_and_dotted() {
        let err = Accumulator::parse("x", &Value::from_json(&serde_json::json!({"$median": "$a"})).unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPipelineOperator);
        assert!(Accumulator::parse("a.b", &Value::from_json(&serde_json::json!({"$sum": 1})).unwrap()).is_err());
    }
}
