// quarry-core/src/pipeline/expression.rs
//! Aggregation expressions.
//!
//! An expression is parsed once into an [`Expression`] tree and evaluated
//! against each document. Evaluation distinguishes a *missing* result
//! (`None`) from `null`: `$project` and `$addFields` drop fields whose
//! expression is missing, everything else treats missing as null.

use std::cmp::Ordering;

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::value::{compare_values, Decimal128, Value};

// ========== VARIABLES ==========

/// Variable scope for one evaluation: `$$NOW`, `let` bindings and the
/// collation string comparisons use.
#[derive(Debug, Clone)]
pub struct Variables {
    pub now: Value,
    bindings: Vec<(String, Value)>,
    pub collation: Option<Collation>,
}

impl Default for Variables {
    fn default() -> Self {
        Variables::new(None)
    }
}

impl Variables {
    pub fn new(collation: Option<Collation>) -> Self {
        Variables {
            now: Value::now(),
            bindings: Vec::new(),
            collation,
        }
    }

    /// A child scope with one more binding; later bindings shadow earlier ones.
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Variables {
        let mut child = self.clone();
        child.bindings.push((name.into(), value));
        child
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }
}

/// Validate a user variable name used in `let`.
pub fn validate_variable_name(name: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || !c.is_ascii())
        .unwrap_or(false)
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(QuarryError::BadValue(format!("'{}' is not a valid variable name", name)))
    }
}

// ========== FIELD PATHS ==========

/// Resolve a dotted path the way aggregation does: arrays of documents map
/// the remaining path over their elements; numeric components are field
/// names, not positions.
pub fn resolve_path(doc: &Document, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let first = doc.get(parts[0])?;
    resolve_value(first, &parts[1..])
}

fn resolve_value(value: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Document(doc) => doc.get(head).and_then(|v| resolve_value(v, rest)),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| matches!(item, Value::Document(_) | Value::Array(_)))
                .filter_map(|item| resolve_value(item, parts))
                .collect(),
        )),
        _ => None,
    }
}

// ========== EXPRESSION TREE ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    And,
    Or,
    Not,
    Cond,
    IfNull,
    Concat,
    ToUpper,
    ToLower,
    Size,
    ArrayElemAt,
    In,
    Type,
    MergeObjects,
    Rand,
}

impl Op {
    fn parse(name: &str) -> Option<Op> {
        Some(match name {
            "$add" => Op::Add,
            "$subtract" => Op::Subtract,
            "$multiply" => Op::Multiply,
            "$divide" => Op::Divide,
            "$mod" => Op::Mod,
            "$abs" => Op::Abs,
            "$eq" => Op::Eq,
            "$ne" => Op::Ne,
            "$gt" => Op::Gt,
            "$gte" => Op::Gte,
            "$lt" => Op::Lt,
            "$lte" => Op::Lte,
            "$cmp" => Op::Cmp,
            "$and" => Op::And,
            "$or" => Op::Or,
            "$not" => Op::Not,
            "$cond" => Op::Cond,
            "$ifNull" => Op::IfNull,
            "$concat" => Op::Concat,
            "$toUpper" => Op::ToUpper,
            "$toLower" => Op::ToLower,
            "$size" => Op::Size,
            "$arrayElemAt" => Op::ArrayElemAt,
            "$in" => Op::In,
            "$type" => Op::Type,
            "$mergeObjects" => Op::MergeObjects,
            "$rand" => Op::Rand,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "$add",
            Op::Subtract => "$subtract",
            Op::Multiply => "$multiply",
            Op::Divide => "$divide",
            Op::Mod => "$mod",
            Op::Abs => "$abs",
            Op::Eq => "$eq",
            Op::Ne => "$ne",
            Op::Gt => "$gt",
            Op::Gte => "$gte",
            Op::Lt => "$lt",
            Op::Lte => "$lte",
            Op::Cmp => "$cmp",
            Op::And => "$and",
            Op::Or => "$or",
            Op::Not => "$not",
            Op::Cond => "$cond",
            Op::IfNull => "$ifNull",
            Op::Concat => "$concat",
            Op::ToUpper => "$toUpper",
            Op::ToLower => "$toLower",
            Op::Size => "$size",
            Op::ArrayElemAt => "$arrayElemAt",
            Op::In => "$in",
            Op::Type => "$type",
            Op::MergeObjects => "$mergeObjects",
            Op::Rand => "$rand",
        }
    }

    /// `(min, max)` argument count.
    fn arity(&self) -> (usize, usize) {
        match self {
            Op::Rand => (0, 0),
            Op::Abs | Op::Not | Op::ToUpper | Op::ToLower | Op::Size | Op::Type => (1, 1),
            Op::Subtract | Op::Divide | Op::Mod | Op::Eq | Op::Ne | Op::Gt | Op::Gte | Op::Lt | Op::Lte
            | Op::Cmp | Op::ArrayElemAt | Op::In => (2, 2),
            Op::Cond => (3, 3),
            Op::IfNull => (2, usize::MAX),
            Op::Add | Op::Multiply | Op::And | Op::Or | Op::Concat | Op::MergeObjects => (0, usize::MAX),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expression {
    Constant(Value),
    /// `$a.b`, relative to the current document.
    FieldPath(String),
    /// `$$name` or `$$name.path`.
    Variable { name: String, path: Option<String> },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Operator { op: Op, args: Vec<Expression> },
}

impl Expression {
    pub fn parse(value: &Value) -> Result<Expression> {
        match value {
            Value::String(s) if s.starts_with("$$") => {
                let body = &s[2..];
                let (name, path) = match body.split_once('.') {
                    Some((name, path)) => (name, Some(path.to_string())),
                    None => (body, None),
                };
                if name.is_empty() {
                    return Err(QuarryError::BadValue("empty variable name".into()));
                }
                Ok(Expression::Variable {
                    name: name.to_string(),
                    path,
                })
            }
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(QuarryError::BadValue(format!("invalid field path '{}'", s)));
                }
                Ok(Expression::FieldPath(path.to_string()))
            }
            Value::Array(items) => Ok(Expression::Array(
                items.iter().map(Expression::parse).collect::<Result<_>>()?,
            )),
            Value::Document(doc) => Expression::parse_document(doc),
            other => Ok(Expression::Constant(other.clone())),
        }
    }

    fn parse_document(doc: &Document) -> Result<Expression> {
        let first = doc.keys().next().cloned();
        match first {
            Some(name) if name.starts_with('$') => {
                if doc.len() != 1 {
                    return Err(QuarryError::BadValue(format!(
                        "an expression specification must contain exactly one field, found {}",
                        doc.len()
                    )));
                }
                let arg = doc.get(&name).cloned().unwrap_or(Value::Null);
                if name == "$literal" {
                    return Ok(Expression::Constant(arg));
                }
                let op = Op::parse(&name).ok_or_else(|| {
                    QuarryError::new(
                        ErrorCode::InvalidPipelineOperator,
                        format!("Unrecognized expression '{}'", name),
                    )
                })?;
                let args = Expression::parse_args(op, &arg)?;
                let (min, max) = op.arity();
                if args.len() < min || args.len() > max {
                    return Err(QuarryError::BadValue(format!(
                        "expression {} takes {} arguments, {} were passed in",
                        op.name(),
                        if min == max { min.to_string() } else { format!("at least {}", min) },
                        args.len()
                    )));
                }
                Ok(Expression::Operator { op, args })
            }
            _ => {
                let mut fields = Vec::with_capacity(doc.len());
                for (key, value) in doc.iter() {
                    if key.starts_with('$') {
                        return Err(QuarryError::BadValue(format!(
                            "field names may not start with '$': '{}'",
                            key
                        )));
                    }
                    fields.push((key.clone(), Expression::parse(value)?));
                }
                Ok(Expression::Object(fields))
            }
        }
    }

    fn parse_args(op: Op, arg: &Value) -> Result<Vec<Expression>> {
        match (op, arg) {
            (Op::Cond, Value::Document(spec)) if spec.contains_key("if") => {
                let part = |name: &str| -> Result<Expression> {
                    let value = spec.get(name).ok_or_else(|| {
                        QuarryError::BadValue(format!("missing '{}' parameter to $cond", name))
                    })?;
                    Expression::parse(value)
                };
                for key in spec.keys() {
                    if !matches!(key.as_str(), "if" | "then" | "else") {
                        return Err(QuarryError::BadValue(format!("unrecognized parameter to $cond: {}", key)));
                    }
                }
                Ok(vec![part("if")?, part("then")?, part("else")?])
            }
            (Op::Rand, Value::Document(spec)) if spec.is_empty() => Ok(Vec::new()),
            (_, Value::Array(items)) => items.iter().map(Expression::parse).collect(),
            (_, single) => Ok(vec![Expression::parse(single)?]),
        }
    }

    pub fn constant(value: Value) -> Expression {
        Expression::Constant(value)
    }

    /// Evaluate with missing mapped to null.
    pub fn evaluate(&self, root: &Document, vars: &Variables) -> Result<Value> {
        Ok(self.evaluate_opt(root, vars)?.unwrap_or(Value::Null))
    }

    /// Evaluate; `None` means the result is missing.
    pub fn evaluate_opt(&self, root: &Document, vars: &Variables) -> Result<Option<Value>> {
        match self {
            Expression::Constant(v) => Ok(Some(v.clone())),
            Expression::FieldPath(path) => Ok(resolve_path(root, path)),
            Expression::Variable { name, path } => {
                let base = match name.as_str() {
                    "ROOT" | "CURRENT" => Value::Document(root.clone()),
                    "NOW" => vars.now.clone(),
                    "REMOVE" => return Ok(None),
                    other => match vars.get(other) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(QuarryError::BadValue(format!("use of undefined variable: {}", other)))
                        }
                    },
                };
                match path {
                    None => Ok(Some(base)),
                    Some(path) => {
                        let parts: Vec<&str> = path.split('.').collect();
                        Ok(resolve_value(&base, &parts))
                    }
                }
            }
            Expression::Object(fields) => {
                let mut out = Document::with_capacity(fields.len());
                for (name, expr) in fields {
                    if let Some(value) = expr.evaluate_opt(root, vars)? {
                        out.insert(name.clone(), value);
                    }
                }
                Ok(Some(Value::Document(out)))
            }
            Expression::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.evaluate(root, vars)?);
                }
                Ok(Some(Value::Array(out)))
            }
            Expression::Operator { op, args } => evaluate_operator(*op, args, root, vars),
        }
    }
}

// ========== OPERATORS ==========

fn evaluate_operator(op: Op, args: &[Expression], root: &Document, vars: &Variables) -> Result<Option<Value>> {
    let arg = |i: usize| -> Result<Value> { args[i].evaluate(root, vars) };
    let all = || -> Result<Vec<Value>> { args.iter().map(|a| a.evaluate(root, vars)).collect() };
    let collation = vars.collation();

    let value = match op {
        Op::Add => {
            let values = all()?;
            if values.iter().any(Value::is_null) {
                return Ok(Some(Value::Null));
            }
            let mut total = Value::Int32(0);
            let mut date = None;
            for value in values {
                match value {
                    Value::Date(ms) => {
                        if date.is_some() {
                            return Err(QuarryError::TypeMismatch("only one date allowed in an $add expression".into()));
                        }
                        date = Some(ms);
                    }
                    v if v.is_number() => total = arithmetic(op, &total, &v)?,
                    v => return Err(type_error(op, &v)),
                }
            }
            match date {
                Some(ms) => Value::Date(ms + total.as_f64().map(|f| f.round() as i64).unwrap_or(0)),
                None => total,
            }
        }
        Op::Multiply => {
            let values = all()?;
            if values.iter().any(Value::is_null) {
                return Ok(Some(Value::Null));
            }
            let mut total = Value::Int32(1);
            for value in values {
                if !value.is_number() {
                    return Err(type_error(op, &value));
                }
                total = arithmetic(op, &total, &value)?;
            }
            total
        }
        Op::Subtract => {
            let (a, b) = (arg(0)?, arg(1)?);
            match (&a, &b) {
                (Value::Null, _) | (_, Value::Null) => Value::Null,
                (Value::Date(x), Value::Date(y)) => Value::Int64(x - y),
                (Value::Date(x), n) if n.is_number() => {
                    Value::Date(x - n.as_f64().map(|f| f.round() as i64).unwrap_or(0))
                }
                (x, y) if x.is_number() && y.is_number() => arithmetic(op, x, y)?,
                (x, y) => return Err(type_error(op, if x.is_number() { y } else { x })),
            }
        }
        Op::Divide | Op::Mod => {
            let (a, b) = (arg(0)?, arg(1)?);
            if a.is_null() || b.is_null() {
                return Ok(Some(Value::Null));
            }
            if !a.is_number() {
                return Err(type_error(op, &a));
            }
            if !b.is_number() {
                return Err(type_error(op, &b));
            }
            if b.as_f64() == Some(0.0) {
                return Err(QuarryError::BadValue(format!("can't {} by zero", op.name())));
            }
            arithmetic(op, &a, &b)?
        }
        Op::Abs => {
            let a = arg(0)?;
            match a {
                Value::Null => Value::Null,
                Value::Int32(i) => i.checked_abs().map(Value::Int32).unwrap_or(Value::Int64((i as i64).abs())),
                Value::Int64(i) => i.checked_abs().map(Value::Int64).unwrap_or(Value::Double((i as f64).abs())),
                Value::Double(d) => Value::Double(d.abs()),
                Value::Decimal128(d) => Value::Decimal128(Decimal128::from_f64(d.to_f64().abs())),
                other => return Err(type_error(op, &other)),
            }
        }
        Op::Eq | Op::Ne | Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let ord = compare_values(&arg(0)?, &arg(1)?, collation);
            Value::Bool(match op {
                Op::Eq => ord == Ordering::Equal,
                Op::Ne => ord != Ordering::Equal,
                Op::Gt => ord == Ordering::Greater,
                Op::Gte => ord != Ordering::Less,
                Op::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            })
        }
        Op::Cmp => Value::Int32(match compare_values(&arg(0)?, &arg(1)?, collation) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }),
        Op::And => {
            for a in args {
                if !a.evaluate(root, vars)?.truthy() {
                    return Ok(Some(Value::Bool(false)));
                }
            }
            Value::Bool(true)
        }
        Op::Or => {
            for a in args {
                if a.evaluate(root, vars)?.truthy() {
                    return Ok(Some(Value::Bool(true)));
                }
            }
            Value::Bool(false)
        }
        Op::Not => Value::Bool(!arg(0)?.truthy()),
        Op::Cond => {
            return if arg(0)?.truthy() {
                args[1].evaluate_opt(root, vars)
            } else {
                args[2].evaluate_opt(root, vars)
            }
        }
        Op::IfNull => {
            let (replacement, candidates) = match args.split_last() {
                Some(split) => split,
                None => return Ok(None),
            };
            for candidate in candidates {
                match candidate.evaluate_opt(root, vars)? {
                    Some(Value::Null) | None => continue,
                    Some(v) => return Ok(Some(v)),
                }
            }
            return replacement.evaluate_opt(root, vars);
        }
        Op::Concat => {
            let mut out = String::new();
            for value in all()? {
                match value {
                    Value::Null => return Ok(Some(Value::Null)),
                    Value::String(s) => out.push_str(&s),
                    other => return Err(type_error(op, &other)),
                }
            }
            Value::String(out)
        }
        Op::ToUpper | Op::ToLower => {
            let text = match arg(0)? {
                Value::Null => String::new(),
                Value::String(s) => s,
                v if v.is_number() || matches!(v, Value::Date(_)) => v.to_string(),
                other => return Err(type_error(op, &other)),
            };
            Value::String(if op == Op::ToUpper { text.to_uppercase() } else { text.to_lowercase() })
        }
        Op::Size => match arg(0)? {
            Value::Array(items) => Value::Int32(items.len() as i32),
            other => {
                return Err(QuarryError::TypeMismatch(format!(
                    "the argument to $size must be an array, but was of type: {}",
                    other.type_name()
                )))
            }
        },
        Op::ArrayElemAt => {
            let (array, index) = (arg(0)?, arg(1)?);
            match (&array, &index) {
                (Value::Null, _) | (_, Value::Null) => Value::Null,
                (Value::Array(items), idx) => {
                    let i = idx.as_i64().ok_or_else(|| {
                        QuarryError::TypeMismatch("$arrayElemAt's second argument must be an integer".into())
                    })?;
                    let pos = if i < 0 { items.len() as i64 + i } else { i };
                    if pos < 0 || pos as usize >= items.len() {
                        return Ok(None);
                    }
                    items[pos as usize].clone()
                }
                (other, _) => return Err(type_error(op, other)),
            }
        }
        Op::In => {
            let (needle, haystack) = (arg(0)?, arg(1)?);
            match haystack {
                Value::Array(items) => Value::Bool(
                    items
                        .iter()
                        .any(|item| compare_values(item, &needle, collation) == Ordering::Equal),
                ),
                other => {
                    return Err(QuarryError::TypeMismatch(format!(
                        "$in requires an array as a second argument, found: {}",
                        other.type_name()
                    )))
                }
            }
        }
        Op::Type => match args[0].evaluate_opt(root, vars)? {
            Some(v) => Value::String(v.type_name().to_string()),
            None => Value::String("missing".into()),
        },
        Op::MergeObjects => {
            let mut out = Document::new();
            for value in all()? {
                match value {
                    Value::Null => {}
                    Value::Document(doc) => {
                        for (k, v) in doc {
                            out.insert(k, v);
                        }
                    }
                    other => return Err(type_error(op, &other)),
                }
            }
            Value::Document(out)
        }
        Op::Rand => Value::Double(rand::random::<f64>()),
    };
    Ok(Some(value))
}

fn type_error(op: Op, value: &Value) -> QuarryError {
    QuarryError::TypeMismatch(format!(
        "{} does not support values of type {}",
        op.name(),
        value.type_name()
    ))
}

/// Numeric width: int32 < int64 < double < decimal.
fn width(value: &Value) -> u8 {
    match value {
        Value::Int32(_) => 0,
        Value::Int64(_) => 1,
        Value::Double(_) => 2,
        _ => 3,
    }
}

/// Binary arithmetic on two numbers, widening the result type as needed.
pub fn arithmetic(op: Op, a: &Value, b: &Value) -> Result<Value> {
    let w = width(a).max(width(b));
    if w <= 1 && op != Op::Divide {
        let (x, y) = (a.as_i64().unwrap_or(0), b.as_i64().unwrap_or(0));
        let exact = match op {
            Op::Add => x.checked_add(y),
            Op::Subtract => x.checked_sub(y),
            Op::Multiply => x.checked_mul(y),
            Op::Mod => x.checked_rem(y),
            _ => None,
        };
        if let Some(r) = exact {
            return Ok(match i32::try_from(r) {
                Ok(small) if w == 0 => Value::Int32(small),
                _ => Value::Int64(r),
            });
        }
    }
    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let r = match op {
        Op::Add => x + y,
        Op::Subtract => x - y,
        Op::Multiply => x * y,
        Op::Divide => x / y,
        Op::Mod => x % y,
        _ => return Err(QuarryError::new(ErrorCode::InternalError, format!("{} is not arithmetic", op.name()))),
    };
    Ok(if w == 3 {
        Value::Decimal128(Decimal128::from_f64(r))
    } else {
        Value::Double(r)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn eval(expr: Value, doc: &Document) -> Value {
        Expression::parse(&expr).unwrap().evaluate(doc, &Variables::default()).unwrap()
    }

    fn v(json: serde_json::Value) -> Value {
        Value::from_json(&json).unwrap()
    }

    #[test]
    fn test_field_paths_and_arrays() {
        let doc = doc!({"a": {"b": 5}, "xs": [{"y": 1}, {"y": 2}, {"z": 3}]});
        assert_eq!(eval(v(serde_json::json!("$a.b")), &doc), Value::Int32(5));
        assert_eq!(
            eval(v(serde_json::json!("$xs.y")), &doc),
            Value::Array(vec![Value::Int32(1), Value::Int32(2)])
        );
        assert_eq!(eval(v(serde_json::json!("$missing")), &doc), Value::Null);
    }

    #[test]
    fn test_arithmetic_widening() {
        let doc = Document::new();
        assert!(matches!(eval(v(serde_json::json!({"$add": [1, 2]})), &doc), Value::Int32(3)));
        assert!(matches!(
            eval(v(serde_json::json!({"$add": [2147483647, 1]})), &doc),
            Value::Int64(2147483648)
        ));
        assert!(matches!(eval(v(serde_json::json!({"$divide": [1, 2]})), &doc), Value::Double(d) if d == 0.5));
        assert_eq!(eval(v(serde_json::json!({"$add": [1, null]})), &doc), Value::Null);
        let err = Expression::parse(&v(serde_json::json!({"$divide": [1, 0]})))
            .unwrap()
            .evaluate(&doc, &Variables::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
    }

    #[test]
    fn test_cond_ifnull_and_variables() {
        let doc = doc!({"qty": 5});
        let vars = Variables::default().bind("limit", Value::Int32(3));
        let expr = Expression::parse(&v(serde_json::json!({
            "$cond": {"if": {"$gt": ["$qty", "$$limit"]}, "then": "big", "else": "small"}
        })))
        .unwrap();
        assert_eq!(expr.evaluate(&doc, &vars).unwrap(), Value::from("big"));
        assert_eq!(
            eval(v(serde_json::json!({"$ifNull": ["$nope", null, "fallback"]})), &doc),
            Value::from("fallback")
        );
        let undefined = Expression::parse(&v(serde_json::json!("$$nope"))).unwrap();
        assert!(undefined.evaluate(&doc, &Variables::default()).is_err());
    }

    #[test]
    fn test_collation_aware_comparison() {
        let collation = Collation::from_document(&doc!({"locale": "en", "strength": 2})).unwrap();
        let vars = Variables::new(Some(collation));
        let expr = Expression::parse(&v(serde_json::json!({"$eq": ["ABC", "abc"]}))).unwrap();
        assert_eq!(expr.evaluate(&Document::new(), &vars).unwrap(), Value::Bool(true));
        assert_eq!(expr.evaluate(&Document::new(), &Variables::default()).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_unknown_operator_and_missing_results() {
        let err = Expression::parse(&v(serde_json::json!({"$frobnicate": 1}))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPipelineOperator);
        let expr = Expression::parse(&v(serde_json::json!({"$arrayElemAt": [[1], 5]}))).unwrap();
        assert_eq!(expr.evaluate_opt(&Document::new(), &Variables::default()).unwrap(), None);
    }
}
