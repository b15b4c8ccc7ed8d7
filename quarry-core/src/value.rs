// quarry-core/src/value.rs
//! Tagged document values with a total, type-bracketed ordering.
//!
//! Values of different types order by their canonical type rank:
//!
//! ```text
//! MinKey < Null < numbers < String < Document < Array < Binary
//!        < ObjectId < Bool < Date < MaxKey
//! ```
//!
//! Numbers compare by numeric value across `Int32`, `Int64`, `Double` and
//! `Decimal128`, so `1`, `1i64` and `1.0` are equal and hash alike. NaN sorts
//! below every other number and equals itself.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::collation::Collation;
use crate::document::Document;
use crate::error::{QuarryError, Result};

// ========== OBJECT ID ==========

lazy_static! {
    /// Per-process random bytes embedded in every generated ObjectId.
    static ref PROCESS_UNIQUE: [u8; 5] = rand::random();
    static ref OID_COUNTER: AtomicU32 = AtomicU32::new(rand::random::<u32>() & 0x00FF_FFFF);
}

/// 12-byte identifier: 4-byte seconds, 5 process-random bytes, 3-byte counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let secs = Utc::now().timestamp() as u32;
        let counter = OID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed) & 0x00FF_FFFF;
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn parse_hex(s: &str) -> Result<Self> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(QuarryError::BadValue(format!("invalid ObjectId hex string '{}'", s)));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| QuarryError::BadValue(format!("invalid ObjectId hex string '{}'", s)))?;
        }
        Ok(ObjectId(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(\"{}\")", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ========== DECIMAL128 ==========

/// Decimal kept in its canonical string form.
///
/// Ordering and arithmetic go through `f64`; the string is what round-trips.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decimal128(String);

impl Decimal128 {
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let valid = matches!(trimmed, "NaN" | "Infinity" | "-Infinity" | "Inf" | "-Inf")
            || trimmed.parse::<f64>().is_ok();
        if !valid {
            return Err(QuarryError::BadValue(format!("invalid decimal128 string '{}'", s)));
        }
        Ok(Decimal128(trimmed.to_string()))
    }

    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            Decimal128("NaN".into())
        } else if value.is_infinite() {
            Decimal128(if value > 0.0 { "Infinity" } else { "-Infinity" }.into())
        } else {
            Decimal128(format!("{}", value))
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self.0.as_str() {
            "NaN" => f64::NAN,
            "Infinity" | "Inf" => f64::INFINITY,
            "-Infinity" | "-Inf" => f64::NEG_INFINITY,
            s => s.parse().unwrap_or(f64::NAN),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ========== BINARY ==========

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

// ========== VALUE ==========

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    MinKey,
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal128(Decimal128),
    String(String),
    Document(Document),
    Array(Vec<Value>),
    Binary(Binary),
    ObjectId(ObjectId),
    Bool(bool),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    MaxKey,
}

/// Canonical type rank used for cross-type ordering.
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::MinKey => 0,
        Value::Null => 5,
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal128(_) => 10,
        Value::String(_) => 15,
        Value::Document(_) => 20,
        Value::Array(_) => 25,
        Value::Binary(_) => 30,
        Value::ObjectId(_) => 35,
        Value::Bool(_) => 40,
        Value::Date(_) => 45,
        Value::MaxKey => 127,
    }
}

impl Value {
    /// Type name as reported by `$type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::MinKey => "minKey",
            Value::Null => "null",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
            Value::Double(_) => "double",
            Value::Decimal128(_) => "decimal",
            Value::String(_) => "string",
            Value::Document(_) => "object",
            Value::Array(_) => "array",
            Value::Binary(_) => "binData",
            Value::ObjectId(_) => "objectId",
            Value::Bool(_) => "bool",
            Value::Date(_) => "date",
            Value::MaxKey => "maxKey",
        }
    }

    /// Numeric BSON type code.
    pub fn type_code(&self) -> i32 {
        match self {
            Value::MinKey => -1,
            Value::Double(_) => 1,
            Value::String(_) => 2,
            Value::Document(_) => 3,
            Value::Array(_) => 4,
            Value::Binary(_) => 5,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::Date(_) => 9,
            Value::Null => 10,
            Value::Int32(_) => 16,
            Value::Int64(_) => 18,
            Value::Decimal128(_) => 19,
            Value::MaxKey => 127,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal128(_)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            Value::Decimal128(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    /// Integral numbers (including integral doubles) as `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            Value::Double(d) if d.fract() == 0.0 && d.abs() < 9.2e18 => Some(*d as i64),
            Value::Decimal128(d) => {
                let f = d.to_f64();
                (f.fract() == 0.0 && f.abs() < 9.2e18).then_some(f as i64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Truthiness as used by expressions: false, null, and zero are false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            v if v.is_number() => v.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => true,
        }
    }

    /// Approximate BSON-encoded size of the value payload.
    pub fn bson_size(&self) -> usize {
        match self {
            Value::MinKey | Value::MaxKey | Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int32(_) => 4,
            Value::Int64(_) | Value::Double(_) | Value::Date(_) => 8,
            Value::Decimal128(_) => 16,
            Value::ObjectId(_) => 12,
            Value::String(s) => 4 + s.len() + 1,
            Value::Binary(b) => 4 + 1 + b.bytes.len(),
            Value::Document(d) => d.bson_size(),
            Value::Array(items) => {
                5 + items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| 1 + decimal_len(i) + 1 + v.bson_size())
                    .sum::<usize>()
            }
        }
    }

    // ========== EXTENDED JSON ==========

    /// Convert from (relaxed) extended JSON.
    pub fn from_json(json: &JsonValue) -> Result<Value> {
        Ok(match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if let Ok(small) = i32::try_from(i) {
                        Value::Int32(small)
                    } else {
                        Value::Int64(i)
                    }
                } else if let Some(u) = n.as_u64() {
                    Value::Double(u as f64)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect::<Result<_>>()?)
            }
            JsonValue::Object(map) => {
                if let (1, Some((key, inner))) = (map.len(), map.iter().next()) {
                    if let Some(special) = Value::from_extended(key, inner)? {
                        return Ok(special);
                    }
                }
                Value::Document(Document::from_json_map(map)?)
            }
        })
    }

    fn from_extended(key: &str, inner: &JsonValue) -> Result<Option<Value>> {
        let bad = |what: &str| QuarryError::BadValue(format!("invalid {} value: {}", what, inner));
        Ok(Some(match key {
            "$oid" => Value::ObjectId(ObjectId::parse_hex(inner.as_str().ok_or_else(|| bad("$oid"))?)?),
            "$numberDecimal" => {
                Value::Decimal128(Decimal128::parse(inner.as_str().ok_or_else(|| bad("$numberDecimal"))?)?)
            }
            "$numberLong" => Value::Int64(
                inner
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| bad("$numberLong"))?,
            ),
            "$numberInt" => Value::Int32(
                inner
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| bad("$numberInt"))?,
            ),
            "$numberDouble" => Value::Double(match inner.as_str() {
                Some("NaN") => f64::NAN,
                Some("Infinity") => f64::INFINITY,
                Some("-Infinity") => f64::NEG_INFINITY,
                Some(s) => s.parse().map_err(|_| bad("$numberDouble"))?,
                None => return Err(bad("$numberDouble")),
            }),
            "$date" => Value::Date(parse_date(inner).ok_or_else(|| bad("$date"))?),
            "$minKey" => Value::MinKey,
            "$maxKey" => Value::MaxKey,
            "$binary" => {
                let hex = inner.get("hex").and_then(|h| h.as_str()).ok_or_else(|| bad("$binary"))?;
                let subtype = inner
                    .get("subType")
                    .and_then(|s| s.as_str())
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .unwrap_or(0);
                Value::Binary(Binary {
                    subtype,
                    bytes: decode_hex(hex).ok_or_else(|| bad("$binary"))?,
                })
            }
            _ => return Ok(None),
        }))
    }

    /// Convert to relaxed extended JSON.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::MinKey => json!({"$minKey": 1}),
            Value::MaxKey => json!({"$maxKey": 1}),
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int32(i) => json!(i),
            Value::Int64(i) => json!(i),
            Value::Double(d) => {
                if d.is_finite() {
                    json!(d)
                } else {
                    json!({"$numberDouble": if d.is_nan() { "NaN".to_string() } else if *d > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }})
                }
            }
            Value::Decimal128(d) => json!({"$numberDecimal": d.as_str()}),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Document(d) => d.to_json(),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Binary(b) => json!({"$binary": {"hex": encode_hex(&b.bytes), "subType": format!("{:02x}", b.subtype)}}),
            Value::ObjectId(oid) => json!({"$oid": oid.to_hex()}),
            Value::Date(ms) => match Utc.timestamp_millis_opt(*ms).single() {
                Some(dt) => json!({"$date": dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)}),
                None => json!({"$date": {"$numberLong": ms.to_string()}}),
            },
        }
    }

    pub fn now() -> Value {
        Value::Date(Utc::now().timestamp_millis())
    }
}

fn parse_date(inner: &JsonValue) -> Option<i64> {
    match inner {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis()),
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::Object(map) => map.get("$numberLong").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
        _ => None,
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

// ========== ORDERING ==========

/// Compare two numbers of any numeric variant.
fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    let int_of = |v: &Value| match v {
        Value::Int32(i) => Some(*i as i64),
        Value::Int64(i) => Some(*i),
        _ => None,
    };
    if let (Some(x), Some(y)) = (int_of(a), int_of(b)) {
        return x.cmp(&y);
    }
    if let (Some(x), Value::Double(y)) = (int_of(a), b) {
        return compare_int_double(x, *y);
    }
    if let (Value::Double(x), Some(y)) = (a, int_of(b)) {
        return compare_int_double(y, *x).reverse();
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    compare_doubles(x, y)
}

fn compare_int_double(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Greater;
    }
    match (i as f64).partial_cmp(&d).unwrap_or(Ordering::Equal) {
        Ordering::Equal if d.abs() < 9.2e18 => i.cmp(&(d as i64)),
        other => other,
    }
}

/// Total order on doubles: NaN first, then numeric order, -0.0 == 0.0.
pub fn compare_doubles(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Compare values under an optional collation (strings only are affected).
pub fn compare_values(a: &Value, b: &Value, collation: Option<&Collation>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => match collation {
            Some(c) => c.compare_str(x, y),
            None => x.as_bytes().cmp(y.as_bytes()),
        },
        (Value::Document(x), Value::Document(y)) => compare_documents(x, y, collation),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Binary(x), Value::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(x.subtype.cmp(&y.subtype))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Value::ObjectId(x), Value::ObjectId(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (x, y) if x.is_number() && y.is_number() => compare_numbers(x, y),
        _ => Ordering::Equal,
    }
}

pub fn compare_documents(a: &Document, b: &Document, collation: Option<&Collation>) -> Ordering {
    let mut left = a.iter();
    let mut right = b.iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = type_rank(va)
                    .cmp(&type_rank(vb))
                    .then_with(|| ka.cmp(kb))
                    .then_with(|| compare_values(va, vb, collation));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        compare_values(self, other, None) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(self, other, None)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        type_rank(self).hash(state);
        match self {
            Value::MinKey | Value::MaxKey | Value::Null => {}
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal128(_) => {
                match self {
                    Value::Int32(i) => (*i as i64).hash(state),
                    Value::Int64(i) => i.hash(state),
                    _ => {
                        let f = self.as_f64().unwrap_or(f64::NAN);
                        if f.is_nan() {
                            u64::MAX.hash(state);
                        } else if f.fract() == 0.0 && f.abs() < 9.2e18 {
                            (f as i64).hash(state);
                        } else {
                            f.to_bits().hash(state);
                        }
                    }
                }
            }
            Value::String(s) => s.hash(state),
            Value::Document(d) => d.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Binary(b) => b.hash(state),
            Value::ObjectId(oid) => oid.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Date(ms) => ms.hash(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_cross_type_order() {
        let ordered = vec![
            Value::MinKey,
            Value::Null,
            Value::Int32(5),
            Value::String("a".into()),
            Value::Document(Document::new()),
            Value::Array(vec![]),
            Value::ObjectId(ObjectId::new()),
            Value::Bool(false),
            Value::Date(0),
            Value::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].cmp(&pair[1]), Ordering::Less, "{:?} < {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_numbers_compare_across_variants() {
        assert_eq!(Value::Int32(1), Value::Double(1.0));
        assert_eq!(Value::Int64(1), Value::Decimal128(Decimal128::parse("1.0").unwrap()));
        assert!(Value::Int64(i64::MAX) > Value::Double(9.0e18));
        assert!(Value::Double(f64::NAN) < Value::Double(f64::NEG_INFINITY));
        assert_eq!(hash_of(&Value::Int32(7)), hash_of(&Value::Double(7.0)));
        assert_eq!(Value::Double(0.0), Value::Double(-0.0));
    }

    #[test]
    fn test_extended_json_round_trip() {
        let oid = ObjectId::new();
        let src = json!({
            "a": {"$oid": oid.to_hex()},
            "b": {"$numberDecimal": "1.5"},
            "c": {"$date": "2024-01-02T03:04:05.006Z"},
            "e": [1, "x", null]
        });
        let value = Value::from_json(&src).unwrap();
        let doc = value.as_document().unwrap();
        assert_eq!(doc.get("a"), Some(&Value::ObjectId(oid)));
        assert_eq!(value.to_json(), src);

        let long = Value::from_json(&json!({"$numberLong": "9000000000"})).unwrap();
        assert!(matches!(long, Value::Int64(9_000_000_000)));
    }

    #[test]
    fn test_object_ids_are_increasing() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert_eq!(ObjectId::parse_hex(&a.to_hex()).unwrap(), a);
        assert!(ObjectId::parse_hex("zz").is_err());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i32>().prop_map(Value::Int32),
            any::<i64>().prop_map(Value::Int64),
            any::<f64>().prop_map(Value::Double),
            "[a-z]{0,4}".prop_map(Value::String),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Date),
        ]
    }

    proptest! {
        #[test]
        fn prop_ordering_is_total_and_antisymmetric(a in arb_value(), b in arb_value()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a == b {
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }
        }

        #[test]
        fn prop_ordering_is_transitive(a in arb_value(), b in arb_value(), c in arb_value()) {
            let mut sorted = vec![a, b, c];
            sorted.sort();
            prop_assert!(sorted[0] <= sorted[1] && sorted[1] <= sorted[2] && sorted[0] <= sorted[2]);
        }
    }
}
