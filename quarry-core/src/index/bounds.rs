// quarry-core/src/index/bounds.rs
//! Index bounds: for every key pattern field, an ordered list of disjoint
//! intervals in value space. `$in` and `$or` produce unions of intervals,
//! conjunctions on one field intersect them.

use std::cmp::Ordering;

use crate::document::Document;
use crate::value::{type_rank, Binary, ObjectId, Value};

use super::key::{Direction, IndexKey, KeyPart};

#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub low: Value,
    pub low_inclusive: bool,
    pub high: Value,
    pub high_inclusive: bool,
}

impl Interval {
    pub fn new(low: Value, low_inclusive: bool, high: Value, high_inclusive: bool) -> Self {
        Interval {
            low,
            low_inclusive,
            high,
            high_inclusive,
        }
    }

    pub fn point(value: Value) -> Self {
        Interval::new(value.clone(), true, value, true)
    }

    pub fn all() -> Self {
        Interval::new(Value::MinKey, true, Value::MaxKey, true)
    }

    /// Every value of `value`'s canonical type.
    pub fn type_bracket(value: &Value) -> Self {
        match value {
            Value::MinKey | Value::MaxKey => Interval::point(value.clone()),
            _ => {
                let rank = type_rank(value);
                Interval::new(type_min(rank), true, type_upper(rank), false)
            }
        }
    }

    pub fn is_point(&self) -> bool {
        self.low_inclusive && self.high_inclusive && self.low == self.high
    }

    pub fn is_all(&self) -> bool {
        matches!(self.low, Value::MinKey) && matches!(self.high, Value::MaxKey) && self.low_inclusive && self.high_inclusive
    }

    pub fn is_empty(&self) -> bool {
        match self.low.cmp(&self.high) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.low_inclusive && self.high_inclusive),
            Ordering::Less => false,
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        let above_low = match value.cmp(&self.low) {
            Ordering::Greater => true,
            Ordering::Equal => self.low_inclusive,
            Ordering::Less => false,
        };
        let below_high = match value.cmp(&self.high) {
            Ordering::Less => true,
            Ordering::Equal => self.high_inclusive,
            Ordering::Greater => false,
        };
        above_low && below_high
    }

    fn intersect(&self, other: &Interval) -> Option<Interval> {
        let (low, low_inclusive) = match self.low.cmp(&other.low) {
            Ordering::Greater => (self.low.clone(), self.low_inclusive),
            Ordering::Less => (other.low.clone(), other.low_inclusive),
            Ordering::Equal => (self.low.clone(), self.low_inclusive && other.low_inclusive),
        };
        let (high, high_inclusive) = match self.high.cmp(&other.high) {
            Ordering::Less => (self.high.clone(), self.high_inclusive),
            Ordering::Greater => (other.high.clone(), other.high_inclusive),
            Ordering::Equal => (self.high.clone(), self.high_inclusive && other.high_inclusive),
        };
        let interval = Interval::new(low, low_inclusive, high, high_inclusive);
        (!interval.is_empty()).then_some(interval)
    }

    /// Whether `self` (sorted before `next`) touches or overlaps `next`.
    fn touches(&self, next: &Interval) -> bool {
        match self.high.cmp(&next.low) {
            Ordering::Greater => true,
            Ordering::Equal => self.high_inclusive || next.low_inclusive,
            Ordering::Less => false,
        }
    }

    fn compare_low(&self, other: &Interval) -> Ordering {
        self.low
            .cmp(&other.low)
            .then_with(|| other.low_inclusive.cmp(&self.low_inclusive))
    }
}

/// Smallest value of a canonical type rank.
fn type_min(rank: u8) -> Value {
    match rank {
        0 => Value::MinKey,
        5 => Value::Null,
        10 => Value::Double(f64::NAN),
        15 => Value::String(String::new()),
        20 => Value::Document(Document::new()),
        25 => Value::Array(Vec::new()),
        30 => Value::Binary(Binary {
            subtype: 0,
            bytes: Vec::new(),
        }),
        35 => Value::ObjectId(ObjectId::from_bytes([0; 12])),
        40 => Value::Bool(false),
        45 => Value::Date(i64::MIN),
        _ => Value::MaxKey,
    }
}

/// Exclusive upper bound of a type rank: the smallest value of the next rank.
fn type_upper(rank: u8) -> Value {
    const RANKS: [u8; 11] = [0, 5, 10, 15, 20, 25, 30, 35, 40, 45, 127];
    let next = RANKS.iter().copied().find(|r| *r > rank).unwrap_or(127);
    type_min(next)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedIntervalList(Vec<Interval>);

impl OrderedIntervalList {
    pub fn new(intervals: Vec<Interval>) -> Self {
        let mut list = OrderedIntervalList(intervals);
        list.normalize();
        list
    }

    pub fn all() -> Self {
        OrderedIntervalList(vec![Interval::all()])
    }

    pub fn empty() -> Self {
        OrderedIntervalList(Vec::new())
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.0
    }

    pub fn is_all(&self) -> bool {
        self.0.len() == 1 && self.0[0].is_all()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_points(&self) -> bool {
        self.0.iter().all(Interval::is_point)
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.0.iter().any(|i| i.contains(value))
    }

    fn normalize(&mut self) {
        self.0.retain(|i| !i.is_empty());
        self.0.sort_by(|a, b| a.compare_low(b));
        let mut merged: Vec<Interval> = Vec::with_capacity(self.0.len());
        for interval in self.0.drain(..) {
            match merged.last_mut() {
                Some(last) if last.touches(&interval) => match interval.high.cmp(&last.high) {
                    Ordering::Greater => {
                        last.high = interval.high;
                        last.high_inclusive = interval.high_inclusive;
                    }
                    Ordering::Equal => last.high_inclusive |= interval.high_inclusive,
                    Ordering::Less => {}
                },
                _ => merged.push(interval),
            }
        }
        self.0 = merged;
    }

    pub fn union(&self, other: &OrderedIntervalList) -> OrderedIntervalList {
        let mut all = self.0.clone();
        all.extend(other.0.iter().cloned());
        OrderedIntervalList::new(all)
    }

    pub fn intersect(&self, other: &OrderedIntervalList) -> OrderedIntervalList {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in &other.0 {
                if let Some(i) = a.intersect(b) {
                    out.push(i);
                }
            }
        }
        OrderedIntervalList::new(out)
    }

    /// Render as `["[1, 1]", "(5, MaxKey]"]` for explain.
    pub fn describe(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|i| {
                format!(
                    "{}{}, {}{}",
                    if i.low_inclusive { "[" } else { "(" },
                    i.low,
                    i.high,
                    if i.high_inclusive { "]" } else { ")" }
                )
            })
            .collect()
    }
}

/// Bounds over a whole key pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBounds {
    pub fields: Vec<OrderedIntervalList>,
}

impl IndexBounds {
    pub fn all(fields: usize) -> Self {
        IndexBounds {
            fields: vec![OrderedIntervalList::all(); fields],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.iter().any(OrderedIntervalList::is_empty)
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        self.fields
            .iter()
            .zip(key.values())
            .all(|(list, value)| list.contains(value))
    }

    /// Key-space ranges to visit, in ascending key order. Each range is the
    /// inclusive span of keys whose first component lies in one interval of
    /// the first field's list.
    pub(crate) fn first_field_ranges(&self, directions: &[Direction]) -> Vec<(IndexKey, IndexKey)> {
        let Some(first) = self.fields.first() else {
            return Vec::new();
        };
        let direction = directions.first().copied().unwrap_or(Direction::Ascending);
        let width = directions.len().max(1);
        let mut ranges: Vec<(IndexKey, IndexKey)> = first
            .intervals()
            .iter()
            .map(|interval| {
                let (lo, hi) = match direction {
                    Direction::Ascending => (KeyPart::Asc(interval.low.clone()), KeyPart::Asc(interval.high.clone())),
                    Direction::Descending => {
                        (KeyPart::Desc(interval.high.clone()), KeyPart::Desc(interval.low.clone()))
                    }
                };
                (IndexKey(vec![lo]), upper_sentinel(hi, width))
            })
            .collect();
        if direction == Direction::Descending {
            ranges.reverse();
        }
        ranges
    }

    pub fn describe(&self, field_names: &[String]) -> Document {
        let mut doc = Document::new();
        for (name, list) in field_names.iter().zip(self.fields.iter()) {
            doc.insert(
                name.clone(),
                Value::Array(list.describe().into_iter().map(Value::String).collect()),
            );
        }
        doc
    }
}

/// A key at least as large as every key whose first component is `part`.
pub(crate) fn upper_sentinel(part: KeyPart, width: usize) -> IndexKey {
    let mut parts = Vec::with_capacity(width + 1);
    parts.push(part);
    // Desc(MinKey) orders after every other key part.
    parts.extend(std::iter::repeat(KeyPart::Desc(Value::MinKey)).take(width));
    IndexKey(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(list: &OrderedIntervalList) -> Vec<(i64, i64)> {
        list.intervals()
            .iter()
            .map(|i| (i.low.as_i64().unwrap(), i.high.as_i64().unwrap()))
            .collect()
    }

    #[test]
    fn test_union_merges_overlaps() {
        let list = OrderedIntervalList::new(vec![
            Interval::point(Value::Int32(5)),
            Interval::new(Value::Int32(1), true, Value::Int32(3), true),
            Interval::new(Value::Int32(2), true, Value::Int32(4), false),
            Interval::point(Value::Int32(1)),
        ]);
        assert_eq!(ints(&list), vec![(1, 4), (5, 5)]);
        assert!(list.contains(&Value::Int32(3)));
        assert!(!list.contains(&Value::Int32(4)));
    }

    #[test]
    fn test_intersection() {
        let gt = OrderedIntervalList::new(vec![Interval::new(Value::Int32(2), false, Value::MaxKey, true)]);
        let lte = OrderedIntervalList::new(vec![Interval::new(Value::MinKey, true, Value::Int32(6), true)]);
        let both = gt.intersect(&lte);
        assert_eq!(both.intervals().len(), 1);
        assert!(!both.contains(&Value::Int32(2)));
        assert!(both.contains(&Value::Int32(6)));
        let none = both.intersect(&OrderedIntervalList::new(vec![Interval::point(Value::Int32(9))]));
        assert!(none.is_empty());
    }

    #[test]
    fn test_type_bracket() {
        let numbers = Interval::type_bracket(&Value::Int32(5));
        assert!(numbers.contains(&Value::Double(-1e300)));
        assert!(!numbers.contains(&Value::String("5".into())));
        let strings = Interval::type_bracket(&Value::from("a"));
        assert!(strings.contains(&Value::from("")));
        assert!(!strings.contains(&Value::Document(Document::new())));
    }

    #[test]
    fn test_sentinel_orders_after_continuations() {
        let sentinel = upper_sentinel(KeyPart::Asc(Value::Int32(3)), 2);
        let key = IndexKey(vec![KeyPart::Asc(Value::Int32(3)), KeyPart::Desc(Value::MaxKey)]);
        let asc_key = IndexKey(vec![KeyPart::Asc(Value::Int32(3)), KeyPart::Asc(Value::MaxKey)]);
        assert!(key < sentinel);
        assert!(asc_key < sentinel);
        assert!(IndexKey(vec![KeyPart::Asc(Value::Int32(4))]) > sentinel);
    }
}
