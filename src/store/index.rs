//! # Index
//!
//! The filter engine: evaluation of equality, one-of, and range filters
//! over a message's indexed key-values, plus the lexicographic encoding
//! used when index values must be stored (and sorted) as strings.
//!
//! Evaluation is total and side-effect free. A filter matches iff every
//! property is present in the indexes and passes its operator; a query
//! matches iff any of its filters match.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

/// The largest integer index value that survives the string encoding with
/// its ordering intact (the double-precision safe-integer limit).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Digit width of [`MAX_SAFE_INTEGER`], the padding width for encoded
/// numbers.
const PADDING: usize = 16;

/// A single property filter.
#[derive(Clone, Debug)]
pub enum FilterVal {
    /// Match on primitive equality (type-preserving).
    Equal(Value),

    /// Match any of the specified values.
    OneOf(Vec<Value>),

    /// Match values within the range. Ranges apply to strings and numbers;
    /// booleans never match a range.
    Range(crate::Range<Value>),
}

/// Evaluate a filter (a conjunction of property filters) against an item's
/// indexes.
#[must_use]
pub fn is_match(filter: &BTreeMap<String, FilterVal>, indexes: &BTreeMap<String, Value>) -> bool {
    for (property, filter_val) in filter {
        let Some(index_val) = indexes.get(property) else {
            return false;
        };
        if !matches_value(filter_val, index_val) {
            return false;
        }
    }
    true
}

fn matches_value(filter_val: &FilterVal, index_val: &Value) -> bool {
    match filter_val {
        FilterVal::Equal(value) => equal(value, index_val),
        FilterVal::OneOf(values) => values.iter().any(|value| equal(value, index_val)),
        FilterVal::Range(range) => {
            if let Some(gt) = &range.gt {
                if compare(index_val, gt) != Some(Ordering::Greater) {
                    return false;
                }
            }
            if let Some(gte) = &range.gte {
                if compare(index_val, gte) == Some(Ordering::Less) || compare(index_val, gte).is_none() {
                    return false;
                }
            }
            if let Some(lt) = &range.lt {
                if compare(index_val, lt) != Some(Ordering::Less) {
                    return false;
                }
            }
            if let Some(lte) = &range.lte {
                if compare(index_val, lte) == Some(Ordering::Greater)
                    || compare(index_val, lte).is_none()
                {
                    return false;
                }
            }
            range.gt.is_some() || range.gte.is_some() || range.lt.is_some() || range.lte.is_some()
        }
    }
}

// Type-preserving equality: strings compare as strings, numbers as numbers.
fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// Ordered comparison over strings and numbers. Booleans (and structured
// values) are unordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        _ => None,
    }
}

/// Encode an index value as a string whose lexicographic order matches the
/// value's natural order: numbers zero-padded (negatives offset below
/// positives), strings quote-delimited to preserve control-character order.
#[must_use]
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::Number(num) => num.as_i64().map_or_else(|| num.to_string(), encode_number),
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}

/// Encode a number so that encoded values sort in numeric order: positives
/// zero-padded to the safe-integer digit width, negatives offset by
/// [`MAX_SAFE_INTEGER`] and prefixed with `!` (which sorts below digits).
#[must_use]
pub fn encode_number(num: i64) -> String {
    if num < 0 {
        format!("!{:0PADDING$}", num + MAX_SAFE_INTEGER)
    } else {
        format!("{num:0PADDING$}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::Range;

    fn indexes(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn encoded_numbers_sort_numerically() {
        let values = [-100_000_i64, -1, 0, 1, 99, 1_000_000, MAX_SAFE_INTEGER];
        let encoded: Vec<String> = values.iter().map(|v| encode_number(*v)).collect();

        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn equality_is_type_preserving() {
        let filter = BTreeMap::from([
            ("schema".to_string(), FilterVal::Equal(json!("https://example.com/note"))),
            ("dataSize".to_string(), FilterVal::Equal(json!(10))),
        ]);

        assert!(is_match(
            &filter,
            &indexes(&[("schema", json!("https://example.com/note")), ("dataSize", json!(10))])
        ));
        assert!(!is_match(
            &filter,
            &indexes(&[("schema", json!("https://example.com/note")), ("dataSize", json!("10"))])
        ));
    }

    #[test]
    fn missing_property_never_matches() {
        let filter =
            BTreeMap::from([("recipient".to_string(), FilterVal::Equal(json!("did:ex:bob")))]);
        assert!(!is_match(&filter, &indexes(&[("author", json!("did:ex:bob"))])));
    }

    #[test]
    fn one_of_matches_any() {
        let filter = BTreeMap::from([(
            "recipient".to_string(),
            FilterVal::OneOf(vec![json!("did:ex:alice"), json!("did:ex:bob")]),
        )]);

        assert!(is_match(&filter, &indexes(&[("recipient", json!("did:ex:bob"))])));
        assert!(!is_match(&filter, &indexes(&[("recipient", json!("did:ex:carol"))])));
    }

    #[test]
    fn range_over_numbers() {
        let filter = BTreeMap::from([(
            "dataSize".to_string(),
            FilterVal::Range(Range::new().gte(json!(10)).lt(json!(100))),
        )]);

        assert!(is_match(&filter, &indexes(&[("dataSize", json!(10))])));
        assert!(is_match(&filter, &indexes(&[("dataSize", json!(99))])));
        assert!(!is_match(&filter, &indexes(&[("dataSize", json!(100))])));
        assert!(!is_match(&filter, &indexes(&[("dataSize", json!(9))])));
    }

    #[test]
    fn range_over_strings() {
        let filter = BTreeMap::from([(
            "dateCreated".to_string(),
            FilterVal::Range(
                Range::new()
                    .gt(json!("2024-01-01T00:00:00.000000Z"))
                    .lte(json!("2024-12-31T23:59:59.999999Z")),
            ),
        )]);

        assert!(is_match(&filter, &indexes(&[("dateCreated", json!("2024-06-01T00:00:00.000000Z"))])));
        assert!(!is_match(&filter, &indexes(&[("dateCreated", json!("2025-01-01T00:00:00.000000Z"))])));
    }

    #[test]
    fn range_over_booleans_is_rejected() {
        let filter = BTreeMap::from([(
            "published".to_string(),
            FilterVal::Range(Range::new().gte(json!(false))),
        )]);
        assert!(!is_match(&filter, &indexes(&[("published", json!(true))])));
    }
}
