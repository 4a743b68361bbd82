//! Canonical encoding of equality/null row filters.
//!
//! A [`Filter`] serves twice: its encoded form is part of the subscription key and it is also
//! the predicate handed to the backend. Encoding is independent of insertion order because the
//! columns are kept sorted.

use crate::event::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Separator between the channel name and the encoded filter inside a subscription key.
pub const KEY_SEPARATOR: &str = "::";

/// An equality filter over row columns. A `null` value matches a null or missing column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

/// Errors raised while parsing an encoded server filter.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    /// The input contained no clauses.
    #[error("empty filter")]
    Empty,
    /// A clause was not of the form `column=operator.value`.
    #[error("malformed clause: {0}")]
    MalformedClause(String),
    /// The clause used something other than `eq.` or `is.null`.
    #[error("unsupported operator in clause: {0}")]
    UnsupportedOperator(String),
    /// A percent escape was truncated, not hex, or decoded to invalid UTF-8.
    #[error("invalid escape sequence in: {0}")]
    InvalidEscape(String),
}

impl Filter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds an equality clause.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Adds an `IS NULL` clause.
    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.0.insert(column.into(), Value::Null);
        self
    }

    /// Inserts or replaces the clause for `column`.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Returns the expected value of `column`, if the filter constrains it.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// The number of clauses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the filter has no clauses.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the clauses in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns true if every clause holds for `row`. A missing row only satisfies an empty
    /// filter.
    pub fn matches(&self, row: Option<&Row>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(row) = row else {
            return false;
        };
        self.0
            .iter()
            .all(|(column, expected)| value_matches(expected, row.get(column)))
    }

    /// Encodes the filter in the server filter syntax, e.g. `report_id=eq.R1&deleted_at=is.null`.
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(column, value)| {
                let column = escape(column);
                match scalar_text(value) {
                    None => format!("{column}=is.null"),
                    Some(text) => format!("{column}=eq.{}", escape(&text)),
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Parses the output of [`Filter::encode`]. Values come back as strings and `is.null` as
    /// JSON null, which compares equal under [`Filter::matches`].
    pub fn parse_server_filter(input: &str) -> Result<Self, FilterError> {
        if input.is_empty() {
            return Err(FilterError::Empty);
        }
        let mut filter = Filter::new();
        for clause in input.split('&') {
            let (column, rhs) = clause
                .split_once('=')
                .ok_or_else(|| FilterError::MalformedClause(clause.to_string()))?;
            if column.is_empty() {
                return Err(FilterError::MalformedClause(clause.to_string()));
            }
            let column = unescape(column)?;
            if rhs == "is.null" {
                filter.0.insert(column, Value::Null);
            } else if let Some(value) = rhs.strip_prefix("eq.") {
                filter.0.insert(column, Value::String(unescape(value)?));
            } else {
                return Err(FilterError::UnsupportedOperator(clause.to_string()));
            }
        }
        Ok(filter)
    }
}

impl<K, V> FromIterator<(K, V)> for Filter
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Encodes an optional filter. `None` is the "no filter" sentinel: the subscription is global.
/// An empty filter is treated the same way.
pub fn encode_filter(filter: Option<&Filter>) -> Option<String> {
    filter.filter(|f| !f.is_empty()).map(Filter::encode)
}

/// Builds the subscription key `channel[::serverFilter]`.
pub fn subscription_key(channel_name: &str, filter: Option<&Filter>) -> String {
    match encode_filter(filter) {
        Some(encoded) => format!("{channel_name}{KEY_SEPARATOR}{encoded}"),
        None => channel_name.to_string(),
    }
}

/// The text a scalar is compared and encoded by. `None` for JSON null.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_matches(expected: &Value, actual: Option<&Value>) -> bool {
    let actual = actual.unwrap_or(&Value::Null);
    match (scalar_text(expected), scalar_text(actual)) {
        (None, None) => true,
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape(input: &str) -> Result<String, FilterError> {
    let invalid = || FilterError::InvalidEscape(input.to_string());
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or_else(invalid)?;
            let hex = std::str::from_utf8(hex).map_err(|_| invalid())?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn no_filter_is_global() {
        assert_eq!(encode_filter(None), None);
        assert_eq!(encode_filter(Some(&Filter::new())), None);
        assert_eq!(subscription_key("reports", None), "reports");
    }

    #[test]
    fn encodes_in_column_order() {
        let filter = Filter::new().eq("user_id", "u1").eq("report_id", "R1");
        assert_eq!(filter.encode(), "report_id=eq.R1&user_id=eq.u1");
        assert_eq!(
            subscription_key("reports", Some(&filter)),
            "reports::report_id=eq.R1&user_id=eq.u1"
        );
    }

    #[test]
    fn null_is_distinct_from_the_string_null() {
        let null = Filter::new().is_null("approved_at");
        let text = Filter::new().eq("approved_at", "null");
        assert_eq!(null.encode(), "approved_at=is.null");
        assert_eq!(text.encode(), "approved_at=eq.null");
        assert_ne!(null.encode(), text.encode());
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let filter = Filter::new().eq("note", "a&b=c::d%");
        let encoded = filter.encode();
        assert_eq!(encoded, "note=eq.a%26b%3Dc%3A%3Ad%25");
        assert!(!encoded.contains("::"));
    }

    #[test]
    fn numbers_and_booleans_use_json_text() {
        let filter = Filter::new().eq("table_id", 42).eq("active", true);
        assert_eq!(filter.encode(), "active=eq.true&table_id=eq.42");
    }

    #[test]
    fn parse_reverses_encode() {
        let filter = Filter::new()
            .eq("report_id", "R 1&x")
            .is_null("deleted_at")
            .eq("count", 3);
        let parsed = Filter::parse_server_filter(&filter.encode()).unwrap();
        assert_eq!(parsed.get("report_id"), Some(&json!("R 1&x")));
        assert_eq!(parsed.get("deleted_at"), Some(&Value::Null));
        assert_eq!(parsed.get("count"), Some(&json!("3")));
        assert_eq!(parsed.encode(), filter.encode());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_eq!(Filter::parse_server_filter(""), Err(FilterError::Empty));
        assert!(matches!(
            Filter::parse_server_filter("report_id"),
            Err(FilterError::MalformedClause(_))
        ));
        assert!(matches!(
            Filter::parse_server_filter("report_id=gt.3"),
            Err(FilterError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            Filter::parse_server_filter("report_id=eq.%2"),
            Err(FilterError::InvalidEscape(_))
        ));
    }

    #[test]
    fn matches_equal_columns_only() {
        let filter = Filter::new().eq("report_id", "R1");
        assert!(filter.matches(Some(&row(json!({"report_id": "R1", "x": 1})))));
        assert!(!filter.matches(Some(&row(json!({"report_id": "R2"})))));
        assert!(!filter.matches(Some(&row(json!({"other": "R1"})))));
        assert!(!filter.matches(None));
    }

    #[test]
    fn matches_numbers_against_their_text() {
        let parsed = Filter::parse_server_filter("table_id=eq.7").unwrap();
        assert!(parsed.matches(Some(&row(json!({"table_id": 7})))));
        assert!(Filter::new().eq("table_id", 7).matches(Some(&row(json!({"table_id": "7"})))));
    }

    #[test]
    fn scalars_match_across_json_types_by_text() {
        let row = row(json!({"report_id": "1", "active": "true", "flag": true}));
        assert!(Filter::new().eq("report_id", 1).matches(Some(&row)));
        assert!(Filter::new().eq("active", true).matches(Some(&row)));
        assert!(Filter::new().eq("flag", "true").matches(Some(&row)));
        assert!(!Filter::new().eq("report_id", 2).matches(Some(&row)));
        assert!(!Filter::new().eq("flag", false).matches(Some(&row)));
    }

    #[test]
    fn null_matches_missing_or_null_columns() {
        let filter = Filter::new().is_null("approved_at");
        assert!(filter.matches(Some(&row(json!({"approved_at": null})))));
        assert!(filter.matches(Some(&row(json!({})))));
        assert!(!filter.matches(Some(&row(json!({"approved_at": "2024-01-01"})))));
        assert!(!filter.matches(Some(&row(json!({"approved_at": "null"})))));
    }

    proptest! {
        #[test]
        fn key_is_independent_of_insertion_order(
            pairs in proptest::collection::btree_map("[a-z_&=:%]{1,8}", "[ -~]{0,8}", 1..6),
            seed in any::<u64>(),
        ) {
            let forward: Filter = pairs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

            let mut shuffled: Vec<_> = pairs.into_iter().collect();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            let mut backward = Filter::new();
            for (k, v) in shuffled {
                backward.insert(k, v);
            }

            prop_assert_eq!(
                subscription_key("reports", Some(&forward)),
                subscription_key("reports", Some(&backward))
            );
        }
    }
}
