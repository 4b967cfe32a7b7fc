//! Flat key/value view of a task specification.

use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::SpecificationError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Ordered map from dotted key to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parset {
    entries: IndexMap<String, String>,
}

impl Parset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Build from a JSON object. Scalars are stringified; nested values keep
    /// their JSON text. `null` entries are skipped.
    pub fn from_json(value: &Value) -> Result<Self, SpecificationError> {
        let Value::Object(map) = value else {
            return Err(SpecificationError::NotAnObject(json_type(value).into()));
        };
        let entries = map
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::Null => return None,
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    other => other.to_string(),
                };
                Some((k.clone(), text))
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Trimmed value; blank values count as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require_str(&self, key: &str) -> Result<&str, SpecificationError> {
        self.get_str(key)
            .ok_or_else(|| SpecificationError::MissingField(key.to_string()))
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, SpecificationError> {
        self.get_str(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| SpecificationError::malformed(key, v, "not a non-negative integer"))
            })
            .transpose()
    }

    /// Parse a vector value such as `[L123, T456]` or `L1;L2` into its
    /// trimmed, non-empty elements. Absent keys give an empty vector.
    pub fn get_vector(&self, key: &str) -> Vec<String> {
        let Some(raw) = self.get_str(key) else {
            return Vec::new();
        };
        let inner = raw
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .unwrap_or(raw);
        inner
            .split([',', ';'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Parse `YYYY-MM-DD HH:MM:SS` (UTC) or RFC 3339.
    pub fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, SpecificationError> {
        let Some(raw) = self.get_str(key) else {
            return Ok(None);
        };
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
            return Ok(Some(naive.and_utc()));
        }
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| SpecificationError::malformed(key, raw, "not a timestamp"))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parset {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn json_scalars_are_stringified() {
        let parset = Parset::from_json(&json!({
            "a.string": "Pipeline",
            "a.number": 16,
            "a.bool": true,
            "a.null": null,
        }))
        .unwrap();
        assert_eq!(parset.get_str("a.string"), Some("Pipeline"));
        assert_eq!(parset.get_u32("a.number").unwrap(), Some(16));
        assert_eq!(parset.get_str("a.bool"), Some("true"));
        assert!(!parset.contains_key("a.null"));
    }

    #[test]
    fn non_object_is_rejected() {
        let err = Parset::from_json(&json!(["x"])).unwrap_err();
        assert_eq!(err, SpecificationError::NotAnObject("an array".into()));
    }

    #[test]
    fn vectors_accept_brackets_and_separators() {
        let parset = Parset::new()
            .with("bracketed", "[L123, T456]")
            .with("semicolons", "L1;L2 ; L3")
            .with("empty", "[]");
        assert_eq!(parset.get_vector("bracketed"), vec!["L123", "T456"]);
        assert_eq!(parset.get_vector("semicolons"), vec!["L1", "L2", "L3"]);
        assert!(parset.get_vector("empty").is_empty());
        assert!(parset.get_vector("absent").is_empty());
    }

    #[test]
    fn timestamps_in_both_formats() {
        let parset = Parset::new()
            .with("plain", "2016-03-01 12:00:00")
            .with("rfc", "2016-03-01T13:00:00+01:00")
            .with("bad", "yesterday");
        let expected = Utc.with_ymd_and_hms(2016, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parset.get_timestamp("plain").unwrap(), Some(expected));
        assert_eq!(parset.get_timestamp("rfc").unwrap(), Some(expected));
        assert_eq!(parset.get_timestamp("missing").unwrap(), None);
        assert!(matches!(
            parset.get_timestamp("bad"),
            Err(SpecificationError::MalformedSpecification { .. })
        ));
    }

    #[test]
    fn blank_values_are_absent() {
        let parset = Parset::new().with("k", "   ");
        assert_eq!(parset.get_str("k"), None);
        assert_eq!(
            parset.require_str("k"),
            Err(SpecificationError::MissingField("k".into()))
        );
    }
}
