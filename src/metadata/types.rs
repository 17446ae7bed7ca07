use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Entity types used by the crate's own stores. Any string is accepted.
pub mod entity {
    pub const DOCUMENT: &str = "document";
    pub const NODE: &str = "node";
    pub const VERSION: &str = "version";
    pub const CONVERSATION: &str = "conversation";
}

/// Type hint stored next to every metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Date,
    Json,
}

impl ValueType {
    /// Best guess for an untyped value. Only objects and arrays count as JSON.
    pub fn infer(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
            return ValueType::Boolean;
        }
        if !trimmed.is_empty() && trimmed.parse::<f64>().is_ok_and(f64::is_finite) {
            return ValueType::Number;
        }
        if DateTime::parse_from_rfc3339(trimmed).is_ok()
            || NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok()
        {
            return ValueType::Date;
        }
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
        {
            return ValueType::Json;
        }
        ValueType::String
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Date => "date",
            ValueType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub key: String,
    pub value: String,
    pub value_type: ValueType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `(entity_type, entity_id)` pair returned by multi-filter queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_value_types() {
        assert_eq!(ValueType::infer("true"), ValueType::Boolean);
        assert_eq!(ValueType::infer("FALSE"), ValueType::Boolean);
        assert_eq!(ValueType::infer("42"), ValueType::Number);
        assert_eq!(ValueType::infer("-3.5"), ValueType::Number);
        assert_eq!(ValueType::infer("NaN"), ValueType::String);
        assert_eq!(ValueType::infer("2024-01-15"), ValueType::Date);
        assert_eq!(ValueType::infer("2024-01-15T10:00:00Z"), ValueType::Date);
        assert_eq!(ValueType::infer(r#"{"a":1}"#), ValueType::Json);
        assert_eq!(ValueType::infer("[1,2"), ValueType::String);
        assert_eq!(ValueType::infer("Legal"), ValueType::String);
        assert_eq!(ValueType::infer(""), ValueType::String);
    }

    #[test]
    fn value_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ValueType::Json).unwrap(), "\"json\"");
        assert_eq!(ValueType::Date.as_str(), "date");
    }
}
