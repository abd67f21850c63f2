//! Schema contract for job parameters and stream values.
//!
//! A schema is a Rust type: serde decides the *shape* (missing fields, wrong
//! types) and [`Schema::validate`] adds value-level invariants (non-empty
//! strings, ranges, ...). Both kinds of failure surface as one
//! [`ValidationError`].

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use crate::error::{ValidationError, Violation};

pub trait Schema: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Human-readable schema name used in error messages.
    fn schema_name() -> &'static str {
        let full = core::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Value-level invariants beyond what deserialization enforces.
    fn validate(&self) -> Result<(), Vec<Violation>> {
        Ok(())
    }

    /// Coerce raw JSON into this schema, then check its invariants.
    fn parse_value(raw: JsonValue) -> Result<Self, ValidationError> {
        let value: Self = serde_json::from_value(raw).map_err(|e| {
            ValidationError::single(Self::schema_name(), Violation::new("$", e.to_string()))
        })?;
        value.check()?;
        Ok(value)
    }

    /// Run [`Schema::validate`] and wrap its violations.
    fn check(&self) -> Result<(), ValidationError> {
        self.validate()
            .map_err(|violations| ValidationError::new(Self::schema_name(), violations))
    }

    /// Serialize a value for storage/transport.
    fn to_json(&self) -> Result<JsonValue, ValidationError> {
        serde_json::to_value(self).map_err(|e| {
            ValidationError::single(Self::schema_name(), Violation::new("$", e.to_string()))
        })
    }
}

/// Untyped schema: accepts any JSON document.
impl Schema for JsonValue {
    fn schema_name() -> &'static str {
        "json"
    }
}

/// Empty schema used when a spec declares no progress type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct NoProgress {}

impl Schema for NoProgress {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Transcode {
        url: String,
    }

    impl Schema for Transcode {
        fn validate(&self) -> Result<(), Vec<Violation>> {
            if self.url.is_empty() {
                return Err(vec![Violation::field("url", "must not be empty")]);
            }
            Ok(())
        }
    }

    #[test]
    fn parse_accepts_well_formed_payload() {
        let t = Transcode::parse_value(json!({"url": "http://x"})).unwrap();
        assert_eq!(t.url, "http://x");
    }

    #[test]
    fn parse_reports_shape_errors() {
        let err = Transcode::parse_value(json!({"uri": "http://x"})).unwrap_err();
        assert_eq!(err.schema, "Transcode");
        assert_eq!(err.violations.len(), 1);
        assert!(err.violations[0].message.contains("url"));
    }

    #[test]
    fn parse_reports_invariant_errors() {
        let err = Transcode::parse_value(json!({"url": ""})).unwrap_err();
        assert_eq!(err.violations, vec![Violation::field("url", "must not be empty")]);
    }

    #[test]
    fn no_progress_accepts_empty_object_only_shape() {
        assert!(NoProgress::parse_value(json!({})).is_ok());
        assert!(NoProgress::parse_value(json!(42)).is_err());
    }
}
