//! Validation and key error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Location of the offending value (`$` for the document root, `$.url`, ...).
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Violation of a top-level field.
    pub fn field(name: &str, message: impl Into<String>) -> Self {
        Self::new(format!("$.{name}"), message)
    }
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Raw data failed schema validation.
///
/// Carries every violation the validator reported, in the order reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed for {schema}: {}", render(.violations))]
pub struct ValidationError {
    pub schema: &'static str,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new(schema: &'static str, violations: Vec<Violation>) -> Self {
        Self { schema, violations }
    }

    pub fn single(schema: &'static str, violation: Violation) -> Self {
        Self::new(schema, vec![violation])
    }
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A key component (spec name, job id, stream type, sub-key) is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} is longer than {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} contains forbidden character {found:?}: {value}")]
    ForbiddenChar {
        kind: &'static str,
        found: char,
        value: String,
    },

    #[error("{kind} must not be a relative path segment: {value}")]
    Reserved { kind: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let err = ValidationError::new(
            "Transcode",
            vec![
                Violation::field("url", "missing field"),
                Violation::field("bitrate", "must be positive"),
            ],
        );

        let msg = err.to_string();
        assert!(msg.contains("Transcode"));
        assert!(msg.contains("$.url: missing field"));
        assert!(msg.contains("$.bitrate: must be positive"));
    }
}
