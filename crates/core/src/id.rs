//! Strongly-typed identifiers and stream keys.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KeyError;

const MAX_KEY_LEN: usize = 200;

/// Separator used when deriving stream ids from their key components.
pub const KEY_SEPARATOR: char = '/';

/// Check a single key component: non-empty, bounded, no separator, no whitespace.
pub fn check_component(kind: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { kind });
    }
    if value.chars().count() > MAX_KEY_LEN {
        return Err(KeyError::TooLong {
            kind,
            max: MAX_KEY_LEN,
        });
    }
    if let Some(found) = value
        .chars()
        .find(|c| *c == KEY_SEPARATOR || c.is_whitespace() || c.is_control())
    {
        return Err(KeyError::ForbiddenChar {
            kind,
            found,
            value: value.to_string(),
        });
    }
    if matches!(value, "." | "..") {
        return Err(KeyError::Reserved {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Identifier of a project (namespace shared by every spec of an environment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

/// Name of a job specification (unique within a project).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecName(String);

/// Identifier of a job instance (unique within a spec's namespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

macro_rules! impl_string_key {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Parse and validate a key component.
            pub fn parse(value: impl Into<String>) -> Result<Self, KeyError> {
                let value = value.into();
                check_component($name, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = KeyError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl TryFrom<String> for $t {
            type Error = KeyError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }
    };
}

impl_string_key!(ProjectId, "project id");
impl_string_key!(SpecName, "spec name");
impl_string_key!(JobId, "job id");

impl JobId {
    /// Generate a fresh id for a spec: `<spec>-<uuid v7>`.
    ///
    /// UUIDv7 keeps generated ids roughly time-ordered.
    pub fn generate(spec: &SpecName) -> Self {
        Self(format!("{}-{}", spec, Uuid::now_v7()))
    }
}

/// Kind of per-job stream.
///
/// `Custom` carries a caller-defined extension key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamType {
    Input,
    Output,
    Progress,
    Custom(String),
}

impl StreamType {
    pub fn custom(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        key.parse()
    }

    pub fn as_str(&self) -> &str {
        match self {
            StreamType::Input => "input",
            StreamType::Output => "output",
            StreamType::Progress => "progress",
            StreamType::Custom(key) => key,
        }
    }
}

impl core::fmt::Display for StreamType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_component("stream type", s)?;
        Ok(match s {
            "input" => StreamType::Input,
            "output" => StreamType::Output,
            "progress" => StreamType::Progress,
            other => StreamType::Custom(other.to_string()),
        })
    }
}

impl Serialize for StreamType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StreamType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Durable identifier of one stream, derived from its [`StreamKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Wrap an already-derived id (e.g. one read back from a substrate).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Full key of a per-job stream: `(project, spec, job id, stream type, sub-key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub project_id: ProjectId,
    pub spec: SpecName,
    pub job_id: JobId,
    pub stream_type: StreamType,
    pub sub_key: Option<String>,
}

impl StreamKey {
    pub fn new(
        project_id: ProjectId,
        spec: SpecName,
        job_id: JobId,
        stream_type: StreamType,
        sub_key: Option<String>,
    ) -> Result<Self, KeyError> {
        if let Some(sub) = &sub_key {
            check_component("sub-key", sub)?;
        }
        Ok(Self {
            project_id,
            spec,
            job_id,
            stream_type,
            sub_key,
        })
    }

    /// `<project>/<spec>/<job>/<type>[/<sub-key>]`
    pub fn stream_id(&self) -> StreamId {
        let mut id = format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.project_id,
            self.spec,
            self.job_id,
            self.stream_type,
            sep = KEY_SEPARATOR
        );
        if let Some(sub) = &self.sub_key {
            id.push(KEY_SEPARATOR);
            id.push_str(sub);
        }
        StreamId(id)
    }
}
