//! Line transformers
//!
//! A transformer turns one raw line read from a log file into the payload
//! bytes forwarded to the collector. Transformers are pure and synchronous;
//! a failure means "drop this line", never "stop tailing".
//!
//! # Examples
//!
//! ```rust
//! use logferry::logs::log_parsers::{DockerJsonTransformer, Transformer};
//!
//! let transformer = DockerJsonTransformer::new();
//! let line = r#"{"log":"GET /health 200\n","stream":"stdout","time":"2024-01-01T12:00:00Z"}"#;
//! assert_eq!(transformer.transform(line).unwrap(), "GET /health 200\n");
//! ```

use serde::de::{Deserialize, Deserializer, IgnoredAny, MapAccess, Visitor};
use std::fmt;
use thiserror::Error;

/// A line could not be transformed and must be skipped
#[derive(Debug, Error)]
#[error("failed to transform line: {reason}")]
pub struct TransformError {
    reason: String,
}

impl TransformError {
    /// Create a transform error with a human readable reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Trait for line transformers
pub trait Transformer: Send + Sync {
    /// Map a raw line to payload bytes
    fn transform(&self, line: &str) -> Result<String, TransformError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Forwards lines unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughTransformer;

impl PassThroughTransformer {
    /// Create a new pass-through transformer
    pub fn new() -> Self {
        Self
    }
}

impl Transformer for PassThroughTransformer {
    fn transform(&self, line: &str) -> Result<String, TransformError> {
        Ok(line.to_string())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// One line of Docker's json-file log driver
///
/// The `log` key matches in any letter case and the last occurrence wins.
/// `null` or a missing key reads as an empty payload.
#[derive(Debug, Default)]
struct DockerLogLine {
    log: String,
}

impl<'de> Deserialize<'de> for DockerLogLine {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LineVisitor;

        impl<'de> Visitor<'de> for LineVisitor {
            type Value = DockerLogLine;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Docker json-file log object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut line = DockerLogLine::default();
                while let Some(key) = map.next_key::<String>()? {
                    if key.eq_ignore_ascii_case("log") {
                        line.log = map.next_value::<Option<String>>()?.unwrap_or_default();
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
                Ok(line)
            }
        }

        deserializer.deserialize_map(LineVisitor)
    }
}

/// Extracts the `log` field of Docker json-file lines
///
/// Docker keeps the original trailing newline inside the field, so the
/// extracted payloads can be concatenated as they are. A missing field
/// yields an empty payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerJsonTransformer;

impl DockerJsonTransformer {
    /// Create a new Docker JSON transformer
    pub fn new() -> Self {
        Self
    }
}

impl Transformer for DockerJsonTransformer {
    fn transform(&self, line: &str) -> Result<String, TransformError> {
        serde_json::from_str::<DockerLogLine>(line)
            .map(|parsed| parsed.log)
            .map_err(|e| TransformError::new(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "docker-json"
    }
}
