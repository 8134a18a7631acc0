use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local};
use thiserror::Error;

/// Property name carrying the logger category, rendered by `{SourceContext}`.
pub const SOURCE_CONTEXT: &str = "SourceContext";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Verbose,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl Level {
    pub const MINIMUM: Level = Level::Verbose;

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Verbose => "Verbose",
            Level::Debug => "Debug",
            Level::Information => "Information",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verbose" | "trace" | "vrb" => Ok(Level::Verbose),
            "debug" | "dbg" => Ok(Level::Debug),
            "information" | "info" | "inf" => Ok(Level::Information),
            "warning" | "warn" | "wrn" => Ok(Level::Warning),
            "error" | "err" => Ok(Level::Error),
            "fatal" | "critical" | "ftl" => Ok(Level::Fatal),
            _ => Err(ParseLevelError(s.to_owned())),
        }
    }
}

/// A single structured log record handed to the sink.
///
/// The sink never mutates an event after `enqueue`; it is moved into the
/// queue and from there into exactly one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<FixedOffset>,
    pub level: Level,
    pub message: String,
    pub exception: Option<String>,
    /// Insertion-ordered so `{Properties}` renders deterministically.
    pub properties: Vec<(String, String)>,
}

impl LogEvent {
    /// Event stamped with the local wall clock.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().fixed_offset(),
            level,
            message: message.into(),
            exception: None,
            properties: Vec::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Add or replace a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.properties.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.properties.push((name, value)),
        }
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn source_context(&self) -> Option<&str> {
        self.property(SOURCE_CONTEXT)
    }
}
