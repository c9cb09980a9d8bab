//! Error types for the NGSI proxies
//!
//! Every error carries the name of the stage that raised it and a numeric
//! code. The rendered form `"<stage><NNN> <message>"` ends up in proxy logs
//! and in the `{"error": ...}` body returned to callers.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Result type for proxy operations
pub type NgsiResult<T> = Result<T, NgsiError>;

/// Stage-tagged error
#[derive(Error, Debug)]
#[error("{message}")]
pub struct NgsiError {
    stage: &'static str,
    code: u16,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl NgsiError {
    /// Create an error with no underlying cause
    pub fn new(stage: &'static str, code: u16, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create an error whose message is taken from `source`
    pub fn with_source<E>(stage: &'static str, code: u16, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            stage,
            code,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Re-tag a lower-level error with the calling stage, keeping its message
    pub fn wrap(stage: &'static str, code: u16, inner: NgsiError) -> Self {
        Self {
            stage,
            code,
            message: inner.message.clone(),
            source: Some(Box::new(inner)),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `"<stage><NNN> <message>"`
    pub fn diagnostic(&self) -> String {
        stage_message(self.stage, self.code, &self.message)
    }

    /// Borrowing adapter for `tracing` fields and `format!`
    pub fn display_diagnostic(&self) -> Diagnostic<'_> {
        Diagnostic(self)
    }
}

/// Displays an [`NgsiError`] in its diagnostic form
pub struct Diagnostic<'a>(&'a NgsiError);

impl fmt::Display for Diagnostic<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03} {}", self.0.stage, self.0.code, self.0.message)
    }
}

/// Format a log line in the `<stage><NNN> <message>` convention
pub fn stage_message(stage: &str, code: u16, message: &str) -> String {
    format!("{}{:03} {}", stage, code, message)
}
