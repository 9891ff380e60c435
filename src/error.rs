//! Error types for the financial research pipeline
//!
//! Every run-level failure is one of a closed set of kinds. Each kind carries
//! the same detail shape so the reporting layer never inspects concrete types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ResearchError>;

/// Uniform payload carried by every error kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub suggestion: Option<String>,
    pub debug_detail: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            debug_detail: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_debug(mut self, debug_detail: impl Into<String>) -> Self {
        self.debug_detail = Some(debug_detail.into());
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for ErrorDetail {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ErrorDetail {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Tag callers switch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Planning,
    Query,
    DataProvider,
    Execution,
    Synthesis,
    Precondition,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Planning => "planning",
            ErrorKind::Query => "query",
            ErrorKind::DataProvider => "data_provider",
            ErrorKind::Execution => "execution",
            ErrorKind::Synthesis => "synthesis",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResearchError {
    // =============================
    // Fatal before any stage runs
    // =============================
    #[error("Configuration error: {0}")]
    Configuration(ErrorDetail),

    // =============================
    // Stage failures
    // =============================
    #[error("Planning error: {0}")]
    Planning(ErrorDetail),

    #[error("Query error: {0}")]
    Query(ErrorDetail),

    /// All providers exhausted for one task. Localized to that task.
    #[error("Data provider error: {0}")]
    DataProvider(ErrorDetail),

    /// Non-task-scoped execution failure such as a provider registry gap
    #[error("Execution error: {0}")]
    Execution(ErrorDetail),

    #[error("Synthesis error: {0}")]
    Synthesis(ErrorDetail),

    #[error("Precondition violated: {0}")]
    Precondition(ErrorDetail),

    #[error("Cancelled: {0}")]
    Cancelled(ErrorDetail),
}

impl ResearchError {
    pub fn configuration(detail: impl Into<ErrorDetail>) -> Self {
        Self::Configuration(detail.into())
    }

    pub fn planning(detail: impl Into<ErrorDetail>) -> Self {
        Self::Planning(detail.into())
    }

    pub fn execution(detail: impl Into<ErrorDetail>) -> Self {
        Self::Execution(detail.into())
    }

    pub fn synthesis(detail: impl Into<ErrorDetail>) -> Self {
        Self::Synthesis(detail.into())
    }

    pub fn precondition(detail: impl Into<ErrorDetail>) -> Self {
        Self::Precondition(detail.into())
    }

    pub fn cancelled(detail: impl Into<ErrorDetail>) -> Self {
        Self::Cancelled(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ResearchError::Configuration(_) => ErrorKind::Configuration,
            ResearchError::Planning(_) => ErrorKind::Planning,
            ResearchError::Query(_) => ErrorKind::Query,
            ResearchError::DataProvider(_) => ErrorKind::DataProvider,
            ResearchError::Execution(_) => ErrorKind::Execution,
            ResearchError::Synthesis(_) => ErrorKind::Synthesis,
            ResearchError::Precondition(_) => ErrorKind::Precondition,
            ResearchError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn detail(&self) -> &ErrorDetail {
        match self {
            ResearchError::Configuration(d)
            | ResearchError::Planning(d)
            | ResearchError::Query(d)
            | ResearchError::DataProvider(d)
            | ResearchError::Execution(d)
            | ResearchError::Synthesis(d)
            | ResearchError::Precondition(d)
            | ResearchError::Cancelled(d) => d,
        }
    }

    /// Flattened form for the reporting surface
    pub fn report(&self) -> ErrorReport {
        let detail = self.detail();
        ErrorReport {
            kind: self.kind(),
            message: detail.message.clone(),
            suggestion: detail.suggestion.clone(),
            debug_detail: detail.debug_detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: Option<String>,
    pub debug_detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_report_share_detail() {
        let err = ResearchError::Planning(
            ErrorDetail::new("plan was not valid JSON")
                .with_suggestion("retry the query")
                .with_debug("raw=<html>"),
        );

        assert_eq!(err.kind(), ErrorKind::Planning);
        assert_eq!(err.to_string(), "Planning error: plan was not valid JSON");

        let report = err.report();
        assert_eq!(report.kind, ErrorKind::Planning);
        assert_eq!(report.suggestion.as_deref(), Some("retry the query"));
        assert_eq!(report.debug_detail.as_deref(), Some("raw=<html>"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DataProvider).unwrap();
        assert_eq!(json, "\"data_provider\"");
    }
}
