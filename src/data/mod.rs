//! Financial data providers
//!
//! Providers are stateless with respect to a run and may be shared across
//! concurrent runs. An empty payload is always a failure, never valid data.

use crate::error::{ErrorDetail, ResearchError};
use crate::models::{StatementPayload, StatementType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub mod alpha_vantage;
pub mod router;

pub use alpha_vantage::AlphaVantageProvider;
pub use router::ProviderRouter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("ticker not found: {0}")]
    NotFound(String),

    #[error("returned empty data")]
    Empty,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Only transient failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Unavailable(_)
        )
    }
}

/// Trait for a single statement source
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_statement(
        &self,
        statement: StatementType,
        ticker: &str,
    ) -> Result<StatementPayload, ProviderError>;
}

/// `null`, `[]` and `{}` are failures
pub fn reject_empty(value: &Value) -> Result<(), ProviderError> {
    let empty = match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    };

    if empty {
        Err(ProviderError::Empty)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

/// Every registered provider failed or returned nothing usable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("all providers failed to fetch {statement} for {ticker}")]
pub struct DataProviderError {
    pub statement: StatementType,
    pub ticker: String,
    /// Per-provider reasons, in attempt order. Diagnostic only.
    pub failures: Vec<ProviderFailure>,
}

impl DataProviderError {
    pub fn is_retryable(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_transient())
    }

    pub fn reasons(&self) -> String {
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl From<DataProviderError> for ResearchError {
    fn from(err: DataProviderError) -> Self {
        ResearchError::DataProvider(
            ErrorDetail::new(err.to_string())
                .with_suggestion(format!(
                    "Check that {} is a valid ticker symbol (e.g. AAPL, MSFT)",
                    err.ticker
                ))
                .with_debug(format!("Provider errors: {}", err.reasons())),
        )
    }
}

//
// ================= Static provider =================
//

/// Fixture-backed provider for development & testing.
/// Scripted failures for a key are consumed before its payload is served.
pub struct StaticProvider {
    name: String,
    payloads: HashMap<(StatementType, String), StatementPayload>,
    failures: Mutex<HashMap<(StatementType, String), VecDeque<ProviderError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payloads: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_payload(mut self, payload: StatementPayload) -> Self {
        self.payloads
            .insert((payload.statement, payload.ticker.clone()), payload);
        self
    }

    pub fn with_failures(
        self,
        statement: StatementType,
        ticker: &str,
        errors: impl IntoIterator<Item = ProviderError>,
    ) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((statement, ticker.to_string()))
            .or_default()
            .extend(errors);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_statement(
        &self,
        statement: StatementType,
        ticker: &str,
    ) -> Result<StatementPayload, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = (statement, ticker.to_string());
        let scripted = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        self.payloads
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(ticker.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_reject_empty_shapes() {
        assert_eq!(reject_empty(&Value::Null), Err(ProviderError::Empty));
        assert_eq!(reject_empty(&json!([])), Err(ProviderError::Empty));
        assert_eq!(reject_empty(&json!({})), Err(ProviderError::Empty));
        assert!(reject_empty(&json!({"symbol": "AAPL"})).is_ok());
        assert!(reject_empty(&json!([1])).is_ok());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::Unavailable("502".into()).is_transient());
        assert!(!ProviderError::NotFound("ZZZZ".into()).is_transient());
        assert!(!ProviderError::Empty.is_transient());
        assert!(!ProviderError::Malformed("x".into()).is_transient());
    }

    #[test]
    fn test_provider_error_converts_with_reasons() {
        let err = DataProviderError {
            statement: StatementType::IncomeStatement,
            ticker: "ZZZZ".to_string(),
            failures: vec![
                ProviderFailure {
                    provider: "primary".to_string(),
                    error: ProviderError::Empty,
                },
                ProviderFailure {
                    provider: "backup".to_string(),
                    error: ProviderError::NotFound("ZZZZ".to_string()),
                },
            ],
        };
        assert!(!err.is_retryable());

        let research: ResearchError = err.into();
        assert_eq!(research.kind(), ErrorKind::DataProvider);
        let debug = research.detail().debug_detail.clone().unwrap();
        assert!(debug.contains("primary: returned empty data"));
        assert!(debug.contains("backup: ticker not found: ZZZZ"));
    }

    #[tokio::test]
    async fn test_static_provider_consumes_scripted_failures() {
        let payload = StatementPayload::new(
            "AAPL",
            StatementType::CashFlow,
            "2023-09-30",
            [("operatingCashflow".to_string(), 1.0)].into(),
        );
        let provider = StaticProvider::new("fixture")
            .with_payload(payload)
            .with_failures(StatementType::CashFlow, "AAPL", [ProviderError::Timeout]);

        assert_eq!(
            provider.fetch_statement(StatementType::CashFlow, "AAPL").await,
            Err(ProviderError::Timeout)
        );
        assert!(provider
            .fetch_statement(StatementType::CashFlow, "AAPL")
            .await
            .is_ok());
        assert_eq!(provider.calls(), 2);
    }
}
