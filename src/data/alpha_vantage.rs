//! Alpha Vantage statement provider
//!
//! The latest annual report becomes the payload; earlier annual reports are
//! kept as history for outlier detection.

use super::{reject_empty, DataProvider, ProviderError};
use crate::error::{ErrorDetail, ResearchError};
use crate::models::{StatementPayload, StatementType};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const BASE_URL: &str = "https://www.alphavantage.co/query";
const MAX_HISTORY_PERIODS: usize = 4;

pub struct AlphaVantageProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantageProvider {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ResearchError::Configuration(
                    ErrorDetail::new("Failed to build HTTP client for Alpha Vantage")
                        .with_debug(e.to_string()),
                )
            })?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

fn function_for(statement: StatementType) -> &'static str {
    match statement {
        StatementType::IncomeStatement => "INCOME_STATEMENT",
        StatementType::BalanceSheet => "BALANCE_SHEET",
        StatementType::CashFlow => "CASH_FLOW",
    }
}

#[async_trait]
impl DataProvider for AlphaVantageProvider {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    async fn fetch_statement(
        &self,
        statement: StatementType,
        ticker: &str,
    ) -> Result<StatementPayload, ProviderError> {
        debug!(%statement, ticker, "Fetching from Alpha Vantage");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", function_for(statement)),
                ("symbol", ticker),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(ticker.to_string()));
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ProviderError::Malformed(format!("HTTP {}", status)));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Malformed(format!("invalid JSON response: {}", e)))?;

        parse_statement(statement, ticker, &body)
    }
}

/// Map an Alpha Vantage statement response to a payload
pub(crate) fn parse_statement(
    statement: StatementType,
    ticker: &str,
    body: &Value,
) -> Result<StatementPayload, ProviderError> {
    reject_empty(body)?;

    // Throttled responses arrive as 200 with a note instead of data
    if body.get("Note").is_some() || body.get("Information").is_some() {
        return Err(ProviderError::RateLimited);
    }
    if body.get("Error Message").is_some() {
        return Err(ProviderError::NotFound(ticker.to_string()));
    }

    let reports = body
        .get("annualReports")
        .ok_or(ProviderError::Empty)?;
    reject_empty(reports)?;
    let reports = reports
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("annualReports is not an array".to_string()))?;

    let latest = &reports[0];
    let period = latest
        .get("fiscalDateEnding")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Malformed("missing fiscalDateEnding".to_string()))?;

    let fields = parse_report(latest);
    if fields.is_empty() {
        return Err(ProviderError::Empty);
    }

    let mut payload = StatementPayload::new(ticker.to_uppercase(), statement, period, fields);
    payload.fetched_at = Utc::now();
    payload.history = reports
        .iter()
        .skip(1)
        .take(MAX_HISTORY_PERIODS)
        .map(parse_report)
        .filter(|f| !f.is_empty())
        .collect();

    Ok(payload)
}

/// Numeric fields only; Alpha Vantage sends numbers as strings and "None"
/// for missing values
fn parse_report(report: &Value) -> BTreeMap<String, f64> {
    report
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(key, value)| {
                    let number = match value {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().parse::<f64>().ok(),
                        _ => None,
                    }?;
                    number.is_finite().then(|| (key.clone(), number))
                })
                .collect()
        })
        .unwrap_or_default()
}
