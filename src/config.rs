//! Immutable pipeline configuration
//!
//! Loaded once from the environment (with `.env` support) and handed to the
//! controller. Nothing downstream reads the environment.

use crate::error::{ErrorDetail, ResearchError};
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_REASONING_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_REASONING_MODEL: &str = "openai/gpt-4o-mini";
pub const DEMO_DATA_API_KEY: &str = "demo";

/// Weights combining the three confidence components into `overall`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
    pub coverage: f64,
    pub quality: f64,
    pub inference: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            coverage: 0.40,
            quality: 0.35,
            inference: 0.25,
        }
    }
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.coverage + self.quality + self.inference
    }
}

#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub reasoning_api_key: String,
    pub reasoning_model: String,
    pub reasoning_base_url: String,
    pub data_api_key: Option<String>,

    pub ratio_validation_enabled: bool,
    pub freshness_threshold_days: i64,
    pub outlier_sigma: f64,
    pub confidence_weights: ConfidenceWeights,

    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_concurrent_tasks: usize,
    pub provider_timeout: Duration,
    pub reasoning_timeout: Duration,
}

impl ResearchConfig {
    /// Configuration with defaults for everything except the credential
    pub fn new(reasoning_api_key: impl Into<String>) -> Self {
        Self {
            reasoning_api_key: reasoning_api_key.into(),
            reasoning_model: DEFAULT_REASONING_MODEL.to_string(),
            reasoning_base_url: DEFAULT_REASONING_BASE_URL.to_string(),
            data_api_key: None,
            ratio_validation_enabled: true,
            freshness_threshold_days: 180,
            outlier_sigma: 3.0,
            confidence_weights: ConfidenceWeights::default(),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            max_concurrent_tasks: 4,
            provider_timeout: Duration::from_secs(10),
            reasoning_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let api_key = env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ResearchError::Configuration(
                    ErrorDetail::new("OPENROUTER_API_KEY not set")
                        .with_suggestion(
                            "Create a .env file in your working directory and add \
                             OPENROUTER_API_KEY=<your-key>",
                        )
                        .with_debug("Environment variable OPENROUTER_API_KEY not found in .env or OS"),
                )
            })?;

        let mut config = Self::new(api_key);

        if let Ok(model) = env::var("OPENROUTER_MODEL") {
            config.reasoning_model = model;
        }
        if let Ok(url) = env::var("OPENROUTER_BASE_URL") {
            config.reasoning_base_url = url.trim_end_matches('/').to_string();
        }

        config.data_api_key = env::var("ALPHA_VANTAGE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        if config.data_api_key.is_none() {
            warn!(
                "ALPHA_VANTAGE_API_KEY not set; using the rate-limited demo key, \
                 which only serves a handful of tickers"
            );
        }

        if let Some(v) = parse_var::<bool>("RATIO_VALIDATION_ENABLED")? {
            config.ratio_validation_enabled = v;
        }
        if let Some(v) = parse_var::<i64>("FRESHNESS_THRESHOLD_DAYS")? {
            config.freshness_threshold_days = v;
        }
        if let Some(v) = parse_var::<f64>("OUTLIER_SIGMA")? {
            config.outlier_sigma = v;
        }
        if let Some(v) = parse_var::<u32>("MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = parse_var::<u64>("RETRY_BACKOFF_MS")? {
            config.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<usize>("MAX_CONCURRENT_TASKS")? {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = parse_var::<u64>("PROVIDER_TIMEOUT_SECS")? {
            config.provider_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>("REASONING_TIMEOUT_SECS")? {
            config.reasoning_timeout = Duration::from_secs(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reasoning_api_key.trim().is_empty() {
            return Err(invalid("reasoning service credential is empty"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(invalid("max_concurrent_tasks must be at least 1"));
        }
        if !(self.outlier_sigma > 0.0) {
            return Err(invalid("outlier_sigma must be positive"));
        }
        if self.freshness_threshold_days <= 0 {
            return Err(invalid("freshness_threshold_days must be positive"));
        }
        let w = self.confidence_weights;
        if w.coverage < 0.0 || w.quality < 0.0 || w.inference < 0.0 {
            return Err(invalid("confidence weights must be non-negative"));
        }
        if (w.sum() - 1.0).abs() > 1e-6 {
            return Err(invalid(format!(
                "confidence weights must sum to 1.0 (got {:.3})",
                w.sum()
            )));
        }
        if self.provider_timeout.is_zero() || self.reasoning_timeout.is_zero() {
            return Err(invalid("timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn data_api_key_or_demo(&self) -> &str {
        self.data_api_key.as_deref().unwrap_or(DEMO_DATA_API_KEY)
    }
}

fn invalid(message: impl Into<String>) -> ResearchError {
    ResearchError::Configuration(
        ErrorDetail::new(message).with_suggestion("Check the values in your .env file"),
    )
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ResearchError::Configuration(
                ErrorDetail::new(format!("{} has an invalid value", name))
                    .with_suggestion(format!("Fix or remove {} in your environment", name))
                    .with_debug(format!("{:?}: {}", raw, e)),
            )
        }),
        _ => Ok(None),
    }
}
