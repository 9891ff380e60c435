//! Provider router
//!
//! Tries the registered providers for a statement type in priority order and
//! returns the first payload that is non-empty and structurally valid.

use super::{DataProvider, DataProviderError, ProviderError, ProviderFailure};
use crate::models::{StatementPayload, StatementType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

pub struct ProviderRouter {
    routes: HashMap<StatementType, Vec<Arc<dyn DataProvider>>>,
    provider_timeout: Duration,
}

impl ProviderRouter {
    pub fn new(provider_timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            provider_timeout,
        }
    }

    /// Append a provider to the priority list for one statement type
    pub fn register(&mut self, statement: StatementType, provider: Arc<dyn DataProvider>) {
        self.routes.entry(statement).or_default().push(provider);
    }

    /// Append a provider for every statement type
    pub fn register_all(&mut self, provider: Arc<dyn DataProvider>) {
        for statement in StatementType::ALL {
            self.register(statement, provider.clone());
        }
    }

    pub fn supports(&self, statement: StatementType) -> bool {
        self.routes
            .get(&statement)
            .is_some_and(|providers| !providers.is_empty())
    }

    pub async fn fetch(
        &self,
        statement: StatementType,
        ticker: &str,
    ) -> Result<StatementPayload, DataProviderError> {
        let providers = self.routes.get(&statement).map(Vec::as_slice).unwrap_or(&[]);
        let mut failures = Vec::with_capacity(providers.len());

        for (rank, provider) in providers.iter().enumerate() {
            let outcome = match timeout(
                self.provider_timeout,
                provider.fetch_statement(statement, ticker),
            )
            .await
            {
                Err(_) => Err(ProviderError::Timeout),
                Ok(result) => result.and_then(|payload| accept(payload, statement)),
            };

            match outcome {
                Ok(mut payload) => {
                    payload.provider = provider.name().to_string();
                    payload.provider_rank = rank;

                    debug!(
                        provider = provider.name(),
                        rank,
                        %statement,
                        ticker,
                        "Provider returned data"
                    );
                    return Ok(payload);
                }
                Err(error) => {
                    warn!(
                        provider = provider.name(),
                        %statement,
                        ticker,
                        error = %error,
                        "Provider failed, falling back"
                    );
                    failures.push(ProviderFailure {
                        provider: provider.name().to_string(),
                        error,
                    });
                }
            }
        }

        Err(DataProviderError {
            statement,
            ticker: ticker.to_string(),
            failures,
        })
    }
}

/// Non-empty, of the requested type, and carrying the required fields
fn accept(
    payload: StatementPayload,
    statement: StatementType,
) -> Result<StatementPayload, ProviderError> {
    if payload.is_empty() {
        return Err(ProviderError::Empty);
    }

    if payload.statement != statement {
        return Err(ProviderError::Malformed(format!(
            "expected {} but received {}",
            statement, payload.statement
        )));
    }

    let missing = payload.missing_fields();
    if !missing.is_empty() {
        return Err(ProviderError::Malformed(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    Ok(payload)
}
