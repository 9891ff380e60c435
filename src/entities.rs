//! Entity extraction on top of the reasoning service

use crate::error::{ErrorDetail, ResearchError};
use crate::models::Entity;
use crate::reasoning::{ensure_sampling_honored, strip_code_fence, ReasoningClient, Sampling};
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct EntityEnvelope {
    #[serde(default)]
    entities: Vec<Entity>,
}

pub struct EntityExtractor {
    reasoning: Arc<dyn ReasoningClient>,
}

impl EntityExtractor {
    pub fn new(reasoning: Arc<dyn ReasoningClient>) -> Self {
        Self { reasoning }
    }

    pub async fn extract(&self, query: &str) -> Result<Vec<Entity>> {
        let sampling = Sampling::Deterministic;
        let completion = self
            .reasoning
            .extract_entities(query, sampling)
            .await
            .map_err(|e| {
                ResearchError::Planning(
                    ErrorDetail::new("Entity extraction failed")
                        .with_suggestion("Check your network connection and reasoning service key")
                        .with_debug(e.to_string()),
                )
            })?;

        ensure_sampling_honored(sampling, &completion).map_err(|reason| {
            ResearchError::Planning(
                ErrorDetail::new("Entity extraction was not deterministic").with_debug(reason),
            )
        })?;

        let entities = parse_entities(&completion.text)?;
        debug!(count = entities.len(), "Entities extracted");
        Ok(entities)
    }
}

pub(crate) fn parse_entities(raw: &str) -> Result<Vec<Entity>> {
    let envelope: EntityEnvelope = serde_json::from_str(strip_code_fence(raw)).map_err(|e| {
        ResearchError::Planning(
            ErrorDetail::new("Entity extraction returned unparseable output")
                .with_debug(format!("{} | raw={}", e, raw)),
        )
    })?;

    Ok(envelope
        .entities
        .into_iter()
        .map(|mut entity| {
            entity.ticker = entity
                .ticker
                .map(|t| t.trim().to_uppercase())
                .filter(|t| !t.is_empty());
            entity
        })
        .collect())
}
