//! Synthesizer
//!
//! Turns validated task results into the final answer. The only data handed
//! to the reasoning service is the fact list built from the results.

use crate::error::{ErrorDetail, ResearchError};
use crate::models::{TaskResult, TaskResults};
use crate::reasoning::{ensure_sampling_honored, Fact, ReasoningClient, Sampling};
use crate::validator::ValidationResult;
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Synthesizer {
    reasoning: Arc<dyn ReasoningClient>,
}

impl Synthesizer {
    pub fn new(reasoning: Arc<dyn ReasoningClient>) -> Self {
        Self { reasoning }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        results: &TaskResults,
        validation: &ValidationResult,
    ) -> Result<String> {
        if !validation.is_valid() {
            return Err(ResearchError::Precondition(
                ErrorDetail::new("Synthesis requested on results that failed validation")
                    .with_debug(
                        validation
                            .blocking_issues()
                            .map(|i| i.to_string())
                            .collect::<Vec<_>>()
                            .join("; "),
                    ),
            ));
        }

        let facts = collect_facts(results);
        if facts.is_empty() {
            return Err(ResearchError::Precondition(ErrorDetail::new(
                "No facts available to synthesize from",
            )));
        }
        debug!(fact_count = facts.len(), "Synthesizing answer");

        let sampling = Sampling::Deterministic;
        let completion = self
            .reasoning
            .synthesize(query, &facts, sampling)
            .await
            .map_err(|e| {
                ResearchError::Synthesis(
                    ErrorDetail::new("Answer generation failed")
                        .with_suggestion("Retry the query; the data was fetched and validated")
                        .with_debug(e.to_string()),
                )
            })?;

        ensure_sampling_honored(sampling, &completion).map_err(|reason| {
            ResearchError::Synthesis(
                ErrorDetail::new("Answer generation was not deterministic").with_debug(reason),
            )
        })?;

        let answer = completion.text.trim();
        if answer.is_empty() {
            return Err(ResearchError::Synthesis(ErrorDetail::new(
                "Reasoning service returned an empty answer",
            )));
        }

        info!(answer_len = answer.len(), "Answer synthesized");
        Ok(answer.to_string())
    }
}

/// Every metric of every result, in result-id then metric order, each
/// (ticker, metric, period, source) once
pub fn collect_facts(results: &TaskResults) -> Vec<Fact> {
    let mut seen = BTreeSet::new();
    results
        .values()
        .flat_map(result_facts)
        .filter(|f| {
            seen.insert((
                f.ticker.clone(),
                f.metric.clone(),
                f.period.clone(),
                f.source.clone(),
            ))
        })
        .collect()
}

fn result_facts(result: &TaskResult) -> Vec<Fact> {
    let (source, period) = if result.derived {
        let providers: BTreeSet<&str> = result.sources.iter().map(|p| p.provider.as_str()).collect();
        let period = result
            .sources
            .first()
            .map(|p| p.period.clone())
            .unwrap_or_default();
        (
            format!(
                "derived from {}",
                providers.into_iter().collect::<Vec<_>>().join(", ")
            ),
            period,
        )
    } else {
        match result.sources.first() {
            Some(p) => (p.provider.clone(), p.period.clone()),
            None => (String::new(), String::new()),
        }
    };

    result
        .metrics
        .iter()
        .map(|(metric, value)| Fact {
            ticker: result.ticker.clone(),
            source: source.clone(),
            metric: metric.clone(),
            value: *value,
            period: period.clone(),
        })
        .collect()
}
