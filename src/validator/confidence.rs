//! Confidence scoring
//!
//! Three component scores in [0, 1] combined with the configured weights.
//! The gate (overall forced to zero) is applied by `ValidationResult`.

use super::ValidationPolicy;
use crate::models::{StatementPayload, Task, TaskResult, TaskResults, TaskStatus};
use serde::{Deserialize, Serialize};

/// Quality lost per step down the provider priority list
const RANK_PENALTY: f64 = 0.15;
const MIN_RANK_FACTOR: f64 = 0.5;
const MIN_FRESHNESS_FACTOR: f64 = 0.5;
/// Freshness factor for payloads with no parseable period end
const UNKNOWN_FRESHNESS_FACTOR: f64 = 0.75;

const DIRECT_LOOKUP_STRENGTH: f64 = 1.0;
const DERIVED_STRENGTH: f64 = 0.8;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceBreakdown {
    pub data_coverage: f64,
    pub data_quality: f64,
    pub inference_strength: f64,
    pub overall: f64,
}

impl ConfidenceBreakdown {
    pub fn compute(plan: &[Task], results: &TaskResults, policy: &ValidationPolicy) -> Self {
        let covered: Vec<&TaskResult> = plan
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| results.get(&t.id))
            .filter(|r| !r.is_empty())
            .collect();

        if plan.is_empty() || covered.is_empty() {
            return Self::default();
        }

        let data_coverage = covered.len() as f64 / plan.len() as f64;
        let data_quality = mean(covered.iter().map(|r| result_quality(r, policy)));
        let inference_strength = mean(covered.iter().map(|r| {
            if r.derived {
                DERIVED_STRENGTH
            } else {
                DIRECT_LOOKUP_STRENGTH
            }
        }));

        let w = policy.weights;
        let overall = (w.coverage * data_coverage
            + w.quality * data_quality
            + w.inference * inference_strength)
            .clamp(0.0, 1.0);

        Self {
            data_coverage,
            data_quality,
            inference_strength,
            overall,
        }
    }

    /// Same components, overall forced to zero
    pub fn gated(self) -> Self {
        Self {
            overall: 0.0,
            ..self
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn result_quality(result: &TaskResult, policy: &ValidationPolicy) -> f64 {
    mean(
        result
            .sources
            .iter()
            .map(|p| rank_factor(p.provider_rank) * freshness_factor(p, policy)),
    )
}

fn rank_factor(rank: usize) -> f64 {
    (1.0 - RANK_PENALTY * rank as f64).max(MIN_RANK_FACTOR)
}

/// 1.0 up to the threshold, then linear down to the floor at twice the
/// threshold
fn freshness_factor(payload: &StatementPayload, policy: &ValidationPolicy) -> f64 {
    let Some(age) = payload.age_days() else {
        return UNKNOWN_FRESHNESS_FACTOR;
    };
    let threshold = policy.freshness_threshold_days.max(1) as f64;
    let age = age as f64;
    if age <= threshold {
        return 1.0;
    }
    let overshoot = (age - threshold) / threshold;
    (1.0 - (1.0 - MIN_FRESHNESS_FACTOR) * overshoot).max(MIN_FRESHNESS_FACTOR)
}
