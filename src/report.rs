//! Final report for the CLI and export collaborators
//!
//! A flattened, serializable view of a terminal run. The fingerprint is a
//! SHA-256 over the facts the answer was built from, so two runs over the
//! same data can be compared without diffing payloads.

use crate::controller::{ErrorSource, Phase, RunState};
use crate::error::ErrorReport;
use crate::models::TaskResults;
use crate::synthesizer::collect_facts;
use crate::validator::{ConfidenceBreakdown, ValidationIssue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::Write;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalReport {
    pub run_id: Uuid,
    pub query: String,
    pub phase: Phase,
    pub tickers: Vec<String>,
    pub data_sources: Vec<String>,
    pub answer: Option<String>,
    pub is_valid: bool,
    /// Overall is zero for every run that did not complete
    pub confidence: ConfidenceBreakdown,
    pub issues: Vec<ValidationIssue>,
    pub error_source: Option<ErrorSource>,
    pub error: Option<ErrorReport>,
    pub task_count: usize,
    pub completed_tasks: usize,
    pub fingerprint: String,
    pub generated_at: DateTime<Utc>,
}

impl FinalReport {
    pub fn from_run(run: &RunState) -> Self {
        let mut tickers: Vec<String> = Vec::new();
        for ticker in run.plan.iter().filter_map(|t| t.ticker()) {
            if !tickers.iter().any(|t| t == ticker) {
                tickers.push(ticker.to_string());
            }
        }

        let mut data_sources: Vec<String> = Vec::new();
        for provider in run
            .task_results
            .values()
            .flat_map(|r| r.sources.iter())
            .map(|p| p.provider.as_str())
        {
            if !provider.is_empty() && !data_sources.iter().any(|s| s == provider) {
                data_sources.push(provider.to_string());
            }
        }

        let mut confidence = run
            .validation
            .as_ref()
            .map(|v| *v.confidence())
            .unwrap_or_default();
        confidence.overall = run.confidence();

        Self {
            run_id: run.run_id,
            query: run.query.clone(),
            phase: run.phase,
            tickers,
            data_sources,
            answer: run.final_answer.clone(),
            is_valid: run.validation.as_ref().is_some_and(|v| v.is_valid()),
            confidence,
            issues: run
                .validation
                .as_ref()
                .map(|v| v.issues().to_vec())
                .unwrap_or_default(),
            error_source: run.error_source,
            error: run.error.clone(),
            task_count: run.plan.len(),
            completed_tasks: run.task_results.len(),
            fingerprint: fingerprint(&run.task_results),
            generated_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text rendering for the terminal
    pub fn render(&self) -> String {
        let mut out = String::new();

        match &self.answer {
            Some(answer) => {
                let _ = writeln!(out, "{}", answer);
                let _ = writeln!(out);
                let _ = writeln!(out, "Confidence: {:.0}%", self.confidence.overall * 100.0);
                let _ = writeln!(
                    out,
                    "  coverage {:.2} | quality {:.2} | inference {:.2}",
                    self.confidence.data_coverage,
                    self.confidence.data_quality,
                    self.confidence.inference_strength
                );
            }
            None => {
                let stage = self
                    .error_source
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(out, "Research failed during {}", stage);
                if let Some(error) = &self.error {
                    let _ = writeln!(out, "  {}", error.message);
                    if let Some(suggestion) = &error.suggestion {
                        let _ = writeln!(out, "  Suggestion: {}", suggestion);
                    }
                }
                let _ = writeln!(out, "Confidence: 0%");
            }
        }

        if !self.issues.is_empty() {
            let _ = writeln!(out, "Issues:");
            for issue in &self.issues {
                let _ = writeln!(out, "  [{:?}] {}", issue.severity, issue);
            }
        }

        if !self.data_sources.is_empty() {
            let _ = writeln!(out, "Sources: {}", self.data_sources.join(", "));
        }

        out
    }
}

/// Hex SHA-256 of the facts in the results. Independent of fetch times.
pub fn fingerprint(results: &TaskResults) -> String {
    let mut hasher = Sha256::new();

    // Stream JSON straight into the hasher
    if serde_json::to_writer(&mut HashWriter(&mut hasher), &collect_facts(results)).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Lets serde_json write into a digest
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
