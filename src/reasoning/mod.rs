//! Reasoning service interface
//!
//! The reasoning service is used for entity extraction, planning and answer
//! synthesis. Every call states its sampling mode explicitly and every reply
//! echoes the temperature actually used, so callers can reject replies that
//! did not honor deterministic mode.

use crate::models::{Capability, Entity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub mod openrouter;
pub use openrouter::OpenRouterClient;

/// Sampling mode requested for a call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampling {
    /// Identical input must give identical output (temperature 0)
    Deterministic,
    Exploratory { temperature: f32 },
}

impl Sampling {
    pub fn temperature(&self) -> f32 {
        match self {
            Sampling::Deterministic => 0.0,
            Sampling::Exploratory { temperature } => *temperature,
        }
    }
}

/// Raw reply from the reasoning service
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Temperature the service reports having used
    pub temperature: f32,
}

impl Completion {
    pub fn deterministic(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            temperature: 0.0,
        }
    }
}

/// Reject a reply that does not match the requested sampling mode
pub fn ensure_sampling_honored(
    requested: Sampling,
    completion: &Completion,
) -> std::result::Result<(), String> {
    match requested {
        Sampling::Deterministic if completion.temperature != 0.0 => Err(format!(
            "deterministic mode requested but the reply was sampled at temperature {}",
            completion.temperature
        )),
        _ => Ok(()),
    }
}

/// One fetched figure handed to synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub ticker: String,
    pub source: String,
    pub metric: String,
    pub value: f64,
    pub period: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReasoningError {
    #[error("reasoning service unreachable: {0}")]
    Unreachable(String),

    #[error("reasoning service timed out")]
    Timeout,

    #[error("reasoning service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("reasoning service reply malformed: {0}")]
    Malformed(String),
}

pub type ReasoningResult<T> = std::result::Result<T, ReasoningError>;

/// Stateless request/response reasoning interface
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn extract_entities(
        &self,
        query: &str,
        sampling: Sampling,
    ) -> ReasoningResult<Completion>;

    async fn plan(
        &self,
        query: &str,
        entities: &[Entity],
        capabilities: &[Capability],
        sampling: Sampling,
    ) -> ReasoningResult<Completion>;

    async fn synthesize(
        &self,
        query: &str,
        facts: &[Fact],
        sampling: Sampling,
    ) -> ReasoningResult<Completion>;
}

//
// ================= Scripted client =================
//

/// Canned-response client for development & testing.
/// Unscripted calls fail as unreachable.
#[derive(Default)]
pub struct ScriptedReasoningClient {
    entities: Option<String>,
    plan: Option<String>,
    answer: Option<String>,
    drift: bool,
    delay: Option<Duration>,
    entity_calls: AtomicUsize,
    plan_calls: AtomicUsize,
    synthesis_calls: AtomicUsize,
    last_facts: Mutex<Vec<Fact>>,
}

impl ScriptedReasoningClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(mut self, json: impl Into<String>) -> Self {
        self.entities = Some(json.into());
        self
    }

    pub fn with_plan(mut self, json: impl Into<String>) -> Self {
        self.plan = Some(json.into());
        self
    }

    pub fn with_answer(mut self, text: impl Into<String>) -> Self {
        self.answer = Some(text.into());
        self
    }

    /// Ignore the requested sampling mode: replies vary per call and
    /// report a non-zero temperature
    pub fn drifting(mut self) -> Self {
        self.drift = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn entity_calls(&self) -> usize {
        self.entity_calls.load(Ordering::SeqCst)
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn synthesis_calls(&self) -> usize {
        self.synthesis_calls.load(Ordering::SeqCst)
    }

    pub async fn last_facts(&self) -> Vec<Fact> {
        self.last_facts.lock().await.clone()
    }

    async fn reply(
        &self,
        scripted: Option<&String>,
        call_no: usize,
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let text = scripted
            .cloned()
            .ok_or_else(|| ReasoningError::Unreachable("no scripted reply".to_string()))?;

        if self.drift {
            return Ok(Completion {
                text: format!("{} ", text).repeat(call_no + 1),
                temperature: 0.7,
            });
        }

        Ok(Completion {
            text,
            temperature: sampling.temperature(),
        })
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoningClient {
    async fn extract_entities(
        &self,
        _query: &str,
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        let n = self.entity_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(self.entities.as_ref(), n, sampling).await
    }

    async fn plan(
        &self,
        _query: &str,
        _entities: &[Entity],
        _capabilities: &[Capability],
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        let n = self.plan_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(self.plan.as_ref(), n, sampling).await
    }

    async fn synthesize(
        &self,
        _query: &str,
        facts: &[Fact],
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        let n = self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_facts.lock().await = facts.to_vec();
        self.reply(self.answer.as_ref(), n, sampling).await
    }
}

/// Strip a markdown code fence the service may wrap JSON in
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
