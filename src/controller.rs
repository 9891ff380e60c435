//! Controller - drives a research run through its state machine
//!
//! PLANNING → EXECUTING → VALIDATING → SYNTHESIZING → COMPLETED
//!
//! Any stage can end the run in FAILED. No state is revisited. The
//! controller owns the run state; stages only see what they are handed.

use crate::config::ResearchConfig;
use crate::data::ProviderRouter;
use crate::entities::EntityExtractor;
use crate::error::{ErrorDetail, ErrorReport, ResearchError};
use crate::executor::Executor;
use crate::models::{Task, TaskResults};
use crate::planner::Planner;
use crate::reasoning::ReasoningClient;
use crate::report::FinalReport;
use crate::synthesizer::Synthesizer;
use crate::validator::{ValidationPolicy, ValidationResult, Validator};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Executing,
    Validating,
    Synthesizing,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Forward edges only; Failed is reachable from every live phase
    pub fn can_transition_to(&self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Completed | Phase::Failed, _) => false,
            (_, Phase::Failed) => true,
            (Phase::Planning, Phase::Executing)
            | (Phase::Executing, Phase::Validating)
            | (Phase::Validating, Phase::Synthesizing)
            | (Phase::Synthesizing, Phase::Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Planning,
    Execution,
    Validation,
    Synthesis,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSource::Planning => "planning",
            ErrorSource::Execution => "execution",
            ErrorSource::Validation => "validation",
            ErrorSource::Synthesis => "synthesis",
        };
        f.write_str(s)
    }
}

/// Canonical record of one run. Created per query and dropped with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: Uuid,
    pub query: String,
    pub phase: Phase,
    pub plan: Vec<Task>,
    pub task_results: TaskResults,
    pub validation: Option<ValidationResult>,
    pub final_answer: Option<String>,
    pub error_source: Option<ErrorSource>,
    /// Set for every failure except a failed validation, whose issues live
    /// in `validation`
    pub error: Option<ErrorReport>,
    pub trace: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn new(query: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            query: query.to_string(),
            phase: Phase::Planning,
            plan: Vec::new(),
            task_results: TaskResults::new(),
            validation: None,
            final_answer: None,
            error_source: None,
            error: None,
            trace: vec!["INPUT: Query received".to_string()],
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Reported confidence. Zero unless the run completed.
    pub fn confidence(&self) -> f64 {
        match (&self.phase, &self.validation) {
            (Phase::Completed, Some(v)) => v.overall(),
            _ => 0.0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }

    pub fn report(&self) -> FinalReport {
        FinalReport::from_run(self)
    }

    fn advance(&mut self, next: Phase) {
        if !self.phase.can_transition_to(next) {
            error!(from = ?self.phase, to = ?next, "Illegal phase transition ignored");
            return;
        }
        debug!(run_id = %self.run_id, from = ?self.phase, to = ?next, "Phase transition");
        self.phase = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    fn fail(&mut self, source: ErrorSource, error: Option<&ResearchError>) {
        match error {
            Some(e) => {
                self.trace.push(format!("FAILED: {} - {}", source, e));
                warn!(run_id = %self.run_id, source = %source, error = %e, "Run failed");
                self.error = Some(e.report());
            }
            None => {
                self.trace.push(format!("FAILED: {}", source));
                warn!(run_id = %self.run_id, source = %source, "Run failed");
            }
        }
        self.error_source = Some(source);
        self.final_answer = None;
        self.advance(Phase::Failed);
    }
}

/// Owns one instance of each stage; safe to share across concurrent runs
pub struct Controller {
    config: ResearchConfig,
    extractor: EntityExtractor,
    planner: Planner,
    executor: Executor,
    validator: Validator,
    synthesizer: Synthesizer,
}

impl Controller {
    /// Rejects an invalid configuration before any stage can run
    pub fn new(
        config: ResearchConfig,
        reasoning: Arc<dyn ReasoningClient>,
        router: Arc<ProviderRouter>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            extractor: EntityExtractor::new(reasoning.clone()),
            planner: Planner::new(reasoning.clone()),
            executor: Executor::new(router, &config),
            validator: Validator::new(ValidationPolicy::from_config(&config)),
            synthesizer: Synthesizer::new(reasoning),
            config,
        })
    }

    pub async fn run(&self, query: &str) -> RunState {
        self.run_with_cancel(query, &CancellationToken::new()).await
    }

    /// Run to a terminal phase. Never returns a partially answered run.
    pub async fn run_with_cancel(&self, query: &str, cancel: &CancellationToken) -> RunState {
        let started = Instant::now();
        let mut run = RunState::new(query.trim());

        info!(run_id = %run.run_id, query = %run.query, "Research run started");

        self.run_stages(&mut run, cancel).await;

        info!(
            run_id = %run.run_id,
            phase = ?run.phase,
            error_source = ?run.error_source,
            confidence = run.confidence(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Research run finished"
        );

        run
    }

    async fn run_stages(&self, run: &mut RunState, cancel: &CancellationToken) {
        // === PLAN ===
        if let Err(e) = cancelled_at(cancel, "planning") {
            return run.fail(ErrorSource::Planning, Some(&e));
        }
        if run.query.is_empty() {
            let e = ResearchError::Query(
                ErrorDetail::new("The question is empty")
                    .with_suggestion("Ask about a company, e.g. \"What is AAPL's revenue?\""),
            );
            return run.fail(ErrorSource::Planning, Some(&e));
        }

        run.trace.push("PLAN: Extracting entities and planning".to_string());
        let query = run.query.clone();
        let entities = self
            .reasoning_call(
                "entity extraction",
                ResearchError::Planning,
                cancel,
                self.extractor.extract(&query),
            )
            .await;
        let planned = match entities {
            Ok(entities) => {
                self.reasoning_call(
                    "planning",
                    ResearchError::Planning,
                    cancel,
                    self.planner.plan(&query, &entities),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match planned {
            Ok(plan) => {
                run.trace.push(format!("PLAN: {} tasks in plan", plan.len()));
                run.plan = plan;
            }
            Err(e) => return run.fail(ErrorSource::Planning, Some(&e)),
        }
        run.advance(Phase::Executing);

        // === EXECUTE ===
        if let Err(e) = cancelled_at(cancel, "execution") {
            return run.fail(ErrorSource::Execution, Some(&e));
        }

        run.trace.push("EXECUTE: Running plan tasks".to_string());
        match self.executor.execute_plan(run.plan.clone(), cancel).await {
            Ok(tasks) => {
                run.task_results = tasks
                    .iter()
                    .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
                    .collect();
                for task in &tasks {
                    run.trace.push(format!(
                        "OBSERVE: {} ({}) - {:?}",
                        task.id, task.tool_name, task.status
                    ));
                }
                run.plan = tasks;
            }
            Err(e) => return run.fail(ErrorSource::Execution, Some(&e)),
        }
        run.advance(Phase::Validating);

        // === VALIDATE ===
        let validation = self.validator.validate(&run.plan, &run.task_results);
        run.trace.push(format!(
            "VALIDATE: {} blocking, {} warnings, confidence {:.2}",
            validation.blocking_issues().count(),
            validation.warnings().count(),
            validation.overall()
        ));
        let valid = validation.is_valid();
        run.validation = Some(validation);

        if !valid {
            return run.fail(ErrorSource::Validation, None);
        }
        run.advance(Phase::Synthesizing);

        // === SYNTHESIZE ===
        if let Err(e) = cancelled_at(cancel, "synthesis") {
            return run.fail(ErrorSource::Synthesis, Some(&e));
        }

        run.trace.push("SYNTHESIZE: Generating answer".to_string());
        let answer = match &run.validation {
            Some(validation) => {
                self.reasoning_call(
                    "synthesis",
                    ResearchError::Synthesis,
                    cancel,
                    self.synthesizer
                        .synthesize(&query, &run.task_results, validation),
                )
                .await
            }
            None => Err(ResearchError::precondition("Synthesis reached without validation")),
        };

        match answer {
            Ok(answer) => {
                run.final_answer = Some(answer);
                run.trace.push("COMPLETE: Answer synthesized".to_string());
                run.advance(Phase::Completed);
            }
            Err(e) => run.fail(ErrorSource::Synthesis, Some(&e)),
        }
    }

    /// Bounds one reasoning-service call by the configured timeout and
    /// aborts it on cancellation
    async fn reasoning_call<T, F>(
        &self,
        stage: &str,
        on_timeout: fn(ErrorDetail) -> ResearchError,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.config.reasoning_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResearchError::cancelled(format!("Run cancelled during {}", stage))),
            outcome = tokio::time::timeout(limit, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(on_timeout(
                    ErrorDetail::new(format!("Reasoning service timed out during {}", stage))
                        .with_suggestion("Try again, or raise REASONING_TIMEOUT_SECS")
                        .with_debug(format!("limit {:?}", limit)),
                )),
            },
        }
    }
}

fn cancelled_at(cancel: &CancellationToken, stage: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ResearchError::cancelled(format!(
            "Run cancelled before {}",
            stage
        )));
    }
    Ok(())
}
