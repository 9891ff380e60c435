//! Executor
//!
//! Runs plan tasks against the provider router. Tasks are independent, so
//! they run concurrently on a bounded pool; results are slotted back by
//! position so completion order never leaks into the output.
//! The reasoning service is never contacted here.

use crate::config::ResearchConfig;
use crate::data::{DataProviderError, ProviderRouter};
use crate::error::{ErrorDetail, ResearchError};
use crate::models::{fields, Capability, StatementPayload, StatementType, Task, TaskResult};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CANCELLED_REASON: &str = "Run cancelled before the task could finish fetching";

#[derive(Clone)]
pub struct Executor {
    router: Arc<ProviderRouter>,
    max_retries: u32,
    retry_backoff: Duration,
    max_concurrent_tasks: usize,
}

impl Executor {
    pub fn new(router: Arc<ProviderRouter>, config: &ResearchConfig) -> Self {
        Self {
            router,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            max_concurrent_tasks: config.max_concurrent_tasks.max(1),
        }
    }

    /// Every statement the plan needs must have at least one provider
    pub fn preflight(&self, plan: &[Task]) -> Result<()> {
        let mut missing: Vec<StatementType> = plan
            .iter()
            .filter_map(Task::capability)
            .flat_map(|c| c.statements().iter().copied())
            .filter(|s| !self.router.supports(*s))
            .collect();
        missing.sort();
        missing.dedup();

        if missing.is_empty() {
            return Ok(());
        }

        let names: Vec<&str> = missing.iter().map(StatementType::as_str).collect();
        Err(ResearchError::Execution(
            ErrorDetail::new(format!(
                "No data provider registered for: {}",
                names.join(", ")
            ))
            .with_suggestion("Register a provider for every statement type before running"),
        ))
    }

    /// Execute all tasks, honoring cancellation between task starts and
    /// between fetches. A provider call already in flight always drains;
    /// unstarted and interrupted tasks fail as cancelled.
    pub async fn execute_plan(
        &self,
        plan: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Task>> {
        self.preflight(&plan)?;

        let started = Instant::now();
        let originals = plan.clone();
        let mut slots: Vec<Option<Task>> = vec![None; plan.len()];
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_tasks));
        let mut running = JoinSet::new();

        debug!(
            task_count = plan.len(),
            workers = self.max_concurrent_tasks,
            "Starting plan execution"
        );

        for (index, task) in plan.into_iter().enumerate() {
            if task.is_terminal() {
                slots[index] = Some(task);
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                warn!(task_id = %task.id, "Task not started: run cancelled");
                slots[index] = Some(task.fail(CANCELLED_REASON));
                continue;
            };

            let executor = self.clone();
            let cancel = cancel.clone();
            running.spawn(async move {
                let _permit = permit;
                (index, executor.execute(task, &cancel).await)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, task)) => slots[index] = Some(task),
                Err(e) => error!(error = %e, "Task worker aborted"),
            }
        }

        let tasks: Vec<Task> = slots
            .into_iter()
            .zip(originals)
            .map(|(slot, original)| slot.unwrap_or_else(|| original.fail("Task worker aborted")))
            .collect();

        info!(
            task_count = tasks.len(),
            failed = tasks.iter().filter(|t| t.error.is_some()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Plan execution completed"
        );

        Ok(tasks)
    }

    /// Run one task to a terminal state
    pub async fn execute(&self, task: Task, cancel: &CancellationToken) -> Task {
        if task.is_terminal() {
            return task;
        }
        let task = task.start();

        let Some(capability) = task.capability() else {
            warn!(task_id = %task.id, tool_name = %task.tool_name, "Tool not registered");
            let reason = format!("Tool not registered: {}", task.tool_name);
            return task.fail(reason);
        };

        let Some(ticker) = task.ticker().map(str::to_string) else {
            return task.fail("Task has no ticker argument");
        };

        debug!(task_id = %task.id, tool = capability.tool_name(), %ticker, "Processing task");

        let mut payloads = Vec::with_capacity(capability.statements().len());
        for statement in capability.statements() {
            if cancel.is_cancelled() {
                warn!(task_id = %task.id, "Task interrupted: run cancelled");
                return task.fail(CANCELLED_REASON);
            }
            match self
                .fetch_with_retry(*statement, &ticker, &task.id, cancel)
                .await
            {
                Ok(payload) => payloads.push(payload),
                Err(_) if cancel.is_cancelled() => {
                    warn!(task_id = %task.id, "Task interrupted: run cancelled");
                    return task.fail(CANCELLED_REASON);
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, reasons = %e.reasons(), "Task failed");
                    let reason = format!("{} [{}]", ResearchError::from(e.clone()), e.reasons());
                    return task.fail(reason);
                }
            }
        }

        // Second gate behind the router: never complete on a thin payload
        if let Some(bad) = payloads
            .iter()
            .find(|p| p.is_empty() || !p.missing_fields().is_empty())
        {
            let reason = format!(
                "{} payload for {} is missing required fields: {}",
                bad.statement,
                ticker,
                bad.missing_fields().join(", ")
            );
            return task.fail(reason);
        }

        let result = if capability.is_derived() {
            let metrics = compute_ratios(&payloads);
            if metrics.is_empty() {
                return task.fail(format!("No ratio could be computed for {}", ticker));
            }
            TaskResult {
                capability,
                ticker: ticker.clone(),
                derived: true,
                sources: payloads,
                metrics,
            }
        } else {
            match payloads.pop() {
                Some(payload) => TaskResult::lookup(capability, payload),
                None => return task.fail("No payload fetched"),
            }
        };

        debug!(task_id = %task.id, metrics = result.metrics.len(), "Task completed");
        task.complete(result)
    }

    /// Retry only while some provider failure is transient, at most
    /// `max_retries` times. Cancellation ends the retry loop.
    async fn fetch_with_retry(
        &self,
        statement: StatementType,
        ticker: &str,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<StatementPayload, DataProviderError> {
        let mut retries = 0;
        loop {
            match self.router.fetch(statement, ticker).await {
                Ok(payload) => return Ok(payload),
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        task_id,
                        %statement,
                        ticker,
                        attempt = retries,
                        reasons = %e.reasons(),
                        "Transient provider failure, retrying"
                    );
                    let delay = self.retry_backoff * retries;
                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(e),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    let (n, d) = (numerator?, denominator?);
    if d == 0.0 {
        return None;
    }
    Some(n / d).filter(|r| r.is_finite())
}

/// Ratios from an income statement and a balance sheet
fn compute_ratios(payloads: &[StatementPayload]) -> BTreeMap<String, f64> {
    let find = |statement: StatementType| payloads.iter().find(|p| p.statement == statement);
    let income = find(StatementType::IncomeStatement);
    let balance = find(StatementType::BalanceSheet);

    let get = |payload: Option<&StatementPayload>, field: &str| payload.and_then(|p| p.get(field));

    let net_income = get(income, fields::NET_INCOME);
    let revenue = get(income, fields::TOTAL_REVENUE);
    let equity = get(balance, fields::TOTAL_EQUITY);
    let liabilities = get(balance, fields::TOTAL_LIABILITIES);

    [
        (fields::RETURN_ON_EQUITY, ratio(net_income, equity)),
        (fields::NET_MARGIN, ratio(net_income, revenue)),
        (fields::DEBT_TO_EQUITY, ratio(liabilities, equity)),
        (
            fields::CURRENT_RATIO,
            ratio(
                get(balance, fields::CURRENT_ASSETS),
                get(balance, fields::CURRENT_LIABILITIES),
            ),
        ),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ProviderError, StaticProvider};
    use crate::models::TaskStatus;

    fn config(max_retries: u32) -> ResearchConfig {
        let mut config = ResearchConfig::new("test-key");
        config.max_retries = max_retries;
        config.retry_backoff = Duration::ZERO;
        config
    }

    fn task(id: &str, tool: &str, ticker: &str) -> Task {
        Task::new(
            id,
            format!("{} {}", tool, ticker),
            tool,
            BTreeMap::from([("ticker".to_string(), ticker.to_string())]),
        )
    }

    fn income(ticker: &str) -> StatementPayload {
        StatementPayload::new(
            ticker,
            StatementType::IncomeStatement,
            "2023-09-30",
            BTreeMap::from([
                (fields::TOTAL_REVENUE.to_string(), 400.0),
                (fields::NET_INCOME.to_string(), 100.0),
            ]),
        )
    }

    fn balance(ticker: &str) -> StatementPayload {
        StatementPayload::new(
            ticker,
            StatementType::BalanceSheet,
            "2023-09-30",
            BTreeMap::from([
                (fields::TOTAL_ASSETS.to_string(), 1000.0),
                (fields::TOTAL_LIABILITIES.to_string(), 600.0),
                (fields::TOTAL_EQUITY.to_string(), 400.0),
                (fields::CURRENT_ASSETS.to_string(), 300.0),
                (fields::CURRENT_LIABILITIES.to_string(), 150.0),
            ]),
        )
    }

    fn executor_with(provider: Arc<StaticProvider>, max_retries: u32) -> Executor {
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        router.register_all(provider);
        Executor::new(Arc::new(router), &config(max_retries))
    }

    #[tokio::test]
    async fn test_lookup_task_completes() {
        let provider = Arc::new(StaticProvider::new("fixture").with_payload(income("AAPL")));
        let executor = executor_with(provider, 2);

        let done = executor
            .execute(task("task-1", "income_statement", "AAPL"), &CancellationToken::new())
            .await;

        assert_eq!(done.status, TaskStatus::Completed);
        let result = done.result.unwrap();
        assert!(!result.derived);
        assert_eq!(result.metrics.get(fields::TOTAL_REVENUE), Some(&400.0));
        assert_eq!(result.sources[0].provider, "fixture");
    }

    #[tokio::test]
    async fn test_retry_bound_is_exact() {
        let max_retries = 3;
        let provider = Arc::new(
            StaticProvider::new("flaky")
                .with_payload(income("AAPL"))
                .with_failures(
                    StatementType::IncomeStatement,
                    "AAPL",
                    vec![ProviderError::RateLimited; max_retries as usize],
                ),
        );
        let executor = executor_with(provider.clone(), max_retries);

        let done = executor
            .execute(task("task-1", "income_statement", "AAPL"), &CancellationToken::new())
            .await;

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(provider.calls(), max_retries as usize + 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_task() {
        let provider = Arc::new(
            StaticProvider::new("flaky")
                .with_payload(income("AAPL"))
                .with_failures(
                    StatementType::IncomeStatement,
                    "AAPL",
                    vec![ProviderError::Timeout; 5],
                ),
        );
        let executor = executor_with(provider.clone(), 2);

        let done = executor
            .execute(task("task-1", "income_statement", "AAPL"), &CancellationToken::new())
            .await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let provider = Arc::new(StaticProvider::new("fixture"));
        let executor = executor_with(provider.clone(), 3);

        let done = executor
            .execute(task("task-1", "income_statement", "ZZZZ"), &CancellationToken::new())
            .await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(provider.calls(), 1);
        let error = done.error.unwrap();
        assert!(error.starts_with("Data provider error"));
        assert!(error.contains("ticker not found: ZZZZ"));
    }

    #[tokio::test]
    async fn test_empty_payload_fails_immediately() {
        let empty = StatementPayload::new(
            "ZZZZ",
            StatementType::IncomeStatement,
            "2023-09-30",
            BTreeMap::new(),
        );
        let provider = Arc::new(StaticProvider::new("fixture").with_payload(empty));
        let executor = executor_with(provider.clone(), 3);

        let done = executor
            .execute(task("task-1", "income_statement", "ZZZZ"), &CancellationToken::new())
            .await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.result.is_none());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_ratio_task_is_derived() {
        let provider = Arc::new(
            StaticProvider::new("fixture")
                .with_payload(income("AAPL"))
                .with_payload(balance("AAPL")),
        );
        let executor = executor_with(provider, 0);

        let done = executor
            .execute(task("task-1", "financial_ratios", "AAPL"), &CancellationToken::new())
            .await;

        let result = done.result.unwrap();
        assert!(result.derived);
        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.metrics.get(fields::RETURN_ON_EQUITY), Some(&0.25));
        assert_eq!(result.metrics.get(fields::NET_MARGIN), Some(&0.25));
        assert_eq!(result.metrics.get(fields::DEBT_TO_EQUITY), Some(&1.5));
        assert_eq!(result.metrics.get(fields::CURRENT_RATIO), Some(&2.0));
    }

    #[tokio::test]
    async fn test_plan_results_keep_plan_order() {
        let provider = Arc::new(
            StaticProvider::new("fixture")
                .with_payload(income("AAPL"))
                .with_payload(income("MSFT"))
                .with_payload(income("NVDA")),
        );
        let executor = executor_with(provider, 0);
        let plan = vec![
            task("task-1", "income_statement", "AAPL"),
            task("task-2", "income_statement", "MSFT"),
            task("task-3", "income_statement", "NVDA"),
        ];

        let done = executor
            .execute_plan(plan, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<&str> = done.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task-1", "task-2", "task-3"]);
        assert!(done.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_unstarted_tasks() {
        let provider = Arc::new(StaticProvider::new("fixture").with_payload(income("AAPL")));
        let executor = executor_with(provider.clone(), 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let done = executor
            .execute_plan(vec![task("task-1", "income_statement", "AAPL")], &cancel)
            .await
            .unwrap();

        assert_eq!(done[0].status, TaskStatus::Failed);
        assert_eq!(done[0].error.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries_in_flight() {
        let provider = Arc::new(
            StaticProvider::new("flaky")
                .with_payload(income("AAPL"))
                .with_failures(
                    StatementType::IncomeStatement,
                    "AAPL",
                    vec![ProviderError::RateLimited; 3],
                )
                .with_delay(Duration::from_millis(30)),
        );
        let executor = executor_with(provider.clone(), 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let done = executor
            .execute(task("task-1", "income_statement", "AAPL"), &cancel)
            .await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_skips_remaining_statements() {
        let provider = Arc::new(
            StaticProvider::new("fixture")
                .with_payload(income("AAPL"))
                .with_payload(balance("AAPL"))
                .with_delay(Duration::from_millis(30)),
        );
        let executor = executor_with(provider.clone(), 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let done = executor
            .execute(task("task-1", "financial_ratios", "AAPL"), &cancel)
            .await;

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_primary_falls_back_to_backup() {
        let empty = StatementPayload::new(
            "AAPL",
            StatementType::IncomeStatement,
            "2023-09-30",
            BTreeMap::new(),
        );
        let primary = Arc::new(StaticProvider::new("primary").with_payload(empty));
        let backup = Arc::new(StaticProvider::new("backup").with_payload(income("AAPL")));
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        router.register_all(primary.clone());
        router.register_all(backup.clone());
        let executor = Executor::new(Arc::new(router), &config(0));

        let done = executor
            .execute(task("task-1", "income_statement", "AAPL"), &CancellationToken::new())
            .await;

        assert_eq!(done.status, TaskStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result.sources[0].provider, "backup");
        assert_eq!(result.sources[0].provider_rank, 1);
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_provider_route_is_fatal() {
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        router.register(
            StatementType::IncomeStatement,
            Arc::new(StaticProvider::new("fixture")),
        );
        let executor = Executor::new(Arc::new(router), &config(0));

        let err = executor
            .execute_plan(
                vec![task("task-1", "cash_flow", "AAPL")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Execution);
        assert!(err.to_string().contains("cash_flow"));
    }

    #[test]
    fn test_ratio_skips_zero_denominator() {
        assert_eq!(ratio(Some(1.0), Some(0.0)), None);
        assert_eq!(ratio(None, Some(2.0)), None);
        assert_eq!(ratio(Some(1.0), Some(4.0)), Some(0.25));
    }
}
