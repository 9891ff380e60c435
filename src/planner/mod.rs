//! Planner
//!
//! Turns a query and its extracted entities into an ordered list of tasks.
//! Single-intent queries with resolved tickers are routed directly; anything
//! else is planned by the reasoning service in deterministic mode. Plans that
//! reference an unknown tool or lack a ticker are rejected as a whole.

use crate::error::{ErrorDetail, ResearchError};
use crate::models::{Capability, Entity, Task};
use crate::reasoning::{ensure_sampling_honored, strip_code_fence, ReasoningClient, Sampling};
use crate::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod intent;
pub use intent::detect_intents;

/// Maximum tasks allowed per plan
pub const MAX_TASKS_PER_PLAN: usize = 20;

/// Plan as returned by the reasoning service
#[derive(Debug, Clone, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: BTreeMap<String, Value>,
}

pub struct Planner {
    reasoning: Arc<dyn ReasoningClient>,
    capabilities: Vec<Capability>,
}

impl Planner {
    pub fn new(reasoning: Arc<dyn ReasoningClient>) -> Self {
        Self {
            reasoning,
            capabilities: Capability::ALL.to_vec(),
        }
    }

    /// Restrict the tools a plan may reference
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub async fn plan(&self, query: &str, entities: &[Entity]) -> Result<Vec<Task>> {
        let tickers = resolved_tickers(entities);
        let intents: Vec<Capability> = detect_intents(query)
            .into_iter()
            .filter(|c| self.capabilities.contains(c))
            .collect();

        if tickers.is_empty() && intents.is_empty() {
            return Err(ResearchError::Query(
                ErrorDetail::new("The question names no company or ticker and asks for no financial data")
                    .with_suggestion(
                        "Mention a company or ticker and what you need, e.g. \"What is AAPL's revenue?\"",
                    ),
            ));
        }

        // Deterministic intent routing for single-statement requests
        if let [capability] = intents.as_slice() {
            if !tickers.is_empty() {
                let tasks = route_by_intent(*capability, &tickers)?;
                info!(
                    task_count = tasks.len(),
                    tool = capability.tool_name(),
                    "Plan routed by intent"
                );
                return Ok(tasks);
            }
        }

        let sampling = Sampling::Deterministic;
        let completion = self
            .reasoning
            .plan(query, entities, &self.capabilities, sampling)
            .await
            .map_err(|e| {
                ResearchError::Planning(
                    ErrorDetail::new("The reasoning service could not produce a plan")
                        .with_suggestion("Try again in a moment")
                        .with_debug(e.to_string()),
                )
            })?;

        ensure_sampling_honored(sampling, &completion).map_err(|reason| {
            ResearchError::Planning(
                ErrorDetail::new("Planning was not deterministic").with_debug(reason),
            )
        })?;

        let spec = parse_plan_spec(&completion.text)?;
        let tasks = self.build_tasks(spec)?;

        info!(task_count = tasks.len(), "Plan created by reasoning service");
        Ok(tasks)
    }

    /// Fail closed: any bad task rejects the whole plan
    fn build_tasks(&self, spec: PlanSpec) -> Result<Vec<Task>> {
        if spec.tasks.is_empty() {
            return Err(ResearchError::planning("Planner produced an empty task list"));
        }

        ensure_within_limit(spec.tasks.len())?;

        let unknown: Vec<&str> = spec
            .tasks
            .iter()
            .filter(|t| {
                Capability::from_tool_name(&t.tool_name)
                    .map_or(true, |c| !self.capabilities.contains(&c))
            })
            .map(|t| t.tool_name.as_str())
            .collect();

        if !unknown.is_empty() {
            warn!(?unknown, "Plan references unregistered tools");
            return Err(ResearchError::Planning(
                ErrorDetail::new(format!(
                    "Plan references unknown tools: {}",
                    unknown.join(", ")
                ))
                .with_debug(format!(
                    "registered: {}",
                    self.capabilities
                        .iter()
                        .map(Capability::tool_name)
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
            ));
        }

        let mut tasks = Vec::with_capacity(spec.tasks.len());

        for (index, task_spec) in spec.tasks.into_iter().enumerate() {
            let mut args = BTreeMap::new();
            for (key, value) in task_spec.tool_args {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(ResearchError::planning(format!(
                            "Task {} has a non-scalar argument '{}': {}",
                            index + 1,
                            key,
                            other
                        )))
                    }
                };
                args.insert(key, value);
            }

            let ticker = args
                .get("ticker")
                .map(|t| t.trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    ResearchError::planning(format!(
                        "Task {} ({}) has no ticker",
                        index + 1,
                        task_spec.tool_name
                    ))
                })?;
            args.insert("ticker".to_string(), ticker);

            tasks.push(Task::new(
                task_id(index),
                task_spec.description,
                task_spec.tool_name.trim(),
                args,
            ));
        }

        debug!(task_count = tasks.len(), "Plan accepted");
        Ok(tasks)
    }
}

/// Positional ids keep equal inputs producing equal plans
fn task_id(index: usize) -> String {
    format!("task-{}", index + 1)
}

fn resolved_tickers(entities: &[Entity]) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    for ticker in entities
        .iter()
        .filter(|e| e.is_resolvable())
        .filter_map(|e| e.ticker.as_deref())
    {
        let ticker = ticker.trim().to_uppercase();
        if !tickers.contains(&ticker) {
            tickers.push(ticker);
        }
    }
    tickers
}

fn ensure_within_limit(task_count: usize) -> Result<()> {
    if task_count > MAX_TASKS_PER_PLAN {
        return Err(ResearchError::planning(format!(
            "Plan exceeds maximum allowed tasks ({})",
            MAX_TASKS_PER_PLAN
        )));
    }
    Ok(())
}

fn route_by_intent(capability: Capability, tickers: &[String]) -> Result<Vec<Task>> {
    ensure_within_limit(tickers.len())?;
    let tasks = tickers
        .iter()
        .enumerate()
        .map(|(index, ticker)| {
            Task::new(
                task_id(index),
                format!("{} for {}", capability.description(), ticker),
                capability.tool_name(),
                BTreeMap::from([("ticker".to_string(), ticker.clone())]),
            )
        })
        .collect();
    Ok(tasks)
}

pub(crate) fn parse_plan_spec(raw: &str) -> Result<PlanSpec> {
    serde_json::from_str(strip_code_fence(raw)).map_err(|e| {
        ResearchError::Planning(
            ErrorDetail::new("Planner output was not valid JSON")
                .with_debug(format!("{} | raw={}", e, raw)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::TaskStatus;
    use crate::reasoning::ScriptedReasoningClient;

    const TWO_TASK_PLAN: &str = r#"{"tasks": [
        {"description": "Fetch AAPL income statement", "tool_name": "income_statement", "tool_args": {"ticker": "aapl"}},
        {"description": "Compute AAPL ratios", "tool_name": "financial_ratios", "tool_args": {"ticker": "AAPL"}}
    ]}"#;

    fn apple() -> Vec<Entity> {
        vec![Entity::company("Apple", "AAPL")]
    }

    #[tokio::test]
    async fn test_single_intent_routes_without_reasoning() {
        let client = Arc::new(ScriptedReasoningClient::new());
        let planner = Planner::new(client.clone());

        let tasks = planner.plan("What is AAPL's revenue?", &apple()).await.unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tool_name, "income_statement");
        assert_eq!(tasks[0].ticker(), Some("AAPL"));
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(client.plan_calls(), 0);
    }

    #[tokio::test]
    async fn test_routed_plan_over_limit_is_rejected() {
        let client = Arc::new(ScriptedReasoningClient::new());
        let planner = Planner::new(client.clone());
        let entities: Vec<Entity> = (0..=MAX_TASKS_PER_PLAN)
            .map(|i| Entity::company(format!("Company {}", i), format!("T{}", i)))
            .collect();

        let err = planner
            .plan("What is the revenue of these companies?", &entities)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Planning);
        assert!(err.to_string().contains("maximum allowed tasks"));
        assert_eq!(client.plan_calls(), 0);
    }

    #[tokio::test]
    async fn test_reasoning_plan_parsed_and_normalized() {
        let client = Arc::new(ScriptedReasoningClient::new().with_plan(TWO_TASK_PLAN));
        let planner = Planner::new(client.clone());

        let tasks = planner
            .plan("Compare AAPL revenue with its return on equity", &apple())
            .await
            .unwrap();

        assert_eq!(client.plan_calls(), 1);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "task-1");
        assert_eq!(tasks[0].ticker(), Some("AAPL"));
        assert_eq!(tasks[1].tool_name, "financial_ratios");
    }

    #[tokio::test]
    async fn test_identical_inputs_give_identical_plans() {
        let client = Arc::new(ScriptedReasoningClient::new().with_plan(TWO_TASK_PLAN));
        let planner = Planner::new(client);
        let query = "Compare AAPL revenue with its return on equity";

        let first = planner.plan(query, &apple()).await.unwrap();
        let second = planner.plan(query, &apple()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_tool_rejects_whole_plan() {
        let plan = r#"{"tasks": [
            {"description": "ok", "tool_name": "income_statement", "tool_args": {"ticker": "AAPL"}},
            {"description": "bad", "tool_name": "web_search", "tool_args": {"ticker": "AAPL"}}
        ]}"#;
        let planner = Planner::new(Arc::new(ScriptedReasoningClient::new().with_plan(plan)));

        let err = planner
            .plan("Tell me about AAPL revenue and margins", &apple())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Planning);
        assert!(err.to_string().contains("web_search"));
    }

    #[tokio::test]
    async fn test_missing_ticker_rejected() {
        let plan = r#"{"tasks": [{"description": "x", "tool_name": "cash_flow", "tool_args": {}}]}"#;
        let planner = Planner::new(Arc::new(ScriptedReasoningClient::new().with_plan(plan)));

        let err = planner.plan("How is cash flow?", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Planning);
    }

    #[tokio::test]
    async fn test_no_entity_and_no_intent_is_query_error() {
        let client = Arc::new(ScriptedReasoningClient::new());
        let planner = Planner::new(client.clone());

        let err = planner.plan("hello there", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(client.plan_calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_plan_is_planning_error() {
        let planner = Planner::new(Arc::new(
            ScriptedReasoningClient::new().with_plan("Sure! Here is your plan."),
        ));
        let err = planner.plan("Analyze AAPL", &apple()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Planning);
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let planner = Planner::new(Arc::new(
            ScriptedReasoningClient::new().with_plan(r#"{"tasks": []}"#),
        ));
        let err = planner.plan("Analyze AAPL", &apple()).await.unwrap_err();
        assert!(err.to_string().contains("empty task list"));
    }

    #[tokio::test]
    async fn test_nondeterministic_planning_rejected() {
        let planner = Planner::new(Arc::new(
            ScriptedReasoningClient::new()
                .with_plan(TWO_TASK_PLAN)
                .drifting(),
        ));
        let err = planner.plan("Analyze AAPL", &apple()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Planning);
        assert!(err.to_string().contains("not deterministic"));
    }

    #[tokio::test]
    async fn test_restricted_capabilities_reject_unregistered_tool() {
        let planner = Planner::new(Arc::new(
            ScriptedReasoningClient::new().with_plan(TWO_TASK_PLAN),
        ))
        .with_capabilities(vec![Capability::IncomeStatement]);

        let err = planner.plan("Analyze AAPL", &apple()).await.unwrap_err();
        assert!(err.to_string().contains("financial_ratios"));
    }
}
