//! OpenRouter reasoning client
//!
//! Talks to an OpenAI-compatible chat-completions endpoint.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::{Completion, Fact, ReasoningClient, ReasoningError, ReasoningResult, Sampling};
use crate::config::ResearchConfig;
use crate::error::{ErrorDetail, ResearchError};
use crate::models::{Capability, Entity};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const ENTITY_PROMPT: &str = r#"Extract financial entities from the user query.

Rules:
- Identify companies, indices, sectors, macro indicators
- Include the ticker only if confidently known, otherwise null
- Do NOT guess

Return ONLY valid JSON:
{"entities": [{"name": "...", "type": "company|index|sector|macro", "ticker": "..."}]}"#;

const SYNTHESIS_PROMPT: &str = r#"You are a financial research writer.

Answer the question using ONLY the facts provided.
- Every number you state must appear in the facts
- Name the ticker and period for each number
- If the facts do not answer the question, say so
- No investment advice"#;

pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(config: &ResearchConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.reasoning_timeout)
            .build()
            .map_err(|e| {
                ResearchError::Configuration(
                    ErrorDetail::new("Failed to build HTTP client for the reasoning service")
                        .with_debug(e.to_string()),
                )
            })?;

        Ok(Self {
            client,
            api_key: config.reasoning_api_key.clone(),
            model: config.reasoning_model.clone(),
            base_url: config.reasoning_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn chat(
        &self,
        system: &str,
        user: String,
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        let temperature = sampling.temperature();
        let request = ChatRequest {
            model: &self.model,
            temperature,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user,
                },
            ],
        };

        debug!(model = %self.model, temperature, "Calling reasoning service");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Reasoning request failed: {}", e);
                if e.is_timeout() {
                    ReasoningError::Timeout
                } else {
                    ReasoningError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Reasoning service error response");
            return Err(ReasoningError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;

        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ReasoningError::Malformed("empty completion".to_string()))?;

        Ok(Completion { text, temperature })
    }
}

#[async_trait]
impl ReasoningClient for OpenRouterClient {
    async fn extract_entities(
        &self,
        query: &str,
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        self.chat(ENTITY_PROMPT, format!("Query:\n{}", query), sampling)
            .await
    }

    async fn plan(
        &self,
        query: &str,
        entities: &[Entity],
        capabilities: &[Capability],
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        let prompt = build_plan_prompt(capabilities);
        let entities_json = serde_json::to_string(entities)
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        let user = format!("QUESTION:\n{}\n\nENTITIES:\n{}", query, entities_json);
        self.chat(&prompt, user, sampling).await
    }

    async fn synthesize(
        &self,
        query: &str,
        facts: &[Fact],
        sampling: Sampling,
    ) -> ReasoningResult<Completion> {
        let facts_json = serde_json::to_string_pretty(facts)
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        let user = format!("QUESTION:\n{}\n\nFACTS:\n{}", query, facts_json);
        self.chat(SYNTHESIS_PROMPT, user, sampling).await
    }
}

fn build_plan_prompt(capabilities: &[Capability]) -> String {
    let tools: Vec<String> = capabilities
        .iter()
        .map(|c| format!("{} – {}", c.tool_name(), c.description()))
        .collect();

    format!(
        r#"You are a financial research planner.

Break the question into explicit research tasks.
- Each task fetches ONE statement for ONE ticker
- Do NOT assume data exists
- Do NOT compute or answer anything

Available tools:
- {}

Rules:
- tool_name must be one of the available tools
- tool_args must contain "ticker"
- Return ONLY valid JSON, no explanation text:

{{
  "tasks": [
    {{
      "description": "...",
      "tool_name": "income_statement",
      "tool_args": {{ "ticker": "AAPL" }}
    }}
  ]
}}
"#,
        tools.join("\n- ")
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}
