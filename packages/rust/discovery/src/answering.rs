//! Answering service adapter: turns a query plus line context into a response.

use std::time::Duration;

use async_trait::async_trait;
use learnline_shared::{AnsweringConfig, LearnlineError, Query, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::retry::{RetryPolicy, with_retry};
use crate::{USER_AGENT, map_status};

const SYSTEM_PROMPT: &str = "Be specific and precise. Follow every detail in the user query.";

/// Service name used in error messages and logs.
const SERVICE: &str = "answering";

/// A response from the answering service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub response_text: String,
    /// Source URLs the answer was built from.
    #[serde(default)]
    pub citations: Vec<String>,
}

/// Produces an answer for a query, given the earlier queries of its line.
#[async_trait]
pub trait AnsweringService: Send + Sync {
    async fn ask(&self, query: &str, context: &[Query]) -> Result<Answer>;
}

// ---------------------------------------------------------------------------
// Chat-completions client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// [`AnsweringService`] backed by an OpenAI-style `/chat/completions` endpoint
/// that also reports `citations`.
pub struct ChatAnsweringClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl ChatAnsweringClient {
    pub fn new(config: &AnsweringConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LearnlineError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            retry: RetryPolicy::new(config.max_retries.max(1), Duration::from_millis(500)),
        })
    }

    /// Override the retry policy (tests use a zero delay).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<Answer> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LearnlineError::Network(format!("{SERVICE}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(SERVICE, status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LearnlineError::upstream(SERVICE, format!("malformed response: {e}")))?;

        let response_text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if response_text.trim().is_empty() {
            return Err(LearnlineError::upstream(SERVICE, "empty answer"));
        }

        Ok(Answer {
            response_text,
            citations: parsed.citations,
        })
    }
}

#[async_trait]
impl AnsweringService for ChatAnsweringClient {
    #[instrument(skip_all, fields(model = %self.model, context = context.len()))]
    async fn ask(&self, query: &str, context: &[Query]) -> Result<Answer> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: SYSTEM_PROMPT,
        }];
        for prior in context {
            messages.push(ChatMessage {
                role: "user",
                content: &prior.text,
            });
            messages.push(ChatMessage {
                role: "assistant",
                content: &prior.response,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: query,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: 0.0,
        };

        debug!(messages = body.messages.len(), "sending chat request");
        let answer = with_retry(self.retry, SERVICE, || self.send(&body)).await?;
        info!(citations = answer.citations.len(), "answer received");
        Ok(answer)
    }
}
