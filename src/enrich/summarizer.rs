use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::ContextEntry;
use crate::config::SummarizerConfig;
use crate::detect::DetectError;
use crate::retry::{with_timeout, RetryPolicy};

const SYSTEM_PROMPT: &str = "You are a monitoring assistant. Turn the alarm JSON you are given into a \
short plain-text summary for a plant operator. Use simple sentences only: no markdown, no bullet \
points, no bold text, no special characters.";

/// Produces a short natural-language explanation for an alarm.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        variable: &str,
        label: &str,
        entry: &ContextEntry,
    ) -> Result<String, DetectError>;
}

/// Always unavailable; enrichment falls back to the raw entry.
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(&self, _: &str, _: &str, _: &ContextEntry) -> Result<String, DetectError> {
        Err(DetectError::Summarizer("summarization disabled".into()))
    }
}

/// Client for an Azure OpenAI style chat-completions deployment.
pub struct ChatSummarizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    request_timeout: Duration,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatSummarizer {
    /// Requires endpoint, key and deployment; anything missing is a
    /// configuration error.
    pub fn new(cfg: &SummarizerConfig, retry: RetryPolicy) -> Result<Self, DetectError> {
        let missing: Vec<&str> = [
            ("endpoint", cfg.endpoint.as_deref()),
            ("api_key", cfg.api_key.as_deref()),
            ("deployment", cfg.deployment.as_deref()),
        ]
        .into_iter()
        .filter(|(_, v)| v.map_or(true, |s| s.trim().is_empty()))
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(DetectError::Configuration(format!(
                "summarizer enabled but missing: {}",
                missing.join(", ")
            )));
        }

        let endpoint = cfg.endpoint.as_deref().unwrap_or_default().trim_end_matches('/');
        let deployment = cfg.deployment.as_deref().unwrap_or_default();
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint, deployment, cfg.api_version
        );

        let request_timeout = Duration::from_millis(cfg.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DetectError::Configuration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            api_key: cfg.api_key.clone().unwrap_or_default(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            request_timeout,
            retry,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Longest a full `summarize` can take: every attempt at the request
    /// timeout plus backoff. Callers that bound the call must allow this.
    pub fn budget(&self) -> Duration {
        self.retry.budget(self.request_timeout)
    }

    fn request_body(&self, variable: &str, label: &str, entry: &ContextEntry) -> serde_json::Value {
        let alarm = json!({
            "variable": variable,
            "alarm_type": label,
            "context": entry,
        });
        json!({
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!("Alarm JSON:\n{}", alarm) },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }

    async fn request_once(&self, body: &serde_json::Value) -> Result<String, DetectError> {
        let resp = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| DetectError::Summarizer(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| DetectError::Summarizer(format!("bad response body: {}", e)))?;

        // An empty answer is returned as-is; the enricher treats it as no summary.
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default())
    }
}

/// Server-side and throttling failures are worth another attempt; any other
/// refusal (bad key, unknown deployment, malformed body) is not.
fn status_error(status: reqwest::StatusCode) -> DetectError {
    let msg = format!("HTTP {}", status);
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        DetectError::Summarizer(msg)
    } else {
        DetectError::SummarizerRejected(msg)
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(
        &self,
        variable: &str,
        label: &str,
        entry: &ContextEntry,
    ) -> Result<String, DetectError> {
        let body = self.request_body(variable, label, entry);
        let result = self
            .retry
            .run("summarizer", || {
                with_timeout("summarizer", self.request_timeout, self.request_once(&body))
            })
            .await;
        match &result {
            Ok(_) => debug!(%variable, %label, "Summary generated"),
            Err(e) => warn!(%variable, %label, error = %e, "Summary request failed"),
        }
        result
    }
}
