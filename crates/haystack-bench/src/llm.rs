//! OpenAI-compatible chat completions client
//!
//! Implements the engine's [`ModelCaller`] seam. Rate limits, server errors,
//! timeouts and connection failures are retried with exponential backoff;
//! every other failure ends the call with [`ModelReply::NoAnswer`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use haystack::{ModelCaller, ModelReply};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::BenchConfig;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub content: Option<String>,
    /// Reasoning trace returned by some reasoning models next to `content`.
    pub reasoning_content: Option<String>,
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum CallError {
    /// Worth another attempt after backing off
    #[error("{0}")]
    Transient(String),

    /// Retrying will not help
    #[error("{0}")]
    Fatal(String),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn message(self) -> String {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }
}

/// Backoff schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first (at least 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Multiplier applied per further attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay after the failed attempt `attempt` (0-indexed): 1s, 2s, 4s, ...
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 1s initial backoff, 2x multiplier, 60s max.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

/// Rate limiting, request timeouts and server-side errors are transient.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Text the parser should see for a completion, or `None` when the response
/// carries no choice at all.
///
/// A reasoning trace is placed before the answer so the answer's JSON object
/// stays the last one in the text.
pub fn extract_reply(response: &ChatResponse) -> Option<String> {
    let message = &response.choices.first()?.message;
    let content = match (&message.reasoning_content, &message.content) {
        (Some(reasoning), Some(answer)) if !reasoning.trim().is_empty() => {
            format!("<reasoning>\n{}\n</reasoning>\n\n{}", reasoning, answer)
        }
        (Some(reasoning), None) => reasoning.clone(),
        (_, answer) => answer.clone().unwrap_or_default(),
    };
    Some(content)
}

/// [`ModelCaller`] backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCaller {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl OpenAiCaller {
    pub fn from_config(config: &BenchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: config.chat_completions_url(),
            api_key: config.api_key.clone(),
            model: config.model_name.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: RetryPolicy::with_attempts(config.max_retries),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn attempt(&self, system_prompt: &str, user_prompt: &str) -> Result<String, CallError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("LLM API error ({}): {}", status, truncate(&body, 300));
            return Err(if is_transient_status(status) {
                CallError::Transient(message)
            } else {
                CallError::Fatal(message)
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallError::Fatal(format!("Failed to parse response: {}", e)))?;

        extract_reply(&chat).ok_or_else(|| CallError::Fatal("No response from LLM".to_string()))
    }
}

#[async_trait]
impl ModelCaller for OpenAiCaller {
    async fn answer_question(&self, system_prompt: &str, user_prompt: &str) -> ModelReply {
        let mut attempt = 0u32;
        loop {
            match self.attempt(system_prompt, user_prompt).await {
                Ok(text) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "request succeeded after retry");
                    }
                    return ModelReply::Text(text);
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff_duration(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient LLM error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(
                            attempts = attempt + 1,
                            error = %e,
                            "LLM error persisted after retries"
                        );
                    } else {
                        error!(error = %e, "non-retryable LLM error");
                    }
                    return ModelReply::no_answer(e.message());
                }
            }
        }
    }
}

fn classify_send_error(e: reqwest::Error) -> CallError {
    let message = format!("HTTP request failed: {}", e);
    if e.is_timeout() || e.is_connect() || e.is_request() {
        debug!(error = %e, "request did not complete");
        CallError::Transient(message)
    } else {
        CallError::Fatal(message)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> ChatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ms(0), 1_000);
        assert_eq!(policy.backoff_ms(1), 2_000);
        assert_eq!(policy.backoff_ms(2), 4_000);
        assert_eq!(policy.backoff_ms(10), 60_000);
    }

    #[test]
    fn attempts_include_the_first_call() {
        let policy = RetryPolicy::with_attempts(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let single = RetryPolicy::with_attempts(0);
        assert_eq!(single.max_attempts, 1);
        assert!(!single.should_retry(0));
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn reasoning_is_placed_before_the_answer() {
        let chat = response(
            r#"{"choices":[{"message":{"content":"{\"answer\": [\"b\"]}","reasoning_content":"maybe {\"answer\": [\"a\"]}"}}]}"#,
        );
        let text = extract_reply(&chat).unwrap();
        assert!(text.starts_with("<reasoning>"));
        assert!(text.ends_with(r#"{"answer": ["b"]}"#));
    }

    #[test]
    fn content_only_and_reasoning_only() {
        let chat = response(r#"{"choices":[{"message":{"content":"plain"}}]}"#);
        assert_eq!(extract_reply(&chat).unwrap(), "plain");

        let chat = response(
            r#"{"choices":[{"message":{"content":null,"reasoning_content":"think"}}]}"#,
        );
        assert_eq!(extract_reply(&chat).unwrap(), "think");

        let chat = response(r#"{"choices":[{"message":{}}]}"#);
        assert_eq!(extract_reply(&chat).unwrap(), "");
    }

    #[test]
    fn no_choices_is_no_reply() {
        assert!(extract_reply(&response(r#"{"choices":[]}"#)).is_none());
        assert!(extract_reply(&response("{}")).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("日本語テキスト", 3), "日本語...");
        assert_eq!(truncate("short", 10), "short");
    }
}
