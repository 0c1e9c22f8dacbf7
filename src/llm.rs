//! LLM adapter (C4): a provider trait plus a retrying OpenAI-compatible
//! implementation and a scripted mock for tests.
//!
//! Retry strategy mirrors the embedding adapter: transient failures (timeout,
//! 429, 5xx, network error) retry with exponential backoff up to
//! `max_retries` (default 3); content-policy rejections are not retried.

use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::ArchivistError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl LlmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmRole::System => "system",
            LlmRole::User => "user",
            LlmRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A chat-completion backend. Implementations only need to speak the
/// request/response shape of their API; retry, backoff, and error-taxonomy
/// mapping live in [`generate`] and [`generate_streaming`] below.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[LlmMessage],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationResult>;

    async fn complete_streaming(
        &self,
        messages: &[LlmMessage],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<TextStream>;
}

/// True when the provider signaled a non-retryable content-policy rejection.
fn is_content_policy_rejection(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("content_policy") || msg.contains("content policy") || msg.contains("safety")
}

/// Non-streaming generate with retry/backoff bounded by `config.max_retries`.
pub async fn generate(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    messages: &[LlmMessage],
) -> crate::error::Result<GenerationResult> {
    let started = Instant::now();
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, delay_secs = delay.as_secs(), "retrying LLM generate call");
            tokio::time::sleep(delay).await;
        }

        match provider
            .complete(messages, config.max_tokens, config.temperature)
            .await
        {
            Ok(result) => {
                debug!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "LLM generate call succeeded"
                );
                return Ok(result);
            }
            Err(e) if is_content_policy_rejection(&e) => {
                warn!(attempt, "LLM generate call rejected on content policy grounds");
                return Err(ArchivistError::LlmRejected(e.to_string()));
            }
            Err(e) => {
                warn!(attempt, error = %e, "LLM generate call errored, will retry");
                last_err = Some(e);
            }
        }
    }

    Err(ArchivistError::LlmUnavailable {
        retries: config.max_retries,
        source: last_err.unwrap_or_else(|| anyhow::anyhow!("LLM generation failed")),
    })
}

/// Streaming generate with the same retry policy applied only to establishing
/// the stream; once content deltas start flowing, a mid-stream error
/// terminates the stream rather than retrying (a partially emitted response
/// cannot be silently replayed to the caller).
pub async fn generate_streaming(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    messages: &[LlmMessage],
) -> crate::error::Result<TextStream> {
    let started = Instant::now();
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, delay_secs = delay.as_secs(), "retrying LLM stream setup");
            tokio::time::sleep(delay).await;
        }

        match provider
            .complete_streaming(messages, config.max_tokens, config.temperature)
            .await
        {
            Ok(stream) => {
                debug!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "LLM stream opened"
                );
                return Ok(stream);
            }
            Err(e) if is_content_policy_rejection(&e) => {
                warn!(attempt, "LLM stream setup rejected on content policy grounds");
                return Err(ArchivistError::LlmRejected(e.to_string()));
            }
            Err(e) => {
                warn!(attempt, error = %e, "LLM stream setup errored, will retry");
                last_err = Some(e);
            }
        }
    }

    Err(ArchivistError::LlmUnavailable {
        retries: config.max_retries,
        source: last_err.unwrap_or_else(|| anyhow::anyhow!("LLM stream setup failed")),
    })
}

// ============ OpenAI-compatible provider ============

pub struct OpenAiLlm {
    model: String,
    api_base: String,
    api_key: String,
    timeout_secs: u64,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for openai provider"))?;
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            api_base,
            api_key,
            timeout_secs: config.timeout_secs,
        })
    }

    fn client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }

    fn request_body(&self, messages: &[LlmMessage], max_tokens: u32, temperature: f64, stream: bool) -> serde_json::Value {
        let msgs: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        serde_json::json!({
            "model": self.model,
            "messages": msgs,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": stream,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationResult> {
        let client = self.client()?;
        let body = self.request_body(messages, max_tokens, temperature, false);

        let response = client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if text.to_lowercase().contains("content_policy") {
                bail!("content_policy rejection: {}", text);
            }
            bail!("LLM API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(GenerationResult {
            content,
            input_tokens,
            output_tokens,
            model: self.model.clone(),
        })
    }

    async fn complete_streaming(
        &self,
        messages: &[LlmMessage],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<TextStream> {
        let client = self.client()?;
        let body = self.request_body(messages, max_tokens, temperature, true);
        let api_base = self.api_base.clone();
        let api_key = self.api_key.clone();

        let response = client
            .post(format!("{}/chat/completions", api_base))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, text);
        }

        let byte_stream = response.bytes_stream();

        let stream = async_stream::try_stream! {
            futures::pin_mut!(byte_stream);
            let mut buffer = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        return;
                    }
                    let parsed: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if let Some(delta) = parsed["choices"][0]["delta"]["content"].as_str() {
                        if !delta.is_empty() {
                            yield delta.to_string();
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// ============ Mock provider (tests / offline dev) ============

pub struct MockLlm {
    model: String,
    pub response: String,
}

impl MockLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            model: "mock".to_string(),
            response: response.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        _messages: &[LlmMessage],
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<GenerationResult> {
        Ok(GenerationResult {
            content: self.response.clone(),
            input_tokens: 0,
            output_tokens: self.response.split_whitespace().count() as u32,
            model: self.model.clone(),
        })
    }

    async fn complete_streaming(
        &self,
        _messages: &[LlmMessage],
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<TextStream> {
        let words: Vec<String> = self
            .response
            .split_whitespace()
            .map(|w| format!("{} ", w))
            .collect();
        let stream = async_stream::stream! {
            for word in words {
                yield Ok(word);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Construct the configured provider, or `None` when LLM generation is disabled.
pub fn create_provider(config: &LlmConfig) -> Result<Option<Box<dyn LlmProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" | "anthropic" => Ok(Some(Box::new(OpenAiLlm::new(config)?))),
        "mock" => Ok(Some(Box::new(MockLlm::new("mock response")))),
        other => bail!("Unknown LLM provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_retries: u32) -> LlmConfig {
        LlmConfig {
            provider: "mock".to_string(),
            model: Some("mock".to_string()),
            api_base: None,
            temperature: 0.3,
            max_tokens: 100,
            timeout_secs: 10,
            max_retries,
        }
    }

    #[tokio::test]
    async fn mock_generate_roundtrips_content() {
        let provider = MockLlm::new("hello world");
        let config = cfg(3);
        let result = generate(&provider, &config, &[LlmMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(result.content, "hello world");
        assert_eq!(result.output_tokens, 2);
    }

    #[tokio::test]
    async fn mock_streaming_emits_words_in_order() {
        let provider = MockLlm::new("one two three");
        let config = cfg(3);
        let mut stream = generate_streaming(&provider, &config, &[LlmMessage::user("hi")])
            .await
            .unwrap();
        let mut out = String::new();
        while let Some(piece) = stream.next().await {
            out.push_str(&piece.unwrap());
        }
        assert_eq!(out.trim(), "one two three");
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        fn model_name(&self) -> &str {
            "failing"
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<GenerationResult> {
            bail!("simulated transient failure")
        }

        async fn complete_streaming(
            &self,
            _messages: &[LlmMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<TextStream> {
            bail!("simulated transient failure")
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_llm_unavailable() {
        let provider = FailingProvider;
        let config = cfg(2);
        let start = Instant::now();
        let err = generate(&provider, &config, &[LlmMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ArchivistError::LlmUnavailable { retries: 2, .. }));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    struct RejectingProvider;

    #[async_trait]
    impl LlmProvider for RejectingProvider {
        fn model_name(&self) -> &str {
            "rejecting"
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<GenerationResult> {
            bail!("content_policy violation: disallowed content")
        }

        async fn complete_streaming(
            &self,
            _messages: &[LlmMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<TextStream> {
            bail!("content_policy violation: disallowed content")
        }
    }

    #[tokio::test]
    async fn content_policy_rejection_is_not_retried() {
        let provider = RejectingProvider;
        let config = cfg(5);
        let start = Instant::now();
        let err = generate(&provider, &config, &[LlmMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ArchivistError::LlmRejected(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
