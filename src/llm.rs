//! Chat and embedding provider integration

use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Maximum retry attempts for transient provider failures
const MAX_ATTEMPTS: u32 = 3;

/// Cap on the exponential backoff delay
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Message role in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Structured-output mode requested from the chat provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    JsonObject,
}

/// A chat completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model override; the provider default is used when absent
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            messages,
            temperature: None,
            response_format: None,
        }
    }

    pub fn json_object(mut self) -> Self {
        self.response_format = Some(ResponseFormat::JsonObject);
        self
    }
}

/// A chat completion response
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Trait for chat model providers
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a chat completion request
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Default model name, for answer provenance
    fn model(&self) -> &str;
}

/// Trait for embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input in order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed output dimension
    fn dimension(&self) -> usize;
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: content.into(),
    }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::Assistant,
        content: content.into(),
    }
}

/// Retry a provider call with capped exponential backoff.
///
/// Only transient failures are retried; permanent failures surface
/// immediately.
pub async fn with_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation, attempt, MAX_ATTEMPTS, delay, e
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_CAP);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// OpenAI-compatible chat provider
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatBody>,
}

#[derive(Debug, Serialize)]
struct ResponseFormatBody {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl OpenAiChatProvider {
    /// Create a new chat provider
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        }
    }

    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = ChatCompletionRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.chat_model.clone()),
            messages: request.messages.clone(),
            temperature: request.temperature.or(Some(self.config.temperature)),
            response_format: request.response_format.map(|_| ResponseFormatBody {
                kind: "json_object".to_string(),
            }),
        };

        let url = self.api_url("chat/completions");
        debug!("Chat request to {} with {} messages", url, body.messages.len());

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.auth(self.client.post(&url)).json(&body).send(),
        )
        .await
        .map_err(|_| ProviderError::Timeout)?
        .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Chat provider returned {}: {}", status, text);
            return Err(classify_status(status.as_u16(), text).into());
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("empty choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or_else(|| body.model.clone()),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        with_retries("chat completion", || self.send_chat(&request)).await
    }

    fn model(&self) -> &str {
        &self.config.chat_model
    }
}

/// OpenAI-compatible embedding provider
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    /// Create a new embedding provider with a fixed output dimension
    pub fn new(config: ProviderConfig, dimension: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(Self {
            client,
            config,
            dimension,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };

        let mut builder = self.client.post(self.api_url());
        if let Some(key) = self.config.api_key.as_deref() {
            if !key.is_empty() {
                builder = builder.bearer_auth(key);
            }
        }

        let response = timeout(
            Duration::from_secs(self.config.timeout_secs),
            builder.json(&body).send(),
        )
        .await
        .map_err(|_| ProviderError::Timeout)?
        .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Embedding provider returned {}: {}", status, text);
            return Err(classify_status(status.as_u16(), text).into());
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);

        if rows.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                rows.len()
            ))
            .into());
        }

        let vectors: Vec<Vec<f32>> = rows.into_iter().map(|r| r.embedding).collect();
        for v in &vectors {
            if v.len() != self.dimension {
                return Err(ProviderError::DimensionMismatch {
                    expected: self.dimension,
                    actual: v.len(),
                }
                .into());
            }
        }

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retries("embedding", || self.send_embed(texts)).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Classify an HTTP status into transient vs permanent
fn classify_status(status: u16, message: String) -> ProviderError {
    if status >= 500 || status == 429 || status == 408 {
        ProviderError::Transient {
            status: Some(status),
            message,
        }
    } else {
        ProviderError::Permanent { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use mockall::mock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    mock! {
        pub Chat {}

        #[async_trait]
        impl ChatProvider for Chat {
            async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
            fn model(&self) -> &str;
        }
    }

    #[tokio::test]
    async fn test_mock_chat_provider() {
        let mut provider = MockChat::new();
        provider.expect_chat().times(1).returning(|_| {
            Ok(ChatResponse {
                content: r#"{"text": "ok", "confidence": 0.9, "found": true}"#.to_string(),
                model: "mock".to_string(),
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            })
        });

        let response = provider
            .chat(ChatRequest::new(vec![user_message("hi")]))
            .await
            .unwrap();
        assert!(response.content.contains("\"found\": true"));
        assert_eq!(response.total_tokens, 5);
    }

    #[test]
    fn test_message_helpers() {
        let msg = system_message("preamble");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "preamble");
        assert_eq!(user_message("q").role, Role::User);
        assert_eq!(assistant_message("a").role, Role::Assistant);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(503, String::new()),
            ProviderError::Transient { .. }
        ));
        assert!(matches!(
            classify_status(429, String::new()),
            ProviderError::Transient { .. }
        ));
        assert!(matches!(
            classify_status(400, String::new()),
            ProviderError::Permanent { .. }
        ));
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: crate::error::Result<()> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::Provider(ProviderError::Permanent {
                    status: 401,
                    message: "no".to_string(),
                }))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(EngineError::Provider(ProviderError::Transient {
                        status: Some(503),
                        message: "busy".to_string(),
                    }))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chat_provider_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-model",
                "choices": [{"message": {"role": "assistant", "content": "{\"text\":\"hi\"}"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
            })))
            .mount(&server)
            .await;

        let config = ProviderConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let provider = OpenAiChatProvider::new(config).unwrap();

        let response = provider
            .chat(ChatRequest::new(vec![user_message("hello")]).json_object())
            .await
            .unwrap();

        assert_eq!(response.content, "{\"text\":\"hi\"}");
        assert_eq!(response.prompt_tokens, 12);
        assert_eq!(response.total_tokens, 16);
    }

    #[tokio::test]
    async fn test_chat_provider_permanent_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let config = ProviderConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let provider = OpenAiChatProvider::new(config).unwrap();

        let err = provider
            .chat(ChatRequest::new(vec![user_message("hello")]))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_embedding_provider_dimension_check() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let config = ProviderConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let provider = OpenAiEmbeddingProvider::new(config, 4).unwrap();

        let err = provider.embed(&["text".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Provider(ProviderError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }
}
