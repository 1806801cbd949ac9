//! LLM client abstraction and the OpenAI-compatible HTTP implementation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use planvm_core::error::VmError;
use planvm_core::llm::TextGenerator;

/// LLM request payload.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
    pub temperature: f32,
}

impl LlmRequest {
    pub fn user_only(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
            temperature: 0.2,
        }
    }
}

/// LLM errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("response error: {0}")]
    Response(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<LlmError> for VmError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Serialization(msg) => VmError::llm_parse(msg),
            other => VmError::tool_failed(other.to_string()),
        }
    }
}

/// A chat-completion endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError>;
}

#[async_trait]
impl LlmClient for Arc<dyn LlmClient> {
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        (**self).complete(request).await
    }
}

/// Configuration for an OpenAI-compatible chat endpoint. Both hosted APIs
/// and local runtimes expose this wire shape.
#[derive(Debug, Clone)]
pub struct HttpLlmClientConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for HttpLlmClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout_secs: 300,
        }
    }
}

/// HTTP LLM client using an OpenAI-compatible API.
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: HttpLlmClientConfig,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmClientConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            let value = format!("Bearer {}", key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(|e| LlmError::Http(e.to_string()))?,
            );
        }

        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user,
        });

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Response(format!("HTTP {}: {}", status, text)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Serialization(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Response("Missing choices".to_string()))
    }
}

/// Mock LLM client for tests and examples: replays queued responses, then
/// repeats the fallback.
pub struct MockLlmClient {
    queued: Mutex<VecDeque<String>>,
    fallback: String,
}

impl MockLlmClient {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
        }
    }

    pub fn with_responses(responses: Vec<String>, fallback: impl Into<String>) -> Self {
        Self {
            queued: Mutex::new(responses.into()),
            fallback: fallback.into(),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(response.into());
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<String, LlmError> {
        let mut queued = self
            .queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(queued.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Adapt an [`LlmClient`] to the VM's [`TextGenerator`] seam used by
/// conditional jumps and the `llm_generate` tool.
pub struct ClientTextGenerator<C> {
    client: C,
    temperature: f32,
}

impl<C> ClientTextGenerator<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            temperature: 0.2,
        }
    }
}

#[async_trait]
impl<C: LlmClient> TextGenerator for ClientTextGenerator<C> {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<String, VmError> {
        let request = LlmRequest {
            system: context.map(str::to_string),
            user: prompt.to_string(),
            temperature: self.temperature,
        };
        Ok(self.client.complete(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_client_replays_then_falls_back() {
        tokio_test::block_on(async {
            let client = MockLlmClient::with_responses(
                vec!["first".to_string(), "second".to_string()],
                "fallback",
            );
            for expected in ["first", "second", "fallback", "fallback"] {
                let reply = client.complete(LlmRequest::user_only("hi")).await.unwrap();
                assert_eq!(reply, expected);
            }
        });
    }

    #[test]
    fn test_text_generator_passes_context_as_system() {
        tokio_test::block_on(async {
            let generator = ClientTextGenerator::new(MockLlmClient::new("ok"));
            let reply = generator.generate("prompt", Some("background")).await.unwrap();
            assert_eq!(reply, "ok");
        });
    }
}
