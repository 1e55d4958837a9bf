//! Translation oracle: the external chat-completion service.
//!
//! The oracle is an untrusted text transformer. Nothing here checks that
//! the markup it returns is sound; that happens in the orchestrator.

use crate::config::Settings;
use crate::error::TranslationError;
use crate::utils::check_response_status;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", or "assistant".
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body for the chat completions API.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Message>,
}

impl OracleRequest {
    /// Content of the last user message.
    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Response from the chat completions API.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

/// A single choice in the response.
#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

/// Message content in a response.
#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Anything that can answer a chat-completion request with text.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Sends one request and returns the best completion text.
    async fn complete(&self, request: &OracleRequest) -> Result<String, TranslationError>;
}

/// Oracle backed by an OpenAI-compatible HTTP API.
pub struct OpenAiOracle {
    /// HTTP client for API requests.
    client: Client,
    /// Base URL, without trailing slash.
    base_url: String,
    /// Bearer token.
    api_key: String,
}

impl OpenAiOracle {
    /// Creates an oracle for the endpoint and credential in `settings`.
    pub fn new(settings: &Settings) -> Result<Self, TranslationError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| TranslationError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn complete(&self, request: &OracleRequest) -> Result<String, TranslationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let response = check_response_status(response).await?;

        let body: ChatResponse = response.json().await.map_err(|e| {
            TranslationError::ParseError(format!("Failed to parse API response: {}", e))
        })?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| TranslationError::ParseError("No choices in API response".to_string()))
    }
}

/// Scripted oracle for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&str) -> Result<String, TranslationError> + Send + Sync>;

    /// Answers each request by running a closure over the user content.
    pub struct ScriptedOracle {
        script: Script,
        requests: Mutex<Vec<OracleRequest>>,
    }

    impl ScriptedOracle {
        pub fn new(
            script: impl Fn(&str) -> Result<String, TranslationError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// User contents of every request received, in order.
        pub fn inputs(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.user_content().to_string())
                .collect()
        }

        /// Every request received, in order.
        pub fn requests(&self) -> Vec<OracleRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn complete(&self, request: &OracleRequest) -> Result<String, TranslationError> {
            self.requests.lock().unwrap().push(request.clone());
            (self.script)(request.user_content())
        }
    }

    #[async_trait]
    impl<T: Oracle + ?Sized> Oracle for std::sync::Arc<T> {
        async fn complete(&self, request: &OracleRequest) -> Result<String, TranslationError> {
            (**self).complete(request).await
        }
    }
}
