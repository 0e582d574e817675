use super::data_source::DataSource;
use crate::config::ApiConfig;
use crate::store::{Role, Turn};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Remote error{}: {message}", .code.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Remote { code: Option<String>, message: String },
    #[error("Response parsing error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Body of a chat completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_sources: Vec<DataSource>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            data_sources: Vec::new(),
            messages,
            temperature: None,
            max_tokens: None,
            stream: false,
        }
    }

    pub fn with_data_source(mut self, source: DataSource) -> Self {
        self.data_sources = vec![source];
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub error: Option<RemoteError>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Content of the first choice, if the model produced one.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Choice>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Choice>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// Absent on filtered choices.
    #[serde(default)]
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    fn into_error(self) -> LlmError {
        LlmError::Remote {
            code: self.code.map(|c| match c {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Chat completion endpoint used by the router and the answer pipeline.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// One Azure OpenAI deployment.
pub struct AzureOpenAI {
    client: Client,
    api_key: SecretString,
    endpoint: String,
    deployment: String,
    api_version: String,
}

impl AzureOpenAI {
    pub fn new(
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .build()
            .map_err(|e| LlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: SecretString::from(api_key.into()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            deployment: deployment.into(),
            api_version: api_version.into(),
        })
    }

    /// Client for the answer deployment
    pub fn chat(config: &ApiConfig) -> Result<Self, LlmError> {
        Self::new(
            &config.openai_endpoint,
            &config.chat_deployment,
            &config.api_version,
            config.openai_key(),
        )
    }

    /// Client for the routing deployment
    pub fn router(config: &ApiConfig) -> Result<Self, LlmError> {
        Self::new(
            &config.openai_endpoint,
            &config.router_deployment,
            &config.api_version,
            config.openai_key(),
        )
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    /// Parse a response body, turning an embedded `error` object into an error
    fn parse_response(body: &str) -> Result<ChatResponse, LlmError> {
        let mut response: ChatResponse = serde_json::from_str(body)
            .map_err(|e| LlmError::ParseError(format!("Invalid JSON: {}", e)))?;
        if let Some(error) = response.error.take() {
            return Err(error.into_error());
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatBackend for AzureOpenAI {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = self.completions_url();
        log::debug!(
            "Calling deployment '{}' with {} message(s)",
            self.deployment,
            request.messages.len()
        );

        let response = self
            .client
            .post(&url)
            .header("api-key", self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            // Azure reports most failures as {"error": {...}}
            if let Ok(ChatResponse {
                error: Some(error), ..
            }) = serde_json::from_str::<ChatResponse>(&body)
            {
                log::warn!("Deployment '{}' returned {}: {}", self.deployment, status, error.message);
                return Err(error.into_error());
            }
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed = Self::parse_response(&body)?;
        if let Some(usage) = &parsed.usage {
            log::debug!(
                "Deployment '{}' used {} tokens ({} prompt, {} completion)",
                self.deployment,
                usage.total_tokens,
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        Ok(parsed)
    }
}
