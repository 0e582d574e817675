use crate::llm::data_source::{AzureSearchParameters, DataSource, DataSourceCatalog, DataSourceDescriptor};
use crate::llm::prompts::SystemPrompts;
use crate::store::DEFAULT_HISTORY_LIMIT;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Invalid data source '{name}': {reason}")]
    InvalidDataSource { name: String, reason: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read agent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse agent file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Credentials and endpoints for the remote services
#[derive(Debug)]
pub struct ApiConfig {
    pub speech_region: String,
    speech_key: SecretString,
    pub openai_endpoint: String,
    openai_key: SecretString,
    pub chat_deployment: String,
    pub router_deployment: String,
    pub api_version: String,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let speech_region = required("COGNITIVE_SERVICES_REGION")?;
        let speech_key = load_secret("COGNITIVE_SERVICES_KEY")?;
        let openai_endpoint = required("AZURE_OPENAI_ENDPOINT")?;
        let openai_key = load_secret("AZURE_OPENAI_API_KEY")?;
        let chat_deployment = required("AZURE_OPENAI_DEPLOYMENT_NAME")?;
        let router_deployment =
            optional("AZURE_OPENAI_ROUTER_DEPLOYMENT_NAME").unwrap_or_else(|| chat_deployment.clone());
        let api_version =
            optional("AZURE_OPENAI_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string());

        url::Url::parse(&openai_endpoint).map_err(|e| ConfigError::InvalidValue {
            name: "AZURE_OPENAI_ENDPOINT".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            speech_region,
            speech_key,
            openai_endpoint: openai_endpoint.trim_end_matches('/').to_string(),
            openai_key,
            chat_deployment,
            router_deployment,
            api_version,
        })
    }

    /// Build a configuration directly, mainly for tests and embedding.
    pub fn new(
        speech_region: impl Into<String>,
        speech_key: impl Into<String>,
        openai_endpoint: impl Into<String>,
        openai_key: impl Into<String>,
        chat_deployment: impl Into<String>,
    ) -> Self {
        let chat_deployment = chat_deployment.into();
        Self {
            speech_region: speech_region.into(),
            speech_key: SecretString::from(speech_key.into()),
            openai_endpoint: openai_endpoint.into(),
            openai_key: SecretString::from(openai_key.into()),
            router_deployment: chat_deployment.clone(),
            chat_deployment,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    /// Speech subscription key (use only when making API calls)
    pub fn speech_key(&self) -> &str {
        self.speech_key.expose_secret()
    }

    /// Azure OpenAI key (use only when making API calls)
    pub fn openai_key(&self) -> &str {
        self.openai_key.expose_secret()
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    let value = env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "value cannot be empty".to_string(),
        });
    }
    Ok(value.trim().to_string())
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn load_secret(name: &str) -> Result<SecretString, ConfigError> {
    required(name).map(SecretString::from)
}

/// Video crop window applied by the avatar renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CropRange {
    pub top_left: (u32, u32),
    pub bottom_right: (u32, u32),
}

impl Default for CropRange {
    fn default() -> Self {
        Self {
            top_left: (600, 50),
            bottom_right: (1320, 1080),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AvatarSettings {
    pub character: String,
    pub style: String,
    pub voice: String,
    pub background_color: String,
    pub crop: CropRange,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            character: "lisa".to_string(),
            style: "casual-sitting".to_string(),
            voice: "en-US-JennyNeural".to_string(),
            background_color: "#FFFFFF".to_string(),
            crop: CropRange::default(),
        }
    }
}

impl AvatarSettings {
    fn apply_env(mut self) -> Self {
        if let Some(voice) = optional("AVATAR_VOICE_NAME") {
            self.voice = voice;
        }
        if let Some(character) = optional("AVATAR_CHARACTER") {
            self.character = character;
        }
        if let Some(style) = optional("AVATAR_STYLE") {
            self.style = style;
        }
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (left, top) = self.crop.top_left;
        let (right, bottom) = self.crop.bottom_right;
        if left >= right || top >= bottom {
            return Err(ConfigError::InvalidValue {
                name: "avatar.crop".to_string(),
                reason: format!("empty crop window {:?} -> {:?}", self.crop.top_left, self.crop.bottom_right),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    /// Candidate languages for automatic source language detection.
    pub languages: Vec<String>,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            languages: vec!["en-US".to_string()],
        }
    }
}

/// Contents of the TOML agent file.
#[derive(Debug, Deserialize)]
struct AgentFile {
    system_prompt: Option<String>,
    history_limit: Option<usize>,
    #[serde(default)]
    data_sources: Vec<DataSourceDescriptor>,
    avatar: Option<AvatarSettings>,
    #[serde(default)]
    recognition: RecognitionSettings,
}

/// Everything the orchestration layer needs, loaded once and then shared read-only.
#[derive(Debug)]
pub struct AgentConfig {
    pub api: ApiConfig,
    pub system_prompt: String,
    pub history_limit: usize,
    pub sources: DataSourceCatalog,
    pub avatar: AvatarSettings,
    pub recognition: RecognitionSettings,
}

impl AgentConfig {
    /// Load from the environment and an optional TOML agent file. Without a
    /// file a single search source is built from `AI_SEARCH_*` variables.
    pub fn load(agent_file: Option<&Path>) -> Result<Self, ConfigError> {
        let api = ApiConfig::load()?;
        match agent_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Self::from_toml(api, &text)
            }
            None => {
                let sources = DataSourceCatalog::new(vec![search_source_from_env()?])?;
                Ok(Self {
                    api,
                    system_prompt: SystemPrompts::information_assistant().to_string(),
                    history_limit: DEFAULT_HISTORY_LIMIT,
                    sources,
                    avatar: AvatarSettings::default().apply_env(),
                    recognition: RecognitionSettings::default(),
                })
            }
        }
    }

    pub fn from_toml(api: ApiConfig, text: &str) -> Result<Self, ConfigError> {
        let file: AgentFile = toml::from_str(text)?;

        let history_limit = file.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if history_limit < 2 {
            return Err(ConfigError::InvalidValue {
                name: "history_limit".to_string(),
                reason: "must hold at least one exchange (2 turns)".to_string(),
            });
        }
        if file.recognition.languages.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "recognition.languages".to_string(),
                reason: "at least one language is required".to_string(),
            });
        }

        let avatar = file.avatar.unwrap_or_default().apply_env();
        avatar.validate()?;

        let system_prompt = file
            .system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| SystemPrompts::information_assistant().to_string());

        Ok(Self {
            api,
            system_prompt,
            history_limit,
            sources: DataSourceCatalog::new(file.data_sources)?,
            avatar,
            recognition: file.recognition,
        })
    }
}

fn search_source_from_env() -> Result<DataSourceDescriptor, ConfigError> {
    let endpoint = required("AI_SEARCH_ENDPOINT")?;
    let key = required("AI_SEARCH_API_KEY")?;
    let index = required("AI_SEARCH_INDEX")?;
    Ok(DataSourceDescriptor {
        name: index.clone(),
        description: "General knowledge base".to_string(),
        keywords: Vec::new(),
        source: DataSource::AzureSearch(AzureSearchParameters::with_key(endpoint, key, index)),
    })
}

/// Load configuration with helpful error messages for development
pub fn load_config(agent_file: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    match AgentConfig::load(agent_file) {
        Ok(config) => {
            log::info!(
                "Loaded configuration with {} data source(s), history limit {}",
                config.sources.len(),
                config.history_limit
            );
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_value_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
