use thiserror::Error;

use crate::avatar::AvatarError;
use crate::config::ConfigError;
use crate::llm::{LlmError, PipelineError};
use crate::speech::SpeechError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Speech error: {0}")]
    Speech(#[from] SpeechError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Avatar error: {0}")]
    Avatar(#[from] AvatarError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
