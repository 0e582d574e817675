pub mod avatar;
pub mod config;
pub mod error;
pub mod llm;
pub mod session;
pub mod speech;
pub mod store;

pub use error::{AgentError, Result};
