//! Data source routing.
//!
//! A small classification call picks which configured search index the
//! answer should be grounded in. Routing never fails from the caller's point
//! of view: any problem falls back to the first source.

use super::client::{ChatBackend, ChatRequest, Message};
use super::data_source::DataSourceCatalog;
use super::prompts::{PromptBuilder, SystemPrompts};
use crate::store::{ConversationHistory, Turn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Number of history turns shown to the routing model.
pub const ROUTER_HISTORY_TURNS: usize = 4;

/// Enough output budget for a small integer.
const ROUTER_MAX_TOKENS: u32 = 5;

const FALLBACK_INDEX: usize = 0;

static FIRST_INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-+]?\d+").expect("valid regex"));

pub struct DataSourceRouter {
    backend: Arc<dyn ChatBackend>,
    catalog: Arc<DataSourceCatalog>,
}

impl DataSourceRouter {
    pub fn new(backend: Arc<dyn ChatBackend>, catalog: Arc<DataSourceCatalog>) -> Self {
        Self { backend, catalog }
    }

    /// Index of the source best suited to `query`, always in `[0, N)`.
    pub async fn select(&self, query: &str, history: &ConversationHistory) -> usize {
        let count = self.catalog.len();
        let recent = history.recent(ROUTER_HISTORY_TURNS);
        let prompt = build_routing_prompt(&self.catalog, query, &recent);

        let request = ChatRequest::new(vec![
            Message::system(SystemPrompts::data_source_router()),
            Message::user(prompt),
        ])
        .with_temperature(0.0)
        .with_max_tokens(ROUTER_MAX_TOKENS);

        let response = match self.backend.chat_completion(&request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Routing call failed, using source {}: {}", FALLBACK_INDEX, e);
                return FALLBACK_INDEX;
            }
        };

        let content = response.first_content().unwrap_or_default();
        match parse_source_index(content) {
            Some(index) if (0..count as i64).contains(&index) => {
                let index = index as usize;
                if let Some(source) = self.catalog.get(index) {
                    log::info!("Routing query to source {} ({})", index, source.name);
                }
                index
            }
            Some(index) => {
                log::warn!(
                    "Router answered {} but only {} source(s) exist, using source {}",
                    index,
                    count,
                    FALLBACK_INDEX
                );
                FALLBACK_INDEX
            }
            None => {
                log::warn!(
                    "Could not parse a source index from router reply {:?}, using source {}",
                    content,
                    FALLBACK_INDEX
                );
                FALLBACK_INDEX
            }
        }
    }
}

/// Prompt listing every source with its description and keywords, the
/// recent conversation, and the question to classify.
pub fn build_routing_prompt(catalog: &DataSourceCatalog, query: &str, recent: &[Turn]) -> String {
    PromptBuilder::new()
        .add_sources(catalog)
        .add_history(recent)
        .add_question(query)
        .add_constraint(&format!(
            "Answer with a single integer between 0 and {}.",
            catalog.len().saturating_sub(1)
        ))
        .build()
}

/// First integer appearing in `reply`, if any.
pub fn parse_source_index(reply: &str) -> Option<i64> {
    FIRST_INTEGER
        .find(reply)
        .and_then(|m| m.as_str().parse::<i64>().ok())
}
