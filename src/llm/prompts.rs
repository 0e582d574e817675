// System prompts and fixed user-facing strings

use super::data_source::DataSourceCatalog;
use crate::store::Turn;
use chrono::{DateTime, Local};

pub struct SystemPrompts;

impl SystemPrompts {
    /// Default retrieval assistant prompt
    pub fn information_assistant() -> &'static str {
        "You are an AI assistant that helps people find information. \n\n\
         - **DO NOT** include any citations, references, or doc links. \n\
         - Only provide a brief response in 1 to 2 sentences unless asked otherwise."
    }

    /// Static prompt followed by the current date and time
    pub fn with_current_time(prompt: &str, now: DateTime<Local>) -> String {
        format!(
            "{}\n\nThe current date and time is {}.",
            prompt.trim_end(),
            now.format("%A, %B %-d, %Y %H:%M (UTC%:z)")
        )
    }

    /// Instructions for the data source routing call
    pub fn data_source_router() -> &'static str {
        "You route user questions to the knowledge source most likely to answer them. \
         Reply with the number of the best matching source and nothing else."
    }
}

pub struct ConversationTemplates;

impl ConversationTemplates {
    /// Shown while a query is being answered
    pub fn working() -> &'static str {
        "One moment please..."
    }

    /// Shown when the chat completion call fails
    pub fn completion_failed() -> &'static str {
        "Sorry, I'm having trouble answering right now. Please try again in a moment."
    }

    /// Shown when the model returns no choices
    pub fn no_response() -> &'static str {
        "Sorry, I couldn't come up with an answer to that. Could you rephrase the question?"
    }
}

pub struct PromptBuilder {
    parts: Vec<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn add_sources(mut self, catalog: &DataSourceCatalog) -> Self {
        let listing = catalog
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let keywords = if source.keywords.is_empty() {
                    String::new()
                } else {
                    format!(" (keywords: {})", source.keywords.join(", "))
                };
                format!("{}. {}: {}{}", index, source.name, source.description, keywords)
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.parts.push(format!("Sources:\n{}", listing));
        self
    }

    pub fn add_history(mut self, turns: &[Turn]) -> Self {
        if turns.is_empty() {
            return self;
        }
        let transcript = turns
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.parts.push(format!("Recent conversation:\n{}", transcript));
        self
    }

    pub fn add_question(mut self, question: &str) -> Self {
        self.parts.push(format!("Question: {}", question));
        self
    }

    pub fn add_constraint(mut self, constraint: &str) -> Self {
        self.parts.push(format!("Constraint: {}", constraint));
        self
    }

    pub fn build(self) -> String {
        self.parts.join("\n\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
