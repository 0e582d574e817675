//! Answer pipeline: route, ask the chat deployment, present, remember.

use super::client::{ChatBackend, ChatRequest, ChatResponse, LlmError, Message};
use super::data_source::DataSourceCatalog;
use super::prompts::{ConversationTemplates, SystemPrompts};
use super::router::DataSourceRouter;
use super::sanitize::sanitize_answer;
use crate::store::{ConversationHistory, ConversationStore};
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error("A query is already being answered")]
    Busy,
    #[error("Query was cancelled")]
    Cancelled,
}

/// How a query ended. Remote failures are outcomes, not errors: the user
/// has already been shown a message for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Answered { source_index: usize, answer: String },
    NoAnswer,
    Failed,
    /// Blank input, nothing was sent.
    Ignored,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

pub struct AnswerPipeline {
    store: Arc<ConversationStore>,
    router: DataSourceRouter,
    backend: Arc<dyn ChatBackend>,
    catalog: Arc<DataSourceCatalog>,
    system_prompt: String,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<Option<CancellationToken>>,
}

/// Clears the in-flight slot when a query finishes, however it finishes.
struct InFlight<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl AnswerPipeline {
    pub fn new(
        store: Arc<ConversationStore>,
        chat_backend: Arc<dyn ChatBackend>,
        router_backend: Arc<dyn ChatBackend>,
        catalog: Arc<DataSourceCatalog>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            store,
            router: DataSourceRouter::new(router_backend, catalog.clone()),
            backend: chat_backend,
            catalog,
            system_prompt: system_prompt.into(),
            clock: Arc::new(SystemClock),
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn handle_query(&self, query: &str) -> Result<QueryOutcome, PipelineError> {
        self.handle_query_with_cancel(query, CancellationToken::new())
            .await
    }

    /// Answer one query. Rejects with `Busy` while another query is in
    /// flight; `cancel` (or [`cancel_in_flight`](Self::cancel_in_flight))
    /// abandons the query: the working text is cleared and no answer or
    /// history is written.
    pub async fn handle_query_with_cancel(
        &self,
        query: &str,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, PipelineError> {
        let query = query.trim();
        if query.is_empty() {
            log::info!("Empty query received, ignoring");
            return Ok(QueryOutcome::Ignored);
        }

        let _in_flight = self.begin(cancel.clone())?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.store.set_display_text(ConversationTemplates::working());
        let snapshot = self.store.history_snapshot();

        let source_index = tokio::select! {
            index = self.router.select(query, &snapshot) => index,
            _ = cancel.cancelled() => return Err(self.abandon()),
        };

        let request = self.build_request(query, &snapshot, source_index);

        let result = tokio::select! {
            result = self.backend.chat_completion(&request) => result,
            _ = cancel.cancelled() => return Err(self.abandon()),
        };

        Ok(self.apply_response(query, source_index, result))
    }

    /// Cancel the query currently in flight, if any.
    pub fn cancel_in_flight(&self) -> bool {
        let slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn begin(&self, cancel: CancellationToken) -> Result<InFlight<'_>, PipelineError> {
        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            log::warn!("Rejecting query while another one is in flight");
            return Err(PipelineError::Busy);
        }
        *slot = Some(cancel);
        Ok(InFlight {
            slot: &self.in_flight,
        })
    }

    fn abandon(&self) -> PipelineError {
        log::info!("Query cancelled before the answer arrived");
        self.store.set_display_text(String::new());
        PipelineError::Cancelled
    }

    fn build_request(&self, query: &str, snapshot: &ConversationHistory, source_index: usize) -> ChatRequest {
        let system = compose_system_prompt(&self.system_prompt, self.clock.now());
        let request = ChatRequest::new(assemble_messages(&system, snapshot, query));
        match self.catalog.get(source_index) {
            Some(descriptor) => {
                request.with_data_source(descriptor.source.with_role_information(&self.system_prompt))
            }
            None => request,
        }
    }

    fn apply_response(
        &self,
        query: &str,
        source_index: usize,
        result: Result<ChatResponse, LlmError>,
    ) -> QueryOutcome {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                log::error!("Chat completion failed: {}", e);
                self.store
                    .set_display_text(ConversationTemplates::completion_failed());
                return QueryOutcome::Failed;
            }
        };

        let answer = response
            .first_content()
            .map(sanitize_answer)
            .filter(|answer| !answer.is_empty());

        match answer {
            Some(answer) => {
                log::info!("Answer ready ({} chars) from source {}", answer.len(), source_index);
                self.store.set_display_text(answer.clone());
                self.store.append_exchange(query, answer.clone());
                QueryOutcome::Answered {
                    source_index,
                    answer,
                }
            }
            None => {
                log::warn!("Chat completion returned no usable choice");
                self.store.set_display_text(ConversationTemplates::no_response());
                QueryOutcome::NoAnswer
            }
        }
    }
}

/// Static prompt with the current date and time appended.
pub fn compose_system_prompt(prompt: &str, now: DateTime<Local>) -> String {
    SystemPrompts::with_current_time(prompt, now)
}

/// System prompt, then the history oldest to newest, then the new user turn.
pub fn assemble_messages(system_prompt: &str, history: &ConversationHistory, query: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend(history.iter().map(Message::from));
    messages.push(Message::user(query));
    messages
}
