//! Speech input controller.
//!
//! Owns at most one live recognition session. A session ends on the first
//! final result, no-match, cancellation or stop; exactly one query is
//! forwarded per recognized utterance and interim hypotheses are dropped.

use super::recognizer::{CancellationReason, RecognitionEvent, SpeechRecognizer};
use super::SpeechError;
use crate::store::ConversationStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RecognitionState {
    Idle,
    Listening,
}

/// How the last session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionOutcome {
    Recognized(String),
    NoMatch,
    Canceled,
    SessionStopped,
    Stopped,
}

struct ActiveSession {
    id: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    session: Option<ActiveSession>,
    last_outcome: Option<RecognitionOutcome>,
}

struct Shared {
    store: Arc<ConversationStore>,
    queries: mpsc::UnboundedSender<String>,
    inner: Mutex<Inner>,
    next_session: AtomicU64,
}

#[derive(Clone)]
pub struct SpeechInputController {
    shared: Arc<Shared>,
}

impl SpeechInputController {
    /// Recognized utterances are sent on `queries`.
    pub fn new(store: Arc<ConversationStore>, queries: mpsc::UnboundedSender<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                queries,
                inner: Mutex::new(Inner::default()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Install the recognizer used by subsequent sessions, stopping any
    /// session still running on the previous one.
    pub async fn provision(&self, recognizer: Arc<dyn SpeechRecognizer>) {
        self.stop().await;
        self.shared.inner.lock().await.recognizer = Some(recognizer);
        log::info!("Speech recognizer provisioned");
    }

    /// Like [`provision`](Self::provision) for a recognizer whose device
    /// acquisition can fail. Failure is logged and leaves the controller
    /// unprovisioned.
    pub async fn provision_with<F>(&self, acquire: F) -> bool
    where
        F: FnOnce() -> Result<Arc<dyn SpeechRecognizer>, SpeechError>,
    {
        match acquire() {
            Ok(recognizer) => {
                self.provision(recognizer).await;
                true
            }
            Err(e) => {
                log::error!("Microphone unavailable, speech input disabled: {}", e);
                false
            }
        }
    }

    pub async fn is_provisioned(&self) -> bool {
        self.shared.inner.lock().await.recognizer.is_some()
    }

    pub async fn state(&self) -> RecognitionState {
        if self.shared.inner.lock().await.session.is_some() {
            RecognitionState::Listening
        } else {
            RecognitionState::Idle
        }
    }

    pub async fn last_outcome(&self) -> Option<RecognitionOutcome> {
        self.shared.inner.lock().await.last_outcome.clone()
    }

    /// Begin a recognition session. Calling it while already listening is a
    /// no-op.
    pub async fn start(&self) -> Result<(), SpeechError> {
        let mut inner = self.shared.inner.lock().await;
        let recognizer = inner
            .recognizer
            .clone()
            .ok_or(SpeechError::RecognizerNotReady)?;

        if inner.session.is_some() {
            log::debug!("Already listening, ignoring start");
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        recognizer.start_continuous(events_tx).await?;

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            run_session(shared, id, events_rx).await;
        });

        inner.session = Some(ActiveSession { id, task });
        self.shared.store.set_listening(true);
        log::info!("Listening (session {})", id);
        Ok(())
    }

    /// Stop listening and release the capture session. Always safe to call.
    pub async fn stop(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(session) = inner.session.take() {
            session.task.abort();
            if let Some(recognizer) = inner.recognizer.clone() {
                if let Err(e) = recognizer.stop_continuous().await {
                    log::warn!("Failed to stop recognizer: {}", e);
                }
            }
            inner.last_outcome = Some(RecognitionOutcome::Stopped);
            log::info!("Stopped listening (session {})", session.id);
        }
        self.shared.store.set_listening(false);
    }
}

async fn run_session(shared: Arc<Shared>, id: u64, mut events: mpsc::UnboundedReceiver<RecognitionEvent>) {
    while let Some(event) = events.recv().await {
        let outcome = match event {
            RecognitionEvent::Recognizing(partial) => {
                log::debug!("RECOGNIZING: {}", partial);
                continue;
            }
            RecognitionEvent::Recognized(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    log::info!("NOMATCH: Recognized an empty utterance.");
                    RecognitionOutcome::NoMatch
                } else {
                    log::info!("RECOGNIZED: {}", text);
                    RecognitionOutcome::Recognized(text)
                }
            }
            RecognitionEvent::NoMatch => {
                log::info!("NOMATCH: Speech could not be recognized.");
                RecognitionOutcome::NoMatch
            }
            RecognitionEvent::Canceled {
                reason,
                error_code,
                details,
            } => {
                log::warn!("CANCELED: Reason={}", reason);
                if reason == CancellationReason::Error {
                    log::warn!("CANCELED: ErrorCode={}", error_code.as_deref().unwrap_or("unknown"));
                    log::warn!("CANCELED: ErrorDetails={}", details.as_deref().unwrap_or(""));
                    log::warn!("CANCELED: Did you set the speech resource key and region values?");
                }
                RecognitionOutcome::Canceled
            }
            RecognitionEvent::SessionStopped => RecognitionOutcome::SessionStopped,
        };
        finish(&shared, id, outcome).await;
        return;
    }
    finish(&shared, id, RecognitionOutcome::SessionStopped).await;
}

/// End session `id` if it is still the live one, forwarding a recognized
/// utterance exactly once.
async fn finish(shared: &Shared, id: u64, outcome: RecognitionOutcome) {
    let mut inner = shared.inner.lock().await;
    match &inner.session {
        Some(session) if session.id == id => {}
        _ => return,
    }
    // Detach rather than abort: this task is the one running.
    inner.session = None;
    shared.store.set_listening(false);

    if let RecognitionOutcome::Recognized(text) = &outcome {
        if shared.queries.send(text.clone()).is_err() {
            log::warn!("No query consumer, dropping recognized utterance");
        }
    }

    if let Some(recognizer) = inner.recognizer.clone() {
        if let Err(e) = recognizer.stop_continuous().await {
            log::warn!("Failed to stop recognizer: {}", e);
        }
    }
    inner.last_outcome = Some(outcome);
}
