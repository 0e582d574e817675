//! User-facing entry points tying speech, pipeline and avatar together.

use crate::avatar::{AvatarSession, StopHandle};
use crate::llm::{AnswerPipeline, PipelineError, QueryOutcome};
use crate::speech::{SpeechError, SpeechInputController, SpeechRecognizer};
use crate::store::ConversationStore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub struct AgentSession {
    store: Arc<ConversationStore>,
    pipeline: Arc<AnswerPipeline>,
    speech: SpeechInputController,
    avatar: Option<Arc<AvatarSession>>,
    stop: Option<StopHandle>,
    voice_queries: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    /// Wire the components together. Utterances recognized by the speech
    /// controller are answered by a background task.
    pub fn new(
        store: Arc<ConversationStore>,
        pipeline: Arc<AnswerPipeline>,
        avatar: Option<Arc<AvatarSession>>,
    ) -> Self {
        let (queries_tx, queries_rx) = mpsc::unbounded_channel();
        let speech = SpeechInputController::new(Arc::clone(&store), queries_tx);
        let task = tokio::spawn(answer_voice_queries(Arc::clone(&pipeline), queries_rx));
        let stop = avatar.as_ref().map(|avatar| avatar.stop_handle());

        Self {
            store,
            pipeline,
            speech,
            avatar,
            stop,
            voice_queries: Mutex::new(Some(task)),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn speech(&self) -> &SpeechInputController {
        &self.speech
    }

    pub fn avatar(&self) -> Option<&Arc<AvatarSession>> {
        self.avatar.as_ref()
    }

    /// Start the avatar, if there is one. Failure is logged and the session
    /// carries on text-only.
    pub async fn connect_avatar(&self) -> bool {
        let Some(avatar) = &self.avatar else {
            return false;
        };
        match avatar.start().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Continuing without avatar: {}", e);
                false
            }
        }
    }

    pub async fn provision_microphone(&self, recognizer: Arc<dyn SpeechRecognizer>) {
        self.speech.provision(recognizer).await;
    }

    /// Answer a typed query.
    pub async fn submit_text(&self, text: &str) -> Result<QueryOutcome, PipelineError> {
        self.pipeline.handle_query(text).await
    }

    pub async fn start_listening(&self) -> Result<(), SpeechError> {
        if self.pipeline.is_busy() {
            log::info!("Still answering, listening anyway");
        }
        self.speech.start().await
    }

    /// Stop listening, abandon the query in flight and silence the avatar.
    pub async fn stop(&self) {
        self.speech.stop().await;
        if self.pipeline.cancel_in_flight() {
            log::info!("Cancelled the query in flight");
        }
        if let Some(stop) = &self.stop {
            if self.store.snapshot_state().is_avatar_speaking {
                stop.request_stop();
            }
        }
    }

    pub async fn shutdown(&self) {
        self.speech.stop().await;
        self.pipeline.cancel_in_flight();
        if let Some(task) = self.voice_queries.lock().await.take() {
            task.abort();
        }
        if let Some(avatar) = &self.avatar {
            avatar.shutdown().await;
        }
        log::info!("Session shut down");
    }
}

async fn answer_voice_queries(pipeline: Arc<AnswerPipeline>, mut queries: mpsc::UnboundedReceiver<String>) {
    while let Some(query) = queries.recv().await {
        log::info!("Voice query: {}", query);
        match pipeline.handle_query(&query).await {
            Ok(outcome) => log::debug!("Voice query finished: {:?}", outcome),
            Err(PipelineError::Busy) => log::warn!("Dropped voice query, still answering the previous one"),
            Err(PipelineError::Cancelled) => log::info!("Voice query cancelled"),
        }
    }
}
