//! # Session Tests
//!
//! Voice and text queries flowing through the session facade, with the
//! recognizer and chat backends replaced by in-process fakes.

mod common;

use avatar_concierge::avatar::{AvatarMedia, AvatarSession};
use avatar_concierge::config::AvatarSettings;
use avatar_concierge::llm::{AnswerPipeline, QueryOutcome};
use avatar_concierge::session::AgentSession;
use avatar_concierge::speech::{
    CancellationReason, RecognitionEvent, RecognitionState, SpeechError, SpeechRecognizer,
};
use avatar_concierge::store::{ConversationStore, Turn};
use common::{
    answer, catalog, wait_for, wait_until, CallLog, FakePeerFactory, FakeRelay, FakeSynthesizer, FixedClock,
    Gate, RecordingSink, ScriptedChat,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Recognizer that replays a script of events when started.
#[derive(Default)]
struct ScriptedRecognizer {
    script: Vec<RecognitionEvent>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    sender: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
}

impl ScriptedRecognizer {
    fn new(script: Vec<RecognitionEvent>) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start_continuous(
        &self,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<(), SpeechError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        for event in &self.script {
            events.send(event.clone()).unwrap();
        }
        *self.sender.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn stop_continuous(&self) -> Result<(), SpeechError> {
        if self.sender.lock().unwrap().take().is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn text_only_session(chat: Arc<ScriptedChat>) -> AgentSession {
    let store = Arc::new(ConversationStore::default());
    let pipeline = Arc::new(
        AnswerPipeline::new(
            Arc::clone(&store),
            chat,
            ScriptedChat::router("0"),
            catalog(2),
            "Prompt",
        )
        .with_clock(Arc::new(FixedClock)),
    );
    AgentSession::new(store, pipeline, None)
}

#[tokio::test]
async fn test_voice_query_is_answered() {
    let session = text_only_session(ScriptedChat::new(vec![answer("Parks open at 8am [doc1].")]));
    let recognizer = ScriptedRecognizer::new(vec![
        RecognitionEvent::Recognizing("what are".to_string()),
        RecognitionEvent::Recognizing("what are the park".to_string()),
        RecognitionEvent::Recognized("What are the park hours?".to_string()),
    ]);
    session.provision_microphone(recognizer.clone()).await;

    let mut history = session.store().subscribe_history();
    session.start_listening().await.unwrap();
    wait_for(&mut history, |h| h.len() == 2).await;

    let turns: Vec<Turn> = session.store().history_snapshot().iter().cloned().collect();
    assert_eq!(
        turns,
        vec![
            Turn::user("What are the park hours?"),
            Turn::assistant("Parks open at 8am.")
        ]
    );
    assert!(!session.store().snapshot_state().is_listening);
    assert_eq!(session.speech().state().await, RecognitionState::Idle);
    assert_eq!(recognizer.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unrecognized_speech_sends_nothing() {
    let chat = ScriptedChat::new(vec![answer("unused")]);
    let session = text_only_session(chat.clone());
    let recognizer = ScriptedRecognizer::new(vec![RecognitionEvent::Canceled {
        reason: CancellationReason::Error,
        error_code: Some("AuthenticationFailure".to_string()),
        details: Some("401".to_string()),
    }]);
    session.provision_microphone(recognizer).await;

    let mut state = session.store().subscribe_state();
    session.start_listening().await.unwrap();
    wait_for(&mut state, |s| !s.is_listening).await;
    tokio::task::yield_now().await;

    assert!(chat.requests().is_empty());
    assert!(session.store().history_snapshot().is_empty());
}

#[tokio::test]
async fn test_listening_requires_microphone() {
    let session = text_only_session(ScriptedChat::new(vec![answer("unused")]));
    assert!(matches!(
        session.start_listening().await,
        Err(SpeechError::RecognizerNotReady)
    ));
}

#[tokio::test]
async fn test_start_stop_keeps_single_capture_session() {
    let session = text_only_session(ScriptedChat::new(vec![answer("unused")]));
    let recognizer = ScriptedRecognizer::new(Vec::new());
    session.provision_microphone(recognizer.clone()).await;

    for round in 0..5 {
        session.start_listening().await.unwrap();
        session.start_listening().await.unwrap();
        assert!(session.store().snapshot_state().is_listening, "round {}", round);
        assert_eq!(recognizer.active.load(Ordering::SeqCst), 1);

        session.stop().await;
        session.stop().await;
        assert!(!session.store().snapshot_state().is_listening);
        assert_eq!(recognizer.active.load(Ordering::SeqCst), 0);
    }
    assert_eq!(recognizer.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_typed_query() {
    let session = text_only_session(ScriptedChat::new(vec![answer("The library opens at 9.")]));

    let outcome = session.submit_text("When does the library open?").await.unwrap();

    assert!(matches!(outcome, QueryOutcome::Answered { .. }));
    assert_eq!(session.store().snapshot_state().display_text, "The library opens at 9.");
}

#[tokio::test]
async fn test_stop_cancels_query_in_flight() {
    let gate = Arc::new(Gate::default());
    let session = Arc::new(text_only_session(ScriptedChat::gated(
        vec![answer("late answer")],
        gate.clone(),
    )));

    let task = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.submit_text("question").await }
    });
    gate.entered.notified().await;
    session.stop().await;

    assert!(task.await.unwrap().is_err());
    assert!(session.store().history_snapshot().is_empty());
    assert_eq!(session.store().snapshot_state().display_text, "");
}

#[tokio::test]
async fn test_stop_silences_avatar() {
    let log = CallLog::default();
    let store = Arc::new(ConversationStore::default());
    let synthesizer = FakeSynthesizer::new(log.clone());
    let avatar = Arc::new(AvatarSession::new(
        Arc::clone(&store),
        AvatarSettings::default(),
        Arc::new(FakeRelay { fail: false }),
        FakePeerFactory::new(log.clone()),
        synthesizer.clone(),
        AvatarMedia {
            audio: Arc::new(RecordingSink { log: log.clone(), fail_play: false }),
            video: Arc::new(RecordingSink { log: log.clone(), fail_play: false }),
        },
    ));
    let pipeline = Arc::new(AnswerPipeline::new(
        Arc::clone(&store),
        ScriptedChat::new(vec![answer("A long answer about the parks.")]),
        ScriptedChat::router("0"),
        catalog(1),
        "Prompt",
    ));
    let session = AgentSession::new(Arc::clone(&store), pipeline, Some(avatar));
    assert!(session.connect_avatar().await);

    let mut state = store.subscribe_state();
    session.submit_text("Tell me about the parks").await.unwrap();
    wait_until(|| {
        synthesizer.spoken().last().map(String::as_str) == Some("A long answer about the parks.")
    })
    .await;
    assert!(store.snapshot_state().is_avatar_speaking);

    session.stop().await;
    wait_for(&mut state, |s| !s.is_avatar_speaking && !s.stop_avatar_speaking).await;
    assert!(log.count("synth.stop") >= 1);

    session.shutdown().await;
    assert!(!store.snapshot_state().is_avatar_connected);
}
