//! # Remote Endpoint Tests
//!
//! HTTP status handling of the relay token and short-audio recognition
//! clients, pointed at a local endpoint.

mod common;

use avatar_concierge::avatar::{AvatarError, AzureRelayTokenSource, RelayTokenSource};
use avatar_concierge::config::ApiConfig;
use avatar_concierge::speech::{
    AudioSource, AzureShortAudioRecognizer, CancellationReason, CapturedAudio, RecognitionEvent,
    SpeechError, SpeechRecognizer,
};
use common::{serve_once, TIMEOUT};
use std::sync::Arc;
use tokio::sync::mpsc;

fn api() -> ApiConfig {
    ApiConfig::new(
        "westeurope",
        "speech-key",
        "https://example.openai.azure.com",
        "openai-key",
        "gpt-4o",
    )
}

struct Silence;

impl AudioSource for Silence {
    fn capture(&self) -> Result<CapturedAudio, SpeechError> {
        Ok(CapturedAudio {
            samples: vec![0; 1600],
            sample_rate: 16000,
        })
    }
}

async fn recognize_against(url: String) -> Vec<RecognitionEvent> {
    let recognizer = AzureShortAudioRecognizer::new(&api(), &["en-US".to_string()], Arc::new(Silence))
        .unwrap()
        .with_endpoint(url);
    let (tx, mut rx) = mpsc::unbounded_channel();
    recognizer.start_continuous(tx).await.unwrap();

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for recognition")
            .expect("event channel closed");
        let stopped = event == RecognitionEvent::SessionStopped;
        events.push(event);
        if stopped {
            return events;
        }
    }
}

#[tokio::test]
async fn test_relay_unauthorized_is_provisioning_error() {
    let url = serve_once(401, r#"{"error":"invalid subscription key"}"#).await;
    let relay = AzureRelayTokenSource::new(&api()).with_url(url);

    match relay.fetch_relay_credentials().await {
        Err(AvatarError::Provisioning(message)) => assert!(message.contains("401"), "{}", message),
        other => panic!("expected provisioning error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_token_is_fetched() {
    let url = serve_once(
        200,
        r#"{"Urls":["turn:relay.example:3478"],"Username":"user","Password":"secret"}"#,
    )
    .await;
    let relay = AzureRelayTokenSource::new(&api()).with_url(url);

    let server = relay.fetch_relay_credentials().await.unwrap();
    assert_eq!(server.urls, vec!["turn:relay.example:3478".to_string()]);
    assert_eq!(server.username, "user");
    assert_eq!(server.credential, "secret");
}

#[tokio::test]
async fn test_recognition_unauthorized_is_canceled_with_error() {
    let url = serve_once(401, r#"{"error":"access denied"}"#).await;

    let events = recognize_against(url).await;

    assert_eq!(events.len(), 2);
    match &events[0] {
        RecognitionEvent::Canceled {
            reason,
            error_code,
            details,
        } => {
            assert_eq!(*reason, CancellationReason::Error);
            assert_eq!(error_code.as_deref(), Some("401"));
            assert!(details.as_deref().unwrap_or_default().contains("access denied"));
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(events[1], RecognitionEvent::SessionStopped);
}

#[tokio::test]
async fn test_recognition_success_is_recognized() {
    let url = serve_once(
        200,
        r#"{"RecognitionStatus":"Success","DisplayText":"Where is the dog park?","Offset":0,"Duration":100}"#,
    )
    .await;

    let events = recognize_against(url).await;

    assert_eq!(
        events,
        vec![
            RecognitionEvent::Recognized("Where is the dog park?".to_string()),
            RecognitionEvent::SessionStopped,
        ]
    );
}
