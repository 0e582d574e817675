use super::SpeechError;
use tokio::sync::mpsc;

/// Why a recognition session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CancellationReason {
    Error,
    EndOfStream,
    CancelledByUser,
}

/// Events a recognizer reports during a continuous session.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Interim hypothesis, never forwarded as a query
    Recognizing(String),
    /// Final transcript of an utterance
    Recognized(String),
    NoMatch,
    Canceled {
        reason: CancellationReason,
        error_code: Option<String>,
        details: Option<String>,
    },
    SessionStopped,
}

/// Continuous speech recognition backend bound to one capture device.
#[async_trait::async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begin capturing. Events are sent on `events` until the session ends
    /// or [`stop_continuous`](Self::stop_continuous) is called.
    async fn start_continuous(
        &self,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<(), SpeechError>;

    /// Stop capturing and release the device. Must tolerate repeated calls.
    async fn stop_continuous(&self) -> Result<(), SpeechError>;
}
