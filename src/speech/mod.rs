pub mod azure;
pub mod controller;
pub mod recognizer;

pub use azure::{AudioSource, AzureShortAudioRecognizer, CapturedAudio, WavFileSource};
pub use controller::{RecognitionOutcome, RecognitionState, SpeechInputController};
pub use recognizer::{CancellationReason, RecognitionEvent, SpeechRecognizer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("Speech recognizer is not provisioned")]
    RecognizerNotReady,
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Audio format error: {0}")]
    AudioFormat(String),
    #[error("Audio device unavailable: {0}")]
    Device(String),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}
