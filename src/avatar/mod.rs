pub mod headless;
pub mod media;
pub mod relay;
pub mod session;
pub mod speech_text;

pub use media::{
    AvatarSynthesizer, IceConnectionState, MediaSink, PeerConnection, PeerConnectionFactory,
    PeerEvent, RemoteTrack, TrackKind, TransceiverDirection,
};
pub use relay::{AzureRelayTokenSource, IceServer, RelayTokenSource};
pub use session::{AvatarMedia, AvatarPhase, AvatarSession, StopHandle};
pub use speech_text::markdown_to_speech_text;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AvatarError {
    #[error("Failed to fetch relay credentials: {0}")]
    Provisioning(String),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Peer connection failed: {0}")]
    Connection(String),
    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("Media playback failed: {0}")]
    Playback(String),
    #[error("Avatar session is not connected")]
    NotConnected,
    #[error("Avatar session already started")]
    AlreadyStarted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}
