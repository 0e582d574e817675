//! Seams between the avatar session and the media stack that renders it.

use super::relay::IceServer;
use super::AvatarError;
use crate::config::AvatarSettings;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
}

/// Callbacks raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Track(RemoteTrack),
    IceStateChanged(IceConnectionState),
    /// Message from the avatar on the control data channel.
    AvatarEvent {
        description: String,
        offset_ms: Option<u64>,
    },
}

#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), AvatarError>;

    async fn create_data_channel(&self, label: &str) -> Result<(), AvatarError>;

    async fn close(&self);
}

#[async_trait::async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a peer connection relayed through `ice`. Track, ICE and data
    /// channel callbacks are delivered on `events`.
    async fn create(
        &self,
        ice: &IceServer,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, AvatarError>;
}

/// The avatar speech synthesizer driving the remote renderer.
#[async_trait::async_trait]
pub trait AvatarSynthesizer: Send + Sync {
    /// Run the avatar rendering handshake over `peer`.
    async fn start_avatar(
        &self,
        settings: &AvatarSettings,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<(), AvatarError>;

    /// Speak `text` and resolve once playback completes.
    async fn speak_text(&self, text: &str, voice: &str) -> Result<(), AvatarError>;

    async fn stop_speaking(&self) -> Result<(), AvatarError>;

    async fn close(&self);
}

/// Local sink a remote track is rendered into.
#[async_trait::async_trait]
pub trait MediaSink: Send + Sync {
    fn bind(&self, track: &RemoteTrack) -> Result<(), AvatarError>;

    async fn play(&self) -> Result<(), AvatarError>;
}
