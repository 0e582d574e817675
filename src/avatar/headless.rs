//! Headless rendering backend for terminal use.
//!
//! Speech is synthesized through the REST text-to-speech endpoint and written
//! to numbered WAV files; playback is simulated by waiting out the audio
//! duration. The loopback peer reports one audio and one video track as soon
//! as transceivers are added.

use super::media::{
    AvatarSynthesizer, IceConnectionState, MediaSink, PeerConnection, PeerConnectionFactory,
    PeerEvent, RemoteTrack, TrackKind, TransceiverDirection,
};
use super::relay::IceServer;
use super::AvatarError;
use crate::config::{ApiConfig, AvatarSettings};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTPUT_FORMAT: &str = "riff-16khz-16bit-mono-pcm";

pub struct RestSpeechSynthesizer {
    client: Client,
    url: String,
    key: SecretString,
    output_dir: PathBuf,
    utterances: AtomicU64,
    active: Mutex<Option<CancellationToken>>,
}

impl RestSpeechSynthesizer {
    pub fn new(api: &ApiConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            url: format!("https://{}.tts.speech.microsoft.com/cognitiveservices/v1", api.speech_region),
            key: SecretString::from(api.speech_key().to_string()),
            output_dir: output_dir.into(),
            utterances: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, AvatarError> {
        let response = self
            .client
            .post(&self.url)
            .header("Ocp-Apim-Subscription-Key", self.key.expose_secret())
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .header("User-Agent", "avatar-concierge")
            .body(build_ssml(text, voice))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AvatarError::Synthesis(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = active.replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

#[async_trait::async_trait]
impl AvatarSynthesizer for RestSpeechSynthesizer {
    async fn start_avatar(
        &self,
        settings: &AvatarSettings,
        _peer: Arc<dyn PeerConnection>,
    ) -> Result<(), AvatarError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        log::info!(
            "Headless avatar {} ({}) on {} cropped {:?}..{:?}, audio in {}",
            settings.character,
            settings.style,
            settings.background_color,
            settings.crop.top_left,
            settings.crop.bottom_right,
            self.output_dir.display()
        );
        Ok(())
    }

    async fn speak_text(&self, text: &str, voice: &str) -> Result<(), AvatarError> {
        let cancel = self.begin();

        let audio = tokio::select! {
            audio = self.synthesize(text, voice) => audio?,
            _ = cancel.cancelled() => return Ok(()),
        };

        let n = self.utterances.fetch_add(1, Ordering::Relaxed) + 1;
        let path = self.output_dir.join(format!("utterance-{:03}.wav", n));
        tokio::fs::write(&path, &audio).await?;
        let duration = wav_duration(&audio)?;
        log::info!("Wrote {} ({:.1}s)", path.display(), duration.as_secs_f32());

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => log::debug!("Playback of {} cut short", path.display()),
        }
        Ok(())
    }

    async fn stop_speaking(&self) -> Result<(), AvatarError> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = active {
            token.cancel();
        }
        Ok(())
    }

    async fn close(&self) {
        let _ = self.stop_speaking().await;
    }
}

fn wav_duration(audio: &[u8]) -> Result<Duration, AvatarError> {
    let reader = hound::WavReader::new(Cursor::new(audio))?;
    let spec = reader.spec();
    let frames = reader.duration() as f64;
    Ok(Duration::from_secs_f64(frames / spec.sample_rate.max(1) as f64))
}

fn build_ssml(text: &str, voice: &str) -> String {
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='en-US'>\
         <voice name='{}'>{}</voice></speak>",
        escape_xml(voice),
        escape_xml(text)
    )
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Peer factory whose connections echo each transceiver back as a remote track.
#[derive(Default)]
pub struct LoopbackPeerFactory;

struct LoopbackPeer {
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait::async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        ice: &IceServer,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, AvatarError> {
        log::debug!("Loopback peer via {} as {}", ice.urls.join(", "), ice.username);
        let _ = events.send(PeerEvent::IceStateChanged(IceConnectionState::Checking));
        Ok(Arc::new(LoopbackPeer { events }))
    }
}

#[async_trait::async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), AvatarError> {
        log::debug!("Added {} transceiver ({})", kind, direction);
        self.events
            .send(PeerEvent::Track(RemoteTrack {
                kind,
                id: format!("loopback-{}", kind),
            }))
            .map_err(|_| AvatarError::Connection("peer event receiver dropped".to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), AvatarError> {
        log::debug!("Opened data channel {}", label);
        let _ = self
            .events
            .send(PeerEvent::IceStateChanged(IceConnectionState::Connected));
        Ok(())
    }

    async fn close(&self) {
        let _ = self
            .events
            .send(PeerEvent::IceStateChanged(IceConnectionState::Closed));
    }
}

/// Sink that accepts any track and reports playback as started.
pub struct LoggingSink {
    kind: TrackKind,
    bound: Mutex<Option<String>>,
}

impl LoggingSink {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            bound: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl MediaSink for LoggingSink {
    fn bind(&self, track: &RemoteTrack) -> Result<(), AvatarError> {
        if track.kind != self.kind {
            return Err(AvatarError::Playback(format!(
                "{} sink cannot render a {} track",
                self.kind, track.kind
            )));
        }
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(track.id.clone());
        Ok(())
    }

    async fn play(&self) -> Result<(), AvatarError> {
        let bound = self.bound.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match bound {
            Some(id) => {
                log::debug!("Playing {} track {}", self.kind, id);
                Ok(())
            }
            None => Err(AvatarError::Playback(format!("no {} track bound", self.kind))),
        }
    }
}
