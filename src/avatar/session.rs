//! Avatar session: peer connection lifecycle plus speech kept in step with
//! the conversation store.
//!
//! Once started, a single task owns every callback. It reacts to peer events
//! (track binding, ICE state), to display text changes (speak) and to stop
//! commands (interrupt). Speech itself runs in a child task so that a stop
//! command can be handled while the synthesizer is busy.

use super::media::{
    AvatarSynthesizer, IceConnectionState, MediaSink, PeerConnection, PeerConnectionFactory,
    PeerEvent, RemoteTrack, TrackKind, TransceiverDirection,
};
use super::relay::RelayTokenSource;
use super::speech_text::markdown_to_speech_text;
use super::AvatarError;
use crate::config::AvatarSettings;
use crate::store::{ConversationState, ConversationStore};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONTROL_CHANNEL: &str = "eventChannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AvatarPhase {
    Uninitialized,
    Provisioning,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AvatarCommand {
    StopSpeaking,
}

/// Sinks for the avatar's remote audio and video tracks.
#[derive(Clone)]
pub struct AvatarMedia {
    pub audio: Arc<dyn MediaSink>,
    pub video: Arc<dyn MediaSink>,
}

/// Issues stop requests to the avatar session. Repeated requests made
/// before the session consumes the first one coalesce into a single command.
#[derive(Clone)]
pub struct StopHandle {
    store: Arc<ConversationStore>,
    commands: mpsc::UnboundedSender<AvatarCommand>,
}

impl StopHandle {
    /// Returns true if this call raised a new stop request.
    pub fn request_stop(&self) -> bool {
        if !self.store.request_stop_speaking() {
            log::debug!("Stop already pending");
            return false;
        }
        if self.commands.send(AvatarCommand::StopSpeaking).is_err() {
            log::warn!("Avatar session is gone, stop request not delivered");
        }
        true
    }
}

struct Speech {
    generation: u64,
    task: JoinHandle<()>,
}

struct Live {
    peer: Arc<dyn PeerConnection>,
    event_loop: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Runtime {
    live: Option<Live>,
    speech: Option<Speech>,
    next_generation: u64,
}

struct Shared {
    store: Arc<ConversationStore>,
    settings: AvatarSettings,
    relay: Arc<dyn RelayTokenSource>,
    peers: Arc<dyn PeerConnectionFactory>,
    synthesizer: Arc<dyn AvatarSynthesizer>,
    media: AvatarMedia,
    phase: watch::Sender<AvatarPhase>,
    runtime: Mutex<Runtime>,
}

pub struct AvatarSession {
    shared: Arc<Shared>,
    commands_tx: mpsc::UnboundedSender<AvatarCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<AvatarCommand>>>,
}

impl AvatarSession {
    pub fn new(
        store: Arc<ConversationStore>,
        settings: AvatarSettings,
        relay: Arc<dyn RelayTokenSource>,
        peers: Arc<dyn PeerConnectionFactory>,
        synthesizer: Arc<dyn AvatarSynthesizer>,
        media: AvatarMedia,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(AvatarPhase::Uninitialized);
        Self {
            shared: Arc::new(Shared {
                store,
                settings,
                relay,
                peers,
                synthesizer,
                media,
                phase,
                runtime: Mutex::new(Runtime::default()),
            }),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            store: Arc::clone(&self.shared.store),
            commands: self.commands_tx.clone(),
        }
    }

    pub fn phase(&self) -> AvatarPhase {
        *self.shared.phase.borrow()
    }

    /// Provision relay credentials, connect the peer and start the avatar.
    /// Any failure leaves the session closed and the avatar disconnected.
    pub async fn start(&self) -> Result<(), AvatarError> {
        let commands = self
            .commands_rx
            .lock()
            .await
            .take()
            .ok_or(AvatarError::AlreadyStarted)?;

        match self.connect(commands).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Avatar session failed to start: {}", e);
                self.shared.store.set_avatar_connected(false);
                self.shared.phase.send_replace(AvatarPhase::Closed);
                Err(e)
            }
        }
    }

    async fn connect(&self, commands: mpsc::UnboundedReceiver<AvatarCommand>) -> Result<(), AvatarError> {
        let shared = &self.shared;

        shared.phase.send_replace(AvatarPhase::Provisioning);
        let ice = shared.relay.fetch_relay_credentials().await?;
        log::info!("Relay credentials acquired for {}", ice.urls.join(", "));

        shared.phase.send_replace(AvatarPhase::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = shared.peers.create(&ice, events_tx).await?;

        if let Err(e) = negotiate(shared, Arc::clone(&peer)).await {
            peer.close().await;
            return Err(e);
        }

        // Text written after this point, even before the loop first runs,
        // is still spoken.
        let state = shared.store.subscribe_state();
        let spoken_revision = state.borrow().display_revision;
        let cancel = CancellationToken::new();
        let event_loop = tokio::spawn(run_event_loop(
            Arc::clone(shared),
            events_rx,
            commands,
            state,
            spoken_revision,
            cancel.clone(),
        ));

        shared.runtime.lock().await.live = Some(Live {
            peer,
            event_loop,
            cancel,
        });
        shared.phase.send_replace(AvatarPhase::Connected);
        log::info!(
            "Avatar {}/{} started with voice {}",
            shared.settings.character,
            shared.settings.style,
            shared.settings.voice
        );
        Ok(())
    }

    /// Speak `text` now, replacing anything currently being spoken.
    pub async fn speak(&self, text: &str) -> Result<(), AvatarError> {
        if self.phase() != AvatarPhase::Connected {
            return Err(AvatarError::NotConnected);
        }
        speak(&self.shared, text).await;
        Ok(())
    }

    /// Stop current speech and consume a pending stop request.
    pub async fn interrupt(&self) {
        interrupt(&self.shared).await;
    }

    /// Stop speech, then release the synthesizer and the peer connection.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if *shared.phase.borrow() == AvatarPhase::Closed {
            return;
        }

        let live = {
            let mut runtime = shared.runtime.lock().await;
            if let Some(live) = runtime.live.as_ref() {
                live.cancel.cancel();
            }
            runtime.live.take()
        };

        if let Some(live) = live {
            let _ = live.event_loop.await;
            stop_current_speech(shared).await;
            shared.synthesizer.close().await;
            live.peer.close().await;
        }

        shared.store.set_avatar_speaking(false);
        shared.store.set_avatar_connected(false);
        shared.phase.send_replace(AvatarPhase::Closed);
        log::info!("Avatar session closed");
    }
}

async fn negotiate(shared: &Shared, peer: Arc<dyn PeerConnection>) -> Result<(), AvatarError> {
    peer.add_transceiver(TrackKind::Video, TransceiverDirection::SendRecv)
        .await?;
    peer.add_transceiver(TrackKind::Audio, TransceiverDirection::SendRecv)
        .await?;
    peer.create_data_channel(CONTROL_CHANNEL).await?;
    shared.synthesizer.start_avatar(&shared.settings, peer).await
}

async fn run_event_loop(
    shared: Arc<Shared>,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mut commands: mpsc::UnboundedReceiver<AvatarCommand>,
    mut state: watch::Receiver<ConversationState>,
    mut spoken_revision: u64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = peer_events.recv() => handle_peer_event(&shared, event).await,
            Some(command) = commands.recv() => match command {
                AvatarCommand::StopSpeaking => interrupt(&shared).await,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let (revision, text) = {
                    let current = state.borrow_and_update();
                    (current.display_revision, current.display_text.clone())
                };
                if revision != spoken_revision {
                    spoken_revision = revision;
                    if !text.trim().is_empty() {
                        speak(&shared, &text).await;
                    }
                }
            }
        }
    }
    log::debug!("Avatar event loop finished");
}

async fn handle_peer_event(shared: &Shared, event: PeerEvent) {
    match event {
        PeerEvent::Track(track) => bind_track(shared, &track).await,
        PeerEvent::IceStateChanged(ice_state) => match ice_state {
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                log::warn!("Avatar connection {}, reload to reconnect", ice_state);
            }
            _ => log::info!("Avatar connection state: {}", ice_state),
        },
        PeerEvent::AvatarEvent {
            description,
            offset_ms,
        } => {
            let now = chrono::Local::now().format("%H:%M:%S%.3f");
            match offset_ms {
                Some(offset) => log::debug!("[{}] Avatar event: {} (offset {}ms)", now, description, offset),
                None => log::debug!("[{}] Avatar event: {}", now, description),
            }
        }
    }
}

async fn bind_track(shared: &Shared, track: &RemoteTrack) {
    let sink = match track.kind {
        TrackKind::Video => &shared.media.video,
        TrackKind::Audio => &shared.media.audio,
    };
    if let Err(e) = sink.bind(track) {
        log::error!("Failed to bind {} track {}: {}", track.kind, track.id, e);
        return;
    }
    log::info!("Bound remote {} track {}", track.kind, track.id);

    match sink.play().await {
        Ok(()) => {
            if track.kind == TrackKind::Video {
                shared.store.set_avatar_connected(true);
                log::info!("Avatar video playing");
            }
        }
        Err(e) => log::warn!("Failed to play {} track: {}", track.kind, e),
    }
}

async fn speak(shared: &Arc<Shared>, text: &str) {
    let speech = markdown_to_speech_text(text);
    if speech.is_empty() {
        return;
    }

    stop_current_speech(shared).await;

    let mut runtime = shared.runtime.lock().await;
    runtime.next_generation += 1;
    let generation = runtime.next_generation;

    shared.store.set_avatar_speaking(true);
    let task_shared = Arc::clone(shared);
    let task = tokio::spawn(async move {
        log::debug!("Speaking: {}", speech);
        let result = task_shared
            .synthesizer
            .speak_text(&speech, &task_shared.settings.voice)
            .await;
        if let Err(e) = result {
            log::error!("Avatar speech failed: {}", e);
        }
        finish_speech(&task_shared, generation).await;
    });
    runtime.speech = Some(Speech { generation, task });
}

/// Clear the speaking flag if `generation` is still the current utterance.
async fn finish_speech(shared: &Shared, generation: u64) {
    let mut runtime = shared.runtime.lock().await;
    if runtime.speech.as_ref().map(|s| s.generation) == Some(generation) {
        runtime.speech = None;
        shared.store.set_avatar_speaking(false);
    }
}

/// Stop the utterance in progress, if any. Returns true if one was stopped.
async fn stop_current_speech(shared: &Shared) -> bool {
    let speech = shared.runtime.lock().await.speech.take();
    let Some(speech) = speech else {
        return false;
    };

    if let Err(e) = shared.synthesizer.stop_speaking().await {
        log::warn!("Failed to stop avatar speech: {}", e);
    }
    speech.task.abort();
    shared.store.set_avatar_speaking(false);
    true
}

async fn interrupt(shared: &Shared) {
    if stop_current_speech(shared).await {
        log::info!("Avatar speech interrupted");
    }
    if !shared.store.consume_stop_request() {
        log::debug!("No stop request pending");
    }
}
