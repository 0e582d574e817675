//! In-process fakes for the remote services and media stack.
#![allow(dead_code)]

use avatar_concierge::avatar::{
    AvatarError, AvatarSynthesizer, IceServer, MediaSink, PeerConnection, PeerConnectionFactory,
    PeerEvent, RelayTokenSource, RemoteTrack, TrackKind, TransceiverDirection,
};
use avatar_concierge::config::AvatarSettings;
use avatar_concierge::llm::data_source::AzureSearchParameters;
use avatar_concierge::llm::{
    ChatBackend, ChatRequest, ChatResponse, Clock, DataSource, DataSourceCatalog,
    DataSourceDescriptor, LlmError,
};
use chrono::{DateTime, Local, TimeZone};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn catalog(n: usize) -> Arc<DataSourceCatalog> {
    let sources = (0..n)
        .map(|i| DataSourceDescriptor {
            name: format!("Source {}", i),
            description: format!("Documents about topic {}", i),
            keywords: vec![format!("kw{}", i)],
            source: DataSource::AzureSearch(AzureSearchParameters::with_key(
                format!("https://s{}.search.windows.net", i),
                "key",
                format!("index-{}", i),
            )),
        })
        .collect();
    Arc::new(DataSourceCatalog::new(sources).unwrap())
}

pub fn index_of(request: &ChatRequest) -> Option<String> {
    request.data_sources.first().map(|source| match source {
        DataSource::AzureSearch(params) => params.index_name.clone(),
    })
}

pub fn answer(content: &str) -> Result<ChatResponse, LlmError> {
    Ok(serde_json::from_value(serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
    .unwrap())
}

/// Reply decoded from an arbitrary completion body.
pub fn raw_reply(body: serde_json::Value) -> Result<ChatResponse, LlmError> {
    Ok(serde_json::from_value(body).unwrap())
}

pub fn no_choices() -> Result<ChatResponse, LlmError> {
    Ok(serde_json::from_value(serde_json::json!({ "choices": [] })).unwrap())
}

pub fn remote_error() -> Result<ChatResponse, LlmError> {
    Err(LlmError::Remote {
        code: Some("429".to_string()),
        message: "Rate limit exceeded".to_string(),
    })
}

pub fn transport_error() -> Result<ChatResponse, LlmError> {
    Err(LlmError::ApiError {
        status: 503,
        message: "Service unavailable".to_string(),
    })
}

/// Pauses a backend call until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Chat backend replaying scripted responses; the last one repeats.
pub struct ScriptedChat {
    replies: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    last: Mutex<Option<Result<ChatResponse, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    gate: Option<Arc<Gate>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<Result<ChatResponse, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated(replies: Vec<Result<ChatResponse, LlmError>>, gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    pub fn router(reply: &str) -> Arc<Self> {
        Self::new(vec![answer(reply)])
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<ChatResponse, LlmError> {
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(reply) => {
                *last = Some(clone_reply(&reply));
                reply
            }
            None => last
                .as_ref()
                .map(clone_reply)
                .unwrap_or_else(no_choices),
        }
    }
}

fn clone_reply(reply: &Result<ChatResponse, LlmError>) -> Result<ChatResponse, LlmError> {
    match reply {
        Ok(response) => Ok(response.clone()),
        Err(LlmError::ApiError { status, message }) => Err(LlmError::ApiError {
            status: *status,
            message: message.clone(),
        }),
        Err(LlmError::Remote { code, message }) => Err(LlmError::Remote {
            code: code.clone(),
            message: message.clone(),
        }),
        Err(other) => Err(LlmError::Config(other.to_string())),
    }
}

#[async_trait::async_trait]
impl ChatBackend for ScriptedChat {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.next_reply()
    }
}

pub struct FixedClock;

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
    }
}

/// Ordered record of calls made on the avatar fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| e.as_str() == entry).count()
    }
}

pub struct FakeRelay {
    pub fail: bool,
}

#[async_trait::async_trait]
impl RelayTokenSource for FakeRelay {
    async fn fetch_relay_credentials(&self) -> Result<IceServer, AvatarError> {
        if self.fail {
            return Err(AvatarError::Provisioning("HTTP 401: invalid subscription key".to_string()));
        }
        Ok(IceServer {
            urls: vec!["turn:relay.test:3478".to_string()],
            username: "user".to_string(),
            credential: "secret".to_string(),
        })
    }
}

/// Peer factory that hands the event sender to the test.
pub struct FakePeerFactory {
    pub log: CallLog,
    pub events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl FakePeerFactory {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            events: Mutex::new(None),
        })
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            tx.send(event).unwrap();
        }
    }

    pub fn emit_track(&self, kind: TrackKind) {
        self.emit(PeerEvent::Track(RemoteTrack {
            kind,
            id: format!("remote-{}", kind),
        }));
    }
}

struct FakePeer {
    log: CallLog,
}

#[async_trait::async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        ice: &IceServer,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, AvatarError> {
        self.log.push(format!("peer.create {}", ice.urls[0]));
        *self.events.lock().unwrap() = Some(events);
        Ok(Arc::new(FakePeer {
            log: self.log.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl PeerConnection for FakePeer {
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), AvatarError> {
        self.log.push(format!("peer.transceiver {} {}", kind, direction));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), AvatarError> {
        self.log.push(format!("peer.data_channel {}", label));
        Ok(())
    }

    async fn close(&self) {
        self.log.push("peer.close");
    }
}

/// Synthesizer whose utterances last until stopped or finished by the test.
pub struct FakeSynthesizer {
    pub log: CallLog,
    pub spoken: Mutex<Vec<String>>,
    current: Mutex<Option<CancellationToken>>,
    finish: Notify,
    pub fail_speech: bool,
}

impl FakeSynthesizer {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            spoken: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            finish: Notify::new(),
            fail_speech: false,
        })
    }

    pub fn failing(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            spoken: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            finish: Notify::new(),
            fail_speech: true,
        })
    }

    /// Let the current utterance complete normally.
    pub fn finish_utterance(&self) {
        self.finish.notify_one();
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AvatarSynthesizer for FakeSynthesizer {
    async fn start_avatar(
        &self,
        settings: &AvatarSettings,
        _peer: Arc<dyn PeerConnection>,
    ) -> Result<(), AvatarError> {
        self.log.push(format!("synth.start {} {}", settings.character, settings.style));
        Ok(())
    }

    async fn speak_text(&self, text: &str, voice: &str) -> Result<(), AvatarError> {
        self.log.push(format!("synth.speak {}", voice));
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail_speech {
            return Err(AvatarError::Synthesis("voice not found".to_string()));
        }

        let token = CancellationToken::new();
        *self.current.lock().unwrap() = Some(token.clone());
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.finish.notified() => {}
        }
        Ok(())
    }

    async fn stop_speaking(&self) -> Result<(), AvatarError> {
        self.log.push("synth.stop");
        if let Some(token) = self.current.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn close(&self) {
        self.log.push("synth.close");
    }
}

pub struct RecordingSink {
    pub log: CallLog,
    pub fail_play: bool,
}

#[async_trait::async_trait]
impl MediaSink for RecordingSink {
    fn bind(&self, track: &RemoteTrack) -> Result<(), AvatarError> {
        self.log.push(format!("sink.bind {}", track.kind));
        Ok(())
    }

    async fn play(&self) -> Result<(), AvatarError> {
        if self.fail_play {
            return Err(AvatarError::Playback("autoplay blocked".to_string()));
        }
        self.log.push("sink.play");
        Ok(())
    }
}

/// Wait until `predicate` holds for the watched value, failing the test on timeout.
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, predicate: F)
where
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(TIMEOUT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Poll `condition` until it holds, failing the test on timeout.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Local HTTP endpoint answering a single request with `status` and `body`.
/// Returns its base URL.
pub async fn serve_once(status: u16, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(end) = header_end(&request) {
                let headers = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 {} Test\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{}", addr)
}

fn header_end(request: &[u8]) -> Option<usize> {
    request
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}
