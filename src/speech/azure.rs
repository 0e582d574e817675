//! Azure speech-to-text over the short-audio REST endpoint.
//!
//! One utterance is captured from an [`AudioSource`], uploaded as 16-bit mono
//! WAV and the single result is reported as recognition events followed by
//! `SessionStopped`.

use super::recognizer::{CancellationReason, RecognitionEvent, SpeechRecognizer};
use super::SpeechError;
use crate::config::ApiConfig;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SUPPORTED_SAMPLE_RATES: [u32; 2] = [16000, 8000];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Mono 16-bit PCM audio ready for upload.
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl CapturedAudio {
    /// Encode as an in-memory WAV file.
    pub fn to_wav(&self) -> Result<Vec<u8>, SpeechError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut buffer, spec)?;
            for sample in &self.samples {
                writer.write_sample(*sample)?;
            }
            writer.finalize()?;
        }
        Ok(buffer.into_inner())
    }
}

/// Where a recognition session gets its audio.
pub trait AudioSource: Send + Sync {
    fn capture(&self) -> Result<CapturedAudio, SpeechError>;
}

/// Audio source backed by a WAV file, validated when opened.
#[derive(Debug, Clone)]
pub struct WavFileSource {
    path: PathBuf,
}

impl WavFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SpeechError> {
        let path = path.as_ref().to_path_buf();
        let reader = hound::WavReader::open(&path)
            .map_err(|e| SpeechError::Device(format!("{}: {}", path.display(), e)))?;
        check_spec(&path, reader.spec())?;
        Ok(Self { path })
    }
}

fn check_spec(path: &Path, spec: hound::WavSpec) -> Result<(), SpeechError> {
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(SpeechError::AudioFormat(format!(
            "{} must be 16-bit PCM, got {} bits {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }
    if !SUPPORTED_SAMPLE_RATES.contains(&spec.sample_rate) {
        return Err(SpeechError::AudioFormat(format!(
            "{} must be 16kHz or 8kHz, got {}Hz",
            path.display(),
            spec.sample_rate
        )));
    }
    Ok(())
}

impl AudioSource for WavFileSource {
    fn capture(&self) -> Result<CapturedAudio, SpeechError> {
        let mut reader = hound::WavReader::open(&self.path)?;
        let spec = reader.spec();
        check_spec(&self.path, spec)?;

        let interleaved = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        let channels = spec.channels.max(1) as usize;
        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|s| *s as i32).sum();
                    (sum / frame.len() as i32) as i16
                })
                .collect()
        };

        log::debug!(
            "Captured {} samples at {}Hz from {}",
            samples.len(),
            spec.sample_rate,
            self.path.display()
        );
        Ok(CapturedAudio {
            samples,
            sample_rate: spec.sample_rate,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShortAudioResponse {
    recognition_status: String,
    display_text: Option<String>,
}

pub struct AzureShortAudioRecognizer {
    client: Client,
    key: SecretString,
    endpoint: String,
    language: String,
    audio: Arc<dyn AudioSource>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AzureShortAudioRecognizer {
    /// Only the first configured language is sent; the short-audio endpoint
    /// has no language identification.
    pub fn new(api: &ApiConfig, languages: &[String], audio: Arc<dyn AudioSource>) -> Result<Self, SpeechError> {
        let language = languages
            .first()
            .cloned()
            .ok_or_else(|| SpeechError::Config("no recognition language configured".to_string()))?;
        if languages.len() > 1 {
            log::info!("Recognizing in {} only, ignoring {} other candidates", language, languages.len() - 1);
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            key: SecretString::from(api.speech_key().to_string()),
            endpoint: format!(
                "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1",
                api.speech_region
            ),
            language,
            audio,
            task: Mutex::new(None),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn recognize(
        client: Client,
        url: String,
        key: SecretString,
        audio: Arc<dyn AudioSource>,
    ) -> Vec<RecognitionEvent> {
        // File reads stay off the runtime thread.
        let captured = tokio::task::spawn_blocking(move || {
            let captured = audio.capture()?;
            captured.to_wav().map(|wav| (wav, captured.sample_rate))
        })
        .await;
        let (body, sample_rate) = match captured {
            Ok(Ok(wav)) => wav,
            Ok(Err(e)) => return vec![canceled(None, e.to_string())],
            Err(e) => return vec![canceled(None, format!("audio capture task failed: {}", e))],
        };

        let response = client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", key.expose_secret())
            .header(
                "Content-Type",
                format!("audio/wav; codecs=audio/pcm; samplerate={}", sample_rate),
            )
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return vec![canceled(None, e.to_string())],
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return vec![canceled(Some(status.as_u16().to_string()), e.to_string())],
        };
        if !status.is_success() {
            return vec![canceled(Some(status.as_u16().to_string()), text)];
        }
        events_for_response(&text)
    }
}

fn canceled(error_code: Option<String>, details: String) -> RecognitionEvent {
    RecognitionEvent::Canceled {
        reason: CancellationReason::Error,
        error_code,
        details: Some(details),
    }
}

/// Map a short-audio JSON result to recognition events.
fn events_for_response(body: &str) -> Vec<RecognitionEvent> {
    let response: ShortAudioResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => return vec![canceled(None, format!("Invalid recognition response: {}", e))],
    };

    match response.recognition_status.as_str() {
        "Success" => vec![RecognitionEvent::Recognized(
            response.display_text.unwrap_or_default(),
        )],
        "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => vec![RecognitionEvent::NoMatch],
        other => vec![canceled(Some(other.to_string()), body.to_string())],
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for AzureShortAudioRecognizer {
    async fn start_continuous(
        &self,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<(), SpeechError> {
        let url = reqwest::Url::parse_with_params(
            &self.endpoint,
            &[("language", self.language.as_str()), ("format", "simple")],
        )
        .map_err(|e| SpeechError::Config(format!("invalid speech endpoint: {}", e)))?;

        let client = self.client.clone();
        let key = SecretString::from(self.key.expose_secret().to_string());
        let audio = Arc::clone(&self.audio);
        let task = tokio::spawn(async move {
            for event in Self::recognize(client, url.to_string(), key, audio).await {
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(RecognitionEvent::SessionStopped);
        });

        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_continuous(&self) -> Result<(), SpeechError> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }
}
