//! Speech synthesis: two backends plus a fallback router.
//!
//! Backends yield PCM frames of exactly [`FRAME_SIZE`](super::FRAME_SIZE)
//! bytes (16 kHz, 16-bit mono; final frame zero-padded). `EdgeTts` talks to
//! the Edge speech gateway over WebSocket and decodes the returned MP3;
//! `CosyVoice` POSTs to a local synthesis server that returns raw PCM.
//!
//! The router tries the session's preferred backend and falls through to
//! the other on failure; when both fail it emits no frames and the caller's
//! turn framing (`tts_end`) still closes cleanly.

use crate::config::TtsConfig;
use crate::error::{Result, WallaceError};
use crate::session::TtsBackendKind;
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::FRAME_SIZE;

/// Frames produced by one backend; errors trigger router fallback.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Frames produced by the router; failures have already been absorbed.
pub type PcmStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A synthesis backend.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize `text` into PCM frames. Empty or whitespace-only text
    /// yields an empty stream.
    async fn synthesize(&self, text: &str) -> Result<FrameStream>;
}

/// Split PCM into [`FRAME_SIZE`] frames, zero-padding the last.
pub fn frame_pcm(pcm: &[u8]) -> Vec<Vec<u8>> {
    pcm.chunks(FRAME_SIZE)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(FRAME_SIZE, 0);
            frame
        })
        .collect()
}

fn frames_to_stream(frames: Vec<Vec<u8>>) -> FrameStream {
    Box::pin(futures_util::stream::iter(frames.into_iter().map(Ok)))
}

// ---------------------------------------------------------------------------
// Edge speech gateway backend
// ---------------------------------------------------------------------------

/// Edge speech gateway endpoint (public read-aloud token).
const EDGE_WSS_URL: &str = "wss://speech.platform.bing.com/consumer/speech/synthesize/\
readaloud/edge/v1?TrustedClientToken=6A5AA1D4EAFF4E9FB37E23D68491D6F4";

/// Output format requested from the gateway: already 16 kHz mono, so the
/// decoded PCM needs no resampling.
const EDGE_OUTPUT_FORMAT: &str = "audio-16khz-32kbitrate-mono-mp3";

/// Cloud synthesis via the Edge speech gateway.
///
/// The gateway streams MP3 chunks; the whole reply is collected and decoded
/// before framing, so per-sentence latency is bounded by sentence synthesis
/// rather than true streaming.
pub struct EdgeTts {
    voice: String,
}

impl EdgeTts {
    /// Create a backend with the configured voice.
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
        }
    }

    async fn fetch_mp3(&self, text: &str) -> Result<Vec<u8>> {
        let (mut ws, _) = connect_async(EDGE_WSS_URL)
            .await
            .map_err(|e| WallaceError::Tts(format!("edge gateway connect failed: {e}")))?;

        let timestamp = chrono::Utc::now().to_rfc2822();
        let config = format!(
            "X-Timestamp:{timestamp}\r\n\
             Content-Type:application/json; charset=utf-8\r\n\
             Path:speech.config\r\n\r\n\
             {{\"context\":{{\"synthesis\":{{\"audio\":{{\"metadataoptions\":\
             {{\"sentenceBoundaryEnabled\":\"false\",\"wordBoundaryEnabled\":\"false\"}},\
             \"outputFormat\":\"{EDGE_OUTPUT_FORMAT}\"}}}}}}}}"
        );
        ws.send(Message::Text(config.into()))
            .await
            .map_err(|e| WallaceError::Tts(format!("edge config send failed: {e}")))?;

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let ssml = format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='zh-CN'>\
             <voice name='{}'>{}</voice></speak>",
            self.voice,
            escape_xml(text)
        );
        let request = format!(
            "X-RequestId:{request_id}\r\nX-Timestamp:{timestamp}\r\n\
             Content-Type:application/ssml+xml\r\nPath:ssml\r\n\r\n{ssml}"
        );
        ws.send(Message::Text(request.into()))
            .await
            .map_err(|e| WallaceError::Tts(format!("edge ssml send failed: {e}")))?;

        let mut mp3 = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(30), ws.next())
                .await
                .map_err(|_| WallaceError::Tts("edge gateway timed out".to_owned()))?;
            let Some(frame) = frame else {
                break;
            };
            match frame.map_err(|e| WallaceError::Tts(format!("edge stream error: {e}")))? {
                Message::Binary(data) => {
                    if let Some(payload) = audio_payload(&data) {
                        mp3.extend_from_slice(payload);
                    }
                }
                Message::Text(text) => {
                    if text.contains("Path:turn.end") {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.close(None).await;

        if mp3.is_empty() {
            return Err(WallaceError::Tts("edge gateway returned no audio".to_owned()));
        }
        Ok(mp3)
    }
}

#[async_trait]
impl TtsBackend for EdgeTts {
    async fn synthesize(&self, text: &str) -> Result<FrameStream> {
        if text.trim().is_empty() {
            return Ok(frames_to_stream(Vec::new()));
        }

        let mp3 = self.fetch_mp3(text).await?;
        info!("edge synthesis returned {} bytes of mp3", mp3.len());

        // MP3 decode is CPU work; keep it off the event loop.
        let pcm = tokio::task::spawn_blocking(move || decode_mp3_to_pcm16(&mp3))
            .await
            .map_err(|e| WallaceError::Tts(format!("decode task failed: {e}")))??;

        Ok(frames_to_stream(frame_pcm(&pcm)))
    }
}

/// Extract the audio payload from an Edge binary frame.
///
/// Frames start with a 2-byte big-endian header length, the text header,
/// then the payload. Only `Path:audio` frames carry MP3 data.
fn audio_payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 2 {
        return None;
    }
    let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let body_start = 2usize.checked_add(header_len)?;
    if frame.len() < body_start {
        return None;
    }
    let header = std::str::from_utf8(&frame[2..body_start]).ok()?;
    header.contains("Path:audio").then(|| &frame[body_start..])
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Decode an MP3 buffer to 16-bit little-endian mono PCM bytes.
fn decode_mp3_to_pcm16(mp3: &[u8]) -> Result<Vec<u8>> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = std::io::Cursor::new(mp3.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| WallaceError::Tts(format!("mp3 probe failed: {e}")))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| WallaceError::Tts("mp3 has no audio track".to_owned()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| WallaceError::Tts(format!("mp3 decoder init failed: {e}")))?;

    let mut pcm = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(WallaceError::Tts(format!("mp3 read failed: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Skip recoverable frame errors (common at stream edges).
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(WallaceError::Tts(format!("mp3 decode failed: {e}"))),
        };

        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);

        let channels = spec.channels.count().max(1);
        if channels == 1 {
            for sample in buf.samples() {
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
        } else {
            // Downmix by averaging; the requested format is mono, so this
            // only runs for nonconforming gateway output.
            for frame in buf.samples().chunks_exact(channels) {
                let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                let mixed = (sum / channels as i32) as i16;
                pcm.extend_from_slice(&mixed.to_le_bytes());
            }
        }
    }
    Ok(pcm)
}

// ---------------------------------------------------------------------------
// CosyVoice backend
// ---------------------------------------------------------------------------

/// Local GPU synthesis via a CosyVoice server that returns raw PCM.
pub struct CosyVoice {
    client: reqwest::Client,
    url: String,
    voice: String,
}

impl CosyVoice {
    /// Build a client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WallaceError::Tts(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            url: config.cosyvoice_url.trim_end_matches('/').to_owned(),
            voice: config.cosyvoice_voice.clone(),
        })
    }
}

#[async_trait]
impl TtsBackend for CosyVoice {
    async fn synthesize(&self, text: &str) -> Result<FrameStream> {
        if text.trim().is_empty() {
            return Ok(frames_to_stream(Vec::new()));
        }

        let response = self
            .client
            .post(format!("{}/tts", self.url))
            .json(&serde_json::json!({ "text": text, "voice": self.voice }))
            .send()
            .await
            .map_err(|e| WallaceError::Tts(format!("cosyvoice request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(WallaceError::Tts(format!(
                "cosyvoice returned {}",
                response.status()
            )));
        }

        let pcm = response
            .bytes()
            .await
            .map_err(|e| WallaceError::Tts(format!("cosyvoice body read failed: {e}")))?;

        Ok(frames_to_stream(frame_pcm(&pcm)))
    }
}

// ---------------------------------------------------------------------------
// Fallback router
// ---------------------------------------------------------------------------

/// Routes synthesis to the session's preferred backend, falling through to
/// the alternate on failure.
pub struct TtsRouter {
    edge: Arc<dyn TtsBackend>,
    cosyvoice: Arc<dyn TtsBackend>,
}

impl TtsRouter {
    /// Build the production router from config.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend client cannot be constructed.
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        Ok(Self {
            edge: Arc::new(EdgeTts::new(config.edge_voice.clone())),
            cosyvoice: Arc::new(CosyVoice::new(config)?),
        })
    }

    /// Build a router over arbitrary backends (tests inject stubs here).
    pub fn new(edge: Arc<dyn TtsBackend>, cosyvoice: Arc<dyn TtsBackend>) -> Self {
        Self { edge, cosyvoice }
    }

    fn backend(&self, kind: TtsBackendKind) -> Arc<dyn TtsBackend> {
        match kind {
            TtsBackendKind::Edge => Arc::clone(&self.edge),
            TtsBackendKind::CosyVoice => Arc::clone(&self.cosyvoice),
        }
    }

    /// Synthesize with automatic fallback.
    ///
    /// Backend failures are logged and absorbed: the returned stream simply
    /// ends, possibly without having produced any frames.
    pub fn synthesize(&self, text: &str, preferred: TtsBackendKind) -> PcmStream {
        let primary = self.backend(preferred);
        let fallback = self.backend(preferred.other());
        let text = text.to_owned();

        Box::pin(async_stream::stream! {
            let mut primary_failed = false;
            match primary.synthesize(&text).await {
                Ok(mut frames) => {
                    while let Some(item) = frames.next().await {
                        match item {
                            Ok(frame) => yield frame,
                            Err(e) => {
                                warn!(
                                    "primary TTS ({}) failed mid-stream: {e}, falling back",
                                    preferred.as_str()
                                );
                                primary_failed = true;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("primary TTS ({}) failed: {e}, falling back", preferred.as_str());
                    primary_failed = true;
                }
            }
            if !primary_failed {
                return;
            }

            match fallback.synthesize(&text).await {
                Ok(mut frames) => {
                    while let Some(item) = frames.next().await {
                        match item {
                            Ok(frame) => yield frame,
                            Err(e) => {
                                error!("both TTS backends failed: {e}");
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!("both TTS backends failed: {e}"),
            }
        })
    }
}
