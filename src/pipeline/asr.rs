//! Speech recognition collaborator and the energy speech gate.

use crate::config::AsrConfig;
use crate::error::{Result, WallaceError};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Transcribes one utterance of 16 kHz mono float samples.
///
/// Implementations may be slow; callers run them behind a cancellation
/// select so a barge-in can abandon the call at the await point.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe normalized f32 samples to text. Empty audio yields "".
    async fn transcribe(&self, samples: &[f32]) -> Result<String>;
}

/// RMS energy of normalized samples.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Energy gate: whether the utterance contains speech at all.
///
/// Empty audio never counts as speech.
pub fn has_speech(samples: &[f32], threshold: f32) -> bool {
    rms_energy(samples) > threshold
}

#[derive(Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: String,
}

/// HTTP transcription client.
///
/// POSTs base64 PCM to `<base_url>/transcribe` and reads `{"text": ...}`.
/// The inference server itself (model, device) is outside this crate.
pub struct HttpAsr {
    client: reqwest::Client,
    base_url: String,
    language: String,
}

impl HttpAsr {
    /// Build a client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &AsrConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| WallaceError::Asr(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl SpeechRecognizer for HttpAsr {
    async fn transcribe(&self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        // Re-quantize to the wire format the recognizer expects.
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            pcm.extend_from_slice(&value.to_le_bytes());
        }

        let url = format!("{}/transcribe", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "audio": BASE64.encode(&pcm),
                "sample_rate": 16_000,
                "language": self.language,
            }))
            .send()
            .await
            .map_err(|e| WallaceError::Asr(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(WallaceError::Asr(format!(
                "transcription server returned {}",
                response.status()
            )));
        }

        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| WallaceError::Asr(format!("invalid response: {e}")))?;

        let text = body.text.trim().to_owned();
        if !text.is_empty() {
            info!("transcribed {} samples: {text}", samples.len());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn empty_audio_has_no_speech() {
        assert!(!has_speech(&[], 0.5));
    }

    #[test]
    fn silence_is_below_threshold() {
        let silence = vec![0.0_f32; 1024];
        assert!(!has_speech(&silence, 0.5));
    }

    #[test]
    fn loud_signal_passes_gate() {
        let loud = vec![0.9_f32; 1024];
        assert!(has_speech(&loud, 0.5));
    }

    #[test]
    fn rms_of_unit_square_wave() {
        let samples: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!((rms_energy(&samples) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn http_asr_round_trip_against_mock() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "  你好  "
            })))
            .mount(&server)
            .await;

        let asr = HttpAsr::new(&AsrConfig {
            base_url: server.uri(),
            ..AsrConfig::default()
        })
        .unwrap();

        let text = asr.transcribe(&[0.1, -0.1, 0.2]).await.unwrap();
        assert_eq!(text, "你好");
    }

    #[tokio::test]
    async fn http_asr_empty_input_skips_request() {
        let asr = HttpAsr::new(&AsrConfig {
            base_url: "http://127.0.0.1:1".to_owned(),
            ..AsrConfig::default()
        })
        .unwrap();
        assert_eq!(asr.transcribe(&[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn http_asr_server_error_propagates() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let asr = HttpAsr::new(&AsrConfig {
            base_url: server.uri(),
            ..AsrConfig::default()
        })
        .unwrap();

        let err = asr.transcribe(&[0.5; 16]).await.unwrap_err();
        assert!(matches!(err, WallaceError::Asr(_)));
    }
}
