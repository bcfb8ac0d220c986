//! Second-stage wake word confirmation.
//!
//! The device does cheap on-chip keyword spotting and asks the server to
//! confirm with a short PCM clip. Verification runs under a timeout and
//! **fails open**: a slow or missing verifier confirms the wake word, since
//! a false accept costs one accidental listen while a stall ruins the
//! interaction latency.

use crate::pipeline::asr::rms_energy;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::Duration;
use tracing::warn;

/// Default verification deadline.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Confirms or rejects a wake word candidate clip.
#[async_trait]
pub trait WakewordVerifier: Send + Sync {
    /// Verify a base64-encoded raw PCM clip.
    async fn verify(&self, audio_b64: &str) -> bool;
}

/// Run a verifier with the fail-open timeout.
pub async fn verify_with_timeout(
    verifier: &dyn WakewordVerifier,
    audio_b64: &str,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, verifier.verify(audio_b64)).await {
        Ok(confirmed) => confirmed,
        Err(_) => {
            warn!("wakeword verification timed out, defaulting to confirmed");
            true
        }
    }
}

/// Energy-based verifier: accepts any clip that decodes to audible audio.
///
/// Stands in for a keyword model; rejecting garbage payloads and silence
/// still filters the worst false triggers.
pub struct EnergyVerifier {
    threshold: f32,
}

impl EnergyVerifier {
    /// Create a verifier with the given RMS threshold.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EnergyVerifier {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl WakewordVerifier for EnergyVerifier {
    async fn verify(&self, audio_b64: &str) -> bool {
        let Ok(bytes) = BASE64.decode(audio_b64) else {
            return false;
        };
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();
        if samples.is_empty() {
            return false;
        }
        rms_energy(&samples) > self.threshold
    }
}
