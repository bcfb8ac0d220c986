//! Wire protocol: the closed device ↔ server message sets.
//!
//! Every text frame is a JSON object with a `type` discriminator. Binary
//! frames are raw 16-bit little-endian mono PCM at 16 kHz and never appear
//! here. Unknown types and missing required fields fail parsing; the router
//! logs and discards such frames without closing the connection.

use crate::error::{Result, WallaceError};
use serde::{Deserialize, Serialize};

/// Messages sent by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Heartbeat probe.
    Ping,
    /// Recording begins; also interrupts a speaking assistant (barge-in).
    AudioStart,
    /// Recording finished; the buffered audio forms one utterance.
    AudioEnd,
    /// Second-stage wake word confirmation request.
    WakewordVerify {
        /// Base64-encoded raw PCM.
        audio: String,
    },
    /// Environmental telemetry report. Omitted fields leave the cached
    /// values unchanged.
    Sensor {
        #[serde(default)]
        temp: Option<f32>,
        #[serde(default)]
        humidity: Option<f32>,
        #[serde(default)]
        light: Option<f32>,
        #[serde(default)]
        air_quality: Option<f32>,
    },
    /// Presence sensor report.
    Proximity {
        #[serde(default)]
        distance: Option<f32>,
        #[serde(default)]
        user_present: Option<bool>,
    },
    /// Device power/connectivity snapshot.
    DeviceState {
        battery_pct: i64,
        power_mode: String,
        wifi_rssi: i64,
    },
    /// Physical interaction or mode-switch event.
    Event {
        event: DeviceEvent,
        #[serde(default)]
        value: serde_json::Value,
    },
    /// Smart-home command to forward to the actuator.
    LocalCmd { action: String },
    /// Camera capture (base64); currently ignored by the server.
    Image { data: String },
    /// Per-session configuration update.
    Config {
        #[serde(default)]
        tts_backend: Option<String>,
    },
}

/// Device event kinds carried by [`DeviceMessage::Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    PersonalitySwitch,
    TreehouseMode,
    Shake,
    Touch,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Heartbeat reply.
    Pong,
    /// Restored mode flags, sent first on a reconnect.
    SessionRestore {
        personality: String,
        treehouse: bool,
        tts_backend: String,
    },
    /// Wake word verification outcome.
    WakewordResult { confirmed: bool },
    /// A synthesized reply is about to stream as binary PCM frames.
    TtsStart {
        #[serde(default = "default_tts_mood")]
        mood: String,
    },
    /// The current reply was interrupted; discard buffered frames.
    TtsCancel,
    /// All frames of the current reply have been sent.
    TtsEnd,
    /// Reply text for display.
    Text {
        content: String,
        #[serde(default)]
        partial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mood: Option<String>,
    },
    /// Proactive care message (scheduled or sensor-triggered).
    Care { content: String, mood: String },
    /// Debounced environmental alert.
    SensorAlert { alert: String, suggestion: String },
    /// Result of a forwarded smart-home command.
    CommandResult {
        action: String,
        success: bool,
        #[serde(default)]
        message: String,
    },
    /// Snapshot of the persisted user memory.
    MemorySync { data: serde_json::Value },
}

fn default_tts_mood() -> String {
    "thinking".to_owned()
}

/// Parse and validate a device → server JSON frame.
///
/// # Errors
///
/// Returns [`WallaceError::MalformedMessage`] for invalid JSON, an unknown
/// `type`, or a missing required field.
pub fn parse_device_message(raw: &str) -> Result<DeviceMessage> {
    serde_json::from_str(raw).map_err(|e| WallaceError::MalformedMessage(e.to_string()))
}

/// Parse and validate a server → device JSON frame.
///
/// Used by tests and tooling; the server itself only serializes these.
///
/// # Errors
///
/// Returns [`WallaceError::MalformedMessage`] on validation failure.
pub fn parse_server_message(raw: &str) -> Result<ServerMessage> {
    serde_json::from_str(raw).map_err(|e| WallaceError::MalformedMessage(e.to_string()))
}

impl ServerMessage {
    /// Serialize to the wire representation.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WallaceError::Channel(e.to_string()))
    }
}
