//! Configuration types for the Wallace server.
//!
//! Settings load from a TOML file and can be overridden per field with
//! environment variables of the form `WALLACE_<SECTION>__<FIELD>`, e.g.
//! `WALLACE_LLM__MODEL=qwen2.5:7b` or `WALLACE_SERVER__PORT=9000`.

use crate::error::{Result, WallaceError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "WALLACE_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listener and logging settings.
    pub server: ServerConfig,
    /// Speech recognition settings.
    pub asr: AsrConfig,
    /// Dialog model settings.
    pub llm: LlmConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// Smart-home broker settings.
    pub mqtt: MqttConfig,
    /// Proactive care push settings.
    pub care: CareConfig,
    /// Environmental telemetry settings.
    pub sensor: SensorConfig,
    /// Weather provider settings.
    pub weather: WeatherConfig,
}

/// HTTP/WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Log level filter (trace/debug/info/warn/error).
    pub log_level: String,
    /// Directory for persisted state (user memory lives under
    /// `<data_dir>/memory/`).
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
            log_level: "info".to_owned(),
            data_dir: "data".to_owned(),
        }
    }
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Base URL of the transcription service.
    pub base_url: String,
    /// Transcription language hint.
    pub language: String,
    /// RMS energy threshold for the speech gate, on f32 samples in \[-1, 1\].
    pub vad_threshold: f32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9977".to_owned(),
            language: "zh".to_owned(),
            vad_threshold: 0.5,
            timeout_secs: 30,
        }
    }
}

/// Dialog model configuration (Ollama-compatible streaming API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the Ollama server.
    pub base_url: String,
    /// Model name to request.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens to generate per response.
    pub max_tokens: usize,
    /// Maximum conversation turns included in the prompt window.
    pub max_history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            model: "deepseek-r1:8b".to_owned(),
            temperature: 0.7,
            max_tokens: 512,
            max_history_turns: 10,
        }
    }
}

/// Speech synthesis configuration (two backends; see `pipeline::tts`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Default backend for new sessions: "edge" or "cosyvoice".
    pub default_backend: String,
    /// Edge-TTS voice name.
    pub edge_voice: String,
    /// CosyVoice server URL.
    pub cosyvoice_url: String,
    /// CosyVoice voice name.
    pub cosyvoice_voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            default_backend: "edge".to_owned(),
            edge_voice: "zh-CN-XiaoxiaoNeural".to_owned(),
            cosyvoice_url: "http://localhost:9880".to_owned(),
            cosyvoice_voice: "default".to_owned(),
        }
    }
}

/// MQTT broker configuration for smart-home actuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker hostname.
    pub broker: String,
    /// Broker port.
    pub port: u16,
    /// Optional username.
    pub username: String,
    /// Optional password.
    pub password: String,
    /// Topic prefix for device commands.
    pub topic_prefix: String,
    /// Seconds between reconnect attempts.
    pub reconnect_interval: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_owned(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            topic_prefix: "wallace/home".to_owned(),
            reconnect_interval: 5,
        }
    }
}

/// Proactive care push configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CareConfig {
    /// Hours between sedentary reminders.
    pub sedentary_interval_hours: u64,
    /// Morning greeting time, local "HH:MM".
    pub morning_time: String,
    /// Evening greeting time, local "HH:MM".
    pub evening_time: String,
    /// Seconds to wait for the pipeline lock before dropping a push.
    pub push_timeout: u64,
    /// Seconds between user-memory sync attempts.
    pub memory_sync_interval: u64,
}

impl Default for CareConfig {
    fn default() -> Self {
        Self {
            sedentary_interval_hours: 2,
            morning_time: "07:30".to_owned(),
            evening_time: "22:00".to_owned(),
            push_timeout: 30,
            memory_sync_interval: 300,
        }
    }
}

/// Environmental telemetry thresholds and alert debounce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Seconds between repeated alerts of the same kind.
    pub alert_cooldown: u64,
    /// Air quality above this value is considered bad.
    pub air_quality_threshold: f32,
    /// Light below this value (lux) is considered dark.
    pub light_dark_threshold: f32,
    /// Temperature above this value triggers an alert.
    pub temp_high: f32,
    /// Temperature below this value triggers an alert.
    pub temp_low: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            alert_cooldown: 300,
            air_quality_threshold: 200.0,
            light_dark_threshold: 50.0,
            temp_high: 35.0,
            temp_low: 10.0,
        }
    }
}

/// Weather provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Provider endpoint.
    pub api_url: String,
    /// API key; empty disables fetching.
    pub api_key: String,
    /// Location passed to the provider.
    pub city: String,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.seniverse.com/v3/weather/now.json".to_owned(),
            api_key: String::new(),
            city: "beijing".to_owned(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, then apply environment overrides.
    ///
    /// A missing file yields defaults (still subject to env overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if an override value does not parse as the field's type.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)
                .map_err(|e| WallaceError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        settings.apply_env_overrides(std::env::vars())?;
        Ok(settings)
    }

    /// Apply `WALLACE_<SECTION>__<FIELD>` overrides from the given variables.
    ///
    /// Values are parsed with the type of the existing field (integer, float,
    /// boolean, or string). Unknown sections/fields are ignored so unrelated
    /// `WALLACE_*` variables don't break startup.
    pub fn apply_env_overrides(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<()> {
        let mut tree = toml::Value::try_from(&*self)
            .map_err(|e| WallaceError::Config(format!("settings serialization failed: {e}")))?;

        let mut touched = false;
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let Some((section, field)) = rest.split_once("__") else {
                continue;
            };
            let section = section.to_ascii_lowercase();
            let field = field.to_ascii_lowercase();

            let Some(slot) = tree
                .get_mut(section.as_str())
                .and_then(|s| s.get_mut(field.as_str()))
            else {
                continue;
            };

            *slot = coerce_override(&key, slot, &value)?;
            touched = true;
        }

        if touched {
            *self = tree
                .try_into()
                .map_err(|e| WallaceError::Config(format!("env override rejected: {e}")))?;
        }
        Ok(())
    }
}

/// Parse an override string with the type of the field it replaces.
fn coerce_override(key: &str, existing: &toml::Value, raw: &str) -> Result<toml::Value> {
    let parsed = match existing {
        toml::Value::Integer(_) => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| WallaceError::Config(format!("{key}: {e}"))),
        toml::Value::Float(_) => raw
            .parse::<f64>()
            .map(toml::Value::Float)
            .map_err(|e| WallaceError::Config(format!("{key}: {e}"))),
        toml::Value::Boolean(_) => raw
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .map_err(|e| WallaceError::Config(format!("{key}: {e}"))),
        _ => Ok(toml::Value::String(raw.to_owned())),
    };
    parsed
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let s = Settings::default();
        assert_eq!(s.server.port, 8000);
        assert_eq!(s.llm.model, "deepseek-r1:8b");
        assert_eq!(s.llm.max_history_turns, 10);
        assert_eq!(s.tts.default_backend, "edge");
        assert_eq!(s.care.morning_time, "07:30");
        assert_eq!(s.sensor.alert_cooldown, 300);
        assert!((s.asr.vad_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.server.port, 8000);
    }

    #[test]
    fn load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallace.toml");
        std::fs::write(
            &path,
            r#"
[llm]
model = "qwen2.5:7b"

[care]
morning_time = "08:00"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.llm.model, "qwen2.5:7b");
        assert_eq!(settings.care.morning_time, "08:00");
        // Untouched sections stay at their defaults.
        assert_eq!(settings.llm.temperature, 0.7);
        assert_eq!(settings.server.port, 8000);
    }

    #[test]
    fn env_overrides_typed_fields() {
        let mut settings = Settings::default();
        let vars = vec![
            ("WALLACE_SERVER__PORT".to_owned(), "9000".to_owned()),
            ("WALLACE_LLM__TEMPERATURE".to_owned(), "0.2".to_owned()),
            ("WALLACE_LLM__MODEL".to_owned(), "llama3:8b".to_owned()),
            ("WALLACE_TTS__DEFAULT_BACKEND".to_owned(), "cosyvoice".to_owned()),
        ];
        settings.apply_env_overrides(vars.into_iter()).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert!((settings.llm.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(settings.llm.model, "llama3:8b");
        assert_eq!(settings.tts.default_backend, "cosyvoice");
    }

    #[test]
    fn env_override_bad_integer_is_config_error() {
        let mut settings = Settings::default();
        let vars = vec![("WALLACE_SERVER__PORT".to_owned(), "not-a-port".to_owned())];
        let err = settings.apply_env_overrides(vars.into_iter()).unwrap_err();
        assert!(matches!(err, WallaceError::Config(_)));
    }

    #[test]
    fn unknown_env_fields_are_ignored() {
        let mut settings = Settings::default();
        let vars = vec![
            ("WALLACE_NOPE__FIELD".to_owned(), "x".to_owned()),
            ("WALLACE_SERVER__NOPE".to_owned(), "x".to_owned()),
            ("UNRELATED".to_owned(), "x".to_owned()),
        ];
        settings.apply_env_overrides(vars.into_iter()).unwrap();
        assert_eq!(settings.server.port, 8000);
    }
}
