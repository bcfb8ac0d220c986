//! Environmental telemetry: caching, LLM context rendering, and debounced
//! threshold alerts.

use crate::config::SensorConfig;
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound of the "normal" light band; above it the room counts as
/// bright regardless of the dark threshold.
const LIGHT_BRIGHT_LUX: f32 = 500.0;

/// A triggered alert: kind name plus the suggestion shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorAlert {
    pub kind: &'static str,
    pub suggestion: String,
}

/// Telemetry processor shared by all sessions.
///
/// The debounce table is engine-wide: once an alert kind fires, the same
/// kind stays silent for `alert_cooldown` seconds across every session.
pub struct SensorEngine {
    config: SensorConfig,
    last_alert: Mutex<HashMap<&'static str, Instant>>,
}

impl SensorEngine {
    /// Create an engine with the given thresholds.
    pub fn new(config: SensorConfig) -> Self {
        Self {
            config,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Merge a telemetry report into the session cache.
    ///
    /// Omitted fields keep their cached values; `updated_at` is stamped
    /// regardless.
    pub fn update(
        &self,
        session: &Session,
        temp: Option<f32>,
        humidity: Option<f32>,
        light: Option<f32>,
        air_quality: Option<f32>,
    ) {
        session.with_sensor_mut(|cache| {
            if let Some(v) = temp {
                cache.temp = v;
            }
            if let Some(v) = humidity {
                cache.humidity = v;
            }
            if let Some(v) = light {
                cache.light = v;
            }
            if let Some(v) = air_quality {
                cache.air_quality = v;
            }
            cache.updated_at = Some(Instant::now());
        });
    }

    /// Update presence from a proximity report. An absent `user_present`
    /// field leaves the flag unchanged.
    pub fn update_proximity(&self, session: &Session, user_present: Option<bool>) {
        if let Some(present) = user_present {
            session.set_proximity_present(present);
        }
    }

    /// Render the cached readings as a system-prompt fragment.
    ///
    /// Empty until the first report arrives.
    pub fn context(&self, session: &Session) -> String {
        let cache = session.sensor();
        if cache.updated_at.is_none() {
            return String::new();
        }

        let mut parts = Vec::with_capacity(4);
        parts.push(format!("室温{:.0}°C", cache.temp));
        parts.push(format!("湿度{:.0}%", cache.humidity));

        if cache.light < self.config.light_dark_threshold {
            parts.push("光线较暗".to_owned());
        } else if cache.light > LIGHT_BRIGHT_LUX {
            parts.push("光线明亮".to_owned());
        } else {
            parts.push(format!("光线{:.0}lux", cache.light));
        }

        if cache.air_quality > self.config.air_quality_threshold {
            parts.push("空气质量较差".to_owned());
        } else {
            parts.push("空气质量良好".to_owned());
        }

        format!("当前环境：{}", parts.join("，"))
    }

    /// Evaluate the alert predicates against the session cache.
    ///
    /// Predicates run in a fixed order; each triggered kind is emitted only
    /// if it has not fired within the cooldown window.
    pub fn check_alerts(&self, session: &Session) -> Vec<SensorAlert> {
        let cache = session.sensor();
        let cooldown = Duration::from_secs(self.config.alert_cooldown);
        let now = Instant::now();

        let checks: [(&'static str, bool, String); 4] = [
            (
                "air_quality_bad",
                cache.air_quality > self.config.air_quality_threshold,
                "空气质量不太好，建议开窗通通风".to_owned(),
            ),
            (
                "light_too_dark",
                cache.light < self.config.light_dark_threshold,
                "光线有点暗，要不要开个灯".to_owned(),
            ),
            (
                "temp_too_high",
                cache.temp > self.config.temp_high,
                format!("温度有点高({:.0}°C)，注意降温", cache.temp),
            ),
            (
                "temp_too_low",
                cache.temp < self.config.temp_low,
                format!("温度有点低({:.0}°C)，注意保暖", cache.temp),
            ),
        ];

        let mut table = self
            .last_alert
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut alerts = Vec::new();
        for (kind, triggered, suggestion) in checks {
            if !triggered {
                continue;
            }
            if let Some(last) = table.get(kind) {
                if now.duration_since(*last) < cooldown {
                    continue;
                }
            }
            table.insert(kind, now);
            alerts.push(SensorAlert { kind, suggestion });
        }
        alerts
    }
}
