//! Smart-home actuation over MQTT.
//!
//! Device `local_cmd` messages become publishes under the configured topic
//! prefix. A background task drives the MQTT event loop and tracks
//! connectivity for `/health`; a broker outage degrades commands to
//! failures instead of breaking sessions.

use crate::config::MqttConfig;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Executes device-requested home automation actions.
#[async_trait]
pub trait HomeActuator: Send + Sync {
    /// Execute one action, returning `(success, message)`.
    async fn execute(&self, action: &str) -> (bool, String);

    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;
}

/// One step of a predefined scene.
#[derive(Debug, Clone)]
pub struct SceneStep {
    pub action: String,
    pub payload: serde_json::Value,
}

/// Predefined multi-device scenes.
fn scene_steps(name: &str) -> Vec<SceneStep> {
    match name {
        "sleep" => vec![
            SceneStep {
                action: "light/off".to_owned(),
                payload: serde_json::json!({}),
            },
            SceneStep {
                action: "ac/sleep_mode".to_owned(),
                payload: serde_json::json!({}),
            },
        ],
        "wakeup" => vec![SceneStep {
            action: "light/on".to_owned(),
            payload: serde_json::json!({"brightness": 50}),
        }],
        _ => Vec::new(),
    }
}

/// MQTT-backed actuator.
pub struct MqttActuator {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    topic_prefix: String,
}

impl MqttActuator {
    /// Connect to the broker and spawn the event-loop driver.
    ///
    /// Connection failures are not fatal: the actuator starts in degraded
    /// mode and the driver keeps retrying at the configured interval.
    pub fn connect(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new("wallace-server", &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 16);
        let connected = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&connected);
        let reconnect_interval = Duration::from_secs(config.reconnect_interval.max(1));
        let broker = format!("{}:{}", config.broker, config.port);
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected to {broker}");
                        flag.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::Relaxed) {
                            warn!("MQTT connection lost ({broker}): {e}, running in degraded mode");
                        }
                        tokio::time::sleep(reconnect_interval).await;
                    }
                }
            }
        });

        Self {
            client,
            connected,
            topic_prefix: config.topic_prefix.clone(),
        }
    }

    /// Execute a predefined scene, returning per-step results.
    pub async fn execute_scene(&self, name: &str) -> Vec<(String, bool, String)> {
        let steps = scene_steps(name);
        if steps.is_empty() {
            return vec![(name.to_owned(), false, format!("Unknown scene: {name}"))];
        }

        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let (success, message) = self.publish(&step.action, &step.payload).await;
            results.push((step.action, success, message));
        }
        results
    }

    async fn publish(&self, action: &str, payload: &serde_json::Value) -> (bool, String) {
        if !self.connected.load(Ordering::Relaxed) {
            return (false, "MQTT not connected".to_owned());
        }

        let topic = format!("{}/{}", self.topic_prefix, action);
        let body = payload.to_string();
        match self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, body)
            .await
        {
            Ok(()) => {
                info!("MQTT publish: {topic}");
                (true, format!("{action} executed"))
            }
            Err(e) => (false, e.to_string()),
        }
    }
}

#[async_trait]
impl HomeActuator for MqttActuator {
    async fn execute(&self, action: &str) -> (bool, String) {
        self.publish(action, &serde_json::json!({})).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
