//! Weather collaborator for the morning greeting.
//!
//! Best-effort: any failure (no key, network, bad payload) yields an empty
//! string and the greeting goes out without weather.

use crate::config::WeatherConfig;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Provides a short human-readable weather summary.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Current conditions, or "" when unavailable.
    async fn now(&self) -> String;
}

/// Seniverse-style weather client.
pub struct WeatherClient {
    client: reqwest::Client,
    config: WeatherConfig,
}

impl WeatherClient {
    /// Build a client from config.
    pub fn new(config: WeatherConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    async fn fetch(&self) -> Option<String> {
        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("location", self.config.city.as_str()),
            ])
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;

        let body: serde_json::Value = response.json().await.ok()?;
        let now = &body["results"][0]["now"];
        let text = now["text"].as_str()?;
        let temperature = now["temperature"].as_str()?;
        Some(format!("{text}，{temperature}°C"))
    }
}

#[async_trait]
impl WeatherProvider for WeatherClient {
    async fn now(&self) -> String {
        if self.config.api_key.is_empty() {
            return String::new();
        }
        match self.fetch().await {
            Some(summary) => summary,
            None => {
                warn!("weather fetch failed");
                String::new()
            }
        }
    }
}
