//! Scheduled care jobs: sedentary reminders plus morning and evening
//! greetings.
//!
//! Three long-lived tokio tasks, started at bootstrap and cancelled on
//! shutdown without waiting for in-flight pushes. Daily jobs compute the
//! next local HH:MM occurrence and sleep until then.

use crate::config::CareConfig;
use crate::care::push::PushCoordinator;
use crate::emotion::Mood;
use crate::error::{Result, WallaceError};
use crate::weather::WeatherProvider;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SEDENTARY_PROMPT: &str = "主人已经坐了很久了，提醒他活动一下";
const EVENING_PROMPT: &str = "夜深了，提醒主人早点休息";

/// Owns the three care job tasks.
pub struct CareScheduler {
    config: CareConfig,
    push: Arc<PushCoordinator>,
    weather: Arc<dyn WeatherProvider>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CareScheduler {
    /// Wire the scheduler to the push coordinator and weather provider.
    pub fn new(
        config: CareConfig,
        push: Arc<PushCoordinator>,
        weather: Arc<dyn WeatherProvider>,
    ) -> Self {
        Self {
            config,
            push,
            weather,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Validate the configured times and spawn the jobs.
    ///
    /// # Errors
    ///
    /// Returns a config error for unparseable `morning_time`/`evening_time`.
    pub fn start(&self) -> Result<()> {
        let morning = parse_hhmm(&self.config.morning_time)
            .ok_or_else(|| WallaceError::Config(format!(
                "invalid care.morning_time: {}",
                self.config.morning_time
            )))?;
        let evening = parse_hhmm(&self.config.evening_time)
            .ok_or_else(|| WallaceError::Config(format!(
                "invalid care.evening_time: {}",
                self.config.evening_time
            )))?;

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Sedentary reminder on a fixed interval.
        {
            let push = Arc::clone(&self.push);
            let cancel = self.cancel.clone();
            let interval =
                Duration::from_secs(self.config.sedentary_interval_hours.max(1) * 3600);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(interval) => {
                            push.push_all(SEDENTARY_PROMPT, Mood::Caring).await;
                        }
                    }
                }
            }));
        }

        // Morning greeting with fresh weather.
        {
            let push = Arc::clone(&self.push);
            let weather = Arc::clone(&self.weather);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let wait = duration_until_local(morning.0, morning.1);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(wait) => {
                            let report = weather.now().await;
                            let prompt = format!(
                                "早上好！今天的天气：{report}。生成一句元气满满的早安问候。"
                            );
                            push.push_all(&prompt, Mood::Happy).await;
                        }
                    }
                }
            }));
        }

        // Evening greeting.
        {
            let push = Arc::clone(&self.push);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let wait = duration_until_local(evening.0, evening.1);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(wait) => {
                            push.push_all(EVENING_PROMPT, Mood::Gentle).await;
                        }
                    }
                }
            }));
        }

        info!(
            "care scheduler started (sedentary every {}h, morning {}, evening {})",
            self.config.sedentary_interval_hours,
            self.config.morning_time,
            self.config.evening_time
        );
        Ok(())
    }

    /// Stop all jobs without waiting for in-flight pushes.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Parse "HH:MM".
fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some((hours, minutes))
}

/// Time until the next local occurrence of `HH:MM`.
fn duration_until_local(hour: u32, minute: u32) -> Duration {
    let now = chrono::Local::now().naive_local();
    let Some(at) = now.date().and_hms_opt(hour, minute, 0) else {
        return Duration::from_secs(24 * 3600);
    };
    let target = if at > now {
        at
    } else {
        at + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn parse_valid_times() {
        assert_eq!(parse_hhmm("07:30"), Some((7, 30)));
        assert_eq!(parse_hhmm("22:00"), Some((22, 0)));
        assert_eq!(parse_hhmm("0:5"), Some((0, 5)));
    }

    #[test]
    fn parse_invalid_times() {
        assert_eq!(parse_hhmm("25:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("noon"), None);
        assert_eq!(parse_hhmm("12"), None);
    }

    #[test]
    fn next_occurrence_is_within_a_day() {
        let wait = duration_until_local(7, 30);
        assert!(wait <= Duration::from_secs(24 * 3600));
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn bad_morning_time_fails_start() {
        use crate::pipeline::llm::{ChatMessage, ChatModel, TokenStream};
        use crate::pipeline::tts::{FrameStream, TtsBackend, TtsRouter};
        use crate::session::SessionRegistry;
        use async_trait::async_trait;

        struct NoopLlm;

        #[async_trait]
        impl ChatModel for NoopLlm {
            async fn chat_stream(
                &self,
                _messages: Vec<ChatMessage>,
            ) -> crate::error::Result<TokenStream> {
                Ok(Box::pin(futures_util::stream::iter(Vec::new())))
            }
            async fn health_check(&self) -> bool {
                true
            }
        }

        struct NoopTts;

        #[async_trait]
        impl TtsBackend for NoopTts {
            async fn synthesize(&self, _text: &str) -> crate::error::Result<FrameStream> {
                Ok(Box::pin(futures_util::stream::iter(Vec::new())))
            }
        }

        struct NoWeather;

        #[async_trait]
        impl WeatherProvider for NoWeather {
            async fn now(&self) -> String {
                String::new()
            }
        }

        let push = Arc::new(PushCoordinator::new(
            Arc::new(NoopLlm),
            Arc::new(TtsRouter::new(Arc::new(NoopTts), Arc::new(NoopTts))),
            Arc::new(SessionRegistry::new()),
            Duration::from_secs(1),
        ));
        let scheduler = CareScheduler::new(
            CareConfig {
                morning_time: "morning".to_owned(),
                ..CareConfig::default()
            },
            push,
            Arc::new(NoWeather),
        );
        assert!(scheduler.start().is_err());
        scheduler.stop();
    }
}
