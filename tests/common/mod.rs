//! Shared stubs and wiring for the end-to-end scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wallace::app::ServerContext;
use wallace::config::Settings;
use wallace::error::Result;
use wallace::pipeline::FRAME_SIZE;
use wallace::pipeline::llm::{ChatMessage, ChatModel, TokenStream};
use wallace::pipeline::orchestrator::Orchestrator;
use wallace::pipeline::tts::{FrameStream, TtsBackend, TtsRouter};
use wallace::pipeline::asr::SpeechRecognizer;
use wallace::sensor::SensorEngine;
use wallace::session::{Outbound, Session, SessionRegistry};
use wallace::smarthome::HomeActuator;
use wallace::wakeword::EnergyVerifier;
use wallace::ws::handler::open_session;

pub struct StubAsr {
    pub text: String,
}

#[async_trait]
impl SpeechRecognizer for StubAsr {
    async fn transcribe(&self, _samples: &[f32]) -> Result<String> {
        Ok(self.text.clone())
    }
}

pub struct StubLlm {
    pub tokens: Vec<String>,
    pub token_delay: Duration,
}

#[async_trait]
impl ChatModel for StubLlm {
    async fn chat_stream(&self, _messages: Vec<ChatMessage>) -> Result<TokenStream> {
        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        Ok(Box::pin(async_stream::stream! {
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(token);
            }
        }))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub struct StubTts {
    pub frames_per_sentence: usize,
    pub frame_delay: Duration,
}

#[async_trait]
impl TtsBackend for StubTts {
    async fn synthesize(&self, text: &str) -> Result<FrameStream> {
        if text.trim().is_empty() {
            return Ok(Box::pin(futures_util::stream::iter(Vec::new())));
        }
        let count = self.frames_per_sentence;
        let delay = self.frame_delay;
        Ok(Box::pin(async_stream::stream! {
            for _ in 0..count {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(vec![0u8; FRAME_SIZE]);
            }
        }))
    }
}

pub struct StubHome;

#[async_trait]
impl HomeActuator for StubHome {
    async fn execute(&self, action: &str) -> (bool, String) {
        (true, format!("{action} executed"))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Knobs for one scripted scenario.
pub struct Scenario {
    pub asr_text: String,
    pub tokens: Vec<String>,
    pub token_delay: Duration,
    pub frame_delay: Duration,
    /// RMS gate; -1.0 means "VAD stubbed to true".
    pub vad_threshold: f32,
}

impl Scenario {
    pub fn new(asr_text: &str, tokens: &[&str]) -> Self {
        Self {
            asr_text: asr_text.to_owned(),
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            token_delay: Duration::ZERO,
            frame_delay: Duration::ZERO,
            vad_threshold: -1.0,
        }
    }

    pub fn slow(mut self, token_delay: Duration, frame_delay: Duration) -> Self {
        self.token_delay = token_delay;
        self.frame_delay = frame_delay;
        self
    }
}

/// Build a full server context wired to scripted collaborators; the temp
/// dir backs the memory store.
pub fn build_ctx(scenario: Scenario) -> (Arc<ServerContext>, tempfile::TempDir) {
    let settings = Settings::default();
    let registry = Arc::new(SessionRegistry::new());
    let sensor = Arc::new(SensorEngine::new(settings.sensor.clone()));
    let llm: Arc<dyn ChatModel> = Arc::new(StubLlm {
        tokens: scenario.tokens,
        token_delay: scenario.token_delay,
    });
    let tts = Arc::new(TtsRouter::new(
        Arc::new(StubTts {
            frames_per_sentence: 2,
            frame_delay: scenario.frame_delay,
        }),
        Arc::new(StubTts {
            frames_per_sentence: 2,
            frame_delay: scenario.frame_delay,
        }),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(StubAsr {
            text: scenario.asr_text,
        }),
        Arc::clone(&llm),
        tts,
        Arc::clone(&sensor),
        scenario.vad_threshold,
        settings.llm.max_history_turns,
    ));

    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(ServerContext {
        settings,
        registry,
        orchestrator,
        sensor,
        wakeword: Arc::new(EnergyVerifier::default()),
        smarthome: Arc::new(StubHome),
        llm,
        memory_dir: dir.path().join("memory"),
        memory_sync_interval: Duration::from_secs(300),
    });
    (ctx, dir)
}

/// Open a session against the context, returning it with its outbound tap.
pub async fn connect(
    ctx: &Arc<ServerContext>,
    user_id: &str,
) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = open_session(ctx, user_id, tx).await;
    (session, rx)
}

/// One observed outbound frame, decoded for assertions.
#[derive(Debug)]
pub enum Observed {
    Text(serde_json::Value),
    Binary(usize),
    Close,
}

impl Observed {
    pub fn msg_type(&self) -> &str {
        match self {
            Self::Text(value) => value["type"].as_str().unwrap_or(""),
            Self::Binary(_) => "binary",
            Self::Close => "close",
        }
    }
}

/// Drain everything currently queued on the outbound channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Observed> {
    let mut observed = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        observed.push(decode(frame));
    }
    observed
}

pub fn decode(frame: Outbound) -> Observed {
    match frame {
        Outbound::Text(json) => {
            Observed::Text(serde_json::from_str(&json).expect("outbound frames are valid JSON"))
        }
        Outbound::Binary(bytes) => Observed::Binary(bytes.len()),
        Outbound::Close => Observed::Close,
    }
}

/// The frame types §8's turn invariant is expressed over.
pub fn turn_types(observed: &[Observed]) -> Vec<String> {
    observed
        .iter()
        .map(Observed::msg_type)
        .filter(|t| matches!(*t, "tts_start" | "binary" | "text" | "tts_end" | "tts_cancel"))
        .map(str::to_owned)
        .collect()
}

/// Run one utterance through the pipeline and wait for it to finish.
pub async fn run_turn(ctx: &Arc<ServerContext>, session: &Arc<Session>, audio: &[u8]) {
    wallace::ws::handler::route_text(ctx, session, r#"{"type":"audio_start"}"#).await;
    session.append_audio(audio);
    wallace::ws::handler::route_text(ctx, session, r#"{"type":"audio_end"}"#).await;
    let handle = session.take_pipeline().expect("pipeline spawned");
    handle.task.await.expect("pipeline task");
}
