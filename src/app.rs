//! Application wiring: component construction, the HTTP/WebSocket router,
//! and the serve loop.

use crate::care::{CareScheduler, PushCoordinator};
use crate::config::Settings;
use crate::error::{Result, WallaceError};
use crate::pipeline::asr::{HttpAsr, SpeechRecognizer};
use crate::pipeline::llm::{ChatModel, OllamaClient};
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::tts::TtsRouter;
use crate::sensor::SensorEngine;
use crate::session::SessionRegistry;
use crate::smarthome::{HomeActuator, MqttActuator};
use crate::wakeword::{EnergyVerifier, WakewordVerifier};
use crate::weather::WeatherClient;
use crate::ws::handler::serve_connection;
use axum::Router;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared dependencies for connection handlers.
pub struct ServerContext {
    pub settings: Settings,
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub sensor: Arc<SensorEngine>,
    pub wakeword: Arc<dyn WakewordVerifier>,
    pub smarthome: Arc<dyn HomeActuator>,
    pub llm: Arc<dyn ChatModel>,
    /// Root for per-user memory files (`<data_dir>/memory`).
    pub memory_dir: PathBuf,
    pub memory_sync_interval: Duration,
}

/// Build the axum router: one WebSocket endpoint per device plus health.
pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/ws/{user_id}", get(ws_endpoint))
        .route("/health", get(health))
        .with_state(ctx)
}

async fn ws_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(ctx, user_id, socket))
}

async fn health(State(ctx): State<Arc<ServerContext>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "llm": ctx.llm.health_check().await,
        "mqtt": ctx.smarthome.is_connected(),
    }))
}

/// Construct every component from settings and serve until ctrl-c.
///
/// # Errors
///
/// Returns an error when a component cannot be constructed, the care times
/// are invalid, or the listener cannot bind. Collaborator outages at
/// runtime are not fatal.
pub async fn run(settings: Settings) -> Result<()> {
    let asr: Arc<dyn SpeechRecognizer> = Arc::new(HttpAsr::new(&settings.asr)?);
    let llm: Arc<dyn ChatModel> = Arc::new(OllamaClient::new(&settings.llm)?);
    let tts = Arc::new(TtsRouter::from_config(&settings.tts)?);
    let sensor = Arc::new(SensorEngine::new(settings.sensor.clone()));
    let smarthome: Arc<dyn HomeActuator> = Arc::new(MqttActuator::connect(&settings.mqtt));
    let wakeword: Arc<dyn WakewordVerifier> = Arc::new(EnergyVerifier::default());
    let weather = Arc::new(WeatherClient::new(settings.weather.clone()));

    let registry = Arc::new(SessionRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&asr),
        Arc::clone(&llm),
        Arc::clone(&tts),
        Arc::clone(&sensor),
        settings.asr.vad_threshold,
        settings.llm.max_history_turns,
    ));

    let push = Arc::new(PushCoordinator::new(
        Arc::clone(&llm),
        Arc::clone(&tts),
        Arc::clone(&registry),
        Duration::from_secs(settings.care.push_timeout),
    ));
    let scheduler = CareScheduler::new(settings.care.clone(), push, weather);
    scheduler.start()?;

    let memory_dir = PathBuf::from(&settings.server.data_dir).join("memory");
    let memory_sync_interval = Duration::from_secs(settings.care.memory_sync_interval);

    let bind = format!("{}:{}", settings.server.host, settings.server.port);
    let ctx = Arc::new(ServerContext {
        settings,
        registry,
        orchestrator,
        sensor,
        wakeword,
        smarthome,
        llm,
        memory_dir,
        memory_sync_interval,
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| WallaceError::Connection(format!("bind {bind} failed: {e}")))?;
    info!("wallace server listening on {bind}");

    let result = axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| WallaceError::Connection(format!("server error: {e}")));

    scheduler.stop();
    result
}
