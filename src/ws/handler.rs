//! Per-connection router: owns the socket, feeds the session, and
//! dispatches control messages.
//!
//! Inbound binary frames append to the session's audio buffer; text frames
//! parse against the device message set and dispatch by type. Malformed
//! input is logged and dropped — it never closes the connection. The actual
//! dispatch logic lives in [`dispatch`] so tests can drive it without a
//! socket.

use crate::app::ServerContext;
use crate::memory::MemoryStore;
use crate::protocol::{DeviceEvent, DeviceMessage, ServerMessage, parse_device_message};
use crate::session::{
    DeviceStateInfo, Outbound, Personality, Session, TtsBackendKind, UserMemory,
};
use crate::wakeword::{VERIFY_TIMEOUT, verify_with_timeout};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Cadence of heartbeat checks.
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// A session silent for longer than this is considered dead.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Handle one WebSocket connection from accept to teardown.
pub async fn serve_connection(ctx: Arc<ServerContext>, user_id: String, socket: WebSocket) {
    info!(user_id = %user_id, "device connected");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                Outbound::Text(text) => sink.send(Message::Text(text.into())).await,
                Outbound::Binary(bytes) => sink.send(Message::Binary(bytes.into())).await,
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let session = open_session(&ctx, &user_id, outbound_tx).await;

    let heartbeat = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            heartbeat_monitor(session).await;
        })
    };

    // Receive loop.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => session.append_audio(&bytes),
            Ok(Message::Text(text)) => route_text(&ctx, &session, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(user_id = %user_id, "socket error: {e}");
                break;
            }
        }
    }

    info!(user_id = %user_id, "device disconnected");

    heartbeat.abort();
    close_session(&ctx, &session).await;
    drop(session);
    let _ = writer.await;
}

/// Build and register a session for an accepted connection.
///
/// On reconnect (an active session already holds this user id) the new
/// session inherits the old one's mode flags and memory, the old pipeline
/// is cancelled, and `session_restore` is the first text frame sent on the
/// new socket. Otherwise memory loads from disk.
pub async fn open_session(
    ctx: &Arc<ServerContext>,
    user_id: &str,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
) -> Arc<Session> {
    let default_backend = TtsBackendKind::from_name(&ctx.settings.tts.default_backend)
        .unwrap_or_default();
    let session = Arc::new(Session::new(user_id, outbound_tx, default_backend));

    let store = Arc::new(MemoryStore::new(
        user_id,
        ctx.memory_dir.clone(),
        ctx.memory_sync_interval,
    ));
    session.set_memory_store(Arc::clone(&store));

    let previous = ctx.registry.get(user_id);
    if let Some(old) = &previous {
        session.set_personality(old.personality());
        session.set_treehouse_mode(old.treehouse_mode());
        session.set_tts_backend(old.tts_backend());
        session.set_memory(old.memory());
        ctx.orchestrator.cancel_pipeline(old).await;
        info!(user_id, "restoring session state on reconnect");
    } else {
        let mut memory = store.load_async().await;
        if memory.first_met.is_empty() {
            memory.first_met = chrono::Local::now().format("%Y-%m-%d").to_string();
        }
        session.set_memory(memory);
    }

    ctx.registry.insert(Arc::clone(&session));

    if previous.is_some() {
        let _ = session.send(&ServerMessage::SessionRestore {
            personality: session.personality().as_str().to_owned(),
            treehouse: session.treehouse_mode(),
            tts_backend: session.tts_backend().as_str().to_owned(),
        });
    }

    session
}

/// Tear a session down: cancel its pipeline, flush changed memory, and
/// vacate the registry slot unless a reconnect already reclaimed it.
pub async fn close_session(ctx: &Arc<ServerContext>, session: &Arc<Session>) {
    ctx.orchestrator.cancel_pipeline(session).await;
    if let Some(store) = session.memory_store() {
        flush_memory(&store, &session.memory()).await;
    }
    ctx.registry.remove_if_same(session.user_id(), session);
}

/// Parse and dispatch one text frame; malformed input is dropped.
pub async fn route_text(ctx: &Arc<ServerContext>, session: &Arc<Session>, raw: &str) {
    let msg = match parse_device_message(raw) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(user_id = session.user_id(), "discarding frame: {e}");
            return;
        }
    };
    dispatch(ctx, session, msg).await;
}

/// Dispatch a validated device message.
pub async fn dispatch(ctx: &Arc<ServerContext>, session: &Arc<Session>, msg: DeviceMessage) {
    match msg {
        DeviceMessage::Ping => {
            session.touch_heartbeat();
            let _ = session.send(&ServerMessage::Pong);
        }

        DeviceMessage::AudioStart => {
            if let Err(e) = ctx.orchestrator.on_audio_start(session).await {
                error!(user_id = session.user_id(), "audio_start rejected: {e}");
                session.force_idle();
            }
        }

        DeviceMessage::AudioEnd => {
            if let Err(e) = ctx.orchestrator.on_audio_end(session) {
                error!(user_id = session.user_id(), "audio_end rejected: {e}");
                session.force_idle();
            }
        }

        DeviceMessage::WakewordVerify { audio } => {
            let confirmed =
                verify_with_timeout(ctx.wakeword.as_ref(), &audio, VERIFY_TIMEOUT).await;
            let _ = session.send(&ServerMessage::WakewordResult { confirmed });
            session.set_wakeword_confirmed(confirmed);
        }

        DeviceMessage::Sensor {
            temp,
            humidity,
            light,
            air_quality,
        } => {
            ctx.sensor.update(session, temp, humidity, light, air_quality);
            for alert in ctx.sensor.check_alerts(session) {
                let _ = session.send(&ServerMessage::SensorAlert {
                    alert: alert.kind.to_owned(),
                    suggestion: alert.suggestion,
                });
            }
        }

        DeviceMessage::Proximity { user_present, .. } => {
            ctx.sensor.update_proximity(session, user_present);
        }

        DeviceMessage::DeviceState {
            battery_pct,
            power_mode,
            wifi_rssi,
        } => {
            session.set_device_state(DeviceStateInfo {
                battery_pct,
                power_mode,
                wifi_rssi,
            });
        }

        DeviceMessage::Event { event, value } => handle_event(ctx, session, event, value),

        DeviceMessage::LocalCmd { action } => {
            let (success, message) = ctx.smarthome.execute(&action).await;
            let _ = session.send(&ServerMessage::CommandResult {
                action,
                success,
                message,
            });
        }

        DeviceMessage::Image { .. } => {
            debug!(user_id = session.user_id(), "image analysis not wired, ignoring");
        }

        DeviceMessage::Config { tts_backend } => {
            if let Some(name) = tts_backend {
                match TtsBackendKind::from_name(&name) {
                    Some(kind) => session.set_tts_backend(kind),
                    None => warn!(user_id = session.user_id(), "unknown tts backend: {name}"),
                }
            }
        }
    }
}

fn handle_event(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    event: DeviceEvent,
    value: serde_json::Value,
) {
    match event {
        DeviceEvent::PersonalitySwitch => {
            let name = value.as_str().unwrap_or_default();
            let personality = Personality::from_name(name);
            session.set_personality(personality);
            session.clear_history();
            info!(
                user_id = session.user_id(),
                "personality switched to {}",
                personality.as_str()
            );
        }
        DeviceEvent::TreehouseMode => {
            session.set_treehouse_mode(truthy(&value));
        }
        DeviceEvent::Shake => {
            ctx.orchestrator.spawn_random_fact(session);
        }
        DeviceEvent::Touch => {}
    }
}

/// Loose truthiness for event values (devices send bools, 0/1, or strings).
fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        serde_json::Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

async fn flush_memory(store: &Arc<MemoryStore>, memory: &UserMemory) {
    if !store.has_changes(memory) {
        return;
    }
    match store.save_async(memory.clone()).await {
        Ok(()) => store.mark_synced(memory),
        Err(e) => error!("memory flush on disconnect failed: {e}"),
    }
}

async fn heartbeat_monitor(session: Arc<Session>) {
    loop {
        tokio::time::sleep(HEARTBEAT_CHECK_INTERVAL).await;
        let age = session.heartbeat_age();
        if age > HEARTBEAT_TIMEOUT {
            warn!(
                user_id = session.user_id(),
                "heartbeat timeout ({}s), closing socket",
                age.as_secs()
            );
            session.close();
            break;
        }
    }
}
