//! Wallace: server core for a desktop voice companion.
//!
//! Terminates persistent WebSocket connections from embedded devices and
//! drives a cascaded response pipeline per utterance:
//! Device audio → VAD → ASR → LLM (streamed) → TTS → PCM frames back out.
//!
//! # Architecture
//!
//! One router task per connection owns the socket; pipelines and proactive
//! pushes are spawned tasks funnelling all output through the session's
//! outbound channel:
//! - **Protocol**: closed device/server message sets over one framed socket
//! - **Session**: per-connection state record with an explicit state machine
//! - **Orchestrator**: ASR → LLM → TTS with sentence-level streaming,
//!   barge-in, and cooperative cancellation
//! - **Care**: scheduled and sensor-triggered pushes, contention-aware
//! - **Memory**: per-user profile JSON with atomic durable writes

pub mod app;
pub mod care;
pub mod config;
pub mod emotion;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod protocol;
pub mod segment;
pub mod sensor;
pub mod session;
pub mod smarthome;
pub mod wakeword;
pub mod weather;
pub mod ws;

pub use config::Settings;
pub use error::{Result, WallaceError};
pub use pipeline::orchestrator::Orchestrator;
pub use session::{PipelineState, Session, SessionRegistry};
