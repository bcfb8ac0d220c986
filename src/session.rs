//! Per-connection session state and the process-wide session registry.
//!
//! A [`Session`] is created on connection accept and destroyed on
//! disconnect. All outbound traffic funnels through the session's frame
//! channel, which a writer task drains into the socket — pipelines and
//! pushes never touch the socket directly. Mutable state sits behind a
//! sync mutex held only for short, non-awaiting sections; the
//! `pipeline_lock` (an async mutex) serializes every LLM+TTS emission
//! window on the socket.

use crate::error::{Result, WallaceError};
use crate::protocol::ServerMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One outbound socket frame.
#[derive(Debug)]
pub enum Outbound {
    /// JSON text frame.
    Text(String),
    /// Raw PCM frame.
    Binary(Vec<u8>),
    /// Close the socket.
    Close,
}

/// Pipeline state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Recording,
    Processing,
    Speaking,
}

impl PipelineState {
    /// Lowercase state name for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }

    /// Whether `self → to` is an edge of the transition table.
    fn allows(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Recording)
                | (Self::Recording, Self::Processing)
                | (Self::Recording, Self::Idle)
                | (Self::Processing, Self::Speaking)
                | (Self::Processing, Self::Idle)
                | (Self::Speaking, Self::Idle)
                | (Self::Speaking, Self::Recording)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selectable assistant personalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Personality {
    #[default]
    Normal,
    Cool,
    Talkative,
    Tsundere,
}

impl Personality {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Cool => "cool",
            Self::Talkative => "talkative",
            Self::Tsundere => "tsundere",
        }
    }

    /// Parse a wire name; unknown names fall back to [`Personality::Normal`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "cool" => Self::Cool,
            "talkative" => Self::Talkative,
            "tsundere" => Self::Tsundere,
            _ => Self::Normal,
        }
    }
}

/// The two synthesis backends a session can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsBackendKind {
    /// Cloud synthesis via the Edge speech gateway.
    #[default]
    Edge,
    /// Local GPU synthesis via a CosyVoice server.
    CosyVoice,
}

impl TtsBackendKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::CosyVoice => "cosyvoice",
        }
    }

    /// Parse a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "edge" => Some(Self::Edge),
            "cosyvoice" => Some(Self::CosyVoice),
            _ => None,
        }
    }

    /// The alternate backend, used for synthesis fallback.
    pub fn other(self) -> Self {
        match self {
            Self::Edge => Self::CosyVoice,
            Self::CosyVoice => Self::Edge,
        }
    }
}

/// Last known environmental readings. `updated_at` is `None` until the
/// first report arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorData {
    pub temp: f32,
    pub humidity: f32,
    pub light: f32,
    pub air_quality: f32,
    pub updated_at: Option<Instant>,
}

/// Persisted per-user profile. Unknown fields in stored files are ignored;
/// missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMemory {
    pub nickname: String,
    pub preferences: Vec<String>,
    pub interests: Vec<String>,
    pub recent_topics: Vec<String>,
    /// Label → "MM-DD".
    pub important_dates: std::collections::BTreeMap<String, String>,
    pub interaction_count: u64,
    pub first_met: String,
}

/// A completed chat history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub role: ChatRole,
    pub content: String,
}

/// Role of a chat history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// Device power/connectivity snapshot from a `device_state` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStateInfo {
    pub battery_pct: i64,
    pub power_mode: String,
    pub wifi_rssi: i64,
}

/// Handle to a spawned cancellable task (pipeline or random-fact push).
#[derive(Debug)]
pub struct PipelineHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Mutable per-session record. Guarded by the session's sync mutex.
struct SessionState {
    personality: Personality,
    treehouse_mode: bool,
    tts_backend: TtsBackendKind,
    state: PipelineState,
    audio_buffer: Vec<u8>,
    chat_history: Vec<ChatEntry>,
    sensor: SensorData,
    proximity_present: bool,
    last_heartbeat: Instant,
    device_state: Option<DeviceStateInfo>,
    wakeword_confirmed: bool,
    memory: UserMemory,
    memory_store: Option<Arc<crate::memory::MemoryStore>>,
    pipeline: Option<PipelineHandle>,
    fact_task: Option<PipelineHandle>,
}

/// Per-connection session, shared across the router, pipeline, and push
/// tasks via `Arc`.
pub struct Session {
    user_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    inner: Mutex<SessionState>,
    /// Serializes LLM+TTS emission windows on this socket.
    pipeline_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session bound to an outbound frame channel.
    pub fn new(
        user_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
        tts_backend: TtsBackendKind,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            outbound,
            inner: Mutex::new(SessionState {
                personality: Personality::Normal,
                treehouse_mode: false,
                tts_backend,
                state: PipelineState::Idle,
                audio_buffer: Vec::new(),
                chat_history: Vec::new(),
                sensor: SensorData::default(),
                proximity_present: true,
                last_heartbeat: Instant::now(),
                device_state: None,
                wakeword_confirmed: false,
                memory: UserMemory::default(),
                memory_store: None,
                pipeline: None,
                fact_task: None,
            }),
            pipeline_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// User this session belongs to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The lock guarding LLM+TTS emission on this socket.
    pub fn pipeline_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.pipeline_lock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        // A poisoned session mutex means a panicked holder; the state itself
        // is still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -- Outbound --

    /// Serialize and enqueue a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns [`WallaceError::Connection`] when the writer task is gone.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = msg.to_json()?;
        self.outbound
            .send(Outbound::Text(json))
            .map_err(|_| WallaceError::Connection("outbound channel closed".to_owned()))
    }

    /// Enqueue a binary PCM frame.
    ///
    /// # Errors
    ///
    /// Returns [`WallaceError::Connection`] when the writer task is gone.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .send(Outbound::Binary(frame))
            .map_err(|_| WallaceError::Connection("outbound channel closed".to_owned()))
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    // -- State machine --

    /// Current pipeline state.
    pub fn state(&self) -> PipelineState {
        self.lock().state
    }

    /// Transition along a table edge.
    ///
    /// # Errors
    ///
    /// Returns [`WallaceError::InvalidTransition`] for any off-table edge
    /// and leaves the state unchanged.
    pub fn transition(&self, to: PipelineState) -> Result<()> {
        let mut state = self.lock();
        if !state.state.allows(to) {
            return Err(WallaceError::InvalidTransition {
                from: state.state.as_str(),
                to: to.as_str(),
            });
        }
        state.state = to;
        Ok(())
    }

    /// Reset to idle outside the table (cancellation and error recovery).
    pub fn force_idle(&self) {
        self.lock().state = PipelineState::Idle;
    }

    // -- Audio buffer --

    /// Append an inbound binary frame to the audio buffer.
    pub fn append_audio(&self, data: &[u8]) {
        self.lock().audio_buffer.extend_from_slice(data);
    }

    /// Drain the buffer and convert to normalized f32 samples.
    ///
    /// Samples are 16-bit little-endian; a trailing odd byte is discarded.
    pub fn take_audio(&self) -> Vec<f32> {
        let bytes = std::mem::take(&mut self.lock().audio_buffer);
        bytes
            .chunks_exact(2)
            .map(|pair| {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                f32::from(sample) / 32768.0
            })
            .collect()
    }

    /// Discard buffered audio.
    pub fn clear_audio(&self) {
        self.lock().audio_buffer.clear();
    }

    /// Buffered byte count (diagnostics and tests).
    pub fn audio_len(&self) -> usize {
        self.lock().audio_buffer.len()
    }

    // -- Mode flags --

    pub fn personality(&self) -> Personality {
        self.lock().personality
    }

    pub fn set_personality(&self, personality: Personality) {
        self.lock().personality = personality;
    }

    pub fn treehouse_mode(&self) -> bool {
        self.lock().treehouse_mode
    }

    pub fn set_treehouse_mode(&self, enabled: bool) {
        self.lock().treehouse_mode = enabled;
    }

    pub fn tts_backend(&self) -> TtsBackendKind {
        self.lock().tts_backend
    }

    pub fn set_tts_backend(&self, backend: TtsBackendKind) {
        self.lock().tts_backend = backend;
    }

    pub fn proximity_present(&self) -> bool {
        self.lock().proximity_present
    }

    pub fn set_proximity_present(&self, present: bool) {
        self.lock().proximity_present = present;
    }

    pub fn wakeword_confirmed(&self) -> bool {
        self.lock().wakeword_confirmed
    }

    pub fn set_wakeword_confirmed(&self, confirmed: bool) {
        self.lock().wakeword_confirmed = confirmed;
    }

    pub fn device_state(&self) -> Option<DeviceStateInfo> {
        self.lock().device_state.clone()
    }

    pub fn set_device_state(&self, info: DeviceStateInfo) {
        self.lock().device_state = Some(info);
    }

    // -- Heartbeat --

    /// Record a heartbeat now.
    pub fn touch_heartbeat(&self) {
        self.lock().last_heartbeat = Instant::now();
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self) -> std::time::Duration {
        self.lock().last_heartbeat.elapsed()
    }

    // -- Sensor cache --

    /// Snapshot of the cached sensor readings.
    pub fn sensor(&self) -> SensorData {
        self.lock().sensor
    }

    /// Mutate the cached sensor readings in place.
    pub fn with_sensor_mut(&self, f: impl FnOnce(&mut SensorData)) {
        f(&mut self.lock().sensor);
    }

    // -- Chat history --

    /// Append one completed turn (user utterance + assistant reply).
    pub fn push_turn(&self, user: impl Into<String>, assistant: impl Into<String>) {
        let mut state = self.lock();
        state.chat_history.push(ChatEntry {
            role: ChatRole::User,
            content: user.into(),
        });
        state.chat_history.push(ChatEntry {
            role: ChatRole::Assistant,
            content: assistant.into(),
        });
    }

    /// The most recent `2 * max_turns` history entries.
    pub fn history_window(&self, max_turns: usize) -> Vec<ChatEntry> {
        let state = self.lock();
        let keep = max_turns.saturating_mul(2);
        let start = state.chat_history.len().saturating_sub(keep);
        state.chat_history[start..].to_vec()
    }

    /// Total history entry count.
    pub fn history_len(&self) -> usize {
        self.lock().chat_history.len()
    }

    /// Drop all history (personality switches start fresh).
    pub fn clear_history(&self) {
        self.lock().chat_history.clear();
    }

    // -- Memory --

    /// Clone of the in-memory user profile.
    pub fn memory(&self) -> UserMemory {
        self.lock().memory.clone()
    }

    /// Replace the user profile (load and reconnect inheritance).
    pub fn set_memory(&self, memory: UserMemory) {
        self.lock().memory = memory;
    }

    /// Mutate the user profile in place.
    pub fn with_memory_mut(&self, f: impl FnOnce(&mut UserMemory)) {
        f(&mut self.lock().memory);
    }

    /// Attach the persistence handle for this user's memory.
    pub fn set_memory_store(&self, store: Arc<crate::memory::MemoryStore>) {
        self.lock().memory_store = Some(store);
    }

    /// The persistence handle, when one is attached.
    pub fn memory_store(&self) -> Option<Arc<crate::memory::MemoryStore>> {
        self.lock().memory_store.clone()
    }

    // -- Task handles --

    /// Install the running pipeline's handle.
    pub fn install_pipeline(&self, handle: PipelineHandle) {
        self.lock().pipeline = Some(handle);
    }

    /// Take the running pipeline's handle, if any.
    pub fn take_pipeline(&self) -> Option<PipelineHandle> {
        self.lock().pipeline.take()
    }

    /// Install the running random-fact push's handle.
    pub fn install_fact_task(&self, handle: PipelineHandle) {
        self.lock().fact_task = Some(handle);
    }

    /// Take the running random-fact push's handle, if any.
    pub fn take_fact_task(&self) -> Option<PipelineHandle> {
        self.lock().fact_task.take()
    }
}

/// Process-wide map of user id → active session.
///
/// The mutex is held only for map operations, never across I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert a session, returning the one it displaced.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.lock().insert(session.user_id().to_owned(), session)
    }

    /// Look up the active session for a user.
    pub fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.lock().get(user_id).cloned()
    }

    /// Remove the entry for `user_id` only if it still points at `session`.
    ///
    /// A disconnecting connection must not tear down a newer session that
    /// already reclaimed the slot.
    pub fn remove_if_same(&self, user_id: &str, session: &Arc<Session>) -> bool {
        let mut map = self.lock();
        match map.get(user_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                map.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all active sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock().values().cloned().collect()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether any session is active.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
