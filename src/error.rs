//! Error types for the Wallace server core.

/// Top-level error type for the session controller and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum WallaceError {
    /// Inbound frame failed validation (bad JSON, unknown type, missing field).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A pipeline state transition that is not in the transition table.
    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition {
        /// State the session was in.
        from: &'static str,
        /// State that was requested.
        to: &'static str,
    },

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Dialog model error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Smart-home actuation error.
    #[error("smart home error: {0}")]
    SmartHome(String),

    /// An operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// User memory could not be persisted.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Socket closed or unusable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, WallaceError>;
