use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::state::EngineState;

/// Machine-readable error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AudioContext,
    MediaRecorder,
    ModuleLoad,
    ModuleProcess,
    AudioProcessing,
    Validation,
    Initialization,
    Permission,
    Unsupported,
    Network,
    FileSystem,
    InvalidTransition,
    Cleanup,
}

/// All errors produced by quell-core.
///
/// `Clone` so a single in-flight initialization result can be handed to every
/// concurrent caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuellError {
    #[error("audio context error: {0}")]
    AudioContext(String),

    #[error("media recorder error: {0}")]
    MediaRecorder(String),

    #[error("module load error: {0}")]
    ModuleLoad(String),

    #[error("module process error: {0}")]
    ModuleProcess(String),

    #[error("audio processing error: {0}")]
    AudioProcessing(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("illegal state transition: {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("cleanup error: {0}")]
    Cleanup(String),
}

impl QuellError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AudioContext(_) => ErrorCode::AudioContext,
            Self::MediaRecorder(_) => ErrorCode::MediaRecorder,
            Self::ModuleLoad(_) => ErrorCode::ModuleLoad,
            Self::ModuleProcess(_) => ErrorCode::ModuleProcess,
            Self::AudioProcessing(_) => ErrorCode::AudioProcessing,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Initialization(_) => ErrorCode::Initialization,
            Self::Permission(_) => ErrorCode::Permission,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Network(_) => ErrorCode::Network,
            Self::FileSystem(_) => ErrorCode::FileSystem,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::Cleanup(_) => ErrorCode::Cleanup,
        }
    }

    /// Snapshot of this error suitable for history and bridge events.
    pub fn record(&self) -> ErrorRecord {
        ErrorRecord {
            code: self.code(),
            message: self.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl From<std::io::Error> for QuellError {
    fn from(e: std::io::Error) -> Self {
        Self::FileSystem(e.to_string())
    }
}

impl From<hound::Error> for QuellError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => Self::FileSystem(io.to_string()),
            other => Self::AudioProcessing(format!("wav: {other}")),
        }
    }
}

/// User-visible failure: code plus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

pub type Result<T> = std::result::Result<T, QuellError>;
