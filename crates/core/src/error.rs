//! Errors surfaced by response assembly.

use thiserror::Error;

use crate::audio::AudioError;
use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum ServeError {
    /// The request or an engine output does not have the expected shape.
    #[error("{0}")]
    Validation(String),
    /// A reasoning or tool-call extractor could not be created for the request.
    #[error("failed to initialize {kind} extractor: {message}")]
    ExtractorSetup { kind: &'static str, message: String },
    /// The consumer went away while a step was pending.
    #[error("Client disconnected")]
    ClientDisconnected,
    #[error(transparent)]
    Engine(EngineError),
    #[error("audio synthesis failed: {0}")]
    Audio(#[from] AudioError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ServeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Cancelled => Self::ClientDisconnected,
            other => Self::Engine(other),
        }
    }
}

impl ServeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Errors caused by the request itself rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ExtractorSetup { .. })
    }
}
