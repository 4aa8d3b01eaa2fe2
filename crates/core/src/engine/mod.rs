//! Interface to the external generation engine.
//!
//! The engine owns scheduling and model execution. This crate only consumes
//! its ordered per-step output stream and may ask it to abort a request.

mod handle;
mod types;

use async_trait::async_trait;

pub use handle::EngineHandle;
pub use types::{
    AudioRow, CompletionOutput, EngineCommand, EngineError, FinishReason, GenerationRequest,
    GenerationStream, RequestOutput, TokenLogprob, TopLogprob, AUDIO_SEGMENT_SENTINEL,
};

/// Client side of a generation engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Submit a request and receive its ordered step outputs.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, EngineError>;

    /// Ask the engine to stop a request and release its resources.
    async fn abort(&self, request_id: &str) -> Result<(), EngineError>;
}
