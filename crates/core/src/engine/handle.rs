//! EngineHandle - channel-backed client for an engine running in another task.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::types::{EngineCommand, EngineError, GenerationRequest, GenerationStream};
use super::EngineClient;

const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Handle to an engine task, cloneable for sharing across request handlers.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) cmd_tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(cmd_tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { cmd_tx }
    }
}

#[async_trait]
impl EngineClient for EngineHandle {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, EngineError> {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        self.cmd_tx
            .send(EngineCommand::Generate { request, output_tx })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        Ok(Box::pin(ReceiverStream::new(output_rx)))
    }

    /// Abort a running request. Unknown ids are a no-op on the engine side.
    async fn abort(&self, request_id: &str) -> Result<(), EngineError> {
        self.cmd_tx
            .send(EngineCommand::Abort {
                request_id: request_id.to_string(),
            })
            .await
            .map_err(|_| EngineError::Shutdown)
    }
}
