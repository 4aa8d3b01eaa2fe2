use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;

use higgs_core::protocol::ChatRequest;

use super::error::ApiError;
use super::streaming::{chat_completion_sse_stream, AbortHandle};
use super::types::ChatCompletionResponse;
use super::AppState;

pub async fn create_chat_completion(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if let Some(model) = req.model.as_deref() {
        if !state.serves_model(model) {
            return Err(ApiError::ModelNotFound(format!("model '{model}' not found")));
        }
    }
    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.model_name.clone());

    if req.stream {
        let response = state.serving.stream(&req).await?;
        let abort = AbortHandle::new(state.serving.engine(), response.request_id.clone());
        let sse = chat_completion_sse_stream(
            response.request_id,
            model,
            response.stream,
            Some(abort),
        );
        return Ok(sse.into_response());
    }

    let response = state.serving.complete(&req).await?;
    tracing::debug!(
        request_id = %response.request_id,
        choices = response.choices.len(),
        "chat completion finished"
    );
    Ok(Json(ChatCompletionResponse::new(model, response)).into_response())
}
