use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::StreamExt;

use higgs_core::engine::EngineClient;
use higgs_core::{ChatStream, ServeError, StreamItem};

use super::error::ApiError;
use super::types::ChatCompletionChunk;

/// Handle for aborting an engine request on client disconnect.
#[derive(Clone)]
pub struct AbortHandle {
    engine: Arc<dyn EngineClient>,
    request_id: String,
}

impl AbortHandle {
    pub fn new(engine: Arc<dyn EngineClient>, request_id: String) -> Self {
        Self { engine, request_id }
    }
}

/// Aborts the engine request when dropped before the stream completed.
///
/// axum drops the response body when the client closes the connection, which
/// drops this guard with it.
pub(super) struct AbortGuard {
    handle: Option<AbortHandle>,
}

impl AbortGuard {
    pub(super) fn new(handle: AbortHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// The request ran to completion; nothing to abort.
    pub(super) fn defuse(&mut self) {
        self.handle = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            tracing::info!(request_id = %h.request_id, "stream dropped, aborting request");
            tokio::spawn(async move {
                let _ = h.engine.abort(&h.request_id).await;
            });
        }
    }
}

fn json_event<T: serde::Serialize>(payload: &T) -> Event {
    Event::default().data(serde_json::to_string(payload).unwrap_or_default())
}

fn error_event(err: ServeError) -> Event {
    json_event(&ApiError::from(err).into_body())
}

/// Frame assembler output as `data:` events, terminated by `data: [DONE]`.
pub fn chat_completion_sse_stream(
    request_id: String,
    model: String,
    items: ChatStream,
    abort_handle: Option<AbortHandle>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id: Arc<str> = request_id.into();
    let model: Arc<str> = model.into();

    let output_stream = async_stream::stream! {
        let mut abort_guard = abort_handle.map(AbortGuard::new);
        let mut items = items;

        while let Some(item) = items.next().await {
            let event = match item {
                StreamItem::Frame(frame) => {
                    json_event(&ChatCompletionChunk::frame(&id, &model, frame))
                }
                StreamItem::Usage(usage) => json_event(&ChatCompletionChunk::usage(&id, &model, usage)),
                StreamItem::Error(err) => error_event(err),
                StreamItem::Done => {
                    if let Some(ref mut guard) = abort_guard {
                        guard.defuse();
                    }
                    Event::default().data("[DONE]")
                }
            };
            yield Ok::<_, Infallible>(event);
        }
    };

    Sse::new(output_stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use higgs_core::engine::FinishReason;
    use higgs_core::protocol::{ChatMessage, ChatRequest, StreamOptions};
    use higgs_core::testing::{finish_step, text_step, ScriptedEngine};
    use higgs_core::{ChatServing, ServingConfig};

    async fn body_to_data_lines(response: axum::response::Response) -> Vec<String> {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        text.lines()
            .filter(|l| l.starts_with("data: "))
            .map(|l| l.to_string())
            .collect()
    }

    fn parse_data_json(line: &str) -> serde_json::Value {
        serde_json::from_str(line.trim_start_matches("data: ")).unwrap()
    }

    fn request(include_usage: bool) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::text("user", "hi")],
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage,
                continuous_usage_stats: false,
            }),
            ..Default::default()
        }
    }

    async fn collect(engine: Arc<ScriptedEngine>, req: ChatRequest) -> Vec<String> {
        let serving = ChatServing::new(ServingConfig::default(), engine.clone());
        let response = serving.stream(&req).await.unwrap();
        let abort = AbortHandle::new(engine, response.request_id.clone());
        let sse = chat_completion_sse_stream(
            response.request_id,
            "test-model".to_string(),
            response.stream,
            Some(abort),
        );
        body_to_data_lines(sse.into_response()).await
    }

    #[tokio::test]
    async fn chat_stream_frames_then_usage_then_done() {
        let engine = Arc::new(ScriptedEngine::new(vec![1, 2, 3]));
        engine.push_script([
            vec![text_step(0, "Hel", &[10])],
            vec![finish_step(0, "lo", &[11], FinishReason::Stop)],
        ]);
        let lines = collect(engine.clone(), request(true)).await;

        assert_eq!(lines.last().unwrap(), "data: [DONE]");
        let role = parse_data_json(&lines[0]);
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");

        let content: String = lines
            .iter()
            .take(lines.len() - 1)
            .map(|l| parse_data_json(l))
            .filter_map(|j| j["choices"][0]["delta"]["content"].as_str().map(String::from))
            .collect();
        assert_eq!(content, "Hello");

        let usage = parse_data_json(&lines[lines.len() - 2]);
        assert_eq!(usage["choices"], serde_json::json!([]));
        assert_eq!(usage["usage"]["prompt_tokens"], 3);
        assert_eq!(usage["usage"]["completion_tokens"], 2);

        let terminal = parse_data_json(&lines[lines.len() - 3]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");

        // A completed stream must not abort.
        tokio::task::yield_now().await;
        assert!(engine.aborted().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_is_reported_in_stream() {
        use higgs_core::engine::EngineError;
        use higgs_core::testing::ScriptStep;

        let engine = Arc::new(ScriptedEngine::new(vec![1]));
        engine.push_script([
            ScriptStep::from(vec![text_step(0, "a", &[10])]),
            ScriptStep::Fail(EngineError::Generation("device lost".into())),
        ]);
        let lines = collect(engine, request(false)).await;

        let err = parse_data_json(&lines[lines.len() - 2]);
        assert_eq!(err["error"]["type"], "server_error");
        assert!(err["error"]["message"].as_str().unwrap().contains("device lost"));
        assert_eq!(lines.last().unwrap(), "data: [DONE]");
    }

    #[tokio::test]
    async fn dropped_guard_aborts_request() {
        let engine = Arc::new(ScriptedEngine::new(vec![1]));
        let guard = AbortGuard::new(AbortHandle::new(engine.clone(), "chatcmpl-x".to_string()));
        drop(guard);
        for _ in 0..10 {
            if !engine.aborted().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.aborted(), vec!["chatcmpl-x".to_string()]);
    }

    #[tokio::test]
    async fn defused_guard_does_nothing() {
        let engine = Arc::new(ScriptedEngine::new(vec![1]));
        let mut guard = AbortGuard::new(AbortHandle::new(engine.clone(), "chatcmpl-y".to_string()));
        guard.defuse();
        drop(guard);
        tokio::task::yield_now().await;
        assert!(engine.aborted().is_empty());
    }
}
