pub mod chat;
pub mod error;
pub mod streaming;
pub mod types;

use axum::routing::post;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use higgs_core::ChatServing;

/// Model name reported when none is configured.
pub const DEFAULT_MODEL_NAME: &str = "higgs-audio";

#[derive(Clone)]
pub struct AppState {
    pub serving: ChatServing,
    pub model_name: String,
    /// Reject requests naming another model. Off when no name was configured.
    enforce_model_name: bool,
}

impl AppState {
    pub fn new(serving: ChatServing, served_model_name: Option<String>) -> Self {
        Self {
            serving,
            enforce_model_name: served_model_name.is_some(),
            model_name: served_model_name.unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
        }
    }

    pub fn serves_model(&self, model: &str) -> bool {
        !self.enforce_model_name || model == self.model_name
    }
}

pub fn create_router(state: AppState) -> Router {
    create_router_with_cors(state, CorsLayer::very_permissive())
}

pub fn create_router_with_cors(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::create_chat_completion))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
