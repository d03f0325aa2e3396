use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use super::cors::json_response;
use crate::config::resolve_api_key;
use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let config = &state.config;
    json_response(&json!({
        "status": "zchat-proxy is running",
        "config": {
            "chat_model": config.chat.model,
            "image_model": config.image.model,
            "web_search_enabled": config.web_search.enabled,
            "chat_key_configured": resolve_api_key(config.chat.api_key.as_deref(), &config.chat.api_key_env).is_some(),
            "image_key_configured": resolve_api_key(config.image.api_key.as_deref(), &config.image.api_key_env).is_some(),
            "client_keys_count": config.client_authentication.allowed_keys.len(),
            "features": {
                "log_level": config.features.log_level,
                "log_format": config.features.log_format.to_string(),
            }
        }
    }))
}
