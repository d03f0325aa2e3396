//! `POST /functions/v1/chat`: forward a conversation to the chat completion
//! upstream and stream its SSE body back unchanged.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::Response;
use http::HeaderMap;
use serde::Serialize;

use super::cors::apply_cors_headers;
use super::search::fetch_search_context;
use crate::config::ChatConfig;
use crate::error::{into_axum_response, upstream_failure, ChatError};
use crate::state::AppState;
use crate::wire::{ApiMessage, ChatRequest, Role};

pub const UPSTREAM_ERROR_PREFIX: &str = "AI service error: ";

#[derive(Debug, Serialize)]
struct UpstreamChatBody<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    stream: bool,
    temperature: f32,
    top_p: f32,
    thinking: Thinking,
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl Thinking {
    fn new(enabled: bool) -> Self {
        Self {
            kind: if enabled { "enabled" } else { "disabled" },
        }
    }
}

pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let request_id = state.next_request_id();
    let started = Instant::now();
    match handle(&state, &headers, &body, request_id).await {
        Ok(response) => {
            tracing::debug!(
                %request_id,
                elapsed_ms = started.elapsed().as_millis(),
                "chat stream opened"
            );
            response
        }
        Err(err) => {
            tracing::error!(%request_id, error = %err, "chat request failed");
            into_axum_response(&err)
        }
    }
}

async fn handle(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    request_id: uuid::Uuid,
) -> Result<Response, ChatError> {
    state.authenticate(headers)?;
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|err| ChatError::InvalidRequest(format!("Invalid JSON body: {err}")))?;
    if request.messages.is_empty() {
        return Err(ChatError::InvalidRequest(
            "messages cannot be empty".to_string(),
        ));
    }
    let api_key = state.chat_api_key()?;
    let chat = &state.config.chat;

    if let Some(requested) = request.model.as_deref() {
        if requested != chat.model {
            tracing::debug!(%request_id, requested, model = %chat.model, "ignoring client model selection");
        }
    }

    let ChatRequest {
        mut messages,
        search,
        think,
        ..
    } = request;

    if search && state.config.web_search.enabled {
        let query = messages.last().map_or("", |m| m.content.as_str());
        if let Some(context) =
            fetch_search_context(&state.transport, &state.config.web_search, &api_key, query).await
        {
            if let Some(last) = messages.last_mut() {
                last.content.push_str(&context);
            }
        }
    }

    tracing::info!(
        %request_id,
        model = %chat.model,
        search,
        think,
        messages = messages.len(),
        "calling chat upstream"
    );

    let upstream_body = build_upstream_body(chat, messages, think)?;
    let response = state
        .transport
        .post_json(&chat.completions_url(), Some(&api_key), upstream_body)
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        tracing::error!(%request_id, status = status.as_u16(), body = %text, "chat upstream error");
        return Err(upstream_failure(
            status.as_u16(),
            &text,
            UPSTREAM_ERROR_PREFIX,
        ));
    }

    Ok(streaming_response(response))
}

/// Build the upstream body: system prompt first, streaming on, thinking
/// switched by `think`.
pub(crate) fn build_upstream_body(
    chat: &ChatConfig,
    messages: Vec<ApiMessage>,
    think: bool,
) -> Result<bytes::Bytes, ChatError> {
    let mut all = Vec::with_capacity(messages.len() + 1);
    all.push(ApiMessage::new(Role::System, chat.system_prompt.clone()));
    all.extend(messages);
    let body = UpstreamChatBody {
        model: &chat.model,
        messages: all,
        stream: true,
        temperature: chat.temperature,
        top_p: chat.top_p,
        thinking: Thinking::new(think),
    };
    serde_json::to_vec(&body)
        .map(bytes::Bytes::from)
        .map_err(|err| ChatError::InvalidRequest(format!("Failed to encode upstream body: {err}")))
}

fn streaming_response(response: reqwest::Response) -> Response {
    let body = axum::body::Body::from_stream(response.bytes_stream());
    let mut passthrough = Response::new(body);
    let headers = passthrough.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    apply_cors_headers(headers);
    passthrough
}
