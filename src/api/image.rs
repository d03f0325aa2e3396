//! `POST /functions/v1/generate-image`: text-to-image through the image
//! upstream, answering with the first generated URL.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::cors::json_response;
use crate::error::{into_axum_response, upstream_failure, ChatError};
use crate::state::AppState;
use crate::wire::{ImageRequest, ImageResponse};

pub const UPSTREAM_ERROR_PREFIX: &str = "Image generation failed: ";
pub const MISSING_IMAGE_MESSAGE: &str = "Failed to obtain the generated image";
const MAX_SIDE: u32 = 4096;

#[derive(Debug, Serialize)]
struct UpstreamImageBody<'a> {
    model: &'a str,
    prompt: &'a str,
    size: String,
    response_format: &'static str,
    n: u32,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamImageReply {
    #[serde(default)]
    data: Option<Vec<UpstreamImage>>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamImage {
    #[serde(default)]
    url: Option<String>,
}

impl UpstreamImageReply {
    fn first_url(self) -> Option<String> {
        self.data?
            .into_iter()
            .next()?
            .url
            .filter(|url| !url.is_empty())
    }
}

pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let request_id = state.next_request_id();
    match handle(&state, &headers, &body, request_id).await {
        Ok(reply) => json_response(&reply),
        Err(err) => {
            tracing::error!(%request_id, error = %err, "image generation failed");
            into_axum_response(&err)
        }
    }
}

async fn handle(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    request_id: uuid::Uuid,
) -> Result<ImageResponse, ChatError> {
    state.authenticate(headers)?;
    let request: ImageRequest = serde_json::from_slice(body)
        .map_err(|err| ChatError::InvalidRequest(format!("Invalid JSON body: {err}")))?;
    let api_key = state.image_api_key()?;
    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(ChatError::InvalidRequest("Prompt is required".to_string()));
    }

    let image = &state.config.image;
    let width = request.width.unwrap_or(image.default_width);
    let height = request.height.unwrap_or(image.default_height);
    if width == 0 || height == 0 || width > MAX_SIDE || height > MAX_SIDE {
        return Err(ChatError::InvalidRequest(format!(
            "Image size must be within 1..={MAX_SIDE} on each side"
        )));
    }

    tracing::info!(%request_id, width, height, prompt_chars = prompt.chars().count(), "generating image");

    let upstream_body = serde_json::to_vec(&UpstreamImageBody {
        model: &image.model,
        prompt,
        size: format!("{width}x{height}"),
        response_format: "url",
        n: 1,
    })
    .map_err(|err| ChatError::InvalidRequest(format!("Failed to encode upstream body: {err}")))?;

    let response = state
        .transport
        .post_json(&image.url, Some(&api_key), bytes::Bytes::from(upstream_body))
        .await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        tracing::error!(%request_id, status = status.as_u16(), body = %text, "image upstream error");
        return Err(upstream_failure(
            status.as_u16(),
            &text,
            UPSTREAM_ERROR_PREFIX,
        ));
    }

    let reply: UpstreamImageReply = serde_json::from_str(&text).unwrap_or_else(|err| {
        tracing::error!(%request_id, error = %err, "image upstream reply is not valid JSON");
        UpstreamImageReply::default()
    });
    let Some(image_url) = reply.first_url() else {
        tracing::error!(%request_id, body = %text, "no image URL in upstream reply");
        return Err(ChatError::Upstream {
            status: 500,
            message: MISSING_IMAGE_MESSAGE.to_string(),
        });
    };

    Ok(ImageResponse {
        success: true,
        image_url,
        prompt: prompt.to_string(),
    })
}
