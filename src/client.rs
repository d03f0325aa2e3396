//! Client for the proxy functions, used by [`crate::session::ChatSession`].

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::config::ClientConfig;
use crate::error::{ChatError, REPLY_FAILED_MESSAGE};
use crate::routing::{CHAT_PATH, IMAGE_PATH};
use crate::transport::{HttpTransport, TransportOptions};
use crate::wire::{ChatRequest, ErrorBody, ImageRequest, ImageResponse};

const IMAGE_FAILED_MESSAGE: &str = "Image generation failed";

/// Response body of a chat turn, as raw transport chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/// Opens the SSE stream of one chat turn.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send `request` and return the streaming body once the reply status is
    /// known to be successful.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Upstream` carrying the proxy's `{ error }` text for
    /// non-2xx replies, or `ChatError::Transport` when the request fails.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub image_url: String,
    pub prompt: String,
}

/// reqwest-backed [`ChatBackend`] talking to a running proxy.
pub struct HttpChatClient {
    transport: HttpTransport,
    base_url: String,
    publishable_key: Option<String>,
    model: Option<String>,
}

impl HttpChatClient {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            transport: HttpTransport::with_options(TransportOptions::from_client(config)),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            publishable_key: config.publishable_key.clone(),
            model: config.model.clone(),
        }
    }

    #[must_use]
    pub fn chat_url(&self) -> String {
        format!("{}{CHAT_PATH}", self.base_url)
    }

    #[must_use]
    pub fn image_url(&self) -> String {
        format!("{}{IMAGE_PATH}", self.base_url)
    }

    /// Generate an image through the image proxy.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Upstream` with the proxy's error text on failure,
    /// or `ChatError::Transport` when the request cannot be sent.
    pub async fn generate_image(
        &self,
        prompt: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<GeneratedImage, ChatError> {
        let body = serde_json::to_vec(&ImageRequest {
            prompt: prompt.to_string(),
            width,
            height,
        })
        .map_err(|err| ChatError::InvalidRequest(format!("Failed to encode request: {err}")))?;
        let response = self
            .transport
            .post_json(
                &self.image_url(),
                self.publishable_key.as_deref(),
                Bytes::from(body),
            )
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &text, IMAGE_FAILED_MESSAGE));
        }
        let reply: ImageResponse = serde_json::from_str(&text).map_err(|err| {
            ChatError::Transport(format!("Invalid image proxy reply: {err}"))
        })?;
        Ok(GeneratedImage {
            image_url: reply.image_url,
            prompt: reply.prompt,
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        let mut request = request.clone();
        if request.model.is_none() {
            request.model.clone_from(&self.model);
        }
        let body = serde_json::to_vec(&request)
            .map_err(|err| ChatError::InvalidRequest(format!("Failed to encode request: {err}")))?;
        let response = self
            .transport
            .post_json(
                &self.chat_url(),
                self.publishable_key.as_deref(),
                Bytes::from(body),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &text, REPLY_FAILED_MESSAGE));
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ChatError::from)),
        ))
    }
}

/// Surface the proxy's `{ "error": ... }` text verbatim, or `fallback` when
/// the body carries none.
fn error_from_body(status: u16, body: &str, fallback: &str) -> ChatError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| fallback.to_string());
    ChatError::Upstream { status, message }
}
