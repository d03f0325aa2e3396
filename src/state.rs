mod request_id;

use crate::auth::{authenticate, build_allowed_key_set, AllowedClientKeys};
use crate::config::{resolve_api_key, AppConfig};
use crate::error::ChatError;
use crate::transport::HttpTransport;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    allowed_client_keys: AllowedClientKeys,
    request_ids: RequestIdGenerator,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        let allowed_client_keys = build_allowed_key_set(&config);
        Self {
            config,
            transport,
            allowed_client_keys,
            request_ids: RequestIdGenerator::new(),
        }
    }

    /// Build state with a transport configured from `config.server`.
    #[must_use]
    pub fn from_config(config: AppConfig) -> Self {
        let transport = HttpTransport::new(&config.server);
        Self::new(config, transport)
    }

    #[must_use]
    pub fn next_request_id(&self) -> uuid::Uuid {
        self.request_ids.next_id()
    }

    /// Authenticate a proxy request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Auth` when the API key is missing or invalid.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<(), ChatError> {
        authenticate(headers, &self.allowed_client_keys)
    }

    /// Key for the chat completion and web search upstream.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::MissingCredential` naming the environment variable.
    pub fn chat_api_key(&self) -> Result<String, ChatError> {
        let chat = &self.config.chat;
        resolve_api_key(chat.api_key.as_deref(), &chat.api_key_env)
            .ok_or_else(|| ChatError::MissingCredential(chat.api_key_env.clone()))
    }

    /// Key for the image generation upstream.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::MissingCredential` naming the environment variable.
    pub fn image_api_key(&self) -> Result<String, ChatError> {
        let image = &self.config.image;
        resolve_api_key(image.api_key.as_deref(), &image.api_key_env)
            .ok_or_else(|| ChatError::MissingCredential(image.api_key_env.clone()))
    }
}
