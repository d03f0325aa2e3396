use axum::response::IntoResponse;

use crate::stream::DecodeError;

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please try again later.";
pub const INVALID_KEY_MESSAGE: &str = "Invalid API key, please check the configuration.";
pub const REPLY_FAILED_MESSAGE: &str = "Failed to get a reply";

/// Error type shared by the proxy, the chat client, and the session.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("{0} is not configured")]
    MissingCredential(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("A reply is already being generated")]
    Busy,
    #[error("No previous message to regenerate")]
    NothingToRegenerate,
    #[error("Request cancelled")]
    Cancelled,
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    Conflict,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        409 => ErrorCategory::Conflict,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl ChatError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            ChatError::Auth(_) => ErrorCategory::Authentication,
            ChatError::NotFound(_) => ErrorCategory::NotFound,
            ChatError::Busy | ChatError::NothingToRegenerate => ErrorCategory::Conflict,
            ChatError::Config(_)
            | ChatError::MissingCredential(_)
            | ChatError::Transport(_)
            | ChatError::Decode(_)
            | ChatError::Storage(_)
            | ChatError::Cancelled => ErrorCategory::ServerError,
            ChatError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// Whether the error came from the connection or the byte stream rather
    /// than from a well-formed upstream reply.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::Decode(_))
    }

    /// Text suitable for a toast or an `{ "error" }` body.
    ///
    /// Upstream messages are passed through verbatim; everything else is the
    /// short form without the category prefix.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Upstream { message, .. } if !message.is_empty() => message.clone(),
            ChatError::Upstream { status: 429, .. } => RATE_LIMIT_MESSAGE.to_string(),
            ChatError::Upstream { status: 401, .. } => INVALID_KEY_MESSAGE.to_string(),
            ChatError::Upstream { .. } => REPLY_FAILED_MESSAGE.to_string(),
            ChatError::Config(msg)
            | ChatError::Auth(msg)
            | ChatError::InvalidRequest(msg)
            | ChatError::Transport(msg)
            | ChatError::Storage(msg)
            | ChatError::NotFound(msg) => msg.clone(),
            ChatError::Decode(err) => err.to_string(),
            ChatError::MissingCredential(_)
            | ChatError::Busy
            | ChatError::NothingToRegenerate
            | ChatError::Cancelled => self.to_string(),
        }
    }

    /// Status code the proxy answers with.
    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        http_status_for_category(self.category())
    }
}

/// Translate a non-2xx upstream reply into the error the proxy returns.
///
/// 429 and 401 keep their status with fixed messages; every other status
/// becomes a 500 carrying `prefix` followed by the upstream body text.
#[must_use]
pub fn upstream_failure(status: u16, body_text: &str, prefix: &str) -> ChatError {
    match status {
        429 => ChatError::Upstream {
            status,
            message: RATE_LIMIT_MESSAGE.to_string(),
        },
        401 => ChatError::Upstream {
            status,
            message: INVALID_KEY_MESSAGE.to_string(),
        },
        _ => ChatError::Upstream {
            status: 500,
            message: format!("{prefix}{body_text}"),
        },
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Category -> HTTP status code
// ---------------------------------------------------------------------------

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::Conflict => http::StatusCode::CONFLICT,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ---------------------------------------------------------------------------
// Axum integration
// ---------------------------------------------------------------------------

/// Format an error as `(status, { "error": message })`.
#[must_use]
pub fn format_error(err: &ChatError) -> (http::StatusCode, serde_json::Value) {
    (
        err.http_status(),
        serde_json::json!({ "error": err.user_message() }),
    )
}

/// Convert a `ChatError` into a JSON response carrying the CORS headers.
#[must_use]
pub fn into_axum_response(err: &ChatError) -> axum::response::Response {
    let (status, body) = format_error(err);
    let mut response = (status, axum::Json(body)).into_response();
    crate::api::cors::apply_cors_headers(response.headers_mut());
    response
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        into_axum_response(&self)
    }
}
