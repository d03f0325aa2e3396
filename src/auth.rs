use crate::config::AppConfig;
use crate::error::ChatError;
use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashSet;

const APIKEY: HeaderName = HeaderName::from_static("apikey");

/// Compact key index used in hot-path authentication.
pub enum AllowedClientKeys {
    /// No keys configured: every caller is accepted.
    Disabled,
    Single { raw: Box<str>, bearer: Box<str> },
    Multiple(FxHashSet<String>),
}

/// Extract the client key from request headers.
///
/// `Authorization: Bearer <key>` is checked first, then the `apikey` header
/// that browser clients send alongside it.
///
/// # Errors
///
/// Returns `ChatError::Auth` when neither header carries a key.
pub fn extract_api_key(headers: &http::HeaderMap) -> Result<&str, ChatError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| headers.get(APIKEY).and_then(|v| v.to_str().ok()))
        .ok_or_else(|| ChatError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request by checking the extracted key against
/// pre-indexed `allowed_keys`.
///
/// # Errors
///
/// Returns `ChatError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    headers: &http::HeaderMap,
    allowed_keys: &AllowedClientKeys,
) -> Result<(), ChatError> {
    match allowed_keys {
        AllowedClientKeys::Disabled => Ok(()),
        AllowedClientKeys::Single { raw, bearer } => {
            authenticate_single_key(headers, raw.as_ref(), bearer.as_ref())
        }
        AllowedClientKeys::Multiple(allowed_set) => {
            let client_key = extract_api_key(headers)?;
            if allowed_set.contains(client_key) {
                Ok(())
            } else {
                Err(ChatError::Auth("Invalid API key".to_string()))
            }
        }
    }
}

fn authenticate_single_key(
    headers: &http::HeaderMap,
    raw_key: &str,
    bearer_key: &str,
) -> Result<(), ChatError> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        return if value.as_bytes() == bearer_key.as_bytes() {
            Ok(())
        } else {
            Err(ChatError::Auth("Invalid API key".to_string()))
        };
    }
    match headers.get(APIKEY) {
        Some(value) if value.as_bytes() == raw_key.as_bytes() => Ok(()),
        Some(_) => Err(ChatError::Auth("Invalid API key".to_string())),
        None => Err(ChatError::Auth("Missing API key".to_string())),
    }
}

/// Build a hash-set index for allowed client keys.
#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let mut allowed_set: FxHashSet<String> = config
        .client_authentication
        .allowed_keys
        .iter()
        .cloned()
        .collect();

    match allowed_set.len() {
        0 => AllowedClientKeys::Disabled,
        1 => match allowed_set.drain().next() {
            Some(single_key) => AllowedClientKeys::Single {
                bearer: format!("Bearer {single_key}").into_boxed_str(),
                raw: single_key.into_boxed_str(),
            },
            None => AllowedClientKeys::Disabled,
        },
        _ => AllowedClientKeys::Multiple(allowed_set),
    }
}
