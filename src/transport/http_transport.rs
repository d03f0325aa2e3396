use std::sync::Arc;
use std::sync::{Once, OnceLock};
use std::time::Duration;

use http::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::ChatError;

static RUSTLS_PROVIDER_INIT: Once = Once::new();
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const URL_CACHE_CAPACITY: usize = 512;

const MAX_RETRIES: u32 = 2;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(1);
const QUICK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Lowercase fragments of transport errors worth another attempt. The flag
/// marks a dropped connection, which is retried almost immediately instead of
/// backing off.
const RETRYABLE_ERRORS: [(&str, bool); 9] = [
    ("connection reset", true),
    ("connection aborted", true),
    ("broken pipe", true),
    ("http2 error", true),
    ("unexpected eof", true),
    ("stream closed", true),
    ("timed out", false),
    ("timeout", false),
    ("connection refused", false),
];

/// Pool and timeout settings for one [`HttpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Option<Duration>,
    pub timeout: Duration,
    pub use_env_proxy: bool,
}

impl TransportOptions {
    /// Options for proxy-to-upstream calls.
    #[must_use]
    pub fn from_server(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        Self {
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            timeout: Duration::from_secs(config.timeout),
            use_env_proxy: config.http_use_env_proxy,
        }
    }

    /// Options for the chat client talking to the proxy.
    #[must_use]
    pub fn from_client(config: &ClientConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout),
            ..Self::default()
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_server(&ServerConfig::default())
    }
}

fn build_reqwest_client(options: &TransportOptions) -> Result<reqwest::Client, ChatError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .pool_idle_timeout(options.pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(options.timeout);

    if !options.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| ChatError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Pooled HTTP client for JSON POSTs whose responses may be streamed.
pub struct HttpTransport {
    client: OnceLock<Arc<reqwest::Client>>,
    parsed_url_cache: RwLock<FxHashMap<String, Arc<url::Url>>>,
    options: TransportOptions,
}

impl HttpTransport {
    /// Create a new transport with connection pooling and timeouts from the given server config.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_options(TransportOptions::from_server(config))
    }

    #[must_use]
    pub fn with_options(options: TransportOptions) -> Self {
        RUSTLS_PROVIDER_INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });

        Self {
            client: OnceLock::new(),
            parsed_url_cache: RwLock::new(FxHashMap::default()),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> TransportOptions {
        self.options
    }

    fn build_client(&self) -> Arc<reqwest::Client> {
        match build_reqwest_client(&self.options) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build configured reqwest client, falling back to default client");
                Arc::new(reqwest::Client::new())
            }
        }
    }

    fn client(&self) -> Arc<reqwest::Client> {
        if let Some(existing) = self.client.get() {
            return existing.clone();
        }

        let built = self.build_client();
        let _ = self.client.set(built.clone());
        self.client.get().cloned().unwrap_or(built)
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, ChatError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| ChatError::Transport(format!("Invalid upstream URL: {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= URL_CACHE_CAPACITY {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// POST a JSON body with an optional bearer token.
    ///
    /// Any status is returned as a response; only connection-level failures
    /// are retried. The caller decides whether to buffer or stream the body.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] when URL parsing fails, request
    /// execution fails, or retries are exhausted.
    pub async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, ChatError> {
        let parsed_url = self.parsed_url(url)?;
        let headers = json_headers(bearer)?;
        let client = self.client();

        let mut attempt = 0;
        loop {
            let mut request = reqwest::Request::new(http::Method::POST, parsed_url.as_ref().clone());
            *request.headers_mut() = headers.clone();
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));

            match client.execute(request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let message = error_chain_message(&err);
                    let delay = match retry_delay(&message, attempt) {
                        Some(delay) if attempt < MAX_RETRIES => delay,
                        _ => return Err(ChatError::Transport(message)),
                    };
                    tracing::debug!(
                        url,
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Wait before the next attempt, or `None` when the error is not transient.
fn retry_delay(message: &str, attempt: u32) -> Option<Duration> {
    let message = message.to_ascii_lowercase();
    let mut dropped = None;
    for (fragment, quick) in RETRYABLE_ERRORS {
        if message.contains(fragment) {
            dropped = Some(dropped.unwrap_or(false) || quick);
        }
    }
    Some(match (dropped?, attempt) {
        (true, 0) => Duration::ZERO,
        (true, _) => QUICK_RETRY_DELAY,
        (false, _) => backoff(attempt),
    })
}

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1 << attempt.min(10))
        .min(BACKOFF_CAP)
}

/// `reqwest` hides the io error behind "error sending request"; include the
/// source chain so the retry policy can see it.
fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn json_headers(bearer: Option<&str>) -> Result<http::HeaderMap, ChatError> {
    let mut headers = http::HeaderMap::with_capacity(3);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
    if let Some(token) = bearer {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ChatError::Config("API key contains invalid header characters".into()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_lazy() {
        let transport = HttpTransport::new(&ServerConfig::default());
        assert!(transport.client.get().is_none());
        let first = transport.client();
        let second = transport.client();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_options_from_server() {
        let options = TransportOptions::from_server(&ServerConfig {
            http_pool_idle_timeout_secs: 0,
            http_pool_max_idle_per_host: 0,
            timeout: 30,
            ..ServerConfig::default()
        });
        assert_eq!(options.pool_idle_timeout, None);
        assert_eq!(options.pool_max_idle_per_host, 1);
        assert_eq!(options.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_options_from_client_timeout() {
        let options = TransportOptions::from_client(&ClientConfig {
            timeout: 12,
            ..ClientConfig::default()
        });
        assert_eq!(options.timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_parsed_url_cache_hit() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let url = "https://open.bigmodel.cn/api/paas/v4/chat/completions";

        let first = transport.parsed_url(url).unwrap();
        let second = transport.parsed_url(url).unwrap();

        assert_eq!(first.as_ref(), second.as_ref());
        assert_eq!(transport.parsed_url_cache.read().len(), 1);
    }

    #[test]
    fn test_parsed_url_cache_is_bounded() {
        let transport = HttpTransport::new(&ServerConfig::default());
        for idx in 0..(URL_CACHE_CAPACITY + 32) {
            let url = format!("https://api.example.com/v1/images/{idx}");
            let _ = transport.parsed_url(&url).unwrap();
        }
        assert!(transport.parsed_url_cache.read().len() <= URL_CACHE_CAPACITY);
    }

    #[test]
    fn test_dropped_connection_retries_quickly() {
        assert_eq!(retry_delay("connection reset by peer", 0), Some(Duration::ZERO));
        assert_eq!(
            retry_delay("unexpected EOF while reading", 1),
            Some(QUICK_RETRY_DELAY)
        );
        assert_eq!(
            retry_delay("upstream failed with HTTP2 error: stream closed", 0),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_timeouts_back_off() {
        assert_eq!(
            retry_delay("operation timed out waiting for response", 0),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            retry_delay("error sending request: Connection refused (os error 111)", 1),
            Some(Duration::from_millis(200))
        );
        assert_eq!(backoff(30), BACKOFF_CAP);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        assert_eq!(retry_delay("invalid certificate", 0), None);
        assert_eq!(retry_delay("builder error: relative URL without a base", 0), None);
    }

    #[test]
    fn test_parsed_url_invalid() {
        let transport = HttpTransport::new(&ServerConfig::default());
        let err = transport.parsed_url("://bad-url").unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[test]
    fn test_json_headers_bearer() {
        let headers = json_headers(Some("sk-1")).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-1");
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
        assert!(json_headers(None).unwrap().get(AUTHORIZATION).is_none());
        assert!(json_headers(Some("bad\nkey")).is_err());
    }

    #[tokio::test]
    async fn test_post_json_refused_connection_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(&ServerConfig::default());
        let err = transport
            .post_json(&format!("http://{addr}/x"), None, bytes::Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }
}
