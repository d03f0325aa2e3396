use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use zchat::config::{AppConfig, ChatConfig, ClientAuthConfig, ServerConfig, WebSearchConfig};
use zchat::error::{INVALID_KEY_MESSAGE, RATE_LIMIT_MESSAGE};
use zchat::routing::dispatch_request;
use zchat::state::AppState;

const SSE_BODY: &str = "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"Let me think\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Hello!\"}}]}\n\n\
data: [DONE]\n\n";

#[derive(Clone, Default)]
struct Captured {
    chat: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    search: Arc<Mutex<Vec<Value>>>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

async fn spawn_upstream(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, server)
}

/// Upstream that streams `SSE_BODY` and answers web searches with
/// `search_reply` under `search_status`.
fn streaming_upstream(
    captured: &Captured,
    search_status: StatusCode,
    search_reply: Value,
) -> Router {
    let chat = captured.chat.clone();
    let search = captured.search.clone();
    Router::new()
        .route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let chat = chat.clone();
                async move {
                    chat.lock().push((bearer(&headers), body));
                    ([(header::CONTENT_TYPE, "text/event-stream")], SSE_BODY)
                }
            }),
        )
        .route(
            "/web_search",
            post(move |Json(body): Json<Value>| {
                let search = search.clone();
                let reply = search_reply.clone();
                async move {
                    search.lock().push(body);
                    (search_status, Json(reply))
                }
            }),
        )
}

fn failing_upstream(status: StatusCode, text: &'static str) -> Router {
    Router::new().route("/chat/completions", post(move || async move { (status, text) }))
}

fn build_config(addr: SocketAddr) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        chat: ChatConfig {
            base_url: format!("http://{addr}"),
            api_key: Some("upstream-secret".to_string()),
            system_prompt: "You are a test assistant.".to_string(),
            ..ChatConfig::default()
        },
        web_search: WebSearchConfig {
            url: format!("http://{addr}/web_search"),
            ..WebSearchConfig::default()
        },
        client_authentication: ClientAuthConfig {
            allowed_keys: vec!["client-key".to_string()],
        },
        ..AppConfig::default()
    }
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/functions/v1/chat")
        .header("authorization", "Bearer client-key")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("serialize request")))
        .expect("build request")
}

async fn dispatch(state: Arc<AppState>, request: Request<Body>) -> Response {
    dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch")
}

async fn error_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read error body");
    let payload: Value = serde_json::from_slice(&body).expect("json error body");
    payload["error"].as_str().expect("error string").to_string()
}

#[tokio::test]
async fn test_chat_streams_upstream_body_unchanged() {
    let captured = Captured::default();
    let (addr, server) =
        spawn_upstream(streaming_upstream(&captured, StatusCode::OK, json!({}))).await;
    let state = Arc::new(AppState::from_config(build_config(addr)));

    let response = dispatch(
        state,
        chat_request(&json!({
            "messages": [{ "role": "user", "content": "Hi" }],
            "model": "some-other-model"
        })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("content type"),
        "text/event-stream"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("cors header"),
        "*"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read stream body");
    assert_eq!(body.as_ref(), SSE_BODY.as_bytes());

    let calls = captured.chat.lock().clone();
    assert_eq!(calls.len(), 1);
    let (auth, upstream) = &calls[0];
    assert_eq!(auth.as_deref(), Some("Bearer upstream-secret"));
    assert_eq!(upstream["model"], "glm-4.7");
    assert_eq!(upstream["stream"], true);
    assert_eq!(upstream["thinking"]["type"], "disabled");
    assert_eq!(upstream["messages"][0]["role"], "system");
    assert_eq!(upstream["messages"][0]["content"], "You are a test assistant.");
    assert_eq!(upstream["messages"][1]["content"], "Hi");
    assert!(captured.search.lock().is_empty());

    server.abort();
}

#[tokio::test]
async fn test_chat_think_flag_enables_thinking() {
    let captured = Captured::default();
    let (addr, server) =
        spawn_upstream(streaming_upstream(&captured, StatusCode::OK, json!({}))).await;
    let state = Arc::new(AppState::from_config(build_config(addr)));

    let response = dispatch(
        state,
        chat_request(&json!({
            "messages": [{ "role": "user", "content": "Why is the sky blue?" }],
            "think": true
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;

    let calls = captured.chat.lock().clone();
    assert_eq!(calls[0].1["thinking"]["type"], "enabled");

    server.abort();
}

#[tokio::test]
async fn test_chat_search_results_appended_to_last_message() {
    let captured = Captured::default();
    let (addr, server) = spawn_upstream(streaming_upstream(
        &captured,
        StatusCode::OK,
        json!({
            "search_result": [
                { "title": "Rust 1.90", "content": "Release notes", "link": "https://blog.rust-lang.org" }
            ]
        }),
    ))
    .await;
    let state = Arc::new(AppState::from_config(build_config(addr)));

    let response = dispatch(
        state,
        chat_request(&json!({
            "messages": [
                { "role": "user", "content": "old question" },
                { "role": "assistant", "content": "old answer" },
                { "role": "user", "content": "latest rust release" }
            ],
            "search": true
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;

    let searches = captured.search.lock().clone();
    assert_eq!(searches.len(), 1);
    assert_eq!(searches[0]["search_query"], "latest rust release");
    assert_eq!(searches[0]["search_engine"], "search_std");
    assert_eq!(searches[0]["count"], 5);
    assert_eq!(searches[0]["content_size"], "medium");

    let calls = captured.chat.lock().clone();
    let messages = calls[0].1["messages"].as_array().expect("messages").clone();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1]["content"], "old question");
    assert_eq!(
        messages[3]["content"],
        "latest rust release\n\n[Web search results]\n1. Rust 1.90\nRelease notes\nSource: https://blog.rust-lang.org"
    );

    server.abort();
}

#[tokio::test]
async fn test_chat_search_failure_is_ignored() {
    let captured = Captured::default();
    let (addr, server) = spawn_upstream(streaming_upstream(
        &captured,
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "search down" }),
    ))
    .await;
    let state = Arc::new(AppState::from_config(build_config(addr)));

    let response = dispatch(
        state,
        chat_request(&json!({
            "messages": [{ "role": "user", "content": "news today" }],
            "search": true
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;

    let calls = captured.chat.lock().clone();
    assert_eq!(calls[0].1["messages"][1]["content"], "news today");

    server.abort();
}

#[tokio::test]
async fn test_chat_search_disabled_in_config_skips_search() {
    let captured = Captured::default();
    let (addr, server) =
        spawn_upstream(streaming_upstream(&captured, StatusCode::OK, json!({}))).await;
    let mut config = build_config(addr);
    config.web_search.enabled = false;
    let state = Arc::new(AppState::from_config(config));

    let response = dispatch(
        state,
        chat_request(&json!({
            "messages": [{ "role": "user", "content": "news today" }],
            "search": true
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;
    assert!(captured.search.lock().is_empty());

    server.abort();
}

#[tokio::test]
async fn test_chat_upstream_status_mapping() {
    let cases = [
        (
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            RATE_LIMIT_MESSAGE.to_string(),
        ),
        (
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            INVALID_KEY_MESSAGE.to_string(),
        ),
        (
            StatusCode::BAD_GATEWAY,
            StatusCode::INTERNAL_SERVER_ERROR,
            "AI service error: model overloaded".to_string(),
        ),
    ];

    for (upstream_status, expected_status, expected_message) in cases {
        let (addr, server) =
            spawn_upstream(failing_upstream(upstream_status, "model overloaded")).await;
        let state = Arc::new(AppState::from_config(build_config(addr)));

        let response = dispatch(
            state,
            chat_request(&json!({ "messages": [{ "role": "user", "content": "Hi" }] })),
        )
        .await;
        assert_eq!(response.status(), expected_status, "upstream {upstream_status}");
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(error_body(response).await, expected_message);

        server.abort();
    }
}

#[tokio::test]
async fn test_chat_missing_credential() {
    let config = AppConfig {
        chat: ChatConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            api_key_env: "ZCHAT_TEST_UNSET_CHAT_KEY".to_string(),
            ..ChatConfig::default()
        },
        ..AppConfig::default()
    };
    let state = Arc::new(AppState::from_config(config));

    let response = dispatch(
        state,
        chat_request(&json!({ "messages": [{ "role": "user", "content": "Hi" }] })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        error_body(response).await,
        "ZCHAT_TEST_UNSET_CHAT_KEY is not configured"
    );
}

#[tokio::test]
async fn test_chat_rejects_bad_bodies() {
    let state = Arc::new(AppState::from_config(build_config(
        "127.0.0.1:9".parse().expect("addr"),
    )));

    let request = Request::builder()
        .method("POST")
        .uri("/functions/v1/chat")
        .header("authorization", "Bearer client-key")
        .body(Body::from("{not json"))
        .expect("build request");
    let response = dispatch(Arc::clone(&state), request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = dispatch(state, chat_request(&json!({ "messages": [] }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_requires_client_key() {
    let state = Arc::new(AppState::from_config(build_config(
        "127.0.0.1:9".parse().expect("addr"),
    )));
    let request = Request::builder()
        .method("POST")
        .uri("/functions/v1/chat")
        .body(Body::from(r#"{"messages":[{"role":"user","content":"Hi"}]}"#))
        .expect("build request");

    let response = dispatch(state, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_chat_preflight() {
    let state = Arc::new(AppState::from_config(AppConfig::default()));
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/functions/v1/chat")
        .body(Body::empty())
        .expect("build request");

    let response = dispatch(state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("allow origin"),
        "*"
    );
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .expect("allow headers"),
        "authorization, x-client-info, apikey, content-type"
    );
}

#[tokio::test]
async fn test_chat_under_base_path() {
    let captured = Captured::default();
    let (addr, server) =
        spawn_upstream(streaming_upstream(&captured, StatusCode::OK, json!({}))).await;
    let state = Arc::new(AppState::from_config(build_config(addr)));

    let request = Request::builder()
        .method("POST")
        .uri("/edge/functions/v1/chat")
        .header("apikey", "client-key")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"messages":[{"role":"user","content":"Hi"}]}"#))
        .expect("build request");
    let response = dispatch_request(Arc::clone(&state), Arc::<str>::from("/edge"), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;

    let request = Request::builder()
        .method("POST")
        .uri("/functions/v1/chat")
        .body(Body::empty())
        .expect("build request");
    let response = dispatch_request(state, Arc::<str>::from("/edge"), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.abort();
}

#[tokio::test]
async fn test_health_reports_config() {
    let state = Arc::new(AppState::from_config(build_config(
        "127.0.0.1:9".parse().expect("addr"),
    )));
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .body(Body::empty())
        .expect("build request");

    let response = dispatch(state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read health body");
    let payload: Value = serde_json::from_slice(&body).expect("json payload");
    assert_eq!(payload["config"]["chat_model"], "glm-4.7");
    assert_eq!(payload["config"]["chat_key_configured"], true);
    assert_eq!(payload["config"]["client_keys_count"], 1);
}
