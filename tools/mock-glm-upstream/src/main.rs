//! Local stand-in for the chat, web search, and image upstreams.
//!
//! Point `chat.base_url`, `web_search.url` and `image.url` at it to run the
//! proxy without real credentials.

use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Think,
    Split,
    RateLimited,
    BadKey,
    Error,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::Think => "think",
            MockScenario::Split => "split",
            MockScenario::RateLimited => "rate_limited",
            MockScenario::BadKey => "bad_key",
            MockScenario::Error => "error",
        }
    }
}

#[derive(Copy, Clone)]
enum Endpoint {
    ChatCompletions,
    WebSearch,
    Images,
}

struct MockState {
    scenario: MockScenario,
    chat_calls: AtomicU64,
    search_calls: AtomicU64,
    image_calls: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        chat_calls: AtomicU64::new(0),
        search_calls: AtomicU64::new(0),
        image_calls: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock upstream on 127.0.0.1:{port} (scenario={})",
        state.scenario.as_str()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("think") => MockScenario::Think,
        Ok("split") => MockScenario::Split,
        Ok("rate_limited") => MockScenario::RateLimited,
        Ok("bad_key") => MockScenario::BadKey,
        Ok("error") => MockScenario::Error,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    drain_request_body(body).await;

    let path = parts.uri.path();
    if parts.method == Method::GET && path == "/_mock/stats" {
        return stats_response(state);
    }
    if parts.method != Method::POST {
        return simple_response_static(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            br#"{"error":"method_not_allowed"}"#,
        );
    }

    let Some(endpoint) = endpoint_for_path(path) else {
        return simple_response_static(
            StatusCode::NOT_FOUND,
            "application/json",
            br#"{"error":"not_found"}"#,
        );
    };

    match state.scenario {
        MockScenario::RateLimited => {
            return simple_response_static(
                StatusCode::TOO_MANY_REQUESTS,
                "application/json",
                br#"{"error":{"code":"1302","message":"rate limit reached"}}"#,
            );
        }
        MockScenario::BadKey => {
            return simple_response_static(
                StatusCode::UNAUTHORIZED,
                "application/json",
                br#"{"error":{"code":"1000","message":"invalid api key"}}"#,
            );
        }
        MockScenario::Error => {
            return simple_response_static(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                br#"{"error":"mock_injected_error"}"#,
            );
        }
        MockScenario::Text | MockScenario::Think | MockScenario::Split => {}
    }

    match endpoint {
        Endpoint::ChatCompletions => {
            state.chat_calls.fetch_add(1, Ordering::Relaxed);
            chat_stream_response(state.scenario)
        }
        Endpoint::WebSearch => {
            state.search_calls.fetch_add(1, Ordering::Relaxed);
            simple_response_static(StatusCode::OK, "application/json", WEB_SEARCH_RESULT)
        }
        Endpoint::Images => {
            state.image_calls.fetch_add(1, Ordering::Relaxed);
            simple_response_static(StatusCode::OK, "application/json", IMAGE_RESULT)
        }
    }
}

async fn drain_request_body(mut body: Incoming) {
    while let Some(frame_result) = body.frame().await {
        if frame_result.is_err() {
            break;
        }
    }
}

fn endpoint_for_path(path: &str) -> Option<Endpoint> {
    match path {
        "/chat/completions" | "/api/paas/v4/chat/completions" => Some(Endpoint::ChatCompletions),
        "/web_search" | "/api/paas/v4/web_search" => Some(Endpoint::WebSearch),
        "/images/generations" | "/api/v3/images/generations" => Some(Endpoint::Images),
        _ => None,
    }
}

fn stats_response(state: &MockState) -> Response<Full<Bytes>> {
    let body = format!(
        "{{\"scenario\":\"{}\",\"chat\":{},\"search\":{},\"images\":{}}}",
        state.scenario.as_str(),
        state.chat_calls.load(Ordering::Relaxed),
        state.search_calls.load(Ordering::Relaxed),
        state.image_calls.load(Ordering::Relaxed),
    );
    simple_response(
        StatusCode::OK,
        "application/json",
        Bytes::from(body.into_bytes()),
    )
}

fn chat_stream_response(scenario: MockScenario) -> Response<Full<Bytes>> {
    let body = match scenario {
        MockScenario::Think => CHAT_STREAM_THINK,
        MockScenario::Split => CHAT_STREAM_SPLIT,
        _ => CHAT_STREAM_TEXT,
    };
    let mut response = simple_response_static(StatusCode::OK, "text/event-stream", body);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn simple_response_static(
    status: StatusCode,
    content_type: &'static str,
    body: &'static [u8],
) -> Response<Full<Bytes>> {
    simple_response(status, content_type, Bytes::from_static(body))
}

const CHAT_STREAM_TEXT: &[u8] = b"data: {\"id\":\"mock\",\"created\":1,\"model\":\"glm-4.7\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\ndata: {\"id\":\"mock\",\"created\":1,\"model\":\"glm-4.7\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" from the mock upstream.\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
const CHAT_STREAM_THINK: &[u8] = b": keep-alive\n\ndata: {\"id\":\"mock\",\"created\":1,\"model\":\"glm-4.7\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"reasoning_content\":\"The user wants a greeting. \"}}]}\n\ndata: {\"id\":\"mock\",\"created\":1,\"model\":\"glm-4.7\",\"choices\":[{\"index\":0,\"delta\":{\"reasoning_content\":\"Keep it short.\"}}]}\n\ndata: {\"id\":\"mock\",\"created\":1,\"model\":\"glm-4.7\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi!\"},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":9,\"total_tokens\":12}}\n\ndata: [DONE]\n\n";
const CHAT_STREAM_SPLIT: &[u8] = b"data: {\"id\":\"mock\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"one \"}}]}\n\ndata: {\"id\":\"mock\",\"choices\":[{\"index\":0,\"delta\":{\"con\ndata: tent\":\"two \"}}]}\n\ndata: {\"id\":\"mock\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"three\"}}]}\n\ndata: [DONE]\n\n";

const WEB_SEARCH_RESULT: &[u8] = br#"{"id":"search-mock","created":1,"search_result":[{"title":"Mock result","content":"Deterministic search content for local runs.","link":"https://example.com/mock","media":"example"}]}"#;
const IMAGE_RESULT: &[u8] = br#"{"model":"doubao-seedream-4-5-251128","created":1,"data":[{"url":"https://example.com/mock-image.png","size":"1024x1024"}],"usage":{"generated_images":1}}"#;
