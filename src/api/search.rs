//! Web search used to ground a chat turn in fresh results.

use serde::{Deserialize, Serialize};

use crate::config::WebSearchConfig;
use crate::transport::HttpTransport;

const LOG_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct WebSearchRequest<'a> {
    search_query: &'a str,
    search_engine: &'a str,
    count: u32,
    content_size: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WebSearchResponse {
    #[serde(default)]
    search_result: Option<Vec<SearchHit>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub link: String,
}

/// Run a web search for `query` and render the hits as a block to append
/// to the last message.
///
/// Returns `None` when the search fails or finds nothing. Failures are
/// logged and never fail the chat request.
pub(crate) async fn fetch_search_context(
    transport: &HttpTransport,
    config: &WebSearchConfig,
    api_key: &str,
    query: &str,
) -> Option<String> {
    tracing::info!(query = %preview(query), "performing web search");

    let body = match serde_json::to_vec(&WebSearchRequest {
        search_query: query,
        search_engine: &config.engine,
        count: config.count,
        content_size: &config.content_size,
    }) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode web search request");
            return None;
        }
    };

    let response = match transport
        .post_json(&config.url, Some(api_key), bytes::Bytes::from(body))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "web search request failed");
            return None;
        }
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "failed to read web search response");
            return None;
        }
    };
    if !status.is_success() {
        tracing::error!(status = status.as_u16(), body = %preview(&text), "web search failed");
        return None;
    }

    tracing::debug!(body = %preview(&text), "web search results");
    let parsed: WebSearchResponse = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!(error = %err, "web search response is not valid JSON");
            return None;
        }
    };
    render_search_context(parsed.search_result.as_deref().unwrap_or_default())
}

/// Render hits as a numbered list, one block per hit.
pub(crate) fn render_search_context(hits: &[SearchHit]) -> Option<String> {
    if hits.is_empty() {
        return None;
    }
    let mut out = String::from("\n\n[Web search results]\n");
    for (index, hit) in hits.iter().enumerate() {
        if index > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "{}. {}\n{}\nSource: {}",
            index + 1,
            hit.title,
            hit.content,
            hit.link
        ));
    }
    Some(out)
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
