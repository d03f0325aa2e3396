pub mod turn_stats;

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

pub use turn_stats::{estimate_tokens, TurnStats};

/// Map a configured log level to an `EnvFilter` directive.
///
/// - "DISABLED" -> `None`, no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.trim().to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Initialize the tracing subscriber with the configured level and format.
pub fn init_tracing(log_level: &str, format: LogFormat) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };

    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Log a finished chat turn, computing duration from start time.
pub fn log_turn_complete(
    conversation_id: Option<uuid::Uuid>,
    increments: usize,
    reasoning: &str,
    content: &str,
    persisted: bool,
    start_time: std::time::Instant,
) {
    turn_stats::log_turn_stats(&TurnStats::new(
        conversation_id,
        increments,
        reasoning,
        content,
        persisted,
        start_time.elapsed(),
    ));
}
