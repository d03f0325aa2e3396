use std::time::Duration;

use tracing::info;
use uuid::Uuid;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`); the upstream stream carries no
/// usage block.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Numbers reported for one finished chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnStats {
    pub conversation_id: Option<Uuid>,
    pub increments: usize,
    pub reasoning_tokens: u64,
    pub content_tokens: u64,
    pub persisted: bool,
    pub duration: Duration,
}

impl TurnStats {
    #[must_use]
    pub fn new(
        conversation_id: Option<Uuid>,
        increments: usize,
        reasoning: &str,
        content: &str,
        persisted: bool,
        duration: Duration,
    ) -> Self {
        Self {
            conversation_id,
            increments,
            reasoning_tokens: estimate_tokens(reasoning),
            content_tokens: estimate_tokens(content),
            persisted,
            duration,
        }
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.reasoning_tokens + self.content_tokens
    }
}

/// Log a completed turn at INFO level.
pub fn log_turn_stats(stats: &TurnStats) {
    info!(
        conversation_id = ?stats.conversation_id,
        increments = stats.increments,
        reasoning_tokens = stats.reasoning_tokens,
        content_tokens = stats.content_tokens,
        total_tokens = stats.total_tokens(),
        persisted = stats.persisted,
        duration_seconds = stats.duration.as_secs_f64(),
        "chat turn completed"
    );
}
