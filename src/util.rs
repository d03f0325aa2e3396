use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;

#[inline]
pub(crate) fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

/// Conversation title derived from its first message: the first 50
/// characters, with `...` appended when the message is longer.
#[must_use]
pub fn conversation_title(first_message: &str) -> String {
    match first_message.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => {
            let mut title = String::with_capacity(cut + 3);
            title.push_str(&first_message[..cut]);
            title.push_str("...");
            title
        }
        None => first_message.to_string(),
    }
}
