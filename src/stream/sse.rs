//! SSE text helpers: UTF-8 safe chunk decoding and frame encoders.
//!
//! Response bodies arrive as arbitrary byte chunks. [`Utf8ChunkDecoder`]
//! turns them into text without ever splitting a multi-byte character, so
//! the line decoder only ever sees whole characters.

/// Field prefix of a data line, including the single separating space.
pub const DATA_PREFIX: &str = "data: ";

/// Payload that marks the end of an OpenAI-compatible stream.
pub const DONE_PAYLOAD: &str = "[DONE]";

const DONE_FRAME: &str = "data: [DONE]\n\n";

// ---------------------------------------------------------------------------
// Utf8ChunkDecoder: byte chunks to text
// ---------------------------------------------------------------------------

/// Incremental UTF-8 decoder for transport chunks.
///
/// A character cut at the end of a chunk is held back and completed by the
/// next chunk. Byte sequences that can never be valid UTF-8 are replaced
/// with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    remainder: Vec<u8>,
}

impl Utf8ChunkDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, returning all text that is complete so far.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() + self.remainder.len());
        if self.remainder.is_empty() {
            push_complete_utf8(bytes, &mut out, &mut self.remainder);
        } else {
            let mut joined = std::mem::take(&mut self.remainder);
            joined.extend_from_slice(bytes);
            push_complete_utf8(&joined, &mut out, &mut self.remainder);
        }
        out
    }

    /// Bytes of an incomplete trailing character still held back.
    #[must_use]
    pub fn remainder_len(&self) -> usize {
        self.remainder.len()
    }
}

fn push_complete_utf8(mut input: &[u8], out: &mut String, remainder: &mut Vec<u8>) {
    loop {
        match std::str::from_utf8(input) {
            Ok(text) => {
                out.push_str(text);
                return;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                out.push_str(std::str::from_utf8(&input[..valid_up_to]).unwrap_or_default());
                match err.error_len() {
                    Some(invalid_len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        input = &input[valid_up_to + invalid_len..];
                    }
                    None => {
                        remainder.extend_from_slice(&input[valid_up_to..]);
                        return;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Format a data-only SSE frame.
#[must_use]
pub fn data_frame(json: &str) -> String {
    let mut out = String::with_capacity(DATA_PREFIX.len() + 2 + json.len());
    out.push_str(DATA_PREFIX);
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// Format an SSE comment line, as sent by keep-alive heartbeats.
#[must_use]
pub fn comment_frame(text: &str) -> String {
    let mut out = String::with_capacity(3 + text.len());
    out.push_str(": ");
    out.push_str(text);
    out.push('\n');
    out
}

/// Format the `[DONE]` terminator frame.
#[must_use]
pub fn done_frame() -> String {
    DONE_FRAME.to_owned()
}

/// Whether an SSE data payload is the end-of-stream sentinel.
#[must_use]
pub fn is_done_payload(payload: &str) -> bool {
    payload.trim() == DONE_PAYLOAD
}
