//! Incremental decoder for OpenAI-compatible chat completion SSE streams.
//!
//! Text chunks may split lines, JSON objects, or `\r\n` pairs anywhere. The
//! decoder reassembles `data:` lines, parses each payload as a
//! [`DeltaEvent`], and splits the deltas into reasoning and answer
//! increments in arrival order.

use std::fmt;

use memchr::memchr_iter;
use smallvec::SmallVec;

use super::delta::DeltaEvent;
use super::sse::{is_done_payload, DATA_PREFIX};

pub const DEFAULT_MAX_CARRY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_PARSE_RETRIES: u32 = 8;

const COMPACT_THRESHOLD_BYTES: usize = 8 * 1024;

/// Which output channel an increment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncrementKind {
    Reasoning,
    Content,
}

impl IncrementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IncrementKind::Reasoning => "reasoning",
            IncrementKind::Content => "content",
        }
    }
}

impl fmt::Display for IncrementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of text appended to the reasoning or answer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub kind: IncrementKind,
    pub text: String,
}

impl Increment {
    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: IncrementKind::Reasoning,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            kind: IncrementKind::Content,
            text: text.into(),
        }
    }
}

/// Result of a single [`StreamDecoder::feed`] call.
///
/// Holds the increments produced by that call in arrival order, and whether
/// the `[DONE]` sentinel has been seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedOutcome {
    increments: SmallVec<[Increment; 4]>,
    done: bool,
}

impl FeedOutcome {
    #[must_use]
    pub fn increments(&self) -> &[Increment] {
        &self.increments
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.increments.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Increment> {
        self.increments.iter()
    }
}

impl IntoIterator for FeedOutcome {
    type Item = Increment;
    type IntoIter = smallvec::IntoIter<[Increment; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.increments.into_iter()
    }
}

impl<'a> IntoIterator for &'a FeedOutcome {
    type Item = &'a Increment;
    type IntoIter = std::slice::Iter<'a, Increment>;

    fn into_iter(self) -> Self::IntoIter {
        self.increments.iter()
    }
}

/// Accumulated text handed back by [`StreamDecoder::finalize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalMessage {
    pub reasoning: String,
    pub content: String,
}

/// Bounds on buffered, not-yet-resolved input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    /// Maximum bytes of a single line, and of the unterminated tail plus any
    /// held partial payload.
    pub max_carry_bytes: usize,
    /// How many continuation lines a payload that failed to parse may absorb
    /// before the stream is declared corrupt.
    pub max_parse_retries: u32,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_carry_bytes: DEFAULT_MAX_CARRY_BYTES,
            max_parse_retries: DEFAULT_MAX_PARSE_RETRIES,
        }
    }
}

/// Buffered input that can no longer be held without violating [`DecoderLimits`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("SSE carry buffer holds {held} bytes, limit is {limit}")]
    CarryOverflow { held: usize, limit: usize },
    #[error("SSE payload still not valid JSON after {retries} continuation lines")]
    MalformedFrame { retries: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeldFrame {
    payload: String,
    retries: u32,
}

/// Mutable state of one response being decoded.
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    carry: String,
    read_offset: usize,
    held: Option<HeldFrame>,
    reasoning: String,
    content: String,
}

impl DecoderState {
    /// Received text with no terminating newline yet.
    #[must_use]
    pub fn carry(&self) -> &str {
        &self.carry[self.read_offset..]
    }

    /// A complete `data:` payload that failed to parse and waits for its
    /// continuation.
    #[must_use]
    pub fn held_payload(&self) -> Option<&str> {
        self.held.as_ref().map(|held| held.payload.as_str())
    }

    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    fn carry_len(&self) -> usize {
        self.carry.len() - self.read_offset + self.held.as_ref().map_or(0, |h| h.payload.len())
    }
}

enum LineAction {
    Continue,
    Done,
}

/// Turns chunked SSE text into reasoning/content increments.
///
/// One decoder serves exactly one response; build a new one for every
/// request, including regenerations.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    state: DecoderState,
    limits: DecoderLimits,
    done: bool,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    #[must_use]
    pub fn limits(&self) -> DecoderLimits {
        self.limits
    }

    /// Whether the `[DONE]` sentinel has been observed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Bytes buffered but not yet resolved into a frame.
    #[must_use]
    pub fn carry_len(&self) -> usize {
        self.state.carry_len()
    }

    /// Feed one decoded text chunk.
    ///
    /// Every complete line is processed in order:
    /// - blank lines, `:` comments, and fields other than `data: ` are skipped
    /// - `data: [DONE]` ends the response; later input is ignored
    /// - other payloads are parsed as [`DeltaEvent`]; a payload that fails to
    ///   parse is held and retried with the next `data:` line appended, on
    ///   the assumption that the upstream split one JSON object over two lines
    ///
    /// The unterminated tail stays buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::CarryOverflow`] when a line or the buffered
    /// remainder exceeds `max_carry_bytes`, and [`DecodeError::MalformedFrame`]
    /// when a held payload absorbs more than `max_parse_retries` lines.
    pub fn feed(&mut self, chunk: &str) -> Result<FeedOutcome, DecodeError> {
        let mut outcome = FeedOutcome::default();
        if self.done {
            outcome.done = true;
            return Ok(outcome);
        }

        let limits = self.limits;
        let DecoderState {
            carry,
            read_offset,
            held,
            reasoning,
            content,
        } = &mut self.state;

        carry.push_str(chunk);
        let mut processed_up_to = *read_offset;
        let scan_start = processed_up_to;
        let mut failure = None;
        for rel_pos in memchr_iter(b'\n', &carry.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &carry[processed_up_to..line_end];
            processed_up_to = line_end + 1;
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            if line.len() > limits.max_carry_bytes {
                failure = Some(DecodeError::CarryOverflow {
                    held: line.len(),
                    limit: limits.max_carry_bytes,
                });
                break;
            }

            match fold_line(line, limits, held, reasoning, content, &mut outcome) {
                Ok(LineAction::Continue) => {}
                Ok(LineAction::Done) => {
                    outcome.done = true;
                    break;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if outcome.done {
            carry.clear();
            *read_offset = 0;
            *held = None;
            self.done = true;
            return Ok(outcome);
        }

        *read_offset = processed_up_to;
        if *read_offset == carry.len() {
            carry.clear();
            *read_offset = 0;
        } else if *read_offset > 0
            && (*read_offset >= carry.len() / 2 || *read_offset >= COMPACT_THRESHOLD_BYTES)
        {
            carry.drain(..*read_offset);
            *read_offset = 0;
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let held_bytes = self.state.carry_len();
        if held_bytes > limits.max_carry_bytes {
            return Err(DecodeError::CarryOverflow {
                held: held_bytes,
                limit: limits.max_carry_bytes,
            });
        }
        Ok(outcome)
    }

    /// Close the response and return the accumulated text.
    ///
    /// Anything still buffered (an unterminated line or a payload that never
    /// parsed) is dropped.
    #[must_use]
    pub fn finalize(self) -> FinalMessage {
        let dropped = self.state.carry_len();
        if dropped > 0 {
            tracing::debug!(
                dropped_bytes = dropped,
                "discarding unresolved SSE input at end of stream"
            );
        }
        FinalMessage {
            reasoning: self.state.reasoning,
            content: self.state.content,
        }
    }
}

fn fold_line(
    line: &str,
    limits: DecoderLimits,
    held: &mut Option<HeldFrame>,
    reasoning: &mut String,
    content: &mut String,
    outcome: &mut FeedOutcome,
) -> Result<LineAction, DecodeError> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(LineAction::Continue);
    }
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(LineAction::Continue);
    };
    let payload = rest.trim();

    if is_done_payload(payload) {
        if let Some(dropped) = held.take() {
            tracing::warn!(
                held_bytes = dropped.payload.len(),
                "stream finished with an unparsed SSE payload"
            );
        }
        return Ok(LineAction::Done);
    }
    if payload.is_empty() {
        return Ok(LineAction::Continue);
    }

    if let Some(mut pending) = held.take() {
        pending.payload.push_str(payload);
        if let Ok(event) = serde_json::from_str::<DeltaEvent>(&pending.payload) {
            fold_event(event, reasoning, content, outcome);
            return Ok(LineAction::Continue);
        }
        if let Ok(event) = serde_json::from_str::<DeltaEvent>(payload) {
            tracing::warn!(
                dropped_bytes = pending.payload.len() - payload.len(),
                "dropping SSE payload that never became valid JSON"
            );
            fold_event(event, reasoning, content, outcome);
            return Ok(LineAction::Continue);
        }
        pending.retries += 1;
        if pending.retries > limits.max_parse_retries {
            return Err(DecodeError::MalformedFrame {
                retries: pending.retries,
            });
        }
        *held = Some(pending);
        return Ok(LineAction::Continue);
    }

    match serde_json::from_str::<DeltaEvent>(payload) {
        Ok(event) => fold_event(event, reasoning, content, outcome),
        Err(err) => {
            tracing::debug!(error = %err, "holding SSE payload until its continuation arrives");
            *held = Some(HeldFrame {
                payload: payload.to_owned(),
                retries: 0,
            });
        }
    }
    Ok(LineAction::Continue)
}

fn fold_event(
    event: DeltaEvent,
    reasoning: &mut String,
    content: &mut String,
    outcome: &mut FeedOutcome,
) {
    for choice in event.choices {
        let Some(delta) = choice.delta else {
            continue;
        };
        if let Some(text) = delta.reasoning() {
            reasoning.push_str(text);
            outcome.increments.push(Increment::reasoning(text));
        }
        if let Some(text) = delta.answer() {
            content.push_str(text);
            outcome.increments.push(Increment::content(text));
        }
    }
}
