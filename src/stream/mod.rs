pub mod decoder;
pub mod delta;
pub mod sse;

pub use decoder::{
    DecodeError, DecoderLimits, DecoderState, FeedOutcome, FinalMessage, Increment,
    IncrementKind, StreamDecoder, DEFAULT_MAX_CARRY_BYTES, DEFAULT_MAX_PARSE_RETRIES,
};
pub use delta::{Delta, DeltaChoice, DeltaEvent};
pub use sse::Utf8ChunkDecoder;

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;

use crate::error::ChatError;

/// Item yielded by [`decode_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// Text appended to one of the two channels.
    Increment(Increment),
    /// The `[DONE]` sentinel arrived; no more increments follow.
    Done,
    /// The response is complete. Always the last item of a successful stream.
    Finished(FinalMessage),
}

pin_project! {
    /// Stream adapter returned by [`decode_stream`].
    pub struct DecodedStream<S> {
        #[pin]
        inner: S,
        utf8: Utf8ChunkDecoder,
        decoder: Option<StreamDecoder>,
        pending: VecDeque<StreamItem>,
    }
}

/// Decode a response body into reasoning/content increments.
///
/// Yields increments in the order their bytes arrived, then
/// [`StreamItem::Finished`] once the body ends or `[DONE]` is seen (the
/// transport is not read past `[DONE]`). A transport error or a
/// [`DecodeError`] is yielded once and ends the stream without a
/// `Finished` item.
pub fn decode_stream<S, E>(byte_stream: S, limits: DecoderLimits) -> DecodedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<ChatError>,
{
    DecodedStream {
        inner: byte_stream,
        utf8: Utf8ChunkDecoder::new(),
        decoder: Some(StreamDecoder::with_limits(limits)),
        pending: VecDeque::with_capacity(8),
    }
}

impl<S, E> Stream for DecodedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<ChatError>,
{
    type Item = Result<StreamItem, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }

            let done = match this.decoder.as_ref() {
                None => return Poll::Ready(None),
                Some(decoder) => decoder.is_done(),
            };
            if done {
                return Poll::Ready(this.decoder.take().map(|decoder| {
                    Ok(StreamItem::Finished(decoder.finalize()))
                }));
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => {
                    let text = this.utf8.decode(&bytes);
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(None);
                    };
                    match decoder.feed(&text) {
                        Ok(outcome) => {
                            let done = outcome.is_done();
                            this.pending
                                .extend(outcome.into_iter().map(StreamItem::Increment));
                            if done {
                                this.pending.push_back(StreamItem::Done);
                            }
                        }
                        Err(err) => {
                            *this.decoder = None;
                            return Poll::Ready(Some(Err(err.into())));
                        }
                    }
                }
                Some(Err(err)) => {
                    *this.decoder = None;
                    return Poll::Ready(Some(Err(err.into())));
                }
                None => {
                    if this.utf8.remainder_len() > 0 {
                        tracing::debug!(
                            bytes = this.utf8.remainder_len(),
                            "response body ended inside a UTF-8 sequence"
                        );
                    }
                    return Poll::Ready(this.decoder.take().map(|decoder| {
                        Ok(StreamItem::Finished(decoder.finalize()))
                    }));
                }
            }
        }
    }
}
