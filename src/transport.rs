//! Adapters between a chunk stream (`Stream<Item = Result<String,
//! DecodeError>>`, one item per line) and the byte- or push-oriented
//! transports a caller is actually likely to have on hand.
//!
//! [`chunks_from_lines`] accumulates an incoming byte stream and
//! splits it into lines, adapted from a synchronous `BufRead`
//! line-reading loop to a `futures::Stream` of `Bytes`.
//! [`PushChannel`] is for transports that hand you a
//! push-one-chunk-at-a-time callback (a WebSocket message handler, an
//! SSE `onmessage`) instead of already owning a pull `Stream`.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::DecodeError;

/// Splits an incoming byte stream into newline-delimited chunk text.
/// One chunk per line, matching [`crate::framing`]'s one-chunk-per-line
/// assumption. A trailing `\r` (CRLF transports) is stripped. A final
/// unterminated line at end-of-stream is still emitted, so transports
/// need not guarantee a trailing newline.
pub fn chunks_from_lines<S, E>(bytes: S) -> impl Stream<Item = Result<String, DecodeError>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    LineSplitter {
        inner: Box::pin(bytes),
        buffer: BytesMut::new(),
        done: false,
    }
}

struct LineSplitter<S> {
    inner: Pin<Box<S>>,
    buffer: BytesMut,
    done: bool,
}

impl<S, E> Stream for LineSplitter<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<String, DecodeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                return Poll::Ready(Some(decode_line(line)));
            }
            if self.done {
                if self.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Poll::Ready(Some(decode_line(rest)));
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(DecodeError::Transport(err.to_string()))));
                }
                Poll::Ready(None) => self.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn decode_line(line: BytesMut) -> Result<String, DecodeError> {
    String::from_utf8(line.to_vec())
        .map(|s| s.trim_end_matches('\r').to_string())
        .map_err(|err| DecodeError::Transport(err.to_string()))
}

/// A handle for pushing chunk text into a [`Decoder`](crate::decoder::Decoder)
/// from a callback-driven transport. Dropping the handle closes the
/// stream, which the decoder observes as [`DecodeError::StreamTruncated`]
/// for any producer still outstanding.
#[derive(Clone)]
pub struct PushChannel {
    sender: mpsc::UnboundedSender<Result<String, DecodeError>>,
}

impl PushChannel {
    /// Create a channel paired with the `Stream` a [`Decoder`](crate::decoder::Decoder)
    /// can consume.
    pub fn new() -> (Self, impl Stream<Item = Result<String, DecodeError>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (Self { sender }, stream)
    }

    /// Push one chunk of text (a root value or a producer frame).
    pub fn push(&self, chunk: impl Into<String>) {
        let _ = self.sender.send(Ok(chunk.into()));
    }

    /// Fail the stream with a transport-level error.
    pub fn fail(&self, err: DecodeError) {
        let _ = self.sender.send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn splits_on_newlines_and_emits_a_trailing_partial_line() {
        let source = futures::stream::iter(vec![
            Ok::<Bytes, std::io::Error>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"c\ndef\ng")),
        ]);
        let lines: Vec<String> = chunks_from_lines(source)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["abc".to_string(), "def".to_string(), "g".to_string()]);
    }

    #[tokio::test]
    async fn strips_carriage_returns() {
        let source = futures::stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from_static(
            b"line\r\n",
        ))]);
        let lines: Vec<String> = chunks_from_lines(source)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["line".to_string()]);
    }

    #[tokio::test]
    async fn push_channel_forwards_pushed_chunks_in_order() {
        let (tx, stream) = PushChannel::new();
        tx.push("root");
        tx.push("1:0:1");
        drop(tx);
        let chunks: Vec<Result<String, DecodeError>> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap(), "root");
        assert_eq!(chunks[1].as_ref().unwrap(), "1:0:1");
    }
}
