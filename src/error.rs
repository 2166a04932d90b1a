//! Error types for the streaming codec.

use thiserror::Error;

use crate::framing::ProducerId;

/// Errors that can occur while encoding a value into a chunk stream.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The root value (or a value produced by a registered producer)
    /// could not be flattened by the synchronous value codec.
    #[error("value could not be encoded: {0}")]
    ValueUnencodable(String),

    /// `serde_json` failed to serialize an encodable value.
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while decoding a chunk stream back into a value.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A chunk's header (`<id>:<status>:<payload>`) could not be parsed.
    #[error("malformed chunk: {0}")]
    Malformed(String),

    /// A frame carried a status code the receiving producer kind does
    /// not understand.
    #[error("unknown status code {0} for producer {1}")]
    UnknownStatus(u8, ProducerId),

    /// `serde_json` failed to parse a chunk's payload.
    #[error("json decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The chunk stream ended (or failed) while one or more producers
    /// still had outstanding sinks.
    #[error("stream interrupted before all producers completed")]
    StreamTruncated,

    /// The underlying chunk transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A decoded `Future`/`Sequence` producer resolved to `FUTURE_ERR`
    /// / `SEQ_ERROR`; this carries the decoded error cause, rendered as
    /// text by the synchronous value codec.
    #[error("producer {0} failed: {1}")]
    ProducerFailed(ProducerId, String),
}

impl DecodeError {
    /// A best-effort, cloneable description, used when the same
    /// underlying failure (stream truncation, transport error) must be
    /// delivered to every outstanding sink.
    pub(crate) fn broadcast(&self) -> DecodeError {
        match self {
            DecodeError::Malformed(s) => DecodeError::Malformed(s.clone()),
            DecodeError::UnknownStatus(s, id) => DecodeError::UnknownStatus(*s, *id),
            DecodeError::Json(e) => DecodeError::Transport(e.to_string()),
            DecodeError::StreamTruncated => DecodeError::StreamTruncated,
            DecodeError::Transport(s) => DecodeError::Transport(s.clone()),
            DecodeError::ProducerFailed(id, s) => DecodeError::ProducerFailed(*id, s.clone()),
        }
    }
}
