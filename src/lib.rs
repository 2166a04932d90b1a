//! Streaming value codec
//!
//! Serializes an in-memory value that may contain not-yet-resolved
//! `Future`s and lazy async `Sequence`s into a stream of textual
//! chunks, and reconstructs an equivalent value on the other end whose
//! embedded futures/sequences resolve as their sources do. The wire
//! transport itself (ordered, byte-preserving) is the caller's concern
//! — this crate only defines the chunk framing and the multiplexer
//! and demultiplexer that ride on top of it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use streamcodec::{Decoder, Encoder, EncodeValue};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let value = EncodeValue::future(async { Ok::<i32, String>(42) });
//!     let mut chunks = Encoder::new().encode_stream(value)?;
//!
//!     let mut wire = Vec::new();
//!     while let Some(chunk) = chunks.next().await {
//!         wire.push(chunk?);
//!     }
//!
//!     let decoded = Decoder::new()
//!         .decode_stream(futures::stream::iter(wire.into_iter().map(Ok)))
//!         .await?;
//!     let _ = decoded;
//!     Ok(())
//! }
//! ```

mod codec;
mod decoder;
mod encoder;
mod error;
mod framing;
mod transport;
mod value;

pub use codec::{ReducerFn, ReviverFn};
pub use decoder::{AsyncHandle, DecodeValue, Decoder, DecodeOptions, DecodedFuture, DecodedSequence, SequenceOutcome};
pub use encoder::{EncodeOptions, Encoder, EncodeStream};
pub use error::{DecodeError, EncodeError};
pub use framing::{ProducerFrame, ProducerId};
pub use transport::{chunks_from_lines, PushChannel};
pub use value::{
    AsyncSequenceSource, CoerceErrorFn, Encodable, EncodeValue, SequenceStep, StreamSequence, Tree,
};
