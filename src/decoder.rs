//! Decoder: demultiplexes an incoming chunk stream back into a value
//! whose embedded futures/sequences resolve as their own chunks arrive
//! (`spec.md` §4.2).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::{self, Reviver, ReviverFn};
use crate::error::DecodeError;
use crate::framing::{self, ProducerId, FUTURE_ERR, FUTURE_OK, SEQ_ERROR, SEQ_RETURN, SEQ_YIELD};
use crate::value::Tree;

/// The value tree handed back by [`Decoder::decode_stream`]: the same
/// shape as [`crate::value::EncodeValue`], but its async leaves are
/// live handles fed by the background demultiplexer rather than
/// not-yet-registered producers.
pub type DecodeValue = Tree<AsyncHandle>;

/// A decoder-side handle to a `Future<T>` or `Sequence<T>` leaf.
pub enum AsyncHandle {
    Future(DecodedFuture),
    Sequence(DecodedSequence),
}

#[derive(Clone, Copy)]
enum ProducerKind {
    Future,
    Sequence,
}

enum SinkMessage {
    FutureResolved(Result<DecodeValue, DecodeValue>),
    SequenceStep(SeqStep),
    /// The pump itself failed (malformed chunk, transport error) or a
    /// frame's status didn't match this producer's kind; the sink's
    /// consumer observes this as a `DecodeError`.
    Failed(DecodeError),
}

enum SeqStep {
    Yield(DecodeValue),
    Return(DecodeValue),
    Error(DecodeValue),
}

struct SinkEntry {
    sender: mpsc::Sender<SinkMessage>,
    kind: ProducerKind,
}

/// One in-flight `Future<T>` being fed by the demultiplexer. Removes
/// its own sink entry on drop, so abandoning a `DecodedFuture` before
/// it resolves doesn't leak a registry entry the pump can never fill.
pub struct DecodedFuture {
    id: ProducerId,
    rx: mpsc::Receiver<SinkMessage>,
    sinks: Arc<Mutex<HashMap<ProducerId, SinkEntry>>>,
}

impl Future for DecodedFuture {
    type Output = Result<DecodeValue, DecodeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(SinkMessage::FutureResolved(Ok(value)))) => Poll::Ready(Ok(value)),
            Poll::Ready(Some(SinkMessage::FutureResolved(Err(cause)))) => {
                Poll::Ready(Err(DecodeError::ProducerFailed(this.id, format!("{cause:?}"))))
            }
            Poll::Ready(Some(SinkMessage::Failed(err))) => Poll::Ready(Err(err)),
            Poll::Ready(Some(SinkMessage::SequenceStep(_))) => {
                unreachable!("future sink received a sequence step")
            }
            Poll::Ready(None) => Poll::Ready(Err(DecodeError::StreamTruncated)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DecodedFuture {
    fn drop(&mut self) {
        self.sinks.lock().remove(&self.id);
    }
}

/// One step pulled from a live `Sequence<T>`.
pub enum SequenceOutcome {
    /// The sequence produced an item; more steps may follow.
    Yield(DecodeValue),
    /// The sequence terminated normally with a return value.
    Return(DecodeValue),
}

/// One in-flight `Sequence<T>` being fed by the demultiplexer, pulled
/// one step at a time so a slow consumer naturally paces the producer
/// (the wire channel behind it holds exactly one outstanding item).
pub struct DecodedSequence {
    id: ProducerId,
    rx: mpsc::Receiver<SinkMessage>,
    done: bool,
    sinks: Arc<Mutex<HashMap<ProducerId, SinkEntry>>>,
}

impl DecodedSequence {
    /// Pull the next step. Returns `Ok(None)` only once a terminal step
    /// has already been observed; callers should stop polling after
    /// seeing [`SequenceOutcome::Return`] or an `Err`.
    pub async fn next(&mut self) -> Result<Option<SequenceOutcome>, DecodeError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(SinkMessage::SequenceStep(SeqStep::Yield(v))) => {
                Ok(Some(SequenceOutcome::Yield(v)))
            }
            Some(SinkMessage::SequenceStep(SeqStep::Return(v))) => {
                self.done = true;
                Ok(Some(SequenceOutcome::Return(v)))
            }
            Some(SinkMessage::SequenceStep(SeqStep::Error(cause))) => {
                self.done = true;
                Err(DecodeError::ProducerFailed(self.id, format!("{cause:?}")))
            }
            Some(SinkMessage::Failed(err)) => {
                self.done = true;
                Err(err)
            }
            Some(SinkMessage::FutureResolved(_)) => {
                unreachable!("sequence sink received a future resolution")
            }
            None => {
                self.done = true;
                Err(DecodeError::StreamTruncated)
            }
        }
    }
}

impl Drop for DecodedSequence {
    fn drop(&mut self) {
        self.sinks.lock().remove(&self.id);
    }
}

#[cfg(test)]
impl AsyncHandle {
    pub(crate) fn test_stub(id: ProducerId) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        AsyncHandle::Future(DecodedFuture {
            id,
            rx,
            sinks: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

/// Registration state shared between the synchronous root parse and
/// the background pump: a sink is inserted the moment a placeholder is
/// revived and removed once its terminal frame has been dispatched.
#[derive(Clone)]
struct DecoderContext {
    sinks: Arc<Mutex<HashMap<ProducerId, SinkEntry>>>,
    revivers: Arc<HashMap<String, ReviverFn>>,
}

impl Reviver for DecoderContext {
    fn revive_future(&mut self, id: ProducerId) -> AsyncHandle {
        let (tx, rx) = mpsc::channel(1);
        self.sinks.lock().insert(
            id,
            SinkEntry {
                sender: tx,
                kind: ProducerKind::Future,
            },
        );
        AsyncHandle::Future(DecodedFuture {
            id,
            rx,
            sinks: self.sinks.clone(),
        })
    }

    fn revive_sequence(&mut self, id: ProducerId) -> AsyncHandle {
        let (tx, rx) = mpsc::channel(1);
        self.sinks.lock().insert(
            id,
            SinkEntry {
                sender: tx,
                kind: ProducerKind::Sequence,
            },
        );
        AsyncHandle::Sequence(DecodedSequence {
            id,
            rx,
            done: false,
            sinks: self.sinks.clone(),
        })
    }

    fn reviver(&self, tag: &str) -> Option<&ReviverFn> {
        self.revivers.get(tag)
    }
}

/// Configuration for [`Decoder::decode_stream`].
#[derive(Default)]
pub struct DecodeOptions {
    revivers: HashMap<String, ReviverFn>,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reviver invoked on every [`Tree::Tagged`] payload
    /// with a matching tag, after its inner value has been parsed.
    #[must_use]
    pub fn reviver(mut self, tag: impl Into<String>, f: ReviverFn) -> Self {
        self.revivers.insert(tag.into(), f);
        self
    }
}

/// Demultiplexes a chunk stream produced by [`crate::encoder::Encoder`]
/// (or anything emitting the same wire format) back into a value.
#[derive(Default)]
pub struct Decoder {
    options: DecodeOptions,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DecodeOptions) -> Self {
        Self { options }
    }

    /// Decode `chunks` into a value. The first item is the root value's
    /// own text; every subsequent item is one producer frame
    /// (`"<id>:<status>:<payload>"`, see [`framing::parse_producer_chunk`]).
    /// Returns as soon as the root value has been parsed; its embedded
    /// futures and sequences resolve in the background as `chunks`
    /// continues to yield frames.
    pub async fn decode_stream<S>(&self, mut chunks: S) -> Result<DecodeValue, DecodeError>
    where
        S: Stream<Item = Result<String, DecodeError>> + Send + Unpin + 'static,
    {
        use futures::StreamExt;

        let mut ctx = DecoderContext {
            sinks: Arc::new(Mutex::new(HashMap::new())),
            revivers: Arc::new(self.options.revivers.clone()),
        };

        let root_text = match chunks.next().await {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            None => return Err(DecodeError::StreamTruncated),
        };
        let root = codec::parse(&root_text, &mut ctx)?;

        tokio::spawn(pump(chunks, ctx));

        Ok(root)
    }
}

async fn pump<S>(mut chunks: S, mut ctx: DecoderContext)
where
    S: Stream<Item = Result<String, DecodeError>> + Send + Unpin + 'static,
{
    use futures::StreamExt;

    while let Some(next) = chunks.next().await {
        let raw = match next {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "chunk transport failed; failing outstanding producers");
                fail_all(&ctx, err).await;
                return;
            }
        };
        let frame = match framing::parse_producer_chunk(&raw) {
            Ok(frame) => frame,
            Err(reason) => {
                tracing::warn!(%reason, "malformed chunk; failing outstanding producers");
                fail_all(&ctx, DecodeError::Malformed(reason)).await;
                return;
            }
        };
        dispatch(&mut ctx, frame).await;
    }
    ctx.sinks.lock().clear();
}

/// Delivers `err` to every outstanding sink and empties the registry,
/// ending the demultiplexer: a malformed chunk header or a transport
/// failure can't be attributed to one producer, so all of them observe
/// it (`spec.md` §4.2, "Error semantics").
async fn fail_all(ctx: &DecoderContext, err: DecodeError) {
    let senders: Vec<_> = ctx
        .sinks
        .lock()
        .drain()
        .map(|(_, entry)| entry.sender)
        .collect();
    for sender in senders {
        let _ = sender.send(SinkMessage::Failed(err.broadcast())).await;
    }
}

async fn dispatch(ctx: &mut DecoderContext, frame: framing::ProducerFrame) {
    let kind = {
        let sinks = ctx.sinks.lock();
        match sinks.get(&frame.id) {
            Some(entry) => entry.kind,
            None => {
                tracing::debug!(id = %frame.id, "dropping frame for unknown producer");
                return;
            }
        }
    };

    let value = match codec::parse(&frame.payload, ctx) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(id = %frame.id, error = %err, "dropping malformed producer payload");
            return;
        }
    };

    let (message, terminal) = match (kind, frame.status) {
        (ProducerKind::Future, FUTURE_OK) => (SinkMessage::FutureResolved(Ok(value)), true),
        (ProducerKind::Future, FUTURE_ERR) => (SinkMessage::FutureResolved(Err(value)), true),
        (ProducerKind::Sequence, SEQ_YIELD) => {
            (SinkMessage::SequenceStep(SeqStep::Yield(value)), false)
        }
        (ProducerKind::Sequence, SEQ_RETURN) => {
            (SinkMessage::SequenceStep(SeqStep::Return(value)), true)
        }
        (ProducerKind::Sequence, SEQ_ERROR) => {
            (SinkMessage::SequenceStep(SeqStep::Error(value)), true)
        }
        (_, status) => {
            tracing::warn!(id = %frame.id, status, "status code does not match producer kind");
            (SinkMessage::Failed(DecodeError::UnknownStatus(status, frame.id)), true)
        }
    };

    let sender = if terminal {
        ctx.sinks.lock().remove(&frame.id).map(|entry| entry.sender)
    } else {
        ctx.sinks
            .lock()
            .get(&frame.id)
            .map(|entry| entry.sender.clone())
    };

    if let Some(sender) = sender {
        let _ = sender.send(message).await;
    }
}


impl std::fmt::Debug for SequenceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceOutcome::Yield(v) => write!(f, "Yield({v:?})"),
            SequenceOutcome::Return(v) => write!(f, "Return({v:?})"),
        }
    }
}
