//! Encoder: multiplexes a value's nested futures and sequences into a
//! single ordered chunk stream (`spec.md` §4.1).
//!
//! Producers race against each other in a [`FuturesUnordered`] pool —
//! whichever step resolves first is the next chunk emitted, regardless
//! of registration order. Futures and sequences are pooled separately
//! so that abandoning the stream can treat them differently: a
//! dropped `Future` just stops being polled (ordinary `Drop`), while a
//! dropped `Sequence` gets one last chance to run its async `cancel()`
//! hook via a background task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;

use crate::codec::{self, ReducerFn, Registrar};
use crate::error::EncodeError;
use crate::framing::{
    IdAllocator, ProducerFrame, ProducerId, FUTURE_ERR, FUTURE_OK, SEQ_ERROR, SEQ_RETURN,
    SEQ_YIELD,
};
use crate::value::{
    AsyncProducer, AsyncSequenceSource, BoxedOutcomeFuture, CoerceErrorFn, EncodeValue,
    FutureOutcome, SequenceStep,
};

/// Configuration for [`Encoder::encode_stream`].
#[derive(Default)]
pub struct EncodeOptions {
    reducers: HashMap<String, ReducerFn>,
    coerce_error: Option<CoerceErrorFn>,
}

impl EncodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer invoked on a [`crate::value::Tree::Tagged`]
    /// value's payload, by tag, before it is flattened.
    #[must_use]
    pub fn reducer(mut self, tag: impl Into<String>, f: ReducerFn) -> Self {
        self.reducers.insert(tag.into(), f);
        self
    }

    /// A fallback applied when a `Future`'s rejected cause fails to
    /// encode on its own: retries encoding `f`'s output instead of
    /// falling back straight to the encoding failure's own text
    /// (`spec.md` §4.1, the `coerceError` option).
    #[must_use]
    pub fn coerce_error(mut self, f: CoerceErrorFn) -> Self {
        self.coerce_error = Some(f);
        self
    }
}

/// Multiplexes a value's nested futures/sequences into a single
/// ordered chunk stream.
#[derive(Default)]
pub struct Encoder {
    options: EncodeOptions,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: EncodeOptions) -> Self {
        Self { options }
    }

    /// Encode `value` as a chunk stream: the first item is the root
    /// value's own text; every subsequent item is one producer frame
    /// (`"<id>:<status>:<payload>"`, see [`ProducerFrame::to_chunk`]).
    pub fn encode_stream(&self, value: EncodeValue) -> Result<EncodeStream, EncodeError> {
        let mut core = EncoderCore {
            ids: IdAllocator::new(),
            reducers: self.options.reducers.clone(),
            coerce_error: self.options.coerce_error.clone(),
            pending: Vec::new(),
        };
        let root_text = codec::stringify(value, &mut core)?;
        let mut stream = EncodeStream {
            core,
            future_tasks: FuturesUnordered::new(),
            sequence_tasks: FuturesUnordered::new(),
            cancel_senders: HashMap::new(),
            root_text: Some(root_text),
        };
        stream.arm_pending();
        Ok(stream)
    }
}

struct EncoderCore {
    ids: IdAllocator,
    reducers: HashMap<String, ReducerFn>,
    coerce_error: Option<CoerceErrorFn>,
    pending: Vec<(ProducerId, AsyncProducer)>,
}

impl Registrar for EncoderCore {
    fn register_future(&mut self, fut: BoxedOutcomeFuture) -> ProducerId {
        let id = self.ids.alloc();
        self.pending.push((id, AsyncProducer::Future(fut)));
        id
    }

    fn register_sequence(&mut self, seq: Box<dyn AsyncSequenceSource>) -> ProducerId {
        let id = self.ids.alloc();
        self.pending.push((id, AsyncProducer::Sequence(seq)));
        id
    }

    fn reducer(&self, tag: &str) -> Option<&ReducerFn> {
        self.reducers.get(tag)
    }
}

type BoxedFutureTask = Pin<Box<dyn Future<Output = (ProducerId, Result<EncodeValue, EncodeValue>)> + Send>>;

enum SequenceTaskOutcome {
    Step(ProducerId, SequenceStep, Box<dyn AsyncSequenceSource>),
    Cancelled(ProducerId),
}

type BoxedSequenceTask = Pin<Box<dyn Future<Output = SequenceTaskOutcome> + Send>>;

/// The chunk stream produced by [`Encoder::encode_stream`]. Implements
/// [`futures::Stream`]; poll it (or collect it, or forward it over a
/// transport) to drive the encoding to completion.
pub struct EncodeStream {
    core: EncoderCore,
    future_tasks: FuturesUnordered<BoxedFutureTask>,
    sequence_tasks: FuturesUnordered<BoxedSequenceTask>,
    cancel_senders: HashMap<ProducerId, oneshot::Sender<()>>,
    root_text: Option<String>,
}

impl EncodeStream {
    fn arm_pending(&mut self) {
        let pending = std::mem::take(&mut self.core.pending);
        for (id, producer) in pending {
            match producer {
                AsyncProducer::Future(fut) => {
                    let coerce_error = self.core.coerce_error.clone();
                    self.future_tasks.push(Box::pin(async move {
                        let result = match fut.await {
                            FutureOutcome::Ready(result) => result,
                            FutureOutcome::Plain(Ok(v)) => {
                                Ok(crate::value::safe_encode(v.as_ref(), coerce_error.as_ref()))
                            }
                            FutureOutcome::Plain(Err(e)) => {
                                Err(crate::value::safe_encode(e.as_ref(), coerce_error.as_ref()))
                            }
                        };
                        (id, result)
                    }));
                }
                AsyncProducer::Sequence(source) => self.arm_sequence_task(id, source),
            }
        }
    }

    fn arm_sequence_task(&mut self, id: ProducerId, source: Box<dyn AsyncSequenceSource>) {
        let (tx, rx) = oneshot::channel();
        self.cancel_senders.insert(id, tx);
        self.sequence_tasks.push(Box::pin(sequence_step(id, source, rx)));
    }

    fn finish(&mut self, id: ProducerId, status: u8, value: EncodeValue) -> Result<String, EncodeError> {
        let payload = codec::stringify(value, &mut self.core)?;
        self.arm_pending();
        Ok(ProducerFrame { id, status, payload }.to_chunk())
    }
}

async fn sequence_step(
    id: ProducerId,
    mut source: Box<dyn AsyncSequenceSource>,
    mut cancel: oneshot::Receiver<()>,
) -> SequenceTaskOutcome {
    tokio::select! {
        step = source.next() => SequenceTaskOutcome::Step(id, step, source),
        _ = &mut cancel => {
            source.cancel().await;
            SequenceTaskOutcome::Cancelled(id)
        }
    }
}

impl Stream for EncodeStream {
    type Item = Result<String, EncodeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();

        if let Some(root) = this.root_text.take() {
            return Poll::Ready(Some(Ok(root)));
        }

        if let Poll::Ready(Some((id, result))) = this.future_tasks.poll_next_unpin(cx) {
            this.cancel_senders.remove(&id);
            let (status, value) = match result {
                Ok(v) => (FUTURE_OK, v),
                Err(v) => (FUTURE_ERR, v),
            };
            return Poll::Ready(Some(this.finish(id, status, value)));
        }

        if let Poll::Ready(Some(outcome)) = this.sequence_tasks.poll_next_unpin(cx) {
            return match outcome {
                SequenceTaskOutcome::Cancelled(_) => {
                    unreachable!("cancellation is only signalled from Drop")
                }
                SequenceTaskOutcome::Step(id, step, source) => {
                    let (status, value, rearm) = match step {
                        SequenceStep::Yield(v) => (SEQ_YIELD, v, Some(source)),
                        SequenceStep::Return(v) => (SEQ_RETURN, v, None),
                        SequenceStep::Error(v) => (SEQ_ERROR, v, None),
                    };
                    if let Some(source) = rearm {
                        this.arm_sequence_task(id, source);
                    } else {
                        this.cancel_senders.remove(&id);
                    }
                    Poll::Ready(Some(this.finish(id, status, value)))
                }
            };
        }

        if this.future_tasks.is_empty() && this.sequence_tasks.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

impl Drop for EncodeStream {
    fn drop(&mut self) {
        if self.sequence_tasks.is_empty() {
            return;
        }
        for (_, sender) in self.cancel_senders.drain() {
            let _ = sender.send(());
        }
        let mut sequence_tasks = std::mem::take(&mut self.sequence_tasks);
        tokio::spawn(async move { while sequence_tasks.next().await.is_some() {} });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::parse_producer_chunk;
    use crate::value::Tree;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn collect(stream: EncodeStream) -> Vec<String> {
        futures::pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.push(chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn future_resolution_emits_root_then_one_frame() {
        let value = EncodeValue::future(async { Ok::<i32, String>(7) });
        let stream = Encoder::new().encode_stream(value).unwrap();
        let chunks = collect(stream).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], r#"{"$future":1}"#);
        let frame = parse_producer_chunk(&chunks[1]).unwrap();
        assert_eq!(frame.status, FUTURE_OK);
        assert_eq!(frame.payload, "7");
    }

    #[tokio::test]
    async fn future_rejection_emits_error_status() {
        let value = EncodeValue::future(async { Err::<i32, String>("boom".to_string()) });
        let stream = Encoder::new().encode_stream(value).unwrap();
        let chunks = collect(stream).await;
        let frame = parse_producer_chunk(&chunks[1]).unwrap();
        assert_eq!(frame.status, FUTURE_ERR);
        assert_eq!(frame.payload, r#""boom""#);
    }

    #[tokio::test]
    async fn sequence_of_three_yields_then_returns() {
        let items: Vec<Result<i32, String>> = vec![Ok(1), Ok(2), Ok(3)];
        let value = EncodeValue::sequence(futures::stream::iter(items));
        let stream = Encoder::new().encode_stream(value).unwrap();
        let chunks = collect(stream).await;
        assert_eq!(chunks.len(), 5);
        let statuses: Vec<u8> = chunks[1..]
            .iter()
            .map(|c| parse_producer_chunk(c).unwrap().status)
            .collect();
        assert_eq!(statuses, vec![SEQ_YIELD, SEQ_YIELD, SEQ_YIELD, SEQ_RETURN]);
    }

    #[tokio::test]
    async fn independent_producers_interleave_by_readiness() {
        let fast = EncodeValue::future(async { Ok::<i32, String>(1) });
        let slow = EncodeValue::future(async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok::<i32, String>(2)
        });
        let root = Tree::object([
            ("fast".to_string(), fast),
            ("slow".to_string(), slow),
        ]);
        let stream = Encoder::new().encode_stream(root).unwrap();
        let chunks = collect(stream).await;
        assert_eq!(chunks.len(), 3);
        let first_frame = parse_producer_chunk(&chunks[1]).unwrap();
        assert_eq!(first_frame.payload, "1");
    }

    struct RecordingSequence {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AsyncSequenceSource for RecordingSequence {
        async fn next(&mut self) -> SequenceStep {
            std::future::pending().await
        }

        async fn cancel(&mut self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    struct Unencodable;

    impl crate::value::Encodable for Unencodable {
        fn encode(&self) -> Result<EncodeValue, crate::error::EncodeError> {
            Err(crate::error::EncodeError::ValueUnencodable("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn coerce_error_rescues_an_unencodable_cause() {
        let options = EncodeOptions::new().coerce_error(Arc::new(|_: &dyn crate::value::Encodable| {
            Box::new("coerced".to_string()) as Box<dyn crate::value::Encodable>
        }));
        let value = EncodeValue::future(async { Err::<i32, Unencodable>(Unencodable) });
        let stream = Encoder::with_options(options).encode_stream(value).unwrap();
        let chunks = collect(stream).await;
        let frame = parse_producer_chunk(&chunks[1]).unwrap();
        assert_eq!(frame.status, FUTURE_ERR);
        assert_eq!(frame.payload, r#""coerced""#);
    }

    #[tokio::test]
    async fn without_coerce_error_unencodable_cause_falls_back_to_its_own_text() {
        let value = EncodeValue::future(async { Err::<i32, Unencodable>(Unencodable) });
        let stream = Encoder::new().encode_stream(value).unwrap();
        let chunks = collect(stream).await;
        let frame = parse_producer_chunk(&chunks[1]).unwrap();
        assert_eq!(frame.status, FUTURE_ERR);
        assert!(frame.payload.contains("boom"));
    }

    #[tokio::test]
    async fn abandoning_a_sequence_invokes_cancel() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let value = EncodeValue::sequence_source(RecordingSequence {
            cancelled: cancelled.clone(),
        });
        let mut stream = Encoder::new().encode_stream(value).unwrap();
        futures::StreamExt::next(&mut stream).await;
        drop(stream);
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
