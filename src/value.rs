//! The value tree the codec moves across the wire, and the two
//! built-in async leaf kinds (`Future`, `Sequence`) layered on top of
//! the (out-of-scope) synchronous value codec — `spec.md` §3, §9.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::EncodeError;

/// A plain-data shape shared by both the encoder-side and decoder-side
/// value trees, parameterized over how an async leaf (`Future` or
/// `Sequence`) is represented on that side.
///
/// `Tree<AsyncProducer>` (aliased [`EncodeValue`]) is what callers hand
/// to [`crate::encoder::Encoder::encode_stream`]; `Tree<AsyncHandle>`
/// (aliased [`crate::decoder::DecodeValue`]) is what
/// [`crate::decoder::Decoder::decode_stream`] hands back.
pub enum Tree<A> {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Tree<A>>),
    Object(BTreeMap<String, Tree<A>>),
    /// An extension point for reducers/revivers beyond the two built-in
    /// async kinds: a type tag plus its already-reduced payload.
    Tagged(String, Box<Tree<A>>),
    /// A `Future<T>` or `Sequence<T>` leaf, represented as `A`.
    Async(A),
}

/// Manual `Debug` impl: the async leaf `A` need not implement `Debug`
/// itself (it may hold a boxed future/trait object), so this never
/// requires `A: Debug`.
impl<A> fmt::Debug for Tree<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tree::Null => write!(f, "Null"),
            Tree::Bool(b) => write!(f, "Bool({b:?})"),
            Tree::Number(n) => write!(f, "Number({n})"),
            Tree::String(s) => write!(f, "String({s:?})"),
            Tree::Array(items) => f.debug_list().entries(items).finish(),
            Tree::Object(map) => f.debug_map().entries(map.iter()).finish(),
            Tree::Tagged(tag, inner) => write!(f, "Tagged({tag:?}, {inner:?})"),
            Tree::Async(_) => write!(f, "Async(..)"),
        }
    }
}

impl<A> Tree<A> {
    pub fn string(s: impl Into<String>) -> Self {
        Tree::String(s.into())
    }

    pub fn number(n: impl Into<serde_json::Number>) -> Self {
        Tree::Number(n.into())
    }

    pub fn object(fields: impl IntoIterator<Item = (String, Tree<A>)>) -> Self {
        Tree::Object(fields.into_iter().collect())
    }
}

/// Anything that can be handed to the (out-of-scope) synchronous value
/// codec to be flattened into the wire representation. Implemented
/// generically for any `Send + 'static` `Serialize` type; user error
/// types and domain values alike satisfy this without extra
/// boilerplate.
pub trait Encodable: Send + 'static {
    fn encode(&self) -> Result<EncodeValue, EncodeError>;
}

impl<T> Encodable for T
where
    T: serde::Serialize + Send + 'static,
{
    fn encode(&self) -> Result<EncodeValue, EncodeError> {
        let json = serde_json::to_value(self)?;
        Ok(json_to_tree(json))
    }
}

fn json_to_tree(json: serde_json::Value) -> EncodeValue {
    match json {
        serde_json::Value::Null => Tree::Null,
        serde_json::Value::Bool(b) => Tree::Bool(b),
        serde_json::Value::Number(n) => Tree::Number(n),
        serde_json::Value::String(s) => Tree::String(s),
        serde_json::Value::Array(items) => {
            Tree::Array(items.into_iter().map(json_to_tree).collect())
        }
        serde_json::Value::Object(map) => {
            Tree::Object(map.into_iter().map(|(k, v)| (k, json_to_tree(v))).collect())
        }
    }
}

/// A fallback, configured on [`crate::encoder::EncodeOptions`], that
/// retries encoding an error cause that the synchronous value codec
/// rejected (`spec.md` §4.1, the `coerceError` option).
pub type CoerceErrorFn = Arc<dyn Fn(&dyn Encodable) -> Box<dyn Encodable> + Send + Sync>;

/// Encode `value` (`spec.md`'s `safeCause`): try `value.encode()`; on
/// failure, if `coerce_error` is set, retry with its output; otherwise
/// (or if that retry also fails) fall back to the encoding error's own
/// text. A `Future`/`Sequence` outcome must always produce a wire-ready
/// payload even when the underlying value doesn't serialize cleanly, so
/// a terminal frame is never blocked on this.
pub(crate) fn safe_encode(value: &dyn Encodable, coerce_error: Option<&CoerceErrorFn>) -> EncodeValue {
    match value.encode() {
        Ok(tree) => tree,
        Err(err) => match coerce_error.map(|coerce| coerce(value)) {
            Some(coerced) => coerced.encode().unwrap_or_else(|_| Tree::String(err.to_string())),
            None => Tree::String(err.to_string()),
        },
    }
}

/// The outcome of a [`Sequence`] source's next step.
pub enum SequenceStep {
    /// The sequence produced an item; it is not yet done.
    Yield(EncodeValue),
    /// The sequence terminated normally with a return value.
    Return(EncodeValue),
    /// The sequence terminated abnormally.
    Error(EncodeValue),
}

/// An encoder-side async sequence source: a lazy ordered stream
/// producing zero or more items, terminated by a return value or a
/// failure (`spec.md` §3, `Sequence<T>`).
///
/// Object-safe via `async-trait` so heterogeneous sequence sources can
/// be boxed and driven uniformly by the encoder's multiplexer.
#[async_trait::async_trait]
pub trait AsyncSequenceSource: Send {
    /// Advance the sequence by one step.
    async fn next(&mut self) -> SequenceStep;

    /// Invoked when the sequence is abandoned before it reaches a
    /// terminal step (the consumer of the chunk stream stopped
    /// pulling). The default does nothing; sources holding an external
    /// resource should override this to release it.
    async fn cancel(&mut self) {}
}

/// Wraps any `futures::Stream<Item = Result<T, E>>` as an
/// [`AsyncSequenceSource`]. The stream's exhaustion (`None`) is treated
/// as a normal return with `Tree::Null`, since most host stream types
/// have no notion of a distinguished return value — callers that need
/// one should implement [`AsyncSequenceSource`] directly.
pub struct StreamSequence<S> {
    inner: S,
}

impl<S> StreamSequence<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<S, T, E> AsyncSequenceSource for StreamSequence<S>
where
    S: futures::Stream<Item = Result<T, E>> + Send + Unpin,
    T: Encodable,
    E: Encodable,
{
    async fn next(&mut self) -> SequenceStep {
        use futures::StreamExt;
        match self.inner.next().await {
            Some(Ok(item)) => SequenceStep::Yield(safe_encode(&item, None)),
            Some(Err(err)) => SequenceStep::Error(safe_encode(&err, None)),
            None => SequenceStep::Return(Tree::Null),
        }
    }
}

/// The outcome of a plain-`Encodable` future, still carrying its raw
/// `T`/`E` rather than an already-flattened [`EncodeValue`]. Encoding is
/// deferred until the producer is resolved by
/// [`crate::encoder::EncodeStream`], so the `coerce_error` hook
/// configured on [`crate::encoder::EncodeOptions`] (unknown until
/// `Encoder::encode_stream` is called) can still apply to it.
pub(crate) enum FutureOutcome {
    /// Already flattened — constructed via `future_value`, which
    /// bypasses `coerce_error` since the caller already controls
    /// encoding.
    Ready(Result<EncodeValue, EncodeValue>),
    /// A plain `Encodable` outcome awaiting `safe_encode`.
    Plain(Result<Box<dyn Encodable>, Box<dyn Encodable>>),
}

pub(crate) type BoxedOutcomeFuture = Pin<Box<dyn Future<Output = FutureOutcome> + Send>>;

/// An encoder-side producer: a live `Future` or `Sequence` source that
/// has not yet been registered with an [`crate::encoder::Encoder`].
pub enum AsyncProducer {
    Future(BoxedOutcomeFuture),
    Sequence(Box<dyn AsyncSequenceSource>),
}

/// The value tree handed to [`crate::encoder::Encoder::encode_stream`].
pub type EncodeValue = Tree<AsyncProducer>;

impl EncodeValue {
    /// Wrap a future resolving to a plain `Encodable` value/error as a
    /// `Future<T>` leaf. Encoding happens once the future resolves and
    /// the producer is driven by an `Encoder`, so a `coerce_error` hook
    /// configured there can still retry a failed error cause.
    pub fn future<F, T, E>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Encodable,
        E: Encodable,
    {
        let boxed: BoxedOutcomeFuture = Box::pin(async move {
            match fut.await {
                Ok(v) => FutureOutcome::Plain(Ok(Box::new(v))),
                Err(e) => FutureOutcome::Plain(Err(Box::new(e))),
            }
        });
        Tree::Async(AsyncProducer::Future(boxed))
    }

    /// Wrap a future resolving directly to a (possibly nested)
    /// [`EncodeValue`] as a `Future<T>` leaf. Use this when the future's
    /// own result may itself embed further `Future`/`Sequence` leaves.
    pub fn future_value<F>(fut: F) -> Self
    where
        F: Future<Output = Result<EncodeValue, EncodeValue>> + Send + 'static,
    {
        Tree::Async(AsyncProducer::Future(Box::pin(async move {
            FutureOutcome::Ready(fut.await)
        })))
    }

    /// Wrap a stream as a `Sequence<T>` leaf (see [`StreamSequence`]).
    pub fn sequence<S, T, E>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<T, E>> + Send + Unpin + 'static,
        T: Encodable,
        E: Encodable,
    {
        Tree::Async(AsyncProducer::Sequence(Box::new(StreamSequence::new(
            stream,
        ))))
    }

    /// Wrap a custom [`AsyncSequenceSource`] as a `Sequence<T>` leaf. Use
    /// this when a yielded item may itself embed further
    /// `Future`/`Sequence` leaves.
    pub fn sequence_source(source: impl AsyncSequenceSource + 'static) -> Self {
        Tree::Async(AsyncProducer::Sequence(Box::new(source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_encode_via_serde() {
        let value: EncodeValue = 42i32.encode().unwrap();
        match value {
            Tree::Number(n) => assert_eq!(n.as_i64(), Some(42)),
            other => panic!("expected Number, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_exhaustion_returns_null() {
        let stream = futures::stream::iter(Vec::<Result<i32, String>>::new());
        let mut seq = StreamSequence::new(stream);
        match seq.next().await {
            SequenceStep::Return(Tree::Null) => {}
            SequenceStep::Return(_) => panic!("expected Return(Null)"),
            _ => panic!("expected Return"),
        }
    }

    #[tokio::test]
    async fn stream_error_is_encoded_as_error_step() {
        let stream = futures::stream::iter(vec![Err::<i32, _>("boom".to_string())]);
        let mut seq = StreamSequence::new(stream);
        match seq.next().await {
            SequenceStep::Error(Tree::String(s)) => assert_eq!(s, "boom"),
            _ => panic!("expected Error(\"boom\")"),
        }
    }
}
