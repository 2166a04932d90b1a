//! The minimal stand-in for the out-of-scope external synchronous
//! value codec (`spec.md` §1: "the core treats it as a black box
//! exposing two hooks"). `stringify` flattens an [`EncodeValue`] to
//! text, registering any nested `Future`/`Sequence` leaf it encounters
//! along the way; `parse` is its mirror image, reviving placeholders
//! back into decoder-side leaves.
//!
//! This module intentionally does not attempt to be a general-purpose
//! value codec — it exists only so the Encoder/Decoder multiplexer
//! (the actual subject of this crate) has something real to drive.

use std::sync::Arc;

use crate::decoder::{AsyncHandle, DecodeValue};
use crate::error::{DecodeError, EncodeError};
use crate::framing::ProducerId;
use crate::value::{AsyncProducer, BoxedOutcomeFuture, EncodeValue, Tree};
use crate::value::AsyncSequenceSource;

/// A user-supplied transform applied to a [`Tree::Tagged`] value's
/// payload before it is flattened, keyed by tag.
pub type ReducerFn = Arc<dyn Fn(EncodeValue) -> EncodeValue + Send + Sync>;

/// A user-supplied transform applied to a [`Tree::Tagged`] value's
/// payload after it is parsed, keyed by tag.
pub type ReviverFn = Arc<dyn Fn(DecodeValue) -> DecodeValue + Send + Sync>;

const FUTURE_TAG: &str = "$future";
const SEQUENCE_TAG: &str = "$sequence";
const CUSTOM_TYPE_KEY: &str = "$type";
const CUSTOM_VALUE_KEY: &str = "$value";

/// Registers producers discovered while flattening a value tree.
/// Implemented by [`crate::encoder::EncoderCore`].
pub(crate) trait Registrar {
    fn register_future(&mut self, fut: BoxedOutcomeFuture) -> ProducerId;
    fn register_sequence(&mut self, seq: Box<dyn AsyncSequenceSource>) -> ProducerId;
    fn reducer(&self, tag: &str) -> Option<&ReducerFn>;
}

/// Revives placeholders discovered while parsing a chunk's payload.
/// Implemented by [`crate::decoder::DecoderContext`].
pub(crate) trait Reviver {
    fn revive_future(&mut self, id: ProducerId) -> AsyncHandle;
    fn revive_sequence(&mut self, id: ProducerId) -> AsyncHandle;
    fn reviver(&self, tag: &str) -> Option<&ReviverFn>;
}

/// Flatten `value` to its textual wire form, registering every nested
/// producer with `registrar`.
pub(crate) fn stringify(
    value: EncodeValue,
    registrar: &mut dyn Registrar,
) -> Result<String, EncodeError> {
    let json = tree_to_json(value, registrar)?;
    serde_json::to_string(&json).map_err(EncodeError::from)
}

fn tree_to_json(
    value: EncodeValue,
    registrar: &mut dyn Registrar,
) -> Result<serde_json::Value, EncodeError> {
    Ok(match value {
        Tree::Null => serde_json::Value::Null,
        Tree::Bool(b) => serde_json::Value::Bool(b),
        Tree::Number(n) => serde_json::Value::Number(n),
        Tree::String(s) => serde_json::Value::String(s),
        Tree::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(tree_to_json(item, registrar)?);
            }
            serde_json::Value::Array(out)
        }
        Tree::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, tree_to_json(item, registrar)?);
            }
            serde_json::Value::Object(out)
        }
        Tree::Tagged(tag, inner) => {
            let inner = match registrar.reducer(&tag) {
                Some(reduce) => reduce(*inner),
                None => *inner,
            };
            let inner_json = tree_to_json(inner, registrar)?;
            let mut out = serde_json::Map::with_capacity(2);
            out.insert(CUSTOM_TYPE_KEY.to_string(), serde_json::Value::String(tag));
            out.insert(CUSTOM_VALUE_KEY.to_string(), inner_json);
            serde_json::Value::Object(out)
        }
        Tree::Async(AsyncProducer::Future(fut)) => {
            let id = registrar.register_future(fut);
            placeholder(FUTURE_TAG, id)
        }
        Tree::Async(AsyncProducer::Sequence(seq)) => {
            let id = registrar.register_sequence(seq);
            placeholder(SEQUENCE_TAG, id)
        }
    })
}

fn placeholder(tag: &str, id: ProducerId) -> serde_json::Value {
    let mut out = serde_json::Map::with_capacity(1);
    out.insert(tag.to_string(), serde_json::Value::Number(id.get().into()));
    serde_json::Value::Object(out)
}

/// Parse a chunk's payload back into a [`DecodeValue`], reviving any
/// `Future`/`Sequence` placeholder with `reviver`.
pub(crate) fn parse(text: &str, reviver: &mut dyn Reviver) -> Result<DecodeValue, DecodeError> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    json_to_tree(json, reviver)
}

fn json_to_tree(
    json: serde_json::Value,
    reviver: &mut dyn Reviver,
) -> Result<DecodeValue, DecodeError> {
    Ok(match json {
        serde_json::Value::Null => Tree::Null,
        serde_json::Value::Bool(b) => Tree::Bool(b),
        serde_json::Value::Number(n) => Tree::Number(n),
        serde_json::Value::String(s) => Tree::String(s),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_to_tree(item, reviver)?);
            }
            Tree::Array(out)
        }
        serde_json::Value::Object(map) => {
            if let Some(handle) = try_revive_placeholder(&map, reviver) {
                return Ok(Tree::Async(handle));
            }
            if map.len() == 2 {
                if let (Some(serde_json::Value::String(tag)), Some(inner)) =
                    (map.get(CUSTOM_TYPE_KEY), map.get(CUSTOM_VALUE_KEY))
                {
                    let tree = json_to_tree(inner.clone(), reviver)?;
                    let revived = match reviver.reviver(tag) {
                        Some(revive) => revive(tree),
                        None => tree,
                    };
                    return Ok(Tree::Tagged(tag.clone(), Box::new(revived)));
                }
            }
            let mut out = std::collections::BTreeMap::new();
            for (key, item) in map {
                out.insert(key, json_to_tree(item, reviver)?);
            }
            Tree::Object(out)
        }
    })
}

fn try_revive_placeholder(
    map: &serde_json::Map<String, serde_json::Value>,
    reviver: &mut dyn Reviver,
) -> Option<AsyncHandle> {
    if map.len() != 1 {
        return None;
    }
    if let Some(id) = map.get(FUTURE_TAG).and_then(producer_id) {
        return Some(reviver.revive_future(id));
    }
    if let Some(id) = map.get(SEQUENCE_TAG).and_then(producer_id) {
        return Some(reviver.revive_sequence(id));
    }
    None
}

fn producer_id(value: &serde_json::Value) -> Option<ProducerId> {
    value.as_u64().and_then(ProducerId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::IdAllocator;
    use std::collections::HashMap;

    struct NullRegistrar {
        ids: IdAllocator,
        reducers: HashMap<String, ReducerFn>,
    }

    impl Registrar for NullRegistrar {
        fn register_future(&mut self, _fut: BoxedOutcomeFuture) -> ProducerId {
            self.ids.alloc()
        }
        fn register_sequence(&mut self, _seq: Box<dyn AsyncSequenceSource>) -> ProducerId {
            self.ids.alloc()
        }
        fn reducer(&self, tag: &str) -> Option<&ReducerFn> {
            self.reducers.get(tag)
        }
    }

    #[test]
    fn plain_tree_round_trips_through_json() {
        let mut reg = NullRegistrar {
            ids: IdAllocator::new(),
            reducers: HashMap::new(),
        };
        let value = Tree::Object(
            [("a".to_string(), Tree::Number(1.into())), ("b".to_string(), Tree::String("x".into()))]
                .into_iter()
                .collect(),
        );
        let text = stringify(value, &mut reg).unwrap();
        assert_eq!(text, r#"{"a":1,"b":"x"}"#);
    }

    struct RecordingReviver {
        seen: Vec<(bool, ProducerId)>,
        revivers: HashMap<String, ReviverFn>,
    }

    impl Reviver for RecordingReviver {
        fn revive_future(&mut self, id: ProducerId) -> AsyncHandle {
            self.seen.push((true, id));
            AsyncHandle::test_stub(id)
        }
        fn revive_sequence(&mut self, id: ProducerId) -> AsyncHandle {
            self.seen.push((false, id));
            AsyncHandle::test_stub(id)
        }
        fn reviver(&self, tag: &str) -> Option<&ReviverFn> {
            self.revivers.get(tag)
        }
    }

    #[test]
    fn placeholder_object_is_revived() {
        let mut rev = RecordingReviver {
            seen: Vec::new(),
            revivers: HashMap::new(),
        };
        let tree = parse(r#"{"a":{"$future":7}}"#, &mut rev).unwrap();
        assert_eq!(rev.seen, vec![(true, ProducerId::new(7).unwrap())]);
        match tree {
            Tree::Object(map) => assert!(matches!(map.get("a"), Some(Tree::Async(_)))),
            other => panic!("expected Object, got {other:?}"),
        }
    }
}
