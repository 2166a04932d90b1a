//! Chunk syntax: producer ids, status codes, and the delimited wire
//! framing chosen for this crate (`spec.md` §9, Open Question 1).

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Future resolved with a value.
pub const FUTURE_OK: u8 = 0;
/// Future failed with a cause.
pub const FUTURE_ERR: u8 = 1;
/// Sequence produced an item.
pub const SEQ_YIELD: u8 = 0;
/// Sequence terminated abnormally.
pub const SEQ_ERROR: u8 = 1;
/// Sequence terminated normally with a return value.
pub const SEQ_RETURN: u8 = 2;

/// A strictly positive producer id, unique within one encode/decode
/// pair. Id zero is unused by construction: [`ProducerId`] can never
/// hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(NonZeroU64);

impl ProducerId {
    pub(crate) fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(ProducerId)
    }

    /// The raw decimal value, as it appears on the wire.
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic producer id allocator. Shared between an [`crate::encoder::Encoder`]'s
/// root registration and every nested registration discovered while
/// flattening a producer's own emitted value.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self { next: AtomicU64::new(0) }
    }

    /// Allocate the next id in registration order.
    pub(crate) fn alloc(&self) -> ProducerId {
        let value = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        ProducerId::new(value).expect("allocator never yields zero")
    }
}

/// One producer chunk: `(id, status, payload)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerFrame {
    pub id: ProducerId,
    pub status: u8,
    pub payload: String,
}

impl ProducerFrame {
    /// Render as `"<id>:<status>:<payload>"`. The payload is the
    /// self-delimited textual output of the synchronous value codec,
    /// which never contains an unescaped newline, so a transport that
    /// preserves chunk boundaries (or simply splits on `\n`) round-trips
    /// this losslessly.
    pub fn to_chunk(&self) -> String {
        format!("{}:{}:{}", self.id, self.status, self.payload)
    }
}

/// Parse one producer chunk. `raw` must not include the trailing
/// newline the transport uses to delimit chunks.
pub fn parse_producer_chunk(raw: &str) -> Result<ProducerFrame, String> {
    let mut parts = raw.splitn(3, ':');
    let id_part = parts.next().ok_or_else(|| "missing id".to_string())?;
    let status_part = parts
        .next()
        .ok_or_else(|| "missing status".to_string())?;
    let payload = parts
        .next()
        .ok_or_else(|| "missing payload".to_string())?;

    let id_value: u64 = id_part
        .parse()
        .map_err(|_| format!("invalid producer id: {id_part:?}"))?;
    let id = ProducerId::new(id_value)
        .ok_or_else(|| "producer id must be positive".to_string())?;
    let status: u8 = status_part
        .parse()
        .map_err(|_| format!("invalid status code: {status_part:?}"))?;

    Ok(ProducerFrame {
        id,
        status,
        payload: payload.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let frame = ProducerFrame {
            id: ProducerId::new(7).unwrap(),
            status: SEQ_YIELD,
            payload: r#"{"n":1}"#.to_string(),
        };
        let chunk = frame.to_chunk();
        assert_eq!(chunk, r#"7:0:{"n":1}"#);
        assert_eq!(parse_producer_chunk(&chunk).unwrap(), frame);
    }

    #[test]
    fn rejects_non_decimal_id() {
        assert!(parse_producer_chunk("x:0:1").is_err());
    }

    #[test]
    fn rejects_zero_id() {
        assert!(parse_producer_chunk("0:0:1").is_err());
    }

    #[test]
    fn rejects_missing_delimiters() {
        assert!(parse_producer_chunk("7").is_err());
        assert!(parse_producer_chunk("7:0").is_err());
    }

    #[test]
    fn payload_may_contain_colons() {
        let raw = r#"3:0:{"url":"https://x"}"#;
        let frame = parse_producer_chunk(raw).unwrap();
        assert_eq!(frame.payload, r#"{"url":"https://x"}"#);
    }

    #[test]
    fn allocator_starts_at_one_and_is_monotonic() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.alloc().get(), 1);
        assert_eq!(alloc.alloc().get(), 2);
        assert_eq!(alloc.alloc().get(), 3);
    }
}
