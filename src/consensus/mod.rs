//! Consensus-facing types: operation ids, quorum configuration, and
//! the anchor registry that pins in-memory operations against log GC.

mod anchor;
mod metadata;

pub use anchor::OpIdAnchorRegistry;
pub use metadata::{ConsensusMetadata, QuorumConfig};

use std::fmt;

use bytes::BytesMut;

use crate::util::coding::{decode_varint64, encode_varint64};

/// Identifier of a replicated operation: a (term, index) pair.
///
/// Totally ordered first by term, then by index. The sentinel `(0, 0)`
/// denotes "uninitialized / minimum".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OpId {
    /// Leader term that proposed the operation.
    pub term: u64,
    /// Position of the operation within the term's log.
    pub index: u64,
}

impl OpId {
    /// The minimum (uninitialized) op id.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    /// Create an op id.
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// Check whether this is the minimum sentinel.
    pub fn is_min(&self) -> bool {
        *self == OpId::MIN
    }

    /// Encode to a buffer.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        encode_varint64(buf, self.term);
        encode_varint64(buf, self.index);
    }

    /// Decode from a buffer.
    pub fn decode_from(buf: &mut &[u8]) -> Option<Self> {
        let term = decode_varint64(buf)?;
        let index = decode_varint64(buf)?;
        Some(Self { term, index })
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.term, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opid_ordering() {
        assert!(OpId::new(1, 5) < OpId::new(2, 1));
        assert!(OpId::new(1, 1) < OpId::new(1, 2));
        assert!(OpId::MIN < OpId::new(1, 1));
        assert_eq!(OpId::new(3, 7), OpId::new(3, 7));
    }

    #[test]
    fn test_opid_display() {
        assert_eq!(OpId::new(1, 12).to_string(), "1,12");
        assert_eq!(OpId::MIN.to_string(), "0,0");
    }

    #[test]
    fn test_opid_encode_decode() {
        let id = OpId::new(7, 130);
        let mut buf = BytesMut::new();
        id.encode_to(&mut buf);

        let mut slice: &[u8] = &buf;
        assert_eq!(OpId::decode_from(&mut slice), Some(id));
        assert!(slice.is_empty());

        let mut truncated: &[u8] = &buf[..1];
        assert_eq!(OpId::decode_from(&mut truncated), None);
    }
}
