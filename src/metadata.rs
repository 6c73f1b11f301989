//! Entry metadata: the wire-level header stored with every appended payload.
//!
//! An entry is framed as a little-endian `u32` header length, the JSON
//! header, then the raw payload bytes. The header carries the producer
//! identity and sequencing fields the dedup engine needs to classify the
//! message again during recovery replay.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

/// Property key carrying `"<lid>:<eid>"`, the source-cluster ledger position
/// of a replicated message.
pub const PROP_REPL_SOURCE_POSITION: &str = "__repl.source.position";

/// Reserved marker-type range denoting replication markers.
pub const MARKER_TYPE_REPLICATION_MIN: i32 = 10;
pub const MARKER_TYPE_REPLICATION_MAX: i32 = 19;

/// Whether a marker type falls in the reserved replication range.
pub fn is_replication_marker(marker_type: i32) -> bool {
    (MARKER_TYPE_REPLICATION_MIN..=MARKER_TYPE_REPLICATION_MAX).contains(&marker_type)
}

/// Per-entry metadata header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub producer_name: String,
    pub sequence_id: u64,
    /// Upper bound of a batch's sequence ids. Defaults to `sequence_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_sequence_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<(String, String)>,
}

impl MessageMetadata {
    pub fn new(producer_name: impl Into<String>, sequence_id: u64) -> Self {
        MessageMetadata {
            producer_name: producer_name.into(),
            sequence_id,
            ..Default::default()
        }
    }

    /// Look up a property value by key (first match wins).
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The batch upper bound, never below `sequence_id`.
    pub fn effective_highest_sequence_id(&self) -> u64 {
        self.highest_sequence_id
            .unwrap_or(self.sequence_id)
            .max(self.sequence_id)
    }

    /// Whether this entry is a replication marker.
    pub fn is_replication_marker(&self) -> bool {
        self.marker_type.is_some_and(is_replication_marker)
    }

    /// Frame this header together with `payload` into one log entry.
    pub fn encode(&self, payload: &Bytes) -> Result<Bytes, MetadataError> {
        let header =
            serde_json::to_vec(self).map_err(|e| MetadataError::Header(e.to_string()))?;
        let mut entry = BytesMut::with_capacity(4 + header.len() + payload.len());
        entry.put_u32_le(header.len() as u32);
        entry.put_slice(&header);
        entry.put_slice(payload);
        Ok(entry.freeze())
    }

    /// Split a log entry back into its header and payload.
    pub fn decode(entry: &Bytes) -> Result<(MessageMetadata, Bytes), MetadataError> {
        if entry.len() < 4 {
            return Err(MetadataError::Truncated(entry.len()));
        }
        let header_len = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
        if 4 + header_len > entry.len() {
            return Err(MetadataError::BadFraming {
                header_len,
                entry_len: entry.len(),
            });
        }
        let metadata = serde_json::from_slice(&entry[4..4 + header_len])
            .map_err(|e| MetadataError::Header(e.to_string()))?;
        Ok((metadata, entry.slice(4 + header_len..)))
    }
}

/// Parse a `"<lid>:<eid>"` source-position property value.
pub fn parse_source_position(value: &str) -> Result<(u64, u64), MetadataError> {
    let (lid, eid) = value
        .split_once(':')
        .ok_or_else(|| MetadataError::SourcePosition {
            value: value.to_string(),
            message: "expected <lid>:<eid>".to_string(),
        })?;
    let lid = lid.parse::<u64>().map_err(|e| MetadataError::SourcePosition {
        value: value.to_string(),
        message: format!("bad lid: {e}"),
    })?;
    let eid = eid.parse::<u64>().map_err(|e| MetadataError::SourcePosition {
        value: value.to_string(),
        message: format!("bad eid: {e}"),
    })?;
    Ok((lid, eid))
}

/// State carried through one in-flight publish.
///
/// Built by the pipeline from the producer session and the message header,
/// then annotated (replication recognition, chunk bounds) before it reaches
/// classification.
#[derive(Clone, Debug)]
pub struct PublishContext {
    pub producer: String,
    pub sequence_id: u64,
    pub highest_sequence_id: u64,
    /// Producer session declared the ledger-position dedup capability.
    pub supports_repl_dedup_v2: bool,

    // Filled in by pipeline annotation.
    pub(crate) remote: bool,
    pub(crate) repl_marker: bool,
    pub(crate) repl_source_position: Option<(u64, u64)>,
    pub(crate) original_producer: Option<String>,
    pub(crate) original_sequence_id: Option<u64>,
    pub(crate) original_highest_sequence_id: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) last_chunk: bool,
}

impl PublishContext {
    pub fn new(producer: impl Into<String>, sequence_id: u64) -> Self {
        PublishContext {
            producer: producer.into(),
            sequence_id,
            highest_sequence_id: sequence_id,
            supports_repl_dedup_v2: false,
            remote: false,
            repl_marker: false,
            repl_source_position: None,
            original_producer: None,
            original_sequence_id: None,
            original_highest_sequence_id: None,
            chunked: false,
            last_chunk: true,
        }
    }

    pub fn with_highest_sequence_id(mut self, highest: u64) -> Self {
        self.highest_sequence_id = highest.max(self.sequence_id);
        self
    }

    pub fn with_repl_dedup_v2(mut self, supported: bool) -> Self {
        self.supports_repl_dedup_v2 = supported;
        self
    }

    /// Whether this publish was recognized as a replication marker.
    pub fn is_repl_marker(&self) -> bool {
        self.repl_marker
    }

    /// Producer identity used on the dedup path. For replicated messages
    /// this is the source-cluster producer recovered from the header, not
    /// the replicator session.
    pub(crate) fn dedup_producer(&self) -> &str {
        self.original_producer.as_deref().unwrap_or(&self.producer)
    }

    pub(crate) fn dedup_sequence_id(&self) -> u64 {
        self.original_sequence_id.unwrap_or(self.sequence_id)
    }

    pub(crate) fn dedup_highest_sequence_id(&self) -> u64 {
        self.original_highest_sequence_id
            .unwrap_or(self.highest_sequence_id)
            .max(self.dedup_sequence_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut meta = MessageMetadata::new("alpha", 7);
        meta.highest_sequence_id = Some(9);
        meta.properties
            .push((PROP_REPL_SOURCE_POSITION.to_string(), "3:14".to_string()));

        let payload = Bytes::from_static(b"hello");
        let entry = meta.encode(&payload).unwrap();
        let (decoded, body) = MessageMetadata::decode(&entry).unwrap();

        assert_eq!(decoded, meta);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_decode_rejects_bad_framing() {
        assert!(matches!(
            MessageMetadata::decode(&Bytes::from_static(b"ab")),
            Err(MetadataError::Truncated(2))
        ));

        let mut entry = BytesMut::new();
        entry.put_u32_le(1000);
        entry.put_slice(b"{}");
        assert!(matches!(
            MessageMetadata::decode(&entry.freeze()),
            Err(MetadataError::BadFraming { .. })
        ));
    }

    #[test]
    fn test_highest_sequence_defaults_to_sequence() {
        let meta = MessageMetadata::new("alpha", 5);
        assert_eq!(meta.effective_highest_sequence_id(), 5);

        let mut meta = MessageMetadata::new("alpha", 5);
        meta.highest_sequence_id = Some(3); // below the lower bound
        assert_eq!(meta.effective_highest_sequence_id(), 5);
    }

    #[test]
    fn test_source_position_parsing() {
        assert_eq!(parse_source_position("10:5").unwrap(), (10, 5));
        assert_eq!(parse_source_position("0:0").unwrap(), (0, 0));
        assert!(parse_source_position("10").is_err());
        assert!(parse_source_position("10:").is_err());
        assert!(parse_source_position("-1:5").is_err());
        assert!(parse_source_position("a:b").is_err());
    }

    #[test]
    fn test_replication_marker_range() {
        assert!(is_replication_marker(MARKER_TYPE_REPLICATION_MIN));
        assert!(is_replication_marker(MARKER_TYPE_REPLICATION_MAX));
        assert!(!is_replication_marker(MARKER_TYPE_REPLICATION_MIN - 1));
        assert!(!is_replication_marker(MARKER_TYPE_REPLICATION_MAX + 1));

        let mut meta = MessageMetadata::new("broker-internal", 0);
        meta.marker_type = Some(MARKER_TYPE_REPLICATION_MIN);
        assert!(meta.is_replication_marker());
    }
}
