//! Hop-trace encoding carried in the BTP envelope's `"trace"` protocol data
//! entry, never in the ILP packet's own `data` field — a forwarded Prepare's
//! payload is untrusted and must round-trip to the next connector byte for
//! byte, so the trace this connector appends cannot live inside it.
//!
//! Wire format: a var-uint hop count followed by that many var-octet-string
//! node ids, using the same OER primitives as the ILP packet codec.

use ilp_packet::oer::{BufOerExt, MutBufOerExt};
use ilp_btp::ProtocolData;

use crate::errors::NodeError;

pub const PROTOCOL_NAME: &str = "trace";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HopTrace {
    pub node_ids: Vec<String>,
}

impl HopTrace {
    pub fn empty() -> Self {
        HopTrace::default()
    }

    pub fn hop_count(&self) -> usize {
        self.node_ids.len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_ids.iter().any(|id| id == node_id)
    }

    /// Returns a new trace with `node_id` appended, the form forwarded to
    /// the next hop.
    pub fn extended_with(&self, node_id: &str) -> Self {
        let mut node_ids = self.node_ids.clone();
        node_ids.push(node_id.to_owned());
        HopTrace { node_ids }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NodeError> {
        let mut reader = bytes;
        let count = reader
            .read_var_uint()
            .map_err(|e| NodeError::InvalidConfig(format!("malformed trace entry: {e}")))?;
        let mut node_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = reader
                .read_var_octet_string()
                .map_err(|e| NodeError::InvalidConfig(format!("malformed trace entry: {e}")))?;
            node_ids.push(
                std::str::from_utf8(id)
                    .map_err(|e| NodeError::InvalidConfig(format!("non-utf8 node id in trace: {e}")))?
                    .to_owned(),
            );
        }
        Ok(HopTrace { node_ids })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_var_uint(self.node_ids.len() as u64);
        for id in &self.node_ids {
            buf.put_var_octet_string(id.as_bytes());
        }
        buf
    }

    pub fn to_protocol_data(&self) -> ProtocolData {
        ProtocolData::trace(self.encode())
    }

    /// Extracts and decodes the `"trace"` entry from an incoming message's
    /// protocol data, defaulting to an empty trace if the sender included
    /// none (e.g. the packet originated at this node's own upstream edge).
    pub fn from_protocol_data(entries: &[ProtocolData]) -> Result<Self, NodeError> {
        match entries.iter().find(|p| p.protocol_name == PROTOCOL_NAME) {
            Some(entry) => HopTrace::decode(&entry.data),
            None => Ok(HopTrace::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let trace = HopTrace {
            node_ids: vec!["node-a".into(), "node-b".into()],
        };
        let decoded = HopTrace::decode(&trace.encode()).unwrap();
        assert_eq!(decoded, trace);
    }

    #[test]
    fn extending_appends_without_mutating_original() {
        let trace = HopTrace::empty();
        let extended = trace.extended_with("node-a");
        assert_eq!(trace.hop_count(), 0);
        assert_eq!(extended.node_ids, vec!["node-a".to_owned()]);
    }

    #[test]
    fn contains_detects_loop_membership() {
        let trace = HopTrace {
            node_ids: vec!["node-a".into(), "node-b".into()],
        };
        assert!(trace.contains("node-a"));
        assert!(!trace.contains("node-c"));
    }

    #[test]
    fn missing_entry_decodes_to_empty_trace() {
        let trace = HopTrace::from_protocol_data(&[]).unwrap();
        assert_eq!(trace, HopTrace::empty());
    }

    #[test]
    fn rejects_non_utf8_node_id() {
        let mut bytes = Vec::new();
        bytes.put_var_uint(1);
        bytes.put_var_octet_string(&[0xff, 0xfe]);
        assert!(HopTrace::decode(&bytes).is_err());
    }
}
