//! Protobuf codec for persisted raft structures
//!
//! raft-rs is built with `prost-codec`, so every persisted record uses the
//! same wire format the consensus messages use.

use crate::error::{MetastoreError, Result};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};

fn decode<M: ProstMessage + Default>(message_type: &str, data: &[u8]) -> Result<M> {
    M::decode(data).map_err(|e| MetastoreError::serialization(message_type, e))
}

/// Serialize a log entry
pub fn serialize_entry(entry: &Entry) -> Vec<u8> {
    entry.encode_to_vec()
}

/// Deserialize a log entry
pub fn deserialize_entry(data: &[u8]) -> Result<Entry> {
    decode("Entry", data)
}

/// Serialize the hard state
pub fn serialize_hard_state(hard_state: &HardState) -> Vec<u8> {
    hard_state.encode_to_vec()
}

/// Deserialize the hard state
pub fn deserialize_hard_state(data: &[u8]) -> Result<HardState> {
    decode("HardState", data)
}

/// Serialize the membership configuration
pub fn serialize_conf_state(conf_state: &ConfState) -> Vec<u8> {
    conf_state.encode_to_vec()
}

/// Deserialize the membership configuration
pub fn deserialize_conf_state(data: &[u8]) -> Result<ConfState> {
    decode("ConfState", data)
}

/// Serialize a snapshot, including its payload
pub fn serialize_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    snapshot.encode_to_vec()
}

/// Deserialize a snapshot
pub fn deserialize_snapshot(data: &[u8]) -> Result<Snapshot> {
    decode("Snapshot", data)
}
