//! Control envelope carried inside every transport frame/datagram.
//!
//! The envelope multiplexes user payloads, mirror batches and control
//! traffic over one socket; the `channel` byte on payloads is what lets
//! several message boxes share a single socket.

use crate::error::{CommError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Ordinary user payload addressed to a logical message box
    Payload { channel: u8, bytes: Vec<u8> },

    /// Value computed by the receive side in answer mode
    Answer(Vec<u8>),

    /// One batch of mirror field updates
    MirrorBatch(Vec<u8>),

    /// Reachability probe
    Probe { token: u64, timestamp_ms: u64 },

    /// Echo of a probe's token
    ProbeReply { token: u64 },

    /// Fixed acknowledgement (UDP ack protocol)
    Ack,

    /// Orderly goodbye
    Disconnect,
}

impl Envelope {
    /// Message type name for routing and logs (zero-copy, all variants are static)
    pub fn opcode(&self) -> &'static str {
        match self {
            Envelope::Payload { .. } => "PAYLOAD",
            Envelope::Answer(_) => "ANSWER",
            Envelope::MirrorBatch(_) => "MIRROR_BATCH",
            Envelope::Probe { .. } => "PROBE",
            Envelope::ProbeReply { .. } => "PROBE_REPLY",
            Envelope::Ack => "ACK",
            Envelope::Disconnect => "DISCONNECT",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an envelope; malformed input is a per-message `Format` error,
    /// never fatal to the loop that read it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| CommError::Format(format!("Malformed envelope: {e}")))
    }
}
