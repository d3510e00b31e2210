//! wire messages
//!
//! every gossip payload is one of four tagged kinds. the node's own broadcasts
//! (heartbeat, task) travel in a signed envelope:
//!
//! ```text
//! base64( hex(signature) [130 chars] || canonical_json(message) )
//! ```
//!
//! participant replies (heartbeat ack, task result) carry their signature
//! inside the body and are plain `base64(json)`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use quorum_primitives::{
    identity, to_canonical_json, Address, KeyPair, PublicKey, QuorumFilter, RecoverableSignature,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NodeError, Result};

/// hex length of a 65-byte signature
pub const SIGNATURE_HEX_LEN: usize = identity::SIGNATURE_LEN * 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub nonce: Uuid,
    pub deadline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// signature over the exact heartbeat payload bytes, hex
    pub signature: String,
}

/// serialized quorum filter as announced with a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterModel {
    pub hex: String,
    pub hashes: u32,
}

impl FilterModel {
    pub fn from_filter(filter: &QuorumFilter) -> Self {
        Self {
            hex: filter.to_hex(),
            hashes: filter.hash_count(),
        }
    }

    /// decode, failing closed when the advertised hash count disagrees with
    /// the encoded header
    pub fn to_filter(&self) -> Result<QuorumFilter> {
        let filter = QuorumFilter::from_hex(&self.hex)?;
        if filter.hash_count() != self.hashes {
            return Err(NodeError::Validation(format!(
                "filter advertises {} hashes, encoded {}",
                self.hashes,
                filter.hash_count()
            )));
        }
        Ok(filter)
    }

    /// decode a filter this node built for `capacity` addresses
    pub fn to_filter_expecting(&self, capacity: u32) -> Result<QuorumFilter> {
        let bytes = hex::decode(self.hex.trim())
            .map_err(|e| NodeError::Validation(format!("filter hex: {}", e)))?;
        let filter = QuorumFilter::from_bytes_expecting(&bytes, self.hashes, capacity)?;
        if filter.is_oversubscribed() {
            return Err(NodeError::Validation(format!(
                "filter holds {} addresses, sized for {}",
                filter.inserted(),
                capacity
            )));
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAnnouncement {
    pub task_id: String,
    pub filter: FilterModel,
    pub prompt: String,
    pub deadline: u64,
    /// compressed sec1 task public key, hex
    pub public_key: String,
}

impl TaskAnnouncement {
    pub fn task_public_key(&self) -> Result<PublicKey> {
        Ok(identity::parse_public_key(&self.public_key)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// sealed answer, hex
    pub ciphertext: String,
    /// signature over sha-256 of the plaintext answer, hex
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    Task(TaskAnnouncement),
    TaskResult(TaskResult),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Heartbeat(_) => "heartbeat",
            WireMessage::HeartbeatAck(_) => "heartbeat_ack",
            WireMessage::Task(_) => "task",
            WireMessage::TaskResult(_) => "task_result",
        }
    }
}

/// a broadcast together with the exact bytes its signature covers
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub message: WireMessage,
    pub payload: Vec<u8>,
    pub signature: RecoverableSignature,
}

impl SignedMessage {
    pub fn sign(key: &KeyPair, message: WireMessage) -> Result<Self> {
        let payload = to_canonical_json(&message)?;
        let signature = key.sign(&payload)?;
        Ok(Self {
            message,
            payload,
            signature,
        })
    }

    /// base64 envelope for the transport
    pub fn encode(&self) -> String {
        let mut raw = self.signature.to_hex().into_bytes();
        raw.extend_from_slice(&self.payload);
        BASE64.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| NodeError::Validation(format!("envelope base64: {}", e)))?;
        if raw.len() <= SIGNATURE_HEX_LEN {
            return Err(NodeError::Validation(format!("envelope too short: {} bytes", raw.len())));
        }
        let (sig_hex, payload) = raw.split_at(SIGNATURE_HEX_LEN);
        let sig_hex = std::str::from_utf8(sig_hex)
            .map_err(|_| NodeError::Validation("signature is not hex".into()))?;
        let signature = RecoverableSignature::from_hex(sig_hex)?;
        let message = serde_json::from_slice(payload)
            .map_err(|e| NodeError::Validation(format!("envelope payload: {}", e)))?;
        Ok(Self {
            message,
            payload: payload.to_vec(),
            signature,
        })
    }

    pub fn signer(&self) -> Result<Address> {
        Ok(identity::recover_signer(&self.signature, &self.payload)?)
    }
}

/// base64 json for unsigned participant replies
pub fn encode_reply(message: &WireMessage) -> Result<String> {
    Ok(BASE64.encode(serde_json::to_vec(message)?))
}

pub fn decode_reply(encoded: &str) -> Result<WireMessage> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| NodeError::Validation(format!("reply base64: {}", e)))?;
    serde_json::from_slice(&raw).map_err(|e| NodeError::Validation(format!("reply json: {}", e)))
}
