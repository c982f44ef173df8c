//! Wire messages of the fundamentalnode gossip protocol.
//!
//! The transport (framing, connection management, ban scores) is external;
//! it hands this layer decoded [`Message`]s tagged with the sending peer and
//! sends whatever the handlers push back. All messages are push/relay: a
//! request elicits zero or more independent pushes, never a reply.
//!
//! | command | message |
//! |---------|---------|
//! | `fne`   | [`Announce`] |
//! | `fnep`  | [`Ping`] |
//! | `fneg`  | list request, empty = whole directory |
//! | `fnl`   | whole-directory resync request |
//! | `fnw`   | [`PaymentWinner`] |
//! | `fnget` | winners window resync request |
//! | `fvote` | [`Vote`] |
//! | `fnse`  | [`ScanningReport`] |

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::chain::{OutPoint, Script};
use crate::consensus::payments::PaymentWinner;
use crate::consensus::scanning::ScanningReport;
use crate::crypto::keys::{CompactSignature, PublicKey, SignedPayload};
use crate::registry::{NodeIdentity, NodeRecord};

/// Signed self-description of a node (`fne`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub vin: OutPoint,
    pub addr: SocketAddr,
    /// Signature by the collateral key over [`Announce::signed_payload`].
    pub signature: CompactSignature,
    pub sig_time: i64,
    pub collateral_key: PublicKey,
    pub service_key: PublicKey,
    /// Directory size when served from a list; `UNSOLICITED_MARKER` when
    /// originated by the node itself.
    pub count: i32,
    /// Position within a served list.
    pub current: i32,
    pub last_seen: i64,
    pub protocol_version: u32,
    pub donation_script: Script,
    pub donation_percent: i32,
}

impl Announce {
    pub fn signed_payload(&self) -> Vec<u8> {
        SignedPayload::new()
            .text(&self.addr.to_string())
            .i64(self.sig_time)
            .bytes(self.collateral_key.as_bytes())
            .bytes(self.service_key.as_bytes())
            .u32(self.protocol_version)
            .bytes(self.donation_script.as_bytes())
            .i32(self.donation_percent)
            .finish()
    }

    /// Re-serve a stored record as position `current` of a `count`-long list.
    pub fn from_record(record: &NodeRecord, count: i32, current: i32) -> Self {
        Announce {
            vin: record.identity.vin,
            addr: record.identity.addr,
            signature: record.signature.clone(),
            sig_time: record.sig_time,
            collateral_key: record.identity.collateral_key.clone(),
            service_key: record.identity.service_key.clone(),
            count,
            current,
            last_seen: record.last_seen,
            protocol_version: record.identity.protocol_version,
            donation_script: record.donation_script.clone(),
            donation_percent: i32::from(record.donation_percent),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            vin: self.vin,
            addr: self.addr,
            collateral_key: self.collateral_key.clone(),
            service_key: self.service_key.clone(),
            protocol_version: self.protocol_version,
        }
    }
}

/// Liveness signal (`fnep`), signed by the operational key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub vin: OutPoint,
    pub signature: CompactSignature,
    pub sig_time: i64,
    /// The node is shutting down.
    pub stop: bool,
}

impl Ping {
    /// The payload is bound to the address the record was announced with.
    pub fn signed_payload(addr: &SocketAddr, sig_time: i64, stop: bool) -> Vec<u8> {
        SignedPayload::new()
            .text(&addr.to_string())
            .i64(sig_time)
            .flag(stop)
            .finish()
    }
}

/// Governance vote of a node (`fvote`), signed by the operational key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub vin: OutPoint,
    pub signature: CompactSignature,
    /// -1 nay, 0 abstain, 1 yea.
    pub value: i32,
}

impl Vote {
    pub fn signed_payload(vin: &OutPoint, value: i32) -> Vec<u8> {
        SignedPayload::new().outpoint(vin).i32(value).finish()
    }
}

/// Gossip messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Announce(Announce),
    Ping(Ping),
    /// Ask for one entry, or for the whole directory when `vin` is `None`.
    ListRequest { vin: Option<OutPoint> },
    /// Ask for the whole directory during startup resync.
    ListSync,
    Winner(PaymentWinner),
    /// Ask for the payment winners around the current height.
    WinnersSync,
    Vote(Vote),
    ScanningReport(ScanningReport),
}

impl Message {
    /// Transport command string.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Announce(_) => "fne",
            Message::Ping(_) => "fnep",
            Message::ListRequest { .. } => "fneg",
            Message::ListSync => "fnl",
            Message::Winner(_) => "fnw",
            Message::WinnersSync => "fnget",
            Message::Vote(_) => "fvote",
            Message::ScanningReport(_) => "fnse",
        }
    }
}

/// Errors from message encoding.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
}

/// Size-limited bincode config used for both serialization and deserialization.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 2 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 2 * 1024 * 1024 }>()
}

/// Serialize a message to bytes (length-prefixed).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serde::encode_to_vec(msg, bincode_config())
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a message from bytes (after length prefix).
///
/// Rejects messages whose declared length exceeds `MAX_NETWORK_MESSAGE_BYTES`.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (msg, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(msg)
}
