//! Chain primitives and the collaborator interfaces the layer consumes.
//!
//! Block validation, the wallet and the P2P transport live outside this
//! crate. They are reached only through [`ChainView`], [`WalletView`],
//! [`PeerSet`] and [`Prober`], so every component can be driven by the
//! in-memory implementations in [`memory`].

pub mod memory;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{CompactSignature, PublicKey};
use crate::network::Message;
use crate::Hash;

// ── Primitives ──

/// Reference to a transaction output; a collateral outpoint identifies a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        format!("{}:{}", crate::short_hex(&self.txid), self.vout)
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// An output script.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    /// `OP_DUP OP_HASH160 <key id> OP_EQUALVERIFY OP_CHECKSIG`
    pub fn p2pkh(key_id: &[u8; 20]) -> Self {
        let mut s = Vec::with_capacity(25);
        s.extend_from_slice(&[0x76, 0xa9, 0x14]);
        s.extend_from_slice(key_id);
        s.extend_from_slice(&[0x88, 0xac]);
        Script(s)
    }

    pub fn is_p2pkh(&self) -> bool {
        self.0.len() == 25
            && self.0[..3] == [0x76, 0xa9, 0x14]
            && self.0[23..] == [0x88, 0xac]
    }

    /// `OP_HASH160 <script hash> OP_EQUAL`
    pub fn is_p2sh(&self) -> bool {
        self.0.len() == 23 && self.0[0] == 0xa9 && self.0[1] == 0x14 && self.0[22] == 0x87
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Script(hex::decode(s.trim())?))
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A transaction output as reported by the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script: Script,
}

/// A confirmed (or mempool) transaction as reported by the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInfo {
    pub outputs: Vec<TxOut>,
    /// Height of the containing block, `None` while unconfirmed.
    pub block_height: Option<u64>,
}

/// Whether an address belongs to a private, loopback or otherwise
/// non-routable range. Such nodes are never relayed or served.
pub fn is_private(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => {
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ── Collaborators ──

/// Read access to the local chain view.
///
/// Implementations must answer every call from one consistent snapshot of
/// the active chain; the registry never locks the chain itself.
pub trait ChainView: Send + Sync {
    /// Height of the active tip, `None` before the first block is known.
    fn best_height(&self) -> Option<u64>;
    /// Hash of the active-chain block at `height`.
    fn block_hash(&self, height: u64) -> Option<Hash>;
    /// Header time of the active-chain block at `height`.
    fn block_time(&self, height: u64) -> Option<i64>;
    /// Look up a transaction by id.
    fn transaction(&self, txid: &Hash) -> Option<TxInfo>;
    /// Whether a spend of `outpoint` would currently be accepted to the mempool.
    fn is_spendable(&self, outpoint: &OutPoint) -> bool;
    /// Confirmation depth of an unspent output, `None` if spent or unknown.
    fn confirmations(&self, outpoint: &OutPoint) -> Option<u32>;
    /// Whether the chain is still catching up with the network.
    fn is_initial_block_download(&self) -> bool;
    /// Network-adjusted UNIX time.
    fn adjusted_time(&self) -> i64;
}

/// An output owned by the local wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletOutput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script: Script,
}

/// The local wallet: coin candidates and signing with collateral keys.
pub trait WalletView: Send + Sync {
    fn is_locked(&self) -> bool;
    /// Unspent outputs of exactly `amount`.
    fn candidate_outputs(&self, amount: u64) -> Vec<WalletOutput>;
    /// Public key controlling a P2PKH script, if the wallet holds it.
    fn public_key_for(&self, script: &Script) -> Option<PublicKey>;
    /// Sign a signed-message payload with the secret half of `key`.
    fn sign_with_key(&self, key: &PublicKey, payload: &[u8]) -> Option<CompactSignature>;
    /// Exclude an output from coin selection.
    fn lock_output(&self, outpoint: &OutPoint);
    fn unlock_output(&self, outpoint: &OutPoint);
}

/// Transport-assigned peer handle.
pub type PeerId = u64;

/// A connected peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub version: u32,
}

/// The connected peer set.
///
/// `send` queues and returns immediately; callers may hold registry locks
/// while sending.
pub trait PeerSet: Send + Sync {
    fn peers(&self) -> Vec<PeerInfo>;
    fn send(&self, peer: PeerId, message: Message);
    /// Report misbehavior; the transport decides when to ban.
    fn misbehaving(&self, peer: PeerId, score: u32);
    /// Our externally visible address, when the transport has learned it.
    fn local_address(&self) -> Option<SocketAddr>;

    /// Send one message to every connected peer.
    fn broadcast(&self, message: &Message) {
        for peer in self.peers() {
            self.send(peer.id, message.clone());
        }
    }
}

/// Raw connectivity probe with a bounded connect timeout.
pub trait Prober: Send + Sync {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Probe by opening and dropping a TCP connection.
pub struct TcpProber;

impl Prober for TcpProber {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match std::net::TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Probe failed");
                false
            }
        }
    }
}
