//! # Fundamentalnode
//!
//! Registry and consensus layer for the collateral-backed service tier of a
//! Bitcoin-derived network:
//! - **Registry** — gossip-maintained node directory with a liveness state machine
//! - **Election** — deterministic block-hash scores that rank every node
//! - **Payments** — per-height convergence on a single authority-signed payee
//! - **Proof-of-service** — rank-gated mutual reachability checks feeding eviction
//! - **Persistence** — checksummed cache file so the directory survives restarts
//!
//! Chain, wallet and transport are consumed through the narrow traits in
//! [`chain`]; everything else is owned by an explicitly constructed
//! [`node::Services`] container.

pub mod activation;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod demo;
pub mod network;
pub mod node;
pub mod registry;
pub mod report;
pub mod storage;

/// Protocol constants
pub mod constants {
    /// Protocol version this implementation speaks.
    pub const PROTOCOL_VERSION: u32 = 70082;
    /// Oldest protocol version accepted into the directory.
    pub const MIN_PROTOCOL_VERSION: u32 = 70076;
    /// Oldest protocol version taking part in proof-of-service scanning.
    pub const MIN_POS_PROTOCOL_VERSION: u32 = 70075;
    /// Oldest peer version asked for the directory during resync.
    pub const MIN_PEER_PROTOCOL_VERSION: u32 = 70076;

    /// Base units per coin.
    pub const COIN: u64 = 100_000_000;
    /// Exact value of a collateral output.
    pub const COLLATERAL_AMOUNT: u64 = COIN;
    /// Confirmations a collateral output needs before its node is accepted.
    pub const MIN_CONFIRMATIONS: u32 = 15;

    /// Maximum distance (seconds) between a signature time and local adjusted time.
    pub const MAX_SIG_TIME_DRIFT_SECS: i64 = 60 * 60;
    /// Minimum spacing between two accepted votes of one node.
    pub const VOTE_INTERVAL_SECS: i64 = 60 * 60;
    /// Votes older than this are reported as abstentions.
    pub const VOTE_EXPIRY_SECS: i64 = 8 * 60 * 60;

    /// `count` value of an announce originated by the node itself.
    pub const UNSOLICITED_MARKER: i32 = -1;
    /// Sequence number a payment winner's input must carry.
    pub const FINAL_SEQUENCE: u32 = u32::MAX;

    /// Winners are accepted this many blocks behind the best height.
    pub const WINNER_WINDOW_BEHIND: u64 = 10;
    /// Winners are accepted this many blocks ahead of the best height.
    pub const WINNER_WINDOW_AHEAD: u64 = 20;
    /// Winners are computed this many blocks ahead of each new tip.
    pub const WINNER_LEAD_BLOCKS: u64 = 10;
    /// Depth of the block hash whose bits drive payee selection.
    pub const PAYEE_HASH_DEPTH: u64 = 10;
    /// Depth of the block hash anchoring the winner tie-break score.
    pub const TIE_BREAK_DEPTH: u64 = 576;
    /// Lower bound on the number of winner heights retained.
    pub const MIN_WINNER_HISTORY: u64 = 1000;

    /// Proof-of-service ranks are taken this many blocks below the height checked.
    pub const SCANNING_RANK_DEPTH: u64 = 5;
    /// Scanning reports older than this many blocks are dropped.
    pub const SCANNING_REPORT_MAX_AGE: u64 = 10;
    /// Lifetime of a seen scanning report.
    pub const SCANNING_REPORT_TTL_SECS: i64 = 60 * 60;

    /// Misbehavior score for forged signatures, bad keys or fake collateral.
    pub const PENALTY_INVALID: u32 = 100;
    /// Misbehavior score for asking the full directory again too soon.
    pub const PENALTY_LIST_FLOOD: u32 = 34;
    /// Misbehavior score for announcing an immature collateral or re-asking winners.
    pub const PENALTY_MINOR: u32 = 20;

    /// Number of peers asked for the directory at startup.
    pub const RESYNC_PEER_TARGET: usize = 3;

    /// Leading string of the persisted cache file.
    pub const CACHE_MAGIC: &str = "FundamentalnodeCache";
    /// Cache file name inside the data directory.
    pub const CACHE_FILE_NAME: &str = "fncache.dat";
    /// Serialization version of the persisted registry.
    pub const CACHE_FORMAT_VERSION: u8 = 0;

    /// Prefix mixed into every signed-message digest.
    pub const SIGNED_MESSAGE_MAGIC: &str = "Bitsend Signed Message:\n";

    /// Maximum network message size (2 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 2 * 1024 * 1024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Bitcoin-style double SHA-256.
pub fn sha256d(data: &[u8]) -> Hash {
    use sha2::{Digest, Sha256};
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// RIPEMD-160 of SHA-256, the key identifier behind P2PKH scripts.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use secp256k1::hashes::{hash160, Hash as _};
    hash160::Hash::hash(data).to_byte_array()
}

/// Compute a domain-separated BLAKE3 hash.
///
/// Used for local content hashes (dedup keys), never for anything peers
/// must reproduce.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Short hex prefix of a hash for log lines.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_NETWORK_MESSAGE_BYTES` to prevent OOM
/// from malicious oversized payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

/// Current UNIX time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_known_vector() {
        // sha256d("") is a well-known constant
        let h = sha256d(b"");
        assert_eq!(
            hex::encode(h),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn hash160_known_vector() {
        let h = hash160(b"");
        assert_eq!(hex::encode(h), "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb");
    }

    #[test]
    fn hash_domain_different_domains() {
        let a = hash_domain("fundamentalnode.a", b"data");
        let b = hash_domain("fundamentalnode.b", b"data");
        assert_ne!(a, b);
        assert_eq!(a, hash_domain("fundamentalnode.a", b"data"));
    }

    #[test]
    fn deserialize_rejects_oversized_input() {
        let oversized = vec![0u8; constants::MAX_NETWORK_MESSAGE_BYTES + 1];
        let result = deserialize::<Vec<u8>>(&oversized);
        assert!(result.is_err(), "oversized input should be rejected");
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let original: Vec<u8> = vec![1, 2, 3, 4, 5];
        let bytes = serialize(&original).unwrap();
        let restored: Vec<u8> = deserialize(&bytes).unwrap();
        assert_eq!(original, restored);
    }
}
