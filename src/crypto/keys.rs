//! secp256k1 key management and signed-message signatures.
//!
//! Every authenticated gossip message carries a 65-byte compact recoverable
//! signature over a canonical payload. Verification recovers the signer's
//! public key and compares key identifiers (hash160), so compressed and
//! uncompressed encodings of one key are interchangeable.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chain::{OutPoint, Script};
use crate::constants::SIGNED_MESSAGE_MAGIC;
use crate::Hash;

const COMPRESSED_PK_BYTES: usize = 33;
const UNCOMPRESSED_PK_BYTES: usize = 65;
pub(crate) const COMPACT_SIG_BYTES: usize = 65;

/// Errors from key parsing, signing and signature recovery.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("malformed signature")]
    InvalidSignature,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

// ── Public keys ──

/// A serialized secp256k1 public key (33 bytes compressed, 65 uncompressed).
///
/// Only the length is checked on deserialization; whether the bytes are a
/// point on the curve is a validation step of its own (see [`PublicKey::is_valid`])
/// so that gossip handlers can penalize peers sending garbage keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub(crate) Vec<u8>);

impl PublicKey {
    /// Parse and validate a serialized public key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        secp256k1::PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(PublicKey(bytes.to_vec()))
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        Self::from_slice(&hex::decode(s.trim())?)
    }

    /// Access the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 33-byte SEC encoding.
    pub fn is_compressed(&self) -> bool {
        self.0.len() == 33
    }

    /// Whether the bytes encode a point on the curve.
    pub fn is_valid(&self) -> bool {
        secp256k1::PublicKey::from_slice(&self.0).is_ok()
    }

    /// hash160 of the serialized key.
    pub fn key_id(&self) -> [u8; 20] {
        crate::hash160(&self.0)
    }

    /// Pay-to-pubkey-hash script for this key.
    pub fn p2pkh_script(&self) -> Script {
        Script::p2pkh(&self.key_id())
    }

    /// Verify a signed-message signature against this key.
    pub fn verify(&self, payload: &[u8], signature: &CompactSignature) -> bool {
        match recover_signer(payload, signature) {
            Ok(recovered) => recovered.key_id() == self.key_id(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != COMPRESSED_PK_BYTES && bytes.len() != UNCOMPRESSED_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid public key length: {}",
                bytes.len()
            )));
        }
        Ok(PublicKey(bytes))
    }
}

// ── Secret keys ──

/// A secp256k1 secret key plus the encoding of its public half.
///
/// Zeroized on drop. `Debug` never prints key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; 32],
    compressed: bool,
}

impl SecretKey {
    /// Generate a fresh random key (compressed public encoding).
    pub fn generate() -> Self {
        loop {
            let bytes: [u8; 32] = rand::random();
            if let Ok(key) = Self::from_bytes(bytes, true) {
                return key;
            }
        }
    }

    /// Build a key from raw scalar bytes.
    pub fn from_bytes(bytes: [u8; 32], compressed: bool) -> Result<Self, KeyError> {
        secp256k1::SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(SecretKey { bytes, compressed })
    }

    /// Parse a hex-encoded 32-byte scalar (compressed public encoding).
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(s.trim())?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Self::from_bytes(bytes, true)
    }

    /// The same scalar with the given public key encoding. Signatures only
    /// verify against a key of the encoding they were made with.
    pub fn with_compression(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Hex encoding of the scalar.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    fn raw(&self) -> Result<secp256k1::SecretKey, KeyError> {
        secp256k1::SecretKey::from_slice(&self.bytes).map_err(|_| KeyError::InvalidSecretKey)
    }

    /// The matching public key in this key's encoding.
    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        let secp = Secp256k1::signing_only();
        let pk = secp256k1::PublicKey::from_secret_key(&secp, &self.raw()?);
        Ok(PublicKey(if self.compressed {
            pk.serialize().to_vec()
        } else {
            pk.serialize_uncompressed().to_vec()
        }))
    }

    /// Produce a compact recoverable signature over a signed-message payload.
    pub fn sign(&self, payload: &[u8]) -> Result<CompactSignature, KeyError> {
        let digest = message_digest(payload);
        let msg = Message::from_digest(digest);
        let secp = Secp256k1::signing_only();
        let sig: RecoverableSignature = secp.sign_ecdsa_recoverable(&msg, &self.raw()?);
        let (rec_id, sig_bytes) = sig.serialize_compact();
        let header = 27u8
            .saturating_add(u8::try_from(rec_id.to_i32()).unwrap_or(0))
            .saturating_add(if self.compressed { 4 } else { 0 });
        let mut out = Vec::with_capacity(COMPACT_SIG_BYTES);
        out.push(header);
        out.extend_from_slice(&sig_bytes);
        Ok(CompactSignature(out))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(REDACTED)")
    }
}

// ── Signatures ──

/// A 65-byte compact recoverable signature (header byte + r + s).
///
/// Empty signatures are allowed on the wire and never verify.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct CompactSignature(pub(crate) Vec<u8>);

impl CompactSignature {
    /// An empty (unsigned) signature.
    pub fn empty() -> Self {
        CompactSignature(Vec::new())
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for CompactSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactSignature({})", hex::encode(&self.0))
    }
}

impl Serialize for CompactSignature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for CompactSignature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if !bytes.is_empty() && bytes.len() != COMPACT_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid compact signature: expected {} bytes, got {}",
                COMPACT_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(CompactSignature(bytes))
    }
}

/// Digest signed by [`SecretKey::sign`]: sha256d(magic ‖ payload), each
/// prefixed with its compact-size length.
pub fn message_digest(payload: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(SIGNED_MESSAGE_MAGIC.len() + payload.len() + 10);
    write_compact_size(&mut buf, SIGNED_MESSAGE_MAGIC.len() as u64);
    buf.extend_from_slice(SIGNED_MESSAGE_MAGIC.as_bytes());
    write_compact_size(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    crate::sha256d(&buf)
}

/// Recover the public key that produced `signature` over `payload`.
pub fn recover_signer(payload: &[u8], signature: &CompactSignature) -> Result<PublicKey, KeyError> {
    let bytes = signature.as_bytes();
    if bytes.len() != COMPACT_SIG_BYTES {
        return Err(KeyError::InvalidSignature);
    }
    let header = bytes[0];
    if !(27..=34).contains(&header) {
        return Err(KeyError::InvalidSignature);
    }
    let compressed = header >= 31;
    let rec = i32::from((header - 27) & 3);
    let rec_id = RecoveryId::from_i32(rec).map_err(|_| KeyError::InvalidSignature)?;
    let sig = RecoverableSignature::from_compact(&bytes[1..], rec_id)
        .map_err(|_| KeyError::InvalidSignature)?;
    let msg = Message::from_digest(message_digest(payload));
    let secp = Secp256k1::verification_only();
    let pk = secp
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| KeyError::InvalidSignature)?;
    Ok(PublicKey(if compressed {
        pk.serialize().to_vec()
    } else {
        pk.serialize_uncompressed().to_vec()
    }))
}

fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    if n < 253 {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(253);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(254);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(255);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

// ── Canonical payloads ──

/// Builder for the byte string a gossip message signs.
///
/// Fields keep their protocol order; variable-length fields carry a
/// compact-size length prefix so no two field sequences collide.
#[derive(Default)]
pub struct SignedPayload {
    buf: Vec<u8>,
}

impl SignedPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        write_compact_size(&mut self.buf, data.len() as u64);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn text(self, s: &str) -> Self {
        self.bytes(s.as_bytes())
    }

    pub fn i64(mut self, v: i64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn flag(mut self, v: bool) -> Self {
        self.buf.push(u8::from(v));
        self
    }

    pub fn outpoint(mut self, o: &OutPoint) -> Self {
        self.buf.extend_from_slice(&o.txid);
        self.buf.extend_from_slice(&o.vout.to_le_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
