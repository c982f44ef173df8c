//! In-memory collaborators for tests, the demo and embedding without a
//! full chain backend.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{
    ChainView, OutPoint, PeerId, PeerInfo, PeerSet, Prober, Script, TxInfo, TxOut, WalletOutput,
    WalletView,
};
use crate::crypto::keys::{CompactSignature, PublicKey, SecretKey};
use crate::network::Message;
use crate::Hash;

/// Seconds between consecutive in-memory blocks.
pub const BLOCK_SPACING_SECS: i64 = 60;

// ── Chain ──

#[derive(Default)]
struct ChainInner {
    hashes: Vec<Hash>,
    times: Vec<i64>,
    txs: HashMap<Hash, TxInfo>,
    utxos: HashMap<OutPoint, u64>,
    initial_download: bool,
    pruned_below: Option<u64>,
    now: i64,
}

/// A linear chain held in memory.
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// A chain with blocks `0..=height`, the last one stamped `now`.
    pub fn with_height(height: u64, now: i64) -> Self {
        let chain = MemoryChain::default();
        {
            let mut inner = chain.inner.write();
            inner.now = now;
            for h in 0..=height {
                let time = now - (height - h) as i64 * BLOCK_SPACING_SECS;
                let hash = block_hash_for(inner.hashes.last(), h);
                inner.hashes.push(hash);
                inner.times.push(time);
            }
        }
        chain
    }

    /// Append a block stamped with the current time; returns its height.
    pub fn mine(&self) -> u64 {
        let mut inner = self.inner.write();
        let height = inner.hashes.len() as u64;
        let hash = block_hash_for(inner.hashes.last(), height);
        let time = inner.now;
        inner.hashes.push(hash);
        inner.times.push(time);
        height
    }

    /// Replace every block above `fork_height` with a competing branch
    /// reaching `new_tip`; returns the new tip.
    pub fn reorg(&self, fork_height: u64, new_tip: u64) -> u64 {
        let mut inner = self.inner.write();
        let keep = usize::try_from(fork_height + 1).unwrap_or(usize::MAX);
        inner.hashes.truncate(keep);
        inner.times.truncate(keep);
        let time = inner.now;
        for height in fork_height + 1..=new_tip {
            let mut hash = block_hash_for(inner.hashes.last(), height);
            hash[31] ^= 0xff;
            inner.hashes.push(hash);
            inner.times.push(time);
        }
        new_tip
    }

    pub fn set_time(&self, now: i64) {
        self.inner.write().now = now;
    }

    pub fn advance_time(&self, secs: i64) {
        self.inner.write().now += secs;
    }

    pub fn set_initial_download(&self, ibd: bool) {
        self.inner.write().initial_download = ibd;
    }

    /// Withhold block hashes below `height`, as a pruned backend would.
    pub fn set_pruned_below(&self, height: Option<u64>) {
        self.inner.write().pruned_below = height;
    }

    /// Record an unspent output confirmed in the block at `height`.
    pub fn add_output(&self, outpoint: OutPoint, value: u64, script: Script, height: u64) {
        let mut inner = self.inner.write();
        let tx = inner.txs.entry(outpoint.txid).or_insert_with(|| TxInfo {
            outputs: Vec::new(),
            block_height: Some(height),
        });
        let idx = outpoint.vout as usize;
        if tx.outputs.len() <= idx {
            tx.outputs.resize(
                idx + 1,
                TxOut {
                    value: 0,
                    script: Script::default(),
                },
            );
        }
        tx.outputs[idx] = TxOut { value, script };
        inner.utxos.insert(outpoint, height);
    }

    /// Mark an output spent.
    pub fn spend(&self, outpoint: &OutPoint) {
        self.inner.write().utxos.remove(outpoint);
    }
}

fn block_hash_for(prev: Option<&Hash>, height: u64) -> Hash {
    let mut buf = prev.copied().unwrap_or([0u8; 32]).to_vec();
    buf.extend_from_slice(&height.to_le_bytes());
    crate::sha256d(&buf)
}

impl ChainView for MemoryChain {
    fn best_height(&self) -> Option<u64> {
        let inner = self.inner.read();
        (inner.hashes.len() as u64).checked_sub(1)
    }

    fn block_hash(&self, height: u64) -> Option<Hash> {
        let inner = self.inner.read();
        if inner.pruned_below.is_some_and(|floor| height < floor) {
            return None;
        }
        inner.hashes.get(height as usize).copied()
    }

    fn block_time(&self, height: u64) -> Option<i64> {
        self.inner.read().times.get(height as usize).copied()
    }

    fn transaction(&self, txid: &Hash) -> Option<TxInfo> {
        self.inner.read().txs.get(txid).cloned()
    }

    fn is_spendable(&self, outpoint: &OutPoint) -> bool {
        self.inner.read().utxos.contains_key(outpoint)
    }

    fn confirmations(&self, outpoint: &OutPoint) -> Option<u32> {
        let inner = self.inner.read();
        let height = *inner.utxos.get(outpoint)?;
        let best = (inner.hashes.len() as u64).checked_sub(1)?;
        if height > best {
            return Some(0);
        }
        u32::try_from(best - height + 1).ok()
    }

    fn is_initial_block_download(&self) -> bool {
        self.inner.read().initial_download
    }

    fn adjusted_time(&self) -> i64 {
        self.inner.read().now
    }
}

// ── Wallet ──

#[derive(Default)]
struct WalletInner {
    keys: Vec<SecretKey>,
    outputs: Vec<WalletOutput>,
    locked_outputs: HashSet<OutPoint>,
    locked: bool,
}

/// A wallet holding a handful of keys and outputs.
#[derive(Default)]
pub struct MemoryWallet {
    inner: Mutex<WalletInner>,
}

impl MemoryWallet {
    /// Add a key; returns its public half.
    pub fn add_key(&self, key: SecretKey) -> Option<PublicKey> {
        let pk = key.public_key().ok()?;
        self.inner.lock().keys.push(key);
        Some(pk)
    }

    pub fn add_output(&self, output: WalletOutput) {
        self.inner.lock().outputs.push(output);
    }

    pub fn set_locked(&self, locked: bool) {
        self.inner.lock().locked = locked;
    }

    pub fn is_output_locked(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().locked_outputs.contains(outpoint)
    }
}

impl WalletView for MemoryWallet {
    fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    fn candidate_outputs(&self, amount: u64) -> Vec<WalletOutput> {
        let inner = self.inner.lock();
        inner
            .outputs
            .iter()
            .filter(|o| o.value == amount && !inner.locked_outputs.contains(&o.outpoint))
            .cloned()
            .collect()
    }

    fn public_key_for(&self, script: &Script) -> Option<PublicKey> {
        let inner = self.inner.lock();
        inner
            .keys
            .iter()
            .filter_map(|k| k.public_key().ok())
            .find(|pk| &pk.p2pkh_script() == script)
    }

    fn sign_with_key(&self, key: &PublicKey, payload: &[u8]) -> Option<CompactSignature> {
        let inner = self.inner.lock();
        let secret = inner
            .keys
            .iter()
            .find(|k| k.public_key().ok().as_ref() == Some(key))?;
        secret.sign(payload).ok()
    }

    fn lock_output(&self, outpoint: &OutPoint) {
        self.inner.lock().locked_outputs.insert(*outpoint);
    }

    fn unlock_output(&self, outpoint: &OutPoint) {
        self.inner.lock().locked_outputs.remove(outpoint);
    }
}

// ── Peers ──

#[derive(Default)]
struct PeersInner {
    peers: Vec<PeerInfo>,
    sent: Vec<(PeerId, Message)>,
    penalties: Vec<(PeerId, u32)>,
    local: Option<SocketAddr>,
}

/// A peer set that records every send and penalty instead of transmitting.
#[derive(Default)]
pub struct RecordingPeers {
    inner: Mutex<PeersInner>,
}

impl RecordingPeers {
    pub fn connect(&self, peer: PeerInfo) {
        self.inner.lock().peers.push(peer);
    }

    pub fn set_local_address(&self, addr: SocketAddr) {
        self.inner.lock().local = Some(addr);
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<(PeerId, Message)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn sent_count(&self) -> usize {
        self.inner.lock().sent.len()
    }

    /// Total misbehavior score reported against `peer`.
    pub fn penalty_for(&self, peer: PeerId) -> u32 {
        self.inner
            .lock()
            .penalties
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, s)| s)
            .sum()
    }
}

impl PeerSet for RecordingPeers {
    fn peers(&self) -> Vec<PeerInfo> {
        self.inner.lock().peers.clone()
    }

    fn send(&self, peer: PeerId, message: Message) {
        self.inner.lock().sent.push((peer, message));
    }

    fn misbehaving(&self, peer: PeerId, score: u32) {
        self.inner.lock().penalties.push((peer, score));
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.inner.lock().local
    }
}

// ── Prober ──

/// A prober answering from a fixed set of unreachable addresses.
#[derive(Default)]
pub struct StaticProber {
    down: Mutex<HashSet<SocketAddr>>,
}

impl StaticProber {
    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }
}

impl Prober for StaticProber {
    fn probe(&self, addr: SocketAddr, _timeout: Duration) -> bool {
        !self.down.lock().contains(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_confirmations_track_height() {
        let chain = MemoryChain::with_height(100, 1_000_000);
        let op = OutPoint::new([1u8; 32], 0);
        chain.add_output(op, 5, Script::default(), 90);
        assert_eq!(chain.confirmations(&op), Some(11));
        chain.mine();
        assert_eq!(chain.confirmations(&op), Some(12));
        chain.spend(&op);
        assert_eq!(chain.confirmations(&op), None);
        assert!(!chain.is_spendable(&op));
    }

    #[test]
    fn chain_block_times_end_at_now() {
        let chain = MemoryChain::with_height(10, 5_000);
        assert_eq!(chain.block_time(10), Some(5_000));
        assert_eq!(chain.block_time(0), Some(5_000 - 10 * BLOCK_SPACING_SECS));
        assert_ne!(chain.block_hash(3), chain.block_hash(4));
    }

    #[test]
    fn wallet_signs_with_held_key() {
        let wallet = MemoryWallet::default();
        let pk = wallet.add_key(SecretKey::generate()).unwrap();
        assert_eq!(wallet.public_key_for(&pk.p2pkh_script()), Some(pk.clone()));
        let sig = wallet.sign_with_key(&pk, b"msg").unwrap();
        assert!(pk.verify(b"msg", &sig));
    }

    #[test]
    fn wallet_locked_outputs_excluded() {
        let wallet = MemoryWallet::default();
        let op = OutPoint::new([3u8; 32], 1);
        wallet.add_output(WalletOutput {
            outpoint: op,
            value: 10,
            script: Script::default(),
        });
        assert_eq!(wallet.candidate_outputs(10).len(), 1);
        assert!(wallet.candidate_outputs(11).is_empty());
        wallet.lock_output(&op);
        assert!(wallet.candidate_outputs(10).is_empty());
    }
}
