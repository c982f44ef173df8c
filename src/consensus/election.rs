//! Deterministic node scores and rank order.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;

use crate::chain::{ChainView, OutPoint};
use crate::registry::{NodeRecord, Registry};
use crate::Hash;

/// Memoized block hashes retained below the newest tip.
const BLOCK_HASH_CACHE_DEPTH: u64 = 2 * crate::constants::MIN_WINNER_HISTORY;

fn hash_to_u256(hash: &Hash) -> U256 {
    U256::from_little_endian(hash)
}

fn u256_to_bytes(value: U256) -> Hash {
    let mut out = [0u8; 32];
    value.to_little_endian(&mut out);
    out
}

fn abs_diff(a: U256, b: U256) -> U256 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Election score of a collateral against a block hash.
pub fn node_score(block_hash: &Hash, vin: &OutPoint) -> U256 {
    let aux = hash_to_u256(&vin.txid)
        .overflowing_add(U256::from(vin.vout))
        .0;
    let hash2 = crate::sha256d(block_hash);
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(block_hash);
    buf.extend_from_slice(&u256_to_bytes(aux));
    let hash3 = crate::sha256d(&buf);
    abs_diff(hash_to_u256(&hash3), hash_to_u256(&hash2))
}

/// Score resolving competing payment winners for one height.
pub fn tie_break_score(block_hash: &Hash, vin: &OutPoint) -> U256 {
    let n2 = crate::sha256d(block_hash);
    let n3 = crate::sha256d(&vin.txid);
    abs_diff(hash_to_u256(&n3), hash_to_u256(&n2))
}

/// Scores and ranks nodes against chain state.
pub struct ElectionScorer {
    chain: Arc<dyn ChainView>,
    block_hashes: Mutex<BTreeMap<u64, Hash>>,
}

impl ElectionScorer {
    pub fn new(chain: Arc<dyn ChainView>) -> Self {
        ElectionScorer {
            chain,
            block_hashes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Block hash at `height`, memoized. `None` above the tip or for
    /// heights the chain cannot resolve.
    pub fn block_hash(&self, height: u64) -> Option<Hash> {
        if let Some(hash) = self.block_hashes.lock().get(&height) {
            return Some(*hash);
        }
        let best = self.chain.best_height()?;
        if height > best {
            return None;
        }
        let hash = self.chain.block_hash(height)?;
        self.block_hashes.lock().insert(height, hash);
        Some(hash)
    }

    /// A new tip arrived at `height`: drop memoized hashes at or above it
    /// and far below it, then walk down from the top and drop every entry
    /// the chain no longer agrees with. The first agreeing entry is below
    /// the fork point, so everything under it is still valid.
    pub fn on_new_tip(&self, height: u64) {
        let mut cache = self.block_hashes.lock();
        cache.split_off(&height);
        let floor = height.saturating_sub(BLOCK_HASH_CACHE_DEPTH);
        *cache = cache.split_off(&floor);
        while let Some((&cached_height, &hash)) = cache.last_key_value() {
            if self.chain.block_hash(cached_height) == Some(hash) {
                break;
            }
            tracing::debug!(height = cached_height, "Dropping block hash from a replaced branch");
            cache.remove(&cached_height);
        }
    }

    pub fn score(&self, vin: &OutPoint, height: u64) -> Option<U256> {
        self.block_hash(height).map(|h| node_score(&h, vin))
    }

    /// All eligible nodes with their 1-based rank at `height`.
    ///
    /// Empty when the block hash is unknown.
    pub fn ranks(
        &self,
        registry: &Registry,
        height: u64,
        min_protocol: u32,
        only_active: bool,
    ) -> Vec<(usize, NodeRecord)> {
        let Some(block_hash) = self.block_hash(height) else {
            return Vec::new();
        };
        let mut scored: Vec<(U256, NodeRecord)> = registry
            .eligible(self.chain.as_ref(), min_protocol, only_active)
            .into_iter()
            .map(|r| (node_score(&block_hash, r.vin()), r))
            .collect();
        scored.sort_by(|(sa, ra), (sb, rb)| sb.cmp(sa).then_with(|| ra.vin().cmp(rb.vin())));
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (_, r))| (i + 1, r))
            .collect()
    }

    /// 1-based rank of `vin` at `height`.
    pub fn rank_of(
        &self,
        registry: &Registry,
        vin: &OutPoint,
        height: u64,
        min_protocol: u32,
        only_active: bool,
    ) -> Option<usize> {
        self.ranks(registry, height, min_protocol, only_active)
            .into_iter()
            .find(|(_, r)| r.vin() == vin)
            .map(|(rank, _)| rank)
    }

    /// The node holding `rank` at `height`.
    pub fn by_rank(
        &self,
        registry: &Registry,
        rank: usize,
        height: u64,
        min_protocol: u32,
        only_active: bool,
    ) -> Option<NodeRecord> {
        self.ranks(registry, height, min_protocol, only_active)
            .into_iter()
            .find(|(r, _)| *r == rank)
            .map(|(_, record)| record)
    }

    /// Highest-scoring enabled node at `height`.
    pub fn current_leader(
        &self,
        registry: &Registry,
        height: u64,
        min_protocol: u32,
    ) -> Option<NodeRecord> {
        self.by_rank(registry, 1, height, min_protocol, true)
    }
}
