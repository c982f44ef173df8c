//! The fundamentalnode directory.
//!
//! One [`Registry`] exists per process. Records are owned values behind a
//! single lock; handlers read clones and mutate only through [`Registry::update`],
//! so no caller keeps a reference into the map across a send or an await.
//! The same lock guards the anti-flood bookkeeping of list requests.

pub mod record;

use std::collections::BTreeMap;
use std::net::IpAddr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainView, OutPoint};
use crate::crypto::keys::PublicKey;
pub use record::{LivenessPolicy, NodeIdentity, NodeRecord, NodeState, ScanOutcome};

/// Serialized form of the registry, as written to the cache file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u8,
    pub nodes: Vec<NodeRecord>,
    /// Peers that asked us for the full list, and when they may ask again.
    pub asked_us_for_list: BTreeMap<IpAddr, i64>,
    /// Peers we asked for the full list, and when we may ask again.
    pub we_asked_for_list: BTreeMap<IpAddr, i64>,
    /// Entries we asked for individually, and when we may ask again.
    pub we_asked_for_entry: BTreeMap<OutPoint, i64>,
    pub dsq_count: i64,
}

#[derive(Default)]
struct RegistryState {
    nodes: BTreeMap<OutPoint, NodeRecord>,
    asked_us_for_list: BTreeMap<IpAddr, i64>,
    we_asked_for_list: BTreeMap<IpAddr, i64>,
    we_asked_for_entry: BTreeMap<OutPoint, i64>,
    dsq_count: i64,
}

impl RegistryState {
    fn check_all(&mut self, chain: &dyn ChainView, policy: &LivenessPolicy) {
        let now = chain.adjusted_time();
        for record in self.nodes.values_mut() {
            record.check(now, policy, |vin| chain.is_spendable(vin));
        }
    }
}

/// Process-wide node directory.
pub struct Registry {
    inner: Mutex<RegistryState>,
    policy: LivenessPolicy,
}

impl Registry {
    pub fn new(policy: LivenessPolicy) -> Self {
        Registry {
            inner: Mutex::new(RegistryState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    /// Insert a record for an unknown collateral. Only enabled records are
    /// accepted; returns `false` if the collateral is already listed.
    pub fn add(&self, record: NodeRecord) -> bool {
        if !record.is_enabled() {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(record.vin()) {
            return false;
        }
        tracing::info!(vin = %record.vin().short(), addr = %record.identity.addr, "Adding fundamentalnode");
        inner.nodes.insert(*record.vin(), record);
        true
    }

    pub fn find(&self, vin: &OutPoint) -> Option<NodeRecord> {
        self.inner.lock().nodes.get(vin).cloned()
    }

    pub fn contains(&self, vin: &OutPoint) -> bool {
        self.inner.lock().nodes.contains_key(vin)
    }

    /// Look a node up by its operational key.
    pub fn find_by_service_key(&self, key: &PublicKey) -> Option<NodeRecord> {
        self.inner
            .lock()
            .nodes
            .values()
            .find(|r| &r.identity.service_key == key)
            .cloned()
    }

    /// Mutate one record in place under the registry lock.
    pub fn update<R>(&self, vin: &OutPoint, f: impl FnOnce(&mut NodeRecord) -> R) -> Option<R> {
        self.inner.lock().nodes.get_mut(vin).map(f)
    }

    /// Mutate one record, then re-run its liveness check.
    pub fn update_checked<R>(
        &self,
        vin: &OutPoint,
        chain: &dyn ChainView,
        f: impl FnOnce(&mut NodeRecord) -> R,
    ) -> Option<(R, NodeState)> {
        let now = chain.adjusted_time();
        let mut inner = self.inner.lock();
        let record = inner.nodes.get_mut(vin)?;
        let out = f(record);
        record.check(now, &self.policy, |v| chain.is_spendable(v));
        Some((out, record.state))
    }

    pub fn remove(&self, vin: &OutPoint) -> Option<NodeRecord> {
        let removed = self.inner.lock().nodes.remove(vin);
        if let Some(r) = &removed {
            tracing::info!(vin = %r.vin().short(), "Removing fundamentalnode");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// Every record, in collateral order.
    pub fn records(&self) -> Vec<NodeRecord> {
        self.inner.lock().nodes.values().cloned().collect()
    }

    /// Run the liveness check on every record.
    pub fn check_all(&self, chain: &dyn ChainView) {
        self.inner.lock().check_all(chain, &self.policy);
    }

    /// Periodic sweep: check every record, delete removed and spent ones,
    /// delete evicted ones once they stop pinging, and expire the
    /// anti-flood bookkeeping. Returns the number of records deleted.
    pub fn check_and_remove(&self, chain: &dyn ChainView) -> usize {
        let now = chain.adjusted_time();
        let policy = self.policy;
        let mut inner = self.inner.lock();
        inner.check_all(chain, &policy);
        let before = inner.nodes.len();
        inner.nodes.retain(|_, r| match r.state {
            NodeState::Remove | NodeState::VinSpent => false,
            NodeState::PosError => r.updated_within(now, policy.removal_secs),
            NodeState::Enabled | NodeState::Expired => true,
        });
        inner.asked_us_for_list.retain(|_, until| *until >= now);
        inner.we_asked_for_list.retain(|_, until| *until >= now);
        inner.we_asked_for_entry.retain(|_, until| *until >= now);
        let removed = before - inner.nodes.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = inner.nodes.len(), "Swept fundamentalnode list");
        }
        removed
    }

    /// Number of enabled nodes at or above `min_protocol`.
    pub fn count_enabled(&self, chain: &dyn ChainView, min_protocol: u32) -> usize {
        let mut inner = self.inner.lock();
        inner.check_all(chain, &self.policy);
        inner
            .nodes
            .values()
            .filter(|r| r.is_enabled() && r.identity.protocol_version >= min_protocol)
            .count()
    }

    /// Checked records at or above `min_protocol`, optionally enabled only.
    pub fn eligible(
        &self,
        chain: &dyn ChainView,
        min_protocol: u32,
        only_active: bool,
    ) -> Vec<NodeRecord> {
        let mut inner = self.inner.lock();
        inner.check_all(chain, &self.policy);
        inner
            .nodes
            .values()
            .filter(|r| r.identity.protocol_version >= min_protocol)
            .filter(|r| !only_active || r.is_enabled())
            .cloned()
            .collect()
    }

    /// The enabled node with the oldest collateral that is not in
    /// `excluded` and has at least `min_age` confirmations.
    pub fn find_oldest_not_in(
        &self,
        chain: &dyn ChainView,
        excluded: &[OutPoint],
        min_age: u32,
    ) -> Option<NodeRecord> {
        let mut inner = self.inner.lock();
        inner.check_all(chain, &self.policy);
        let mut best: Option<(u32, OutPoint)> = None;
        for record in inner.nodes.values_mut() {
            if !record.is_enabled() || excluded.contains(record.vin()) {
                continue;
            }
            let age = record.input_age(chain);
            if age < min_age {
                continue;
            }
            // strictly older wins; equal ages keep the lower outpoint
            if best.is_none_or(|(b, _)| age > b) {
                best = Some((age, *record.vin()));
            }
        }
        best.and_then(|(_, vin)| inner.nodes.get(&vin).cloned())
    }

    // ── Anti-flood bookkeeping ──

    /// Record a full-list request from `ip`. Returns `false` if the peer
    /// already asked within the window.
    pub fn note_list_request(&self, ip: IpAddr, now: i64, window: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.asked_us_for_list.get(&ip).is_some_and(|until| *until > now) {
            return false;
        }
        inner.asked_us_for_list.insert(ip, now + window);
        true
    }

    /// Record that we asked `ip` for the full list. Returns `false` if we
    /// already asked within the window.
    pub fn note_list_sync(&self, ip: IpAddr, now: i64, window: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.we_asked_for_list.get(&ip).is_some_and(|until| *until > now) {
            return false;
        }
        inner.we_asked_for_list.insert(ip, now + window);
        true
    }

    /// Record that we asked for one entry. Returns `false` if we already
    /// asked within the window.
    pub fn note_entry_request(&self, vin: &OutPoint, now: i64, window: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.we_asked_for_entry.get(vin).is_some_and(|until| *until > now) {
            return false;
        }
        inner.we_asked_for_entry.insert(*vin, now + window);
        true
    }

    pub fn dsq_count(&self) -> i64 {
        self.inner.lock().dsq_count
    }

    pub fn set_dsq_count(&self, count: i64) {
        self.inner.lock().dsq_count = count;
    }

    // ── Persistence ──

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock();
        RegistrySnapshot {
            version: crate::constants::CACHE_FORMAT_VERSION,
            nodes: inner.nodes.values().cloned().collect(),
            asked_us_for_list: inner.asked_us_for_list.clone(),
            we_asked_for_list: inner.we_asked_for_list.clone(),
            we_asked_for_entry: inner.we_asked_for_entry.clone(),
            dsq_count: inner.dsq_count,
        }
    }

    /// Replace the whole directory with a snapshot. Duplicate collaterals
    /// in the snapshot collapse to the last occurrence.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.lock();
        inner.nodes = snapshot
            .nodes
            .into_iter()
            .map(|r| (*r.vin(), r))
            .collect();
        inner.asked_us_for_list = snapshot.asked_us_for_list;
        inner.we_asked_for_list = snapshot.we_asked_for_list;
        inner.we_asked_for_entry = snapshot.we_asked_for_entry;
        inner.dsq_count = snapshot.dsq_count;
    }

    pub fn clear(&self) {
        *self.inner.lock() = RegistryState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::MemoryChain;
    use crate::chain::Script;
    use crate::constants::{COLLATERAL_AMOUNT, PROTOCOL_VERSION};
    use crate::crypto::keys::{CompactSignature, SecretKey};

    const NOW: i64 = 1_700_000_000;

    fn record(seed: u8, chain: &MemoryChain, conf_height: u64) -> NodeRecord {
        let key = SecretKey::generate().public_key().unwrap();
        let vin = OutPoint::new([seed; 32], 0);
        chain.add_output(vin, COLLATERAL_AMOUNT, key.p2pkh_script(), conf_height);
        let identity = NodeIdentity {
            vin,
            addr: format!("8.8.{}.1:5647", seed).parse().unwrap(),
            collateral_key: key.clone(),
            service_key: key,
            protocol_version: PROTOCOL_VERSION,
        };
        let mut r = NodeRecord::new(identity, CompactSignature::empty(), NOW, Script::default(), 0);
        r.update_last_seen(NOW);
        r
    }

    #[test]
    fn add_rejects_duplicate_collateral() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        let r = record(1, &chain, 50);
        assert!(registry.add(r.clone()));
        assert!(!registry.add(r));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_rejects_non_enabled() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        let mut r = record(1, &chain, 50);
        r.state = NodeState::Expired;
        assert!(!registry.add(r));
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_removes_stale_and_spent() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        let live = record(1, &chain, 50);
        let spent = record(2, &chain, 50);
        let mut stale = record(3, &chain, 50);
        stale.update_last_seen(NOW - 2 * 60 * 60);
        chain.spend(spent.vin());
        registry.add(live.clone());
        registry.add(spent);
        registry.add(stale);

        assert_eq!(registry.check_and_remove(&chain), 2);
        assert_eq!(registry.records().len(), 1);
        assert!(registry.contains(live.vin()));
    }

    #[test]
    fn find_by_service_key() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        let r = record(4, &chain, 50);
        registry.add(r.clone());
        let found = registry.find_by_service_key(&r.identity.service_key).unwrap();
        assert_eq!(found.vin(), r.vin());
    }

    #[test]
    fn oldest_not_in_prefers_oldest_collateral() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        let young = record(1, &chain, 90);
        let old = record(2, &chain, 10);
        let middle = record(3, &chain, 50);
        registry.add(young.clone());
        registry.add(old.clone());
        registry.add(middle.clone());

        let pick = registry.find_oldest_not_in(&chain, &[], 0).unwrap();
        assert_eq!(pick.vin(), old.vin());
        let pick = registry.find_oldest_not_in(&chain, &[*old.vin()], 0).unwrap();
        assert_eq!(pick.vin(), middle.vin());
        // min age excludes the young collateral (11 confirmations)
        let pick = registry.find_oldest_not_in(&chain, &[*old.vin(), *middle.vin()], 20);
        assert!(pick.is_none());
    }

    #[test]
    fn list_request_throttled_per_peer() {
        let registry = Registry::new(LivenessPolicy::default());
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        assert!(registry.note_list_request(ip, NOW, 100));
        assert!(!registry.note_list_request(ip, NOW + 50, 100));
        assert!(registry.note_list_request(ip, NOW + 101, 100));
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        registry.add(record(1, &chain, 50));
        registry.add(record(2, &chain, 50));
        registry.note_entry_request(&OutPoint::new([9u8; 32], 1), NOW, 60);
        registry.set_dsq_count(7);

        let snap = registry.snapshot();
        let other = Registry::new(LivenessPolicy::default());
        other.restore(snap.clone());
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.dsq_count(), 7);
    }

    #[test]
    fn count_enabled_respects_protocol() {
        let chain = MemoryChain::with_height(100, NOW);
        let registry = Registry::new(LivenessPolicy::default());
        let mut old = record(1, &chain, 50);
        old.identity.protocol_version = 1;
        registry.add(old);
        registry.add(record(2, &chain, 50));
        assert_eq!(registry.count_enabled(&chain, PROTOCOL_VERSION), 1);
        assert_eq!(registry.count_enabled(&chain, 0), 2);
    }
}
