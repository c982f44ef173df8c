//! Payment consensus: one payee per block height.
//!
//! Only the holder of the network's authority key originates winners. Every
//! node validates, stores and relays them; for a given height the stored
//! winner is replaced only by one with a strictly greater tie-break score,
//! so all honest nodes end on the same entry whatever order proposals
//! arrive in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainView, OutPoint, PeerId, PeerInfo, PeerSet, Script};
use crate::consensus::election::{tie_break_score, ElectionScorer};
use crate::constants::{
    FINAL_SEQUENCE, MIN_PROTOCOL_VERSION, MIN_WINNER_HISTORY, PAYEE_HASH_DEPTH, TIE_BREAK_DEPTH,
    WINNER_WINDOW_AHEAD, WINNER_WINDOW_BEHIND,
};
use crate::crypto::keys::{CompactSignature, KeyError, PublicKey, SecretKey, SignedPayload};
use crate::network::{GossipError, Message};
use crate::registry::Registry;
use crate::Hash;

/// The elected payee of one block height (`fnw`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWinner {
    pub height: u64,
    /// Collateral of the winning node.
    pub vin: OutPoint,
    /// Must be `FINAL_SEQUENCE`.
    pub sequence: u32,
    pub payee: Script,
    /// Authority signature over [`PaymentWinner::signed_payload`].
    pub signature: CompactSignature,
    /// Tie-break score, computed locally on acceptance.
    #[serde(skip)]
    pub score: U256,
}

impl PaymentWinner {
    pub fn new(height: u64, vin: OutPoint, payee: Script) -> Self {
        PaymentWinner {
            height,
            vin,
            sequence: FINAL_SEQUENCE,
            payee,
            signature: CompactSignature::empty(),
            score: U256::zero(),
        }
    }

    pub fn signed_payload(&self) -> Vec<u8> {
        SignedPayload::new()
            .outpoint(&self.vin)
            .u64(self.height)
            .bytes(self.payee.as_bytes())
            .finish()
    }

    /// Dedup key over the relayed fields.
    pub fn content_hash(&self) -> Hash {
        let mut buf = SignedPayload::new()
            .u64(self.height)
            .outpoint(&self.vin)
            .u32(self.sequence)
            .bytes(self.payee.as_bytes())
            .finish();
        buf.extend_from_slice(self.signature.as_bytes());
        crate::hash_domain("fundamentalnode.winner", &buf)
    }

    /// Whether `self` should replace `stored` for the same height.
    fn outranks(&self, stored: &PaymentWinner) -> bool {
        match self.score.cmp(&stored.score) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => (&self.vin, &self.payee) > (&stored.vin, &stored.payee),
        }
    }
}

/// Reasons the local node could not originate a winner.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("height {0} already processed")]
    AlreadyProcessed(u64),
    #[error("payments key not configured")]
    NotAuthority,
    #[error("payments key does not match the network authority key")]
    InvalidAuthorityKey,
    #[error("block hash at height {0} unavailable")]
    MissingBlockHash(u64),
    #[error("no eligible fundamentalnode")]
    NoEligibleNode,
    #[error("a stronger winner is already stored for height {0}")]
    Superseded(u64),
    #[error("signing failed: {0}")]
    Signing(#[from] KeyError),
}

#[derive(Default)]
struct PaymentsState {
    winners: BTreeMap<u64, PaymentWinner>,
    /// Content hash of every validated winner, with its height for pruning.
    seen: HashMap<Hash, u64>,
    last_processed: Option<u64>,
    synced_peers: HashSet<PeerId>,
}

/// Per-height payee convergence.
pub struct PaymentConsensus {
    registry: Arc<Registry>,
    scorer: Arc<ElectionScorer>,
    chain: Arc<dyn ChainView>,
    peers: Arc<dyn PeerSet>,
    authority_key: PublicKey,
    signing_key: Mutex<Option<SecretKey>>,
    state: Mutex<PaymentsState>,
}

impl PaymentConsensus {
    pub fn new(
        registry: Arc<Registry>,
        scorer: Arc<ElectionScorer>,
        chain: Arc<dyn ChainView>,
        peers: Arc<dyn PeerSet>,
        authority_key: PublicKey,
    ) -> Self {
        PaymentConsensus {
            registry,
            scorer,
            chain,
            peers,
            authority_key,
            signing_key: Mutex::new(None),
            state: Mutex::new(PaymentsState::default()),
        }
    }

    /// Enable winner origination. The key must produce signatures the
    /// network authority key verifies.
    pub fn set_authority_key(&self, key: SecretKey) -> Result<(), PaymentError> {
        let mut probe = PaymentWinner::new(0, OutPoint::default(), Script::default());
        probe.signature = key.sign(&probe.signed_payload())?;
        if !self.check_signature(&probe) {
            return Err(PaymentError::InvalidAuthorityKey);
        }
        *self.signing_key.lock() = Some(key);
        tracing::info!("Payments authority key enabled");
        Ok(())
    }

    pub fn is_authority(&self) -> bool {
        self.signing_key.lock().is_some()
    }

    pub fn check_signature(&self, winner: &PaymentWinner) -> bool {
        self.authority_key
            .verify(&winner.signed_payload(), &winner.signature)
    }

    /// Store a validated winner, replacing the current one for its height
    /// only if it outranks it. Returns whether the store changed.
    ///
    /// A winner counts as seen once it has been scored; one whose anchor
    /// block is unavailable stays unseen so a later copy is considered again.
    pub fn add_winner(&self, mut winner: PaymentWinner) -> bool {
        let anchor = winner.height.saturating_sub(TIE_BREAK_DEPTH);
        let Some(block_hash) = self.scorer.block_hash(anchor) else {
            tracing::debug!(height = winner.height, anchor, "No anchor block hash for winner");
            return false;
        };
        winner.score = tie_break_score(&block_hash, &winner.vin);

        let mut state = self.state.lock();
        state.seen.insert(winner.content_hash(), winner.height);
        match state.winners.get_mut(&winner.height) {
            Some(stored) => {
                if !winner.outranks(stored) {
                    return false;
                }
                tracing::debug!(height = winner.height, vin = %winner.vin.short(), "Replacing payment winner");
                *stored = winner;
            }
            None => {
                state.winners.insert(winner.height, winner);
            }
        }
        true
    }

    /// Validate a winner received from `from` and relay it if it changed
    /// the store. Returns whether it was stored.
    pub fn process_winner(&self, from: &PeerInfo, winner: PaymentWinner) -> Result<bool, GossipError> {
        let best = self.chain.best_height().ok_or(GossipError::ChainUnavailable)?;
        let hash = winner.content_hash();
        if self.state.lock().seen.contains_key(&hash) {
            return Err(GossipError::Duplicate);
        }
        if winner.height < best.saturating_sub(WINNER_WINDOW_BEHIND)
            || winner.height > best + WINNER_WINDOW_AHEAD
        {
            return Err(GossipError::OutOfWindow(winner.height));
        }
        if winner.sequence != FINAL_SEQUENCE {
            return Err(GossipError::MalformedSequence);
        }
        if !self.check_signature(&winner) {
            return Err(GossipError::BadSignature);
        }
        tracing::debug!(
            peer = from.id,
            height = winner.height,
            vin = %winner.vin.short(),
            "Received payment winner"
        );
        let relay = Message::Winner(winner.clone());
        let stored = self.add_winner(winner);
        if stored {
            self.peers.broadcast(&relay);
        }
        Ok(stored)
    }

    /// Compute, sign, store and flood the winner for `height`.
    ///
    /// Heights are processed monotonically; a repeated or older height is a
    /// no-op.
    pub fn process_block(&self, height: u64) -> Result<PaymentWinner, PaymentError> {
        if self.state.lock().last_processed.is_some_and(|last| height <= last) {
            return Err(PaymentError::AlreadyProcessed(height));
        }
        let key = self.signing_key.lock().clone().ok_or(PaymentError::NotAuthority)?;

        let chain = self.chain.as_ref();
        let enabled = self.registry.count_enabled(chain, MIN_PROTOCOL_VERSION);
        let seed_height = height
            .checked_sub(PAYEE_HASH_DEPTH)
            .ok_or(PaymentError::MissingBlockHash(0))?;
        let seed = self
            .scorer
            .block_hash(seed_height)
            .ok_or(PaymentError::MissingBlockHash(seed_height))?;
        let percentile = u16::from_le_bytes([seed[0], seed[1]]) % 100;

        // most recent payees first
        let recent: Vec<OutPoint> = {
            let state = self.state.lock();
            state
                .winners
                .range(..height)
                .rev()
                .take(enabled + 1)
                .map(|(_, w)| w.vin)
                .collect()
        };

        let min_age = u32::try_from(enabled).unwrap_or(u32::MAX);
        let record = match self.registry.find_oldest_not_in(chain, &recent, min_age) {
            Some(r) => r,
            None => recent
                .iter()
                .rev()
                .filter_map(|vin| self.registry.find(vin))
                .find(|r| r.is_enabled())
                .ok_or(PaymentError::NoEligibleNode)?,
        };

        let payee = if record.donation_percent > 0
            && percentile <= u16::from(record.donation_percent)
            && !record.donation_script.is_empty()
        {
            record.donation_script.clone()
        } else {
            record.identity.collateral_key.p2pkh_script()
        };

        let mut winner = PaymentWinner::new(height, record.identity.vin, payee);
        winner.signature = key.sign(&winner.signed_payload())?;
        if !self.add_winner(winner.clone()) {
            return Err(PaymentError::Superseded(height));
        }
        self.state.lock().last_processed = Some(height);

        tracing::info!(height, vin = %winner.vin.short(), payee = %winner.payee, "Elected payment winner");
        self.peers.broadcast(&Message::Winner(winner.clone()));
        Ok(winner)
    }

    /// Push the winners around the current height to `peer`, once per peer.
    pub fn sync_peer(&self, peer: &PeerInfo) -> Result<usize, GossipError> {
        let best = self.chain.best_height().ok_or(GossipError::ChainUnavailable)?;
        let winners: Vec<PaymentWinner> = {
            let mut state = self.state.lock();
            if !state.synced_peers.insert(peer.id) {
                return Err(GossipError::WinnersSyncFlood);
            }
            state
                .winners
                .range(best.saturating_sub(WINNER_WINDOW_BEHIND)..=best + WINNER_WINDOW_AHEAD)
                .map(|(_, w)| w.clone())
                .collect()
        };
        let sent = winners.len();
        for w in winners {
            self.peers.send(peer.id, Message::Winner(w));
        }
        tracing::debug!(peer = peer.id, sent, "Sent payment winners");
        Ok(sent)
    }

    /// Drop winners older than `max(2 × enabled, MIN_WINNER_HISTORY)` blocks.
    pub fn clean(&self) {
        let Some(best) = self.chain.best_height() else {
            return;
        };
        let enabled = self
            .registry
            .count_enabled(self.chain.as_ref(), MIN_PROTOCOL_VERSION) as u64;
        let limit = (2 * enabled).max(MIN_WINNER_HISTORY);
        let mut state = self.state.lock();
        let before = state.winners.len();
        state.winners.retain(|h, _| best.saturating_sub(*h) <= limit);
        state.seen.retain(|_, h| best.saturating_sub(*h) <= limit);
        let removed = before - state.winners.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned payment winners");
        }
    }

    pub fn winner(&self, height: u64) -> Option<PaymentWinner> {
        self.state.lock().winners.get(&height).cloned()
    }

    pub fn block_payee(&self, height: u64) -> Option<Script> {
        self.winner(height).map(|w| w.payee)
    }

    /// Stored winners in height order.
    pub fn winners(&self) -> Vec<PaymentWinner> {
        self.state.lock().winners.values().cloned().collect()
    }

    pub fn last_processed_height(&self) -> Option<u64> {
        self.state.lock().last_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{MemoryChain, RecordingPeers};
    use crate::constants::{COLLATERAL_AMOUNT, PENALTY_INVALID, PROTOCOL_VERSION};
    use crate::registry::{LivenessPolicy, NodeIdentity, NodeRecord};

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        chain: Arc<MemoryChain>,
        registry: Arc<Registry>,
        peers: Arc<RecordingPeers>,
        payments: PaymentConsensus,
        authority: SecretKey,
    }

    fn fixture(tip: u64) -> Fixture {
        let chain = Arc::new(MemoryChain::with_height(tip, NOW));
        let registry = Arc::new(Registry::new(LivenessPolicy::default()));
        let peers = Arc::new(RecordingPeers::default());
        let scorer = Arc::new(ElectionScorer::new(chain.clone()));
        let authority = SecretKey::generate();
        let payments = PaymentConsensus::new(
            registry.clone(),
            scorer,
            chain.clone(),
            peers.clone(),
            authority.public_key().unwrap(),
        );
        Fixture {
            chain,
            registry,
            peers,
            payments,
            authority,
        }
    }

    fn add_node(f: &Fixture, seed: u8, conf_height: u64) -> NodeRecord {
        let key = SecretKey::generate().public_key().unwrap();
        let vin = OutPoint::new([seed; 32], 0);
        f.chain
            .add_output(vin, COLLATERAL_AMOUNT, key.p2pkh_script(), conf_height);
        let identity = NodeIdentity {
            vin,
            addr: format!("8.8.{}.1:5647", seed).parse().unwrap(),
            collateral_key: key.clone(),
            service_key: key,
            protocol_version: PROTOCOL_VERSION,
        };
        let mut r = NodeRecord::new(identity, CompactSignature::empty(), NOW, Script::default(), 0);
        r.update_last_seen(NOW);
        f.registry.add(r.clone());
        r
    }

    fn peer() -> PeerInfo {
        PeerInfo {
            id: 1,
            addr: "9.9.9.9:5647".parse().unwrap(),
            version: PROTOCOL_VERSION,
        }
    }

    fn signed(f: &Fixture, height: u64, seed: u8) -> PaymentWinner {
        let mut w = PaymentWinner::new(height, OutPoint::new([seed; 32], 0), Script(vec![seed]));
        w.signature = f.authority.sign(&w.signed_payload()).unwrap();
        w
    }

    #[test]
    fn wrong_authority_key_rejected() {
        let f = fixture(100);
        assert!(matches!(
            f.payments.set_authority_key(SecretKey::generate()),
            Err(PaymentError::InvalidAuthorityKey)
        ));
        assert!(f.payments.set_authority_key(f.authority.clone()).is_ok());
        assert!(f.payments.is_authority());
    }

    #[test]
    fn process_block_requires_authority() {
        let f = fixture(100);
        add_node(&f, 1, 10);
        assert!(matches!(f.payments.process_block(101), Err(PaymentError::NotAuthority)));
    }

    #[test]
    fn process_block_picks_oldest_and_is_monotonic() {
        let f = fixture(105);
        add_node(&f, 1, 50);
        let oldest = add_node(&f, 2, 10);
        add_node(&f, 3, 30);
        f.payments.set_authority_key(f.authority.clone()).unwrap();

        let w = f.payments.process_block(101).unwrap();
        assert_eq!(&w.vin, oldest.vin());
        assert!(f.payments.check_signature(&w));
        assert_eq!(f.payments.winner(101).unwrap().vin, w.vin);
        assert_eq!(f.peers.sent_count(), 0, "no peers connected, nothing sent");

        assert!(matches!(
            f.payments.process_block(101),
            Err(PaymentError::AlreadyProcessed(101))
        ));
    }

    #[test]
    fn recently_paid_nodes_are_skipped() {
        let f = fixture(110);
        let a = add_node(&f, 1, 10);
        let b = add_node(&f, 2, 20);
        let c = add_node(&f, 3, 30);
        f.payments.set_authority_key(f.authority.clone()).unwrap();

        let w1 = f.payments.process_block(101).unwrap();
        let w2 = f.payments.process_block(102).unwrap();
        let w3 = f.payments.process_block(103).unwrap();
        assert_eq!(
            vec![w1.vin, w2.vin, w3.vin],
            vec![*a.vin(), *b.vin(), *c.vin()]
        );
    }

    #[test]
    fn donation_share_includes_its_boundary() {
        let f = fixture(120);
        let percentile = |height: u64| {
            let seed = f.chain.block_hash(height - PAYEE_HASH_DEPTH).unwrap();
            u16::from_le_bytes([seed[0], seed[1]]) % 100
        };
        let height = (11..=120).find(|h| percentile(*h) > 0).unwrap();

        let key = SecretKey::generate().public_key().unwrap();
        let vin = OutPoint::new([1; 32], 0);
        f.chain.add_output(vin, COLLATERAL_AMOUNT, key.p2pkh_script(), 5);
        let identity = NodeIdentity {
            vin,
            addr: "8.8.1.1:5647".parse().unwrap(),
            collateral_key: key.clone(),
            service_key: key,
            protocol_version: PROTOCOL_VERSION,
        };
        let donation = Script(vec![0xd0]);
        let percent = u8::try_from(percentile(height)).unwrap();
        let mut r = NodeRecord::new(identity, CompactSignature::empty(), NOW, donation.clone(), percent);
        r.update_last_seen(NOW);
        f.registry.add(r);
        f.payments.set_authority_key(f.authority.clone()).unwrap();

        assert_eq!(f.payments.process_block(height).unwrap().payee, donation);
    }

    #[test]
    fn winner_outside_window_dropped() {
        let f = fixture(100);
        let w = signed(&f, 150, 1);
        assert_eq!(
            f.payments.process_winner(&peer(), w),
            Err(GossipError::OutOfWindow(150))
        );
        let w = signed(&f, 80, 1);
        assert_eq!(
            f.payments.process_winner(&peer(), w),
            Err(GossipError::OutOfWindow(80))
        );
    }

    #[test]
    fn forged_winner_penalized() {
        let f = fixture(100);
        let mut w = signed(&f, 105, 1);
        w.payee = Script(vec![0xff]);
        let err = f.payments.process_winner(&peer(), w).unwrap_err();
        assert_eq!(err, GossipError::BadSignature);
        assert_eq!(err.penalty(), Some(PENALTY_INVALID));
    }

    #[test]
    fn bad_sequence_rejected() {
        let f = fixture(100);
        let mut w = signed(&f, 105, 1);
        w.sequence = 0;
        assert_eq!(
            f.payments.process_winner(&peer(), w),
            Err(GossipError::MalformedSequence)
        );
    }

    #[test]
    fn duplicate_winner_dropped() {
        let f = fixture(100);
        let w = signed(&f, 105, 1);
        assert_eq!(f.payments.process_winner(&peer(), w.clone()), Ok(true));
        assert_eq!(
            f.payments.process_winner(&peer(), w),
            Err(GossipError::Duplicate)
        );
    }

    #[test]
    fn winner_without_anchor_block_is_considered_again() {
        let f = fixture(700);
        let w = signed(&f, 705, 1);
        f.chain.set_pruned_below(Some(200));
        assert_eq!(f.payments.process_winner(&peer(), w.clone()), Ok(false));
        assert!(f.payments.winner(705).is_none());

        f.chain.set_pruned_below(None);
        assert_eq!(f.payments.process_winner(&peer(), w), Ok(true));
        assert_eq!(f.payments.winner(705).map(|w| w.vin), Some(OutPoint::new([1; 32], 0)));
    }

    #[test]
    fn outranked_winner_is_not_reconsidered() {
        let f = fixture(100);
        let a = signed(&f, 105, 1);
        let b = signed(&f, 105, 2);
        let anchor = f.chain.block_hash(0).unwrap();
        let (hi, lo) = if tie_break_score(&anchor, &a.vin) > tie_break_score(&anchor, &b.vin) {
            (a, b)
        } else {
            (b, a)
        };
        assert_eq!(f.payments.process_winner(&peer(), hi), Ok(true));
        assert_eq!(f.payments.process_winner(&peer(), lo.clone()), Ok(false));
        assert_eq!(
            f.payments.process_winner(&peer(), lo),
            Err(GossipError::Duplicate)
        );
    }

    #[test]
    fn higher_score_replaces_lower_never() {
        let f = fixture(100);
        let a = signed(&f, 105, 1);
        let b = signed(&f, 105, 2);
        let anchor = f.chain.block_hash(0).unwrap();
        let (hi, lo) = if tie_break_score(&anchor, &a.vin) > tie_break_score(&anchor, &b.vin) {
            (a, b)
        } else {
            (b, a)
        };

        assert!(f.payments.add_winner(lo.clone()));
        assert!(f.payments.add_winner(hi.clone()));
        assert_eq!(f.payments.winner(105).unwrap().vin, hi.vin);
        assert!(!f.payments.add_winner(lo));
        assert_eq!(f.payments.winner(105).unwrap().vin, hi.vin);
    }

    #[test]
    fn exact_tie_resolves_by_payee_order() {
        let f = fixture(100);
        let vin = OutPoint::new([4u8; 32], 0);
        let low = PaymentWinner::new(105, vin, Script(vec![1]));
        let high = PaymentWinner::new(105, vin, Script(vec![2]));
        assert!(f.payments.add_winner(high.clone()));
        assert!(!f.payments.add_winner(low.clone()));
        assert!(!f.payments.add_winner(high));
        assert_eq!(f.payments.block_payee(105), Some(Script(vec![2])));
    }

    #[test]
    fn sync_once_per_peer() {
        let f = fixture(100);
        f.payments.add_winner(signed(&f, 95, 1));
        f.payments.add_winner(signed(&f, 105, 2));
        f.payments.add_winner(signed(&f, 60, 3));
        assert_eq!(f.payments.sync_peer(&peer()), Ok(2));
        assert_eq!(f.peers.take_sent().len(), 2);
        assert_eq!(
            f.payments.sync_peer(&peer()),
            Err(GossipError::WinnersSyncFlood)
        );
    }

    #[test]
    fn clean_prunes_old_heights() {
        let f = fixture(2000);
        f.payments.add_winner(signed(&f, 500, 1));
        f.payments.add_winner(signed(&f, 1500, 2));
        f.payments.clean();
        let heights: Vec<u64> = f.payments.winners().iter().map(|w| w.height).collect();
        assert_eq!(heights, vec![1500]);
    }
}
