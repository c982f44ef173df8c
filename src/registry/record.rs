//! Node records and their liveness state machine.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::chain::{ChainView, OutPoint, Script};
use crate::crypto::keys::{CompactSignature, PublicKey};

/// Lifecycle state of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Enabled,
    Expired,
    /// The collateral output has been spent.
    VinSpent,
    Remove,
    /// Evicted by proof-of-service reports. Terminal.
    PosError,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Enabled => "ENABLED",
            NodeState::Expired => "EXPIRED",
            NodeState::VinSpent => "VIN_SPENT",
            NodeState::Remove => "REMOVE",
            NodeState::PosError => "POS_ERROR",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one proof-of-service probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanOutcome {
    Success,
    NoResponse,
    InstantSendNoResponse,
}

impl ScanOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, ScanOutcome::Success)
    }

    /// Wire code used in signed payloads.
    pub fn code(&self) -> u8 {
        match self {
            ScanOutcome::Success => 1,
            ScanOutcome::NoResponse => 2,
            ScanOutcome::InstantSendNoResponse => 3,
        }
    }
}

/// Time windows and thresholds driving [`NodeRecord::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// No liveness for this long: `Expired`.
    pub expiration_secs: i64,
    /// No liveness for this long: `Remove`.
    pub removal_secs: i64,
    /// Error count at which a node enters `PosError`.
    pub scanning_error_threshold: u32,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        LivenessPolicy {
            expiration_secs: 65 * 60,
            removal_secs: 70 * 60,
            scanning_error_threshold: 6,
        }
    }
}

/// What a node claims about itself in its announce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Collateral outpoint; the unique key of the record.
    pub vin: OutPoint,
    pub addr: SocketAddr,
    /// Key owning the collateral output.
    pub collateral_key: PublicKey,
    /// Key the running node signs pings, votes and scanning reports with.
    pub service_key: PublicKey,
    pub protocol_version: u32,
}

/// One directory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub identity: NodeIdentity,
    /// Announce signature by the collateral key.
    pub signature: CompactSignature,
    pub sig_time: i64,
    pub last_seen: i64,
    /// Signature time of the newest accepted ping.
    pub last_ping: i64,
    /// Local time this node last flooded liveness for the record.
    pub last_relay: i64,
    pub state: NodeState,
    pub donation_script: Script,
    pub donation_percent: u8,
    pub vote: i8,
    pub last_vote: i64,
    pub scanning_errors: u32,
    pub last_scanning_error_height: u64,
    pub cache_input_age: u32,
    pub cache_input_age_block: u64,
}

impl NodeRecord {
    pub fn new(
        identity: NodeIdentity,
        signature: CompactSignature,
        sig_time: i64,
        donation_script: Script,
        donation_percent: u8,
    ) -> Self {
        NodeRecord {
            identity,
            signature,
            sig_time,
            last_seen: 0,
            last_ping: 0,
            last_relay: 0,
            state: NodeState::Enabled,
            donation_script,
            donation_percent,
            vote: 0,
            last_vote: 0,
            scanning_errors: 0,
            last_scanning_error_height: 0,
            cache_input_age: 0,
            cache_input_age_block: 0,
        }
    }

    pub fn vin(&self) -> &OutPoint {
        &self.identity.vin
    }

    pub fn is_enabled(&self) -> bool {
        self.state == NodeState::Enabled
    }

    pub fn updated_within(&self, now: i64, secs: i64) -> bool {
        now - self.last_seen < secs
    }

    pub fn update_last_seen(&mut self, at: i64) {
        self.last_seen = at;
    }

    /// Forget liveness; the next check moves the node out of `Enabled`.
    pub fn disable(&mut self) {
        self.last_seen = 0;
    }

    /// Recompute `state` from liveness, collateral and scanning errors.
    ///
    /// `PosError` and `VinSpent` are terminal. `spendable` is consulted only
    /// while the node is otherwise live.
    pub fn check(
        &mut self,
        now: i64,
        policy: &LivenessPolicy,
        spendable: impl FnOnce(&OutPoint) -> bool,
    ) {
        if matches!(self.state, NodeState::PosError | NodeState::VinSpent) {
            return;
        }
        if self.scanning_errors >= policy.scanning_error_threshold {
            self.state = NodeState::PosError;
            return;
        }
        if !self.updated_within(now, policy.removal_secs) {
            self.state = NodeState::Remove;
            return;
        }
        if !self.updated_within(now, policy.expiration_secs) {
            self.state = NodeState::Expired;
            return;
        }
        if !spendable(&self.identity.vin) {
            self.state = NodeState::VinSpent;
            return;
        }
        self.state = NodeState::Enabled;
    }

    /// Apply one accepted scanning report.
    ///
    /// Returns `false` when a report for this height was already applied.
    pub fn apply_scanning(&mut self, outcome: ScanOutcome, height: u64, threshold: u32) -> bool {
        if height == self.last_scanning_error_height {
            return false;
        }
        self.last_scanning_error_height = height;
        if outcome.is_error() {
            self.scanning_errors = (self.scanning_errors + 1).min(threshold * 2);
        } else {
            self.scanning_errors = self.scanning_errors.saturating_sub(1);
        }
        true
    }

    /// Confirmations of the collateral, cached and projected by chain growth.
    pub fn input_age(&mut self, chain: &dyn ChainView) -> u32 {
        let best = chain.best_height().unwrap_or(0);
        if self.cache_input_age == 0 {
            self.cache_input_age = chain.confirmations(&self.identity.vin).unwrap_or(0);
            self.cache_input_age_block = best;
        }
        let grown = best.saturating_sub(self.cache_input_age_block);
        self.cache_input_age
            .saturating_add(u32::try_from(grown).unwrap_or(u32::MAX))
    }

    /// `YEA`, `NAY` or `ABSTAIN`; stale votes count as abstentions.
    pub fn vote_label(&self, now: i64) -> &'static str {
        if now - self.last_vote < crate::constants::VOTE_EXPIRY_SECS {
            match self.vote {
                -1 => return "NAY",
                1 => return "YEA",
                _ => {}
            }
        }
        "ABSTAIN"
    }
}
