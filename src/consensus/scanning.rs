//! Proof-of-service: rank-gated reachability checks.
//!
//! At every height the top `quota` ranks (taken `SCANNING_RANK_DEPTH` blocks
//! below the tip) each probe the node at rank `count - checker_rank` and
//! flood a signed [`ScanningReport`]. Accepted reports move the target's
//! error counter; enough errors evict it for good.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainView, OutPoint, PeerSet};
use crate::consensus::election::ElectionScorer;
use crate::constants::{
    MIN_POS_PROTOCOL_VERSION, SCANNING_RANK_DEPTH, SCANNING_REPORT_MAX_AGE,
    SCANNING_REPORT_TTL_SECS,
};
use crate::crypto::keys::{CompactSignature, KeyError, SecretKey, SignedPayload};
use crate::network::Message;
use crate::registry::{NodeState, Registry, ScanOutcome};
use crate::Hash;

/// Signed result of one probe (`fnse`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanningReport {
    /// The checking node.
    pub reporter: OutPoint,
    /// The probed node.
    pub target: OutPoint,
    pub outcome: ScanOutcome,
    /// Sender's wall-clock expiry hint.
    pub expiration: i64,
    /// Height the ranks were taken at.
    pub height: u64,
    /// Reporter's operational-key signature.
    pub signature: CompactSignature,
}

impl ScanningReport {
    pub fn signed_payload(&self) -> Vec<u8> {
        SignedPayload::new()
            .outpoint(&self.reporter)
            .outpoint(&self.target)
            .u64(self.height)
            .u32(u32::from(self.outcome.code()))
            .finish()
    }

    pub fn content_hash(&self) -> Hash {
        let mut buf = self.signed_payload();
        buf.extend_from_slice(&self.expiration.to_le_bytes());
        buf.extend_from_slice(self.signature.as_bytes());
        crate::hash_domain("fundamentalnode.scanning", &buf)
    }
}

/// Reasons a scanning report is dropped.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error("report already seen")]
    Duplicate,
    #[error("unknown reporter")]
    UnknownReporter,
    #[error("reporter protocol {0} below scanning minimum")]
    OutdatedReporter(u32),
    #[error("chain height unknown")]
    ChainUnavailable,
    #[error("report for height {0} is too old")]
    TooOld(u64),
    #[error("reporter rank outside the checker quota")]
    ReporterOutsideQuota,
    #[error("target rank outside the scanned quota")]
    TargetOutsideQuota,
    #[error("invalid reporter signature")]
    BadSignature,
    #[error("signing failed: {0}")]
    Signing(#[from] KeyError),
}

/// One probe the local node owes the network at a height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeAssignment {
    pub reporter: OutPoint,
    pub target: OutPoint,
    pub addr: SocketAddr,
    pub height: u64,
}

/// Plans local probes and validates reports from the network.
pub struct ServiceMonitor {
    registry: Arc<Registry>,
    scorer: Arc<ElectionScorer>,
    chain: Arc<dyn ChainView>,
    peers: Arc<dyn PeerSet>,
    /// Content hash → local expiry.
    seen: Mutex<HashMap<Hash, i64>>,
}

impl ServiceMonitor {
    pub fn new(
        registry: Arc<Registry>,
        scorer: Arc<ElectionScorer>,
        chain: Arc<dyn ChainView>,
        peers: Arc<dyn PeerSet>,
    ) -> Self {
        ServiceMonitor {
            registry,
            scorer,
            chain,
            peers,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn eligible_count(&self) -> usize {
        self.registry
            .count_enabled(self.chain.as_ref(), MIN_POS_PROTOCOL_VERSION)
    }

    /// Number of checkers per height: 1% of eligible nodes, at least one.
    pub fn quota(&self) -> usize {
        (self.eligible_count() / 100).max(1)
    }

    /// The probe `local` must run at the current tip, if it is a checker.
    pub fn plan(&self, local: &OutPoint) -> Option<ProbeAssignment> {
        if self.chain.is_initial_block_download() {
            return None;
        }
        let height = self.chain.best_height()?.checked_sub(SCANNING_RANK_DEPTH)?;
        let rank = self.scorer.rank_of(
            &self.registry,
            local,
            height,
            MIN_POS_PROTOCOL_VERSION,
            true,
        )?;
        if rank > self.quota() {
            return None;
        }
        let target_rank = self.eligible_count().checked_sub(rank).filter(|r| *r > 0)?;
        let target = self.scorer.by_rank(
            &self.registry,
            target_rank,
            height,
            MIN_POS_PROTOCOL_VERSION,
            false,
        )?;
        Some(ProbeAssignment {
            reporter: *local,
            target: *target.vin(),
            addr: target.identity.addr,
            height,
        })
    }

    /// Sign the outcome of a finished probe, apply it locally and flood it.
    pub fn complete_probe(
        &self,
        assignment: &ProbeAssignment,
        reachable: bool,
        operational_key: &SecretKey,
    ) -> Result<ScanningReport, ScanError> {
        let outcome = if reachable {
            ScanOutcome::Success
        } else {
            ScanOutcome::NoResponse
        };
        let mut report = ScanningReport {
            reporter: assignment.reporter,
            target: assignment.target,
            outcome,
            expiration: self.chain.adjusted_time() + SCANNING_REPORT_TTL_SECS,
            height: assignment.height,
            signature: CompactSignature::empty(),
        };
        report.signature = operational_key.sign(&report.signed_payload())?;
        tracing::debug!(
            target_vin = %report.target.short(),
            addr = %assignment.addr,
            reachable,
            "Probed fundamentalnode"
        );
        self.process_report(report.clone())?;
        Ok(report)
    }

    /// Validate and apply a report. Returns whether the target's counter
    /// moved; every valid report is relayed.
    pub fn process_report(&self, report: ScanningReport) -> Result<bool, ScanError> {
        let now = self.chain.adjusted_time();
        let hash = report.content_hash();
        {
            let mut seen = self.seen.lock();
            if seen.contains_key(&hash) {
                return Err(ScanError::Duplicate);
            }
            seen.insert(hash, now + SCANNING_REPORT_TTL_SECS);
        }

        self.validate(&report)?;

        let threshold = self.registry.policy().scanning_error_threshold;
        let Some((applied, state)) = self.registry.update_checked(&report.target, self.chain.as_ref(), |r| {
            r.apply_scanning(report.outcome, report.height, threshold)
        }) else {
            return Err(ScanError::TargetOutsideQuota);
        };
        if applied && state == NodeState::PosError {
            tracing::info!(target_vin = %report.target.short(), "Fundamentalnode evicted by proof-of-service");
        }
        self.peers.broadcast(&Message::ScanningReport(report));
        Ok(applied)
    }

    fn validate(&self, report: &ScanningReport) -> Result<(), ScanError> {
        let reporter = self
            .registry
            .find(&report.reporter)
            .ok_or(ScanError::UnknownReporter)?;
        if reporter.identity.protocol_version < MIN_POS_PROTOCOL_VERSION {
            return Err(ScanError::OutdatedReporter(reporter.identity.protocol_version));
        }
        let best = self.chain.best_height().ok_or(ScanError::ChainUnavailable)?;
        if best.saturating_sub(report.height) > SCANNING_REPORT_MAX_AGE {
            return Err(ScanError::TooOld(report.height));
        }

        let quota = self.quota();
        let rank = self
            .scorer
            .rank_of(&self.registry, &report.reporter, report.height, MIN_POS_PROTOCOL_VERSION, true)
            .filter(|r| *r <= quota)
            .ok_or(ScanError::ReporterOutsideQuota)?;
        let floor = self.eligible_count().saturating_sub(quota);
        self.scorer
            .rank_of(&self.registry, &report.target, report.height, MIN_POS_PROTOCOL_VERSION, false)
            .filter(|r| *r >= floor)
            .ok_or(ScanError::TargetOutsideQuota)?;

        if !reporter
            .identity
            .service_key
            .verify(&report.signed_payload(), &report.signature)
        {
            return Err(ScanError::BadSignature);
        }
        tracing::trace!(reporter_rank = rank, height = report.height, "Scanning report valid");
        Ok(())
    }

    /// Forget expired report hashes.
    pub fn clean(&self) {
        let now = self.chain.adjusted_time();
        self.seen.lock().retain(|_, expiry| *expiry >= now);
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{MemoryChain, RecordingPeers};
    use crate::chain::Script;
    use crate::constants::PROTOCOL_VERSION;
    use crate::registry::{LivenessPolicy, NodeIdentity, NodeRecord};

    const NOW: i64 = 1_700_000_000;

    struct Net {
        chain: Arc<MemoryChain>,
        registry: Arc<Registry>,
        scorer: Arc<ElectionScorer>,
        monitor: ServiceMonitor,
        peers: Arc<RecordingPeers>,
        keys: Vec<(OutPoint, SecretKey)>,
    }

    fn net(size: u8) -> Net {
        let chain = Arc::new(MemoryChain::with_height(100, NOW));
        let registry = Arc::new(Registry::new(LivenessPolicy::default()));
        let scorer = Arc::new(ElectionScorer::new(chain.clone()));
        let peers = Arc::new(RecordingPeers::default());
        let mut keys = Vec::new();
        for seed in 1..=size {
            let key = SecretKey::generate();
            let pk = key.public_key().unwrap();
            let vin = OutPoint::new([seed; 32], 0);
            chain.add_output(vin, 1, Script::default(), 10);
            let identity = NodeIdentity {
                vin,
                addr: format!("8.8.{}.1:5647", seed).parse().unwrap(),
                collateral_key: pk.clone(),
                service_key: pk,
                protocol_version: PROTOCOL_VERSION,
            };
            let mut r = NodeRecord::new(identity, CompactSignature::empty(), NOW, Script::default(), 0);
            r.update_last_seen(NOW);
            registry.add(r);
            keys.push((vin, key));
        }
        peers.connect(crate::chain::PeerInfo {
            id: 9,
            addr: "9.9.9.9:5647".parse().unwrap(),
            version: PROTOCOL_VERSION,
        });
        let monitor = ServiceMonitor::new(registry.clone(), scorer.clone(), chain.clone(), peers.clone());
        Net {
            chain,
            registry,
            scorer,
            monitor,
            peers,
            keys,
        }
    }

    fn key_of<'a>(net: &'a Net, vin: &OutPoint) -> &'a SecretKey {
        &net.keys.iter().find(|(v, _)| v == vin).unwrap().1
    }

    fn vin_at(net: &Net, rank: usize) -> OutPoint {
        *net.scorer
            .by_rank(&net.registry, rank, 95, MIN_POS_PROTOCOL_VERSION, true)
            .unwrap()
            .vin()
    }

    #[test]
    fn only_top_rank_checks() {
        let n = net(3);
        let checker = vin_at(&n, 1);
        let plan = n.monitor.plan(&checker).unwrap();
        assert_eq!(plan.target, vin_at(&n, 2));
        assert_eq!(plan.height, 95);
        assert!(n.monitor.plan(&vin_at(&n, 2)).is_none());
        assert!(n.monitor.plan(&vin_at(&n, 3)).is_none());
    }

    #[test]
    fn failed_probe_raises_error_counter_once_per_height() {
        let n = net(3);
        let checker = vin_at(&n, 1);
        let plan = n.monitor.plan(&checker).unwrap();
        let key = key_of(&n, &checker);

        n.monitor.complete_probe(&plan, false, key).unwrap();
        assert_eq!(n.registry.find(&plan.target).unwrap().scanning_errors, 1);

        // a second, distinct report for the same height is not applied
        let mut again = ScanningReport {
            reporter: checker,
            target: plan.target,
            outcome: ScanOutcome::InstantSendNoResponse,
            expiration: NOW + 10,
            height: plan.height,
            signature: CompactSignature::empty(),
        };
        again.signature = key.sign(&again.signed_payload()).unwrap();
        assert_eq!(n.monitor.process_report(again), Ok(false));
        assert_eq!(n.registry.find(&plan.target).unwrap().scanning_errors, 1);
    }

    #[test]
    fn valid_report_is_relayed_even_when_not_applied() {
        let n = net(3);
        let checker = vin_at(&n, 1);
        let plan = n.monitor.plan(&checker).unwrap();
        let key = key_of(&n, &checker);
        n.monitor.complete_probe(&plan, false, key).unwrap();
        assert_eq!(n.peers.take_sent().len(), 1);

        let mut again = ScanningReport {
            reporter: checker,
            target: plan.target,
            outcome: ScanOutcome::NoResponse,
            expiration: NOW + 20,
            height: plan.height,
            signature: CompactSignature::empty(),
        };
        again.signature = key.sign(&again.signed_payload()).unwrap();
        assert_eq!(n.monitor.process_report(again.clone()), Ok(false));
        let sent = n.peers.take_sent();
        assert_eq!(sent, vec![(9, Message::ScanningReport(again))]);
    }

    #[test]
    fn success_never_goes_negative() {
        let n = net(3);
        let checker = vin_at(&n, 1);
        let plan = n.monitor.plan(&checker).unwrap();
        n.monitor
            .complete_probe(&plan, true, key_of(&n, &checker))
            .unwrap();
        assert_eq!(n.registry.find(&plan.target).unwrap().scanning_errors, 0);
    }

    #[test]
    fn reporter_outside_quota_rejected() {
        let n = net(3);
        let outsider = vin_at(&n, 3);
        let mut report = ScanningReport {
            reporter: outsider,
            target: vin_at(&n, 2),
            outcome: ScanOutcome::NoResponse,
            expiration: NOW,
            height: 95,
            signature: CompactSignature::empty(),
        };
        report.signature = key_of(&n, &outsider).sign(&report.signed_payload()).unwrap();
        assert_eq!(
            n.monitor.process_report(report),
            Err(ScanError::ReporterOutsideQuota)
        );
    }

    #[test]
    fn forged_and_stale_reports_rejected() {
        let n = net(3);
        let checker = vin_at(&n, 1);
        let mut report = ScanningReport {
            reporter: checker,
            target: vin_at(&n, 2),
            outcome: ScanOutcome::NoResponse,
            expiration: NOW,
            height: 95,
            signature: CompactSignature::empty(),
        };
        report.signature = SecretKey::generate().sign(&report.signed_payload()).unwrap();
        assert_eq!(
            n.monitor.process_report(report.clone()),
            Err(ScanError::BadSignature)
        );
        assert_eq!(
            n.monitor.process_report(report.clone()),
            Err(ScanError::Duplicate)
        );

        report.height = 80;
        assert_eq!(n.monitor.process_report(report), Err(ScanError::TooOld(80)));
    }

    #[test]
    fn seen_reports_expire() {
        let n = net(3);
        let checker = vin_at(&n, 1);
        let plan = n.monitor.plan(&checker).unwrap();
        n.monitor
            .complete_probe(&plan, true, key_of(&n, &checker))
            .unwrap();
        assert_eq!(n.monitor.seen_count(), 1);
        n.chain.advance_time(SCANNING_REPORT_TTL_SECS + 1);
        n.monitor.clean();
        assert_eq!(n.monitor.seen_count(), 0);
    }
}
