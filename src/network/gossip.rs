//! Gossip message handlers.
//!
//! Every handler validates first and applies last: the first failing check
//! returns a [`GossipError`] and nothing has been written. The dispatcher
//! logs the rejection and reports its penalty, if any, to the transport.
//! Handlers are serialized by one coarse lock so that two messages never
//! interleave their partial application.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::activation::ActivationAgent;
use crate::chain::{is_private, ChainView, OutPoint, PeerId, PeerInfo, PeerSet, Script};
use crate::config::{NetworkParams, TimingConfig};
use crate::consensus::payments::PaymentConsensus;
use crate::consensus::scanning::{ScanError, ServiceMonitor};
use crate::constants::{
    MAX_SIG_TIME_DRIFT_SECS, MIN_PEER_PROTOCOL_VERSION, PENALTY_INVALID, PENALTY_LIST_FLOOD,
    PENALTY_MINOR, PROTOCOL_VERSION, RESYNC_PEER_TARGET, UNSOLICITED_MARKER, VOTE_INTERVAL_SECS,
};
use crate::network::protocol::{Announce, Message, Ping, Vote};
use crate::registry::{NodeRecord, NodeState, Registry};

/// Reasons a gossip message is dropped.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum GossipError {
    #[error("local chain is still syncing")]
    Syncing,
    #[error("chain height unknown")]
    ChainUnavailable,
    #[error("signature time {0} too far in the future")]
    FutureSigTime(i64),
    #[error("signature time {0} too far in the past")]
    StaleSigTime(i64),
    #[error("donation percent {0} out of range")]
    DonationOutOfRange(i32),
    #[error("protocol version {0} is outdated")]
    OutdatedProtocol(u32),
    #[error("malformed public key")]
    InvalidKey,
    #[error("bad signature")]
    BadSignature,
    #[error("port {0} is not the fundamentalnode port")]
    WrongPort(u16),
    #[error("collateral transaction does not pay the collateral key")]
    BadCollateral,
    #[error("collateral output is spent")]
    CollateralSpent,
    #[error("collateral has {0} confirmations")]
    ImmatureCollateral(u32),
    #[error("signature time predates collateral maturity")]
    SigTimeBeforeMaturity,
    #[error("entry is not newer than the stored one")]
    NotNewer,
    #[error("entry updated too recently")]
    TooSoon,
    #[error("collateral key differs from the stored one")]
    CollateralKeyMismatch,
    #[error("unknown fundamentalnode {0}")]
    UnknownNode(OutPoint),
    #[error("peer already asked for the full list")]
    ListRequestFlood,
    #[error("peer already asked for the winners")]
    WinnersSyncFlood,
    #[error("vote value {0} out of range")]
    VoteOutOfRange(i32),
    #[error("voted too recently")]
    VoteTooSoon,
    #[error("height {0} outside the accepted window")]
    OutOfWindow(u64),
    #[error("already seen")]
    Duplicate,
    #[error("input sequence is not final")]
    MalformedSequence,
    #[error("scanning report rejected: {0}")]
    Scan(#[from] ScanError),
}

impl GossipError {
    /// Misbehavior score to report against the sender.
    pub fn penalty(&self) -> Option<u32> {
        match self {
            GossipError::InvalidKey
            | GossipError::BadSignature
            | GossipError::BadCollateral
            | GossipError::MalformedSequence
            | GossipError::Scan(ScanError::BadSignature) => Some(PENALTY_INVALID),
            GossipError::ListRequestFlood => Some(PENALTY_LIST_FLOOD),
            GossipError::ImmatureCollateral(_) | GossipError::WinnersSyncFlood => Some(PENALTY_MINOR),
            _ => None,
        }
    }
}

/// Inbound dispatch for every gossip message.
pub struct GossipProtocol {
    registry: Arc<Registry>,
    chain: Arc<dyn ChainView>,
    peers: Arc<dyn PeerSet>,
    payments: Arc<PaymentConsensus>,
    monitor: Arc<ServiceMonitor>,
    agent: Option<Arc<ActivationAgent>>,
    params: NetworkParams,
    timing: TimingConfig,
    message_lock: Mutex<()>,
    synced_peers: Mutex<HashSet<PeerId>>,
    sync_requests: AtomicUsize,
}

impl GossipProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        chain: Arc<dyn ChainView>,
        peers: Arc<dyn PeerSet>,
        payments: Arc<PaymentConsensus>,
        monitor: Arc<ServiceMonitor>,
        agent: Option<Arc<ActivationAgent>>,
        params: NetworkParams,
        timing: TimingConfig,
    ) -> Self {
        GossipProtocol {
            registry,
            chain,
            peers,
            payments,
            monitor,
            agent,
            params,
            timing,
            message_lock: Mutex::new(()),
            synced_peers: Mutex::new(HashSet::new()),
            sync_requests: AtomicUsize::new(0),
        }
    }

    /// Handle one message, logging rejections and applying penalties.
    pub fn process(&self, from: &PeerInfo, msg: Message) {
        let command = msg.command();
        if let Err(e) = self.handle(from, msg) {
            match e.penalty() {
                Some(score) => {
                    tracing::debug!(peer = from.id, command, score, reason = %e, "Penalized gossip message");
                    self.peers.misbehaving(from.id, score);
                }
                None => tracing::trace!(peer = from.id, command, reason = %e, "Dropped gossip message"),
            }
        }
    }

    /// Handle one message. Nothing is applied when an error is returned.
    pub fn handle(&self, from: &PeerInfo, msg: Message) -> Result<(), GossipError> {
        let _guard = self.message_lock.lock();
        if self.chain.is_initial_block_download() {
            return Err(GossipError::Syncing);
        }
        match msg {
            Message::Announce(announce) => self.on_announce(announce),
            Message::Ping(ping) => self.on_ping(from, ping),
            Message::ListRequest { vin } => self.on_list_request(from, vin),
            Message::ListSync => self.on_list_request(from, None),
            Message::Winner(winner) => self.payments.process_winner(from, winner).map(|_| ()),
            Message::WinnersSync => self.payments.sync_peer(from).map(|_| ()),
            Message::Vote(vote) => self.on_vote(vote),
            Message::ScanningReport(report) => {
                self.monitor.process_report(report)?;
                Ok(())
            }
        }
    }

    // ── fne ──

    fn on_announce(&self, msg: Announce) -> Result<(), GossipError> {
        let now = self.chain.adjusted_time();
        if msg.sig_time > now + MAX_SIG_TIME_DRIFT_SECS {
            return Err(GossipError::FutureSigTime(msg.sig_time));
        }
        if !(0..=100).contains(&msg.donation_percent) {
            return Err(GossipError::DonationOutOfRange(msg.donation_percent));
        }
        if msg.protocol_version < self.params.min_protocol_version {
            return Err(GossipError::OutdatedProtocol(msg.protocol_version));
        }
        if !msg.collateral_key.is_valid() || !msg.service_key.is_valid() {
            return Err(GossipError::InvalidKey);
        }
        if !msg.collateral_key.verify(&msg.signed_payload(), &msg.signature) {
            return Err(GossipError::BadSignature);
        }
        if msg.addr.port() != self.params.fundamentalnode_port {
            return Err(GossipError::WrongPort(msg.addr.port()));
        }

        let awaiting_remote = self
            .agent
            .as_ref()
            .is_some_and(|a| a.awaits_remote_activation(&msg.service_key));
        if !awaiting_remote {
            if let Some(existing) = self.registry.find(&msg.vin) {
                return self.refresh_announce(&existing, msg, now);
            }
        }
        self.admit_announce(msg, now)
    }

    /// Re-announce of a listed collateral.
    fn refresh_announce(&self, existing: &NodeRecord, msg: Announce, now: i64) -> Result<(), GossipError> {
        // entries served from a list never refresh
        if msg.count != UNSOLICITED_MARKER {
            return Ok(());
        }
        if existing.identity.collateral_key != msg.collateral_key {
            return Err(GossipError::CollateralKeyMismatch);
        }
        if existing.updated_within(now, self.timing.min_announce_seconds) {
            return Err(GossipError::TooSoon);
        }
        if msg.sig_time <= existing.sig_time {
            return Err(GossipError::NotNewer);
        }

        let (donation_script, donation_percent) = accepted_donation(&msg);
        let updated = self.registry.update_checked(&msg.vin, self.chain.as_ref(), |r| {
            r.update_last_seen(now);
            r.last_relay = now;
            r.identity.service_key = msg.service_key.clone();
            r.identity.protocol_version = msg.protocol_version;
            r.identity.addr = msg.addr;
            r.sig_time = msg.sig_time;
            r.signature = msg.signature.clone();
            r.donation_script = donation_script;
            r.donation_percent = donation_percent;
        });
        tracing::debug!(vin = %msg.vin.short(), addr = %msg.addr, "Got updated fundamentalnode entry");
        if let Some(((), NodeState::Enabled)) = updated {
            self.peers.broadcast(&Message::Announce(msg));
        }
        Ok(())
    }

    /// First announce of a collateral: verify it against the chain once.
    fn admit_announce(&self, msg: Announce, now: i64) -> Result<(), GossipError> {
        let chain = self.chain.as_ref();
        let tx = chain
            .transaction(&msg.vin.txid)
            .ok_or(GossipError::BadCollateral)?;
        let payee = msg.collateral_key.p2pkh_script();
        if !tx
            .outputs
            .iter()
            .any(|out| out.value == self.params.collateral_amount && out.script == payee)
        {
            return Err(GossipError::BadCollateral);
        }
        if !chain.is_spendable(&msg.vin) {
            return Err(GossipError::CollateralSpent);
        }
        let confirmations = chain.confirmations(&msg.vin).unwrap_or(0);
        if confirmations < self.params.min_confirmations {
            return Err(GossipError::ImmatureCollateral(confirmations));
        }
        if let Some(height) = tx.block_height {
            let mature_at = height + u64::from(self.params.min_confirmations) - 1;
            if chain.block_time(mature_at).is_some_and(|t| t > msg.sig_time) {
                return Err(GossipError::SigTimeBeforeMaturity);
            }
        }

        let (donation_script, donation_percent) = accepted_donation(&msg);
        let mut record = NodeRecord::new(
            msg.identity(),
            msg.signature.clone(),
            msg.sig_time,
            donation_script,
            donation_percent,
        );
        let seen = if msg.last_seen > 0 { msg.last_seen.min(now) } else { now };
        record.update_last_seen(seen);
        record.last_relay = now;
        let added = self.registry.add(record);
        if !added {
            tracing::trace!(vin = %msg.vin.short(), "Announce for a listed collateral");
        }

        if msg.protocol_version == PROTOCOL_VERSION {
            if let Some(agent) = &self.agent {
                agent.enable_hot_cold(&msg.service_key, msg.vin, msg.addr);
            }
        }
        if added && msg.count == UNSOLICITED_MARKER && !is_private(&msg.addr) {
            self.peers.broadcast(&Message::Announce(msg));
        }
        Ok(())
    }

    // ── fnep ──

    fn on_ping(&self, from: &PeerInfo, msg: Ping) -> Result<(), GossipError> {
        let now = self.chain.adjusted_time();
        if msg.sig_time > now + MAX_SIG_TIME_DRIFT_SECS {
            return Err(GossipError::FutureSigTime(msg.sig_time));
        }
        if msg.sig_time <= now - MAX_SIG_TIME_DRIFT_SECS {
            return Err(GossipError::StaleSigTime(msg.sig_time));
        }

        let Some(record) = self.registry.find(&msg.vin) else {
            if self
                .registry
                .note_entry_request(&msg.vin, now, self.timing.min_ping_seconds)
            {
                tracing::debug!(vin = %msg.vin.short(), peer = from.id, "Asking for missing fundamentalnode entry");
                self.peers
                    .send(from.id, Message::ListRequest { vin: Some(msg.vin) });
            }
            return Err(GossipError::UnknownNode(msg.vin));
        };
        if record.identity.protocol_version < self.params.min_protocol_version {
            return Err(GossipError::OutdatedProtocol(record.identity.protocol_version));
        }
        if msg.sig_time <= record.last_ping {
            return Err(GossipError::NotNewer);
        }
        let payload = Ping::signed_payload(&record.identity.addr, msg.sig_time, msg.stop);
        if !record.identity.service_key.verify(&payload, &msg.signature) {
            return Err(GossipError::BadSignature);
        }

        let min_ping = self.timing.min_ping_seconds;
        let Some((relay_due, state)) = self.registry.update_checked(&msg.vin, self.chain.as_ref(), |r| {
            r.last_ping = msg.sig_time;
            let relay_due = now - r.last_relay >= min_ping;
            if msg.stop {
                r.disable();
            } else {
                r.update_last_seen(now);
                if relay_due {
                    r.last_relay = now;
                }
            }
            relay_due
        }) else {
            return Err(GossipError::UnknownNode(msg.vin));
        };

        if msg.stop {
            tracing::debug!(vin = %msg.vin.short(), "Fundamentalnode stopped");
            self.peers.broadcast(&Message::Ping(msg));
        } else if relay_due && state == NodeState::Enabled {
            self.peers.broadcast(&Message::Ping(msg));
        }
        Ok(())
    }

    // ── fneg / fnl ──

    fn on_list_request(&self, from: &PeerInfo, vin: Option<OutPoint>) -> Result<(), GossipError> {
        let now = self.chain.adjusted_time();
        if vin.is_none()
            && !is_private(&from.addr)
            && !self
                .registry
                .note_list_request(from.addr.ip(), now, self.timing.list_resync_seconds)
        {
            return Err(GossipError::ListRequestFlood);
        }

        self.registry.check_all(self.chain.as_ref());
        let records = self.registry.records();
        let count = i32::try_from(records.len()).unwrap_or(i32::MAX);
        let mut current = 0i32;
        for record in &records {
            if is_private(&record.identity.addr) || !record.is_enabled() {
                continue;
            }
            match vin {
                None => {
                    self.peers
                        .send(from.id, Message::Announce(Announce::from_record(record, count, current)));
                }
                Some(wanted) if wanted == *record.vin() => {
                    self.peers
                        .send(from.id, Message::Announce(Announce::from_record(record, count, current)));
                    tracing::debug!(peer = from.id, vin = %wanted.short(), "Sent fundamentalnode entry");
                    return Ok(());
                }
                Some(_) => {}
            }
            current += 1;
        }
        if vin.is_none() {
            tracing::debug!(peer = from.id, sent = current, "Sent fundamentalnode list");
        }
        Ok(())
    }

    // ── fvote ──

    fn on_vote(&self, msg: Vote) -> Result<(), GossipError> {
        if !(-1..=1).contains(&msg.value) {
            return Err(GossipError::VoteOutOfRange(msg.value));
        }
        let record = self
            .registry
            .find(&msg.vin)
            .ok_or(GossipError::UnknownNode(msg.vin))?;
        let now = self.chain.adjusted_time();
        if now - record.last_vote <= VOTE_INTERVAL_SECS {
            return Err(GossipError::VoteTooSoon);
        }
        let payload = Vote::signed_payload(&msg.vin, msg.value);
        if !record.identity.service_key.verify(&payload, &msg.signature) {
            return Err(GossipError::BadSignature);
        }
        let value = i8::try_from(msg.value).map_err(|_| GossipError::VoteOutOfRange(msg.value))?;
        self.registry.update(&msg.vin, |r| {
            r.vote = value;
            r.last_vote = now;
        });
        self.peers.broadcast(&Message::Vote(msg));
        Ok(())
    }

    // ── Startup resync ──

    /// Ask peers not yet asked for the directory and the winners, until
    /// `RESYNC_PEER_TARGET` peers have been asked. Returns how many peers
    /// were asked by this call.
    pub fn request_sync(&self) -> usize {
        if self.sync_requests.load(Ordering::Relaxed) >= RESYNC_PEER_TARGET
            || self.chain.is_initial_block_download()
        {
            return 0;
        }
        let now = self.chain.adjusted_time();
        let mut asked = 0;
        for peer in self.peers.peers() {
            if peer.version < MIN_PEER_PROTOCOL_VERSION {
                continue;
            }
            if !self.synced_peers.lock().insert(peer.id) {
                continue;
            }
            if self
                .registry
                .note_list_sync(peer.addr.ip(), now, self.timing.list_resync_seconds)
            {
                self.peers.send(peer.id, Message::ListSync);
            } else {
                tracing::debug!(peer = peer.id, "Already asked peer for the list; skipping");
            }
            self.peers.send(peer.id, Message::WinnersSync);
            asked += 1;
        }
        if asked > 0 {
            self.sync_requests.fetch_add(asked, Ordering::Relaxed);
            tracing::info!(asked, "Asked peers for fundamentalnode list and payment winners");
        }
        asked
    }

    /// Whether enough peers have been asked to sync.
    pub fn sync_requested(&self) -> bool {
        self.sync_requests.load(Ordering::Relaxed) >= RESYNC_PEER_TARGET
    }
}

/// Pay-to-script-hash donation payees are not supported and are dropped.
fn accepted_donation(msg: &Announce) -> (Script, u8) {
    let percent = u8::try_from(msg.donation_percent).unwrap_or(0);
    if msg.donation_script.is_p2sh() {
        (Script::default(), 0)
    } else {
        (msg.donation_script.clone(), percent)
    }
}
