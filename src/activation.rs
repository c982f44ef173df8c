//! Activation agent: registers the local node, keeps it pinging and retires
//! it on request.
//!
//! The agent also drives remote ("cold") starts of configured entries: the
//! wallet signs the announce with the collateral key while the running node
//! only holds the operational key and promotes itself to
//! [`ActivationStatus::RemotelyEnabled`] when it sees that announce.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::{ChainView, OutPoint, PeerSet, Prober, Script, WalletView};
use crate::config::{ConfigError, FundamentalnodeConfig, FundamentalnodeEntry, NetworkParams, TimingConfig};
use crate::constants::UNSOLICITED_MARKER;
use crate::crypto::keys::{KeyError, PublicKey, SecretKey};
use crate::network::protocol::{Announce, Message, Ping, Vote};
use crate::registry::{NodeRecord, Registry};

/// Where the local node is in its activation lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationStatus {
    NotProcessed,
    IsCapable,
    NotCapable,
    Stopped,
    InputTooNew,
    SyncInProcess,
    RemotelyEnabled,
}

impl ActivationStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ActivationStatus::IsCapable | ActivationStatus::RemotelyEnabled)
    }
}

/// Why the agent could not activate or act. `Display` is the operator-facing
/// reason string.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ActivationError {
    #[error("Can't detect external address. Please use the service_addr configuration option.")]
    NoExternalAddress,
    #[error("Invalid port: {port} - only {expected} is supported on this network.")]
    InvalidPort { port: u16, expected: u16 },
    #[error("Could not connect to {0}")]
    Unreachable(SocketAddr),
    #[error("Wallet is locked.")]
    WalletLocked,
    #[error("Could not find suitable coins!")]
    NoCollateral,
    #[error("Input must have least {required} confirmations - {actual} confirmations")]
    InputTooNew { required: u32, actual: u32 },
    #[error("could not allocate vin {0}")]
    CollateralNotFound(OutPoint),
    #[error("Fundamentalnode List doesn't include our Fundamentalnode, shutting down pinging service! {0}")]
    NotListed(OutPoint),
    #[error("Fundamentalnode is not in a running status")]
    NotRunning,
    #[error("no operational key configured")]
    NoOperationalKey,
    #[error("could not find alias {0} in config")]
    UnknownAlias(String),
    #[error("can't find fundamentalnode by pubkey for {0}")]
    UnknownServiceKey(String),
    #[error("wallet could not sign with the collateral key")]
    WalletSigning,
    #[error("verify message failed")]
    VerifyFailed,
    #[error("vote must be 1 (yea) or -1 (nay), got {0}")]
    InvalidVote(i32),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("{0}")]
    Config(String),
}

impl From<ConfigError> for ActivationError {
    fn from(e: ConfigError) -> Self {
        ActivationError::Config(e.to_string())
    }
}

impl ActivationError {
    /// Status the local agent parks in after this failure.
    fn status(&self) -> ActivationStatus {
        match self {
            ActivationError::InputTooNew { .. } => ActivationStatus::InputTooNew,
            _ => ActivationStatus::NotCapable,
        }
    }
}

/// What the agent needs from the configuration.
#[derive(Clone, Default)]
pub struct AgentSettings {
    /// Present when this process runs a fundamentalnode itself.
    pub operational_key: Option<SecretKey>,
    /// Externally visible address; the transport's guess is used when unset.
    pub service_addr: Option<SocketAddr>,
    /// Entries for remote start/stop and votes.
    pub entries: Vec<FundamentalnodeEntry>,
}

impl AgentSettings {
    pub fn from_config(config: &FundamentalnodeConfig) -> Result<Self, ConfigError> {
        let operational_key = if config.node.fundamentalnode {
            config.operational_key()?
        } else {
            None
        };
        Ok(AgentSettings {
            operational_key,
            service_addr: config.service_addr()?,
            entries: config.entries.clone(),
        })
    }
}

struct AgentState {
    status: ActivationStatus,
    not_capable_reason: String,
    vin: Option<OutPoint>,
    service: Option<SocketAddr>,
}

/// Self-registration state machine of the local node.
pub struct ActivationAgent {
    registry: Arc<Registry>,
    chain: Arc<dyn ChainView>,
    wallet: Arc<dyn WalletView>,
    peers: Arc<dyn PeerSet>,
    prober: Arc<dyn Prober>,
    params: NetworkParams,
    timing: TimingConfig,
    settings: AgentSettings,
    state: Mutex<AgentState>,
}

impl ActivationAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        chain: Arc<dyn ChainView>,
        wallet: Arc<dyn WalletView>,
        peers: Arc<dyn PeerSet>,
        prober: Arc<dyn Prober>,
        params: NetworkParams,
        timing: TimingConfig,
        settings: AgentSettings,
    ) -> Self {
        ActivationAgent {
            registry,
            chain,
            wallet,
            peers,
            prober,
            params,
            timing,
            settings,
            state: Mutex::new(AgentState {
                status: ActivationStatus::NotProcessed,
                not_capable_reason: String::new(),
                vin: None,
                service: None,
            }),
        }
    }

    pub fn status(&self) -> ActivationStatus {
        self.state.lock().status
    }

    pub fn not_capable_reason(&self) -> String {
        self.state.lock().not_capable_reason.clone()
    }

    /// Collateral of the local node once activated.
    pub fn vin(&self) -> Option<OutPoint> {
        self.state.lock().vin
    }

    /// Whether this process runs a fundamentalnode.
    pub fn is_enabled(&self) -> bool {
        self.settings.operational_key.is_some()
    }

    pub fn entries(&self) -> &[FundamentalnodeEntry] {
        &self.settings.entries
    }

    /// The operational key, when this process runs a fundamentalnode.
    pub fn operational_key(&self) -> Option<&SecretKey> {
        self.settings.operational_key.as_ref()
    }

    fn signing_key(&self) -> Result<&SecretKey, ActivationError> {
        self.settings
            .operational_key
            .as_ref()
            .ok_or(ActivationError::NoOperationalKey)
    }

    fn set_status(&self, status: ActivationStatus, reason: String) {
        let mut state = self.state.lock();
        state.status = status;
        state.not_capable_reason = reason;
    }

    /// Periodic step: activate when not yet processed, ping when running.
    pub fn manage_status(&self) -> ActivationStatus {
        if !self.is_enabled() {
            return self.status();
        }
        if self.chain.is_initial_block_download() {
            self.set_status(ActivationStatus::SyncInProcess, String::new());
            tracing::info!("Sync in progress; waiting before starting fundamentalnode");
            return ActivationStatus::SyncInProcess;
        }

        let status = {
            let mut state = self.state.lock();
            if matches!(
                state.status,
                ActivationStatus::InputTooNew | ActivationStatus::NotCapable | ActivationStatus::SyncInProcess
            ) {
                state.status = ActivationStatus::NotProcessed;
            }
            state.status
        };

        match status {
            ActivationStatus::NotProcessed => match self.try_activate() {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(reason = %e, "Fundamentalnode not capable");
                    let status = e.status();
                    self.set_status(status, e.to_string());
                    status
                }
            },
            s if s.is_running() => {
                if let Err(e) = self.ping() {
                    tracing::warn!(reason = %e, "Fundamentalnode ping failed");
                }
                self.status()
            }
            s => s,
        }
    }

    /// Validate the address, wallet and collateral, then register.
    pub fn try_activate(&self) -> Result<ActivationStatus, ActivationError> {
        let service = self
            .settings
            .service_addr
            .or_else(|| self.peers.local_address())
            .ok_or(ActivationError::NoExternalAddress)?;
        if service.port() != self.params.fundamentalnode_port {
            return Err(ActivationError::InvalidPort {
                port: service.port(),
                expected: self.params.fundamentalnode_port,
            });
        }
        tracing::info!(addr = %service, "Checking inbound connection");
        if !self.prober.probe(service, self.timing.probe_timeout()) {
            return Err(ActivationError::Unreachable(service));
        }
        if self.wallet.is_locked() {
            return Err(ActivationError::WalletLocked);
        }

        let (vin, collateral_key) = self.select_collateral(None)?;
        let confirmations = self.chain.confirmations(&vin).unwrap_or(0);
        if confirmations < self.params.min_confirmations {
            return Err(ActivationError::InputTooNew {
                required: self.params.min_confirmations,
                actual: confirmations,
            });
        }

        tracing::info!(vin = %vin.short(), "Fundamentalnode is capable");
        {
            let mut state = self.state.lock();
            state.status = ActivationStatus::IsCapable;
            state.not_capable_reason.clear();
            state.vin = Some(vin);
            state.service = Some(service);
        }
        self.wallet.lock_output(&vin);

        let service_key = self.signing_key()?.public_key()?;
        // donations are only configurable for remote entries
        if let Err(e) = self.register(vin, service, &collateral_key, service_key, Script::default(), 0) {
            tracing::warn!(reason = %e, "Fundamentalnode registration failed");
        }
        Ok(ActivationStatus::IsCapable)
    }

    /// First wallet output of exactly the collateral amount, or the one at
    /// `wanted`, with the key controlling it.
    fn select_collateral(&self, wanted: Option<OutPoint>) -> Result<(OutPoint, PublicKey), ActivationError> {
        let candidates = self.wallet.candidate_outputs(self.params.collateral_amount);
        let output = match wanted {
            Some(vin) => candidates
                .into_iter()
                .find(|o| o.outpoint == vin)
                .ok_or(ActivationError::CollateralNotFound(vin))?,
            None => candidates
                .into_iter()
                .next()
                .ok_or(ActivationError::NoCollateral)?,
        };
        let key = self
            .wallet
            .public_key_for(&output.script)
            .ok_or(ActivationError::NoCollateral)?;
        Ok((output.outpoint, key))
    }

    /// Sign an announce with the collateral key, list it locally and flood it.
    pub fn register(
        &self,
        vin: OutPoint,
        addr: SocketAddr,
        collateral_key: &PublicKey,
        service_key: PublicKey,
        donation_script: Script,
        donation_percent: u8,
    ) -> Result<Announce, ActivationError> {
        let now = self.chain.adjusted_time();
        let mut announce = Announce {
            vin,
            addr,
            signature: Default::default(),
            sig_time: now,
            collateral_key: collateral_key.clone(),
            service_key,
            count: UNSOLICITED_MARKER,
            current: UNSOLICITED_MARKER,
            last_seen: now,
            protocol_version: self.params.protocol_version,
            donation_script,
            donation_percent: i32::from(donation_percent),
        };
        let payload = announce.signed_payload();
        announce.signature = self
            .wallet
            .sign_with_key(collateral_key, &payload)
            .ok_or(ActivationError::WalletSigning)?;
        if !collateral_key.verify(&payload, &announce.signature) {
            return Err(ActivationError::VerifyFailed);
        }

        if !self.registry.contains(&vin) {
            tracing::info!(vin = %vin.short(), %addr, "Adding own fundamentalnode to list");
            let mut record = NodeRecord::new(
                announce.identity(),
                announce.signature.clone(),
                now,
                announce.donation_script.clone(),
                donation_percent,
            );
            record.update_last_seen(now);
            self.registry.add(record);
        }
        self.peers.broadcast(&Message::Announce(announce.clone()));
        Ok(announce)
    }

    /// Ping for the local node.
    pub fn ping(&self) -> Result<Ping, ActivationError> {
        let (status, vin, service) = {
            let state = self.state.lock();
            (state.status, state.vin, state.service)
        };
        let (Some(vin), Some(service)) = (vin, service) else {
            return Err(ActivationError::NotRunning);
        };
        if !status.is_running() {
            return Err(ActivationError::NotRunning);
        }
        let key = self.signing_key()?;
        match self.send_ping(vin, service, key, false) {
            Err(e @ ActivationError::NotListed(_)) => {
                self.set_status(ActivationStatus::NotCapable, e.to_string());
                Err(e)
            }
            other => other,
        }
    }

    /// Sign and flood a ping for any node. A stop ping drops the local record.
    pub fn send_ping(
        &self,
        vin: OutPoint,
        addr: SocketAddr,
        key: &SecretKey,
        stop: bool,
    ) -> Result<Ping, ActivationError> {
        let now = self.chain.adjusted_time();
        let payload = Ping::signed_payload(&addr, now, stop);
        let signature = key.sign(&payload)?;
        if !key.public_key()?.verify(&payload, &signature) {
            return Err(ActivationError::VerifyFailed);
        }

        if !self.registry.contains(&vin) {
            return Err(ActivationError::NotListed(vin));
        }
        if stop {
            self.registry.remove(&vin);
        } else {
            self.registry.update(&vin, |r| {
                r.update_last_seen(now);
                r.last_ping = now;
            });
        }

        tracing::debug!(vin = %vin.short(), stop, "Relaying fundamentalnode ping");
        let ping = Ping {
            vin,
            signature,
            sig_time: now,
            stop,
        };
        self.peers.broadcast(&Message::Ping(ping.clone()));
        Ok(ping)
    }

    /// Retire the local node: unlock its collateral and flood a stop ping.
    pub fn stop(&self) -> Result<(), ActivationError> {
        let (vin, service) = {
            let mut state = self.state.lock();
            if !state.status.is_running() {
                return Err(ActivationError::NotRunning);
            }
            state.status = ActivationStatus::Stopped;
            (state.vin, state.service)
        };
        let (Some(vin), Some(service)) = (vin, service) else {
            return Err(ActivationError::NotRunning);
        };
        let key = self.signing_key()?;
        self.wallet.unlock_output(&vin);
        self.send_ping(vin, service, key, true)?;
        tracing::info!(vin = %vin.short(), "Fundamentalnode stopped");
        Ok(())
    }

    /// Promote to remotely enabled when a fresh announce carries our
    /// operational key.
    pub fn enable_hot_cold(&self, service_key: &PublicKey, vin: OutPoint, addr: SocketAddr) -> bool {
        let Ok(ours) = self.signing_key().and_then(|k| Ok(k.public_key()?)) else {
            return false;
        };
        if &ours != service_key {
            return false;
        }
        let mut state = self.state.lock();
        state.status = ActivationStatus::RemotelyEnabled;
        state.not_capable_reason.clear();
        state.vin = Some(vin);
        state.service = Some(addr);
        tracing::info!(vin = %vin.short(), %addr, "Enabled! You may shut down the cold daemon.");
        true
    }

    /// True while the local node has no collateral yet and `service_key` is
    /// its operational key: such announces must reach the hot/cold check even
    /// when the collateral is already listed.
    pub fn awaits_remote_activation(&self, service_key: &PublicKey) -> bool {
        if self.state.lock().vin.is_some() {
            return false;
        }
        self.signing_key()
            .ok()
            .and_then(|k| k.public_key().ok())
            .is_some_and(|ours| &ours == service_key)
    }

    /// Operator start of the local node: re-run activation unless running.
    pub fn start(&self) -> String {
        {
            let mut state = self.state.lock();
            if !state.status.is_running() {
                state.status = ActivationStatus::NotProcessed;
            }
        }
        self.manage_status();
        self.status_message()
    }

    // ── Remote entries ──

    fn entry(&self, alias: &str) -> Result<&FundamentalnodeEntry, ActivationError> {
        self.settings
            .entries
            .iter()
            .find(|e| e.alias == alias)
            .ok_or_else(|| ActivationError::UnknownAlias(alias.to_string()))
    }

    /// Register a configured entry with the wallet's collateral key.
    pub fn start_alias(&self, alias: &str) -> Result<Announce, ActivationError> {
        let entry = self.entry(alias)?;
        entry.check_port(&self.params)?;
        let addr = entry.socket_addr()?;
        let service_key = entry.secret_key()?.public_key()?;
        let (donation_script, donation_percent) = entry.donation()?;
        if self.wallet.is_locked() {
            return Err(ActivationError::WalletLocked);
        }
        let (vin, collateral_key) = self.select_collateral(Some(entry.outpoint()?))?;
        self.register(vin, addr, &collateral_key, service_key, donation_script, donation_percent)
    }

    /// Start every configured entry.
    pub fn start_many(&self) -> Vec<(String, Result<Announce, ActivationError>)> {
        self.settings
            .entries
            .iter()
            .map(|e| (e.alias.clone(), self.start_alias(&e.alias)))
            .collect()
    }

    /// Stop a configured entry with its operational key.
    pub fn stop_alias(&self, alias: &str) -> Result<Ping, ActivationError> {
        let entry = self.entry(alias)?;
        let key = entry.secret_key()?;
        let vin = entry.outpoint()?;
        self.wallet.unlock_output(&vin);
        self.send_ping(vin, entry.socket_addr()?, &key, true)
    }

    pub fn stop_many(&self) -> Vec<(String, Result<Ping, ActivationError>)> {
        self.settings
            .entries
            .iter()
            .map(|e| (e.alias.clone(), self.stop_alias(&e.alias)))
            .collect()
    }

    // ── Votes ──

    fn signed_vote(key: &SecretKey, vin: OutPoint, value: i32) -> Result<Vote, ActivationError> {
        if value != 1 && value != -1 {
            return Err(ActivationError::InvalidVote(value));
        }
        let payload = Vote::signed_payload(&vin, value);
        let signature = key.sign(&payload)?;
        if !key.public_key()?.verify(&payload, &signature) {
            return Err(ActivationError::VerifyFailed);
        }
        Ok(Vote { vin, signature, value })
    }

    /// Vote with the local node.
    pub fn vote(&self, value: i32) -> Result<Vote, ActivationError> {
        let vin = self.vin().ok_or(ActivationError::NotRunning)?;
        let vote = Self::signed_vote(self.signing_key()?, vin, value)?;
        self.peers.broadcast(&Message::Vote(vote.clone()));
        Ok(vote)
    }

    /// Vote with every configured entry that is listed. Returns the number
    /// of successful and failed votes.
    pub fn vote_many(&self, value: i32) -> (usize, usize) {
        let mut success = 0;
        let mut failed = 0;
        for entry in &self.settings.entries {
            let result = entry
                .secret_key()
                .map_err(ActivationError::from)
                .and_then(|key| {
                    let pk = key.public_key()?;
                    let record = self
                        .registry
                        .find_by_service_key(&pk)
                        .ok_or_else(|| ActivationError::UnknownServiceKey(entry.alias.clone()))?;
                    Self::signed_vote(&key, *record.vin(), value)
                });
            match result {
                Ok(vote) => {
                    self.peers.broadcast(&Message::Vote(vote));
                    success += 1;
                }
                Err(e) => {
                    tracing::warn!(alias = %entry.alias, reason = %e, "Vote failed");
                    failed += 1;
                }
            }
        }
        (success, failed)
    }

    /// Human-readable status of the local node.
    pub fn status_message(&self) -> String {
        let state = self.state.lock();
        match state.status {
            ActivationStatus::NotProcessed => "fundamentalnode not yet processed".into(),
            ActivationStatus::IsCapable => "successfully started fundamentalnode".into(),
            ActivationStatus::RemotelyEnabled => "fundamentalnode started remotely".into(),
            ActivationStatus::InputTooNew => format!(
                "fundamentalnode input must have at least {} confirmations",
                self.params.min_confirmations
            ),
            ActivationStatus::Stopped => "fundamentalnode is stopped".into(),
            ActivationStatus::NotCapable => {
                format!("not capable fundamentalnode: {}", state.not_capable_reason)
            }
            ActivationStatus::SyncInProcess => {
                "sync in process. Must wait until client is synced to start.".into()
            }
        }
    }
}
