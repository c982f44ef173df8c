//! Service container and maintenance loop.
//!
//! [`Services`] owns every subsystem and wires them together explicitly;
//! nothing is reachable through globals. [`Node`] drives it: inbound gossip
//! and new-block events from the host, plus a 1 Hz ticker fanning out to
//! modulo-gated maintenance. Blocking work (connectivity probes, activation)
//! runs on the blocking pool so a slow probe never stalls a sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::activation::{ActivationAgent, AgentSettings};
use crate::chain::{ChainView, PeerInfo, PeerSet, Prober, WalletView};
use crate::config::{ConfigError, FundamentalnodeConfig, TimingConfig};
use crate::consensus::election::ElectionScorer;
use crate::consensus::payments::{PaymentConsensus, PaymentError};
use crate::consensus::scanning::{ProbeAssignment, ServiceMonitor};
use crate::constants::WINNER_LEAD_BLOCKS;
use crate::network::{GossipProtocol, Message};
use crate::registry::Registry;
use crate::storage::PersistentStore;

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("payments key rejected: {0}")]
    Payments(#[from] PaymentError),
}

/// Host-provided collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainView>,
    pub wallet: Arc<dyn WalletView>,
    pub peers: Arc<dyn PeerSet>,
    pub prober: Arc<dyn Prober>,
}

/// Every subsystem of one fundamentalnode process.
pub struct Services {
    pub registry: Arc<Registry>,
    pub scorer: Arc<ElectionScorer>,
    pub payments: Arc<PaymentConsensus>,
    pub monitor: Arc<ServiceMonitor>,
    pub agent: Arc<ActivationAgent>,
    pub gossip: Arc<GossipProtocol>,
    pub store: PersistentStore,
    chain: Arc<dyn ChainView>,
    prober: Arc<dyn Prober>,
    timing: TimingConfig,
}

fn due(second: u64, every: u64) -> bool {
    every > 0 && second % every == 0
}

impl Services {
    pub fn new(config: &FundamentalnodeConfig, host: Collaborators) -> Result<Self, NodeError> {
        let params = config.params();
        let timing = config.timing.clone();
        let registry = Arc::new(Registry::new(timing.liveness_policy()));
        let scorer = Arc::new(ElectionScorer::new(host.chain.clone()));

        let payments = Arc::new(PaymentConsensus::new(
            registry.clone(),
            scorer.clone(),
            host.chain.clone(),
            host.peers.clone(),
            config.authority_key()?,
        ));
        if let Some(key) = config.payments_key()? {
            payments.set_authority_key(key)?;
        }

        let monitor = Arc::new(ServiceMonitor::new(
            registry.clone(),
            scorer.clone(),
            host.chain.clone(),
            host.peers.clone(),
        ));
        let agent = Arc::new(ActivationAgent::new(
            registry.clone(),
            host.chain.clone(),
            host.wallet.clone(),
            host.peers.clone(),
            host.prober.clone(),
            params.clone(),
            timing.clone(),
            AgentSettings::from_config(config)?,
        ));
        let gossip = Arc::new(GossipProtocol::new(
            registry.clone(),
            host.chain.clone(),
            host.peers.clone(),
            payments.clone(),
            monitor.clone(),
            Some(agent.clone()),
            params.clone(),
            timing.clone(),
        ));
        let store = PersistentStore::in_dir(&config.data_dir(), params.magic);

        Ok(Services {
            registry,
            scorer,
            payments,
            monitor,
            agent,
            gossip,
            store,
            chain: host.chain,
            prober: host.prober,
            timing,
        })
    }

    /// Restore the directory from the cache file, if it is usable.
    pub fn load(&self) -> bool {
        self.store.load(&self.registry, self.chain.as_ref())
    }

    pub fn on_message(&self, from: &PeerInfo, message: Message) {
        self.gossip.process(from, message);
    }

    /// React to a new best block. Returns the probe the local node owes the
    /// network at this height, if any.
    pub fn on_new_block(&self, height: u64) -> Option<ProbeAssignment> {
        self.scorer.on_new_tip(height);
        if self.payments.is_authority() {
            match self.payments.process_block(height + WINNER_LEAD_BLOCKS) {
                Ok(_) | Err(PaymentError::AlreadyProcessed(_)) => {}
                Err(e) => tracing::debug!(height, reason = %e, "No payment winner this block"),
            }
        }
        if !self.agent.status().is_running() {
            return None;
        }
        let vin = self.agent.vin()?;
        self.monitor.plan(&vin)
    }

    /// Probe the assigned target and report the outcome. Blocking.
    pub fn run_probe(&self, assignment: &ProbeAssignment) {
        let Some(key) = self.agent.operational_key() else {
            return;
        };
        let reachable = self.prober.probe(assignment.addr, self.timing.probe_timeout());
        if let Err(e) = self.monitor.complete_probe(assignment, reachable, key) {
            tracing::debug!(target_vin = %assignment.target.short(), reason = %e, "Scanning report not applied");
        }
    }

    /// Non-blocking maintenance due at `second`.
    pub fn maintain(&self, second: u64) {
        if due(second, self.timing.sweep_seconds) {
            self.registry.check_and_remove(self.chain.as_ref());
            self.payments.clean();
            self.monitor.clean();
        }
        if due(second, self.timing.dump_seconds) {
            self.store.dump(&self.registry);
        }
        if due(second, self.timing.sync_poll_seconds) && !self.gossip.sync_requested() {
            self.gossip.request_sync();
        }
    }

    /// Whether the activation agent should run at `second`.
    pub fn activation_due(&self, second: u64) -> bool {
        self.agent.is_enabled()
            && due(second, u64::try_from(self.timing.ping_seconds).unwrap_or(0))
    }

    /// Final dump on shutdown.
    pub fn shutdown(&self) -> bool {
        self.store.dump(&self.registry)
    }
}

/// Events the host feeds into the node.
#[derive(Debug)]
pub enum NodeEvent {
    Message { from: PeerInfo, message: Message },
    NewBlock(u64),
}

/// The event loop.
pub struct Node {
    services: Arc<Services>,
    events: mpsc::Receiver<NodeEvent>,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(
        services: Arc<Services>,
        events: mpsc::Receiver<NodeEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Node {
            services,
            events,
            cancel,
        }
    }

    /// Run until cancelled, then dump the directory.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        let mut second: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = ticker.tick() => {
                    second += 1;
                    self.services.maintain(second);
                    if self.services.activation_due(second) {
                        let services = Arc::clone(&self.services);
                        tokio::task::spawn_blocking(move || {
                            services.agent.manage_status();
                        });
                    }
                }
            }
        }

        tracing::info!("Node shutting down");
        self.services.shutdown();
    }

    fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Message { from, message } => self.services.on_message(&from, message),
            NodeEvent::NewBlock(height) => {
                if let Some(assignment) = self.services.on_new_block(height) {
                    let services = Arc::clone(&self.services);
                    tokio::task::spawn_blocking(move || services.run_probe(&assignment));
                }
            }
        }
    }
}
