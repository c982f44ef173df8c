//! Multi-node scenarios driven through the public [`Services`] API.
//!
//! Every node owns its own directory, payment store and scanning state and
//! shares one in-memory chain. Messages travel only through the recording
//! transports, delivered by [`Cluster::route`], so these tests exercise the
//! same dispatch path a real transport would.
//!
//! Scenarios covered:
//! - **Registration**: activation floods announces; every directory converges
//! - **Resync**: a late joiner rebuilds the directory and winners from peers
//! - **Liveness**: pings keep a node listed several hops away
//! - **Payments**: all nodes store the authority's winner for a height
//! - **Proof-of-service**: an unreachable node is evicted everywhere
//! - **Persistence**: a restarted node restores its directory from the cache
//! - **Hostile input**: forged announces are penalized and never applied

use std::net::SocketAddr;
use std::sync::Arc;

use fundamentalnode::chain::memory::{MemoryChain, MemoryWallet, RecordingPeers, StaticProber};
use fundamentalnode::chain::{OutPoint, PeerInfo, WalletOutput};
use fundamentalnode::config::{FundamentalnodeConfig, Network};
use fundamentalnode::constants::{
    COLLATERAL_AMOUNT, PENALTY_INVALID, PROTOCOL_VERSION, WINNER_LEAD_BLOCKS,
};
use fundamentalnode::crypto::keys::SecretKey;
use fundamentalnode::network::{Announce, Message};
use fundamentalnode::node::{Collaborators, Services};
use fundamentalnode::registry::NodeState;

const NOW: i64 = 1_700_000_000;
const TIP: u64 = 200;

// ── Helpers ─────────────────────────────────────────────────────────────

struct TestNode {
    info: PeerInfo,
    peers: Arc<RecordingPeers>,
    services: Services,
    config: FundamentalnodeConfig,
    wallet: Arc<MemoryWallet>,
    _dir: tempfile::TempDir,
}

struct Cluster {
    chain: Arc<MemoryChain>,
    prober: Arc<StaticProber>,
    authority: SecretKey,
    nodes: Vec<TestNode>,
}

fn addr(id: u64) -> SocketAddr {
    let port = Network::Regtest.params().fundamentalnode_port;
    SocketAddr::from(([8, 8, 8, id as u8], port))
}

fn peer(id: u64) -> PeerInfo {
    PeerInfo {
        id,
        addr: addr(id),
        version: PROTOCOL_VERSION,
    }
}

impl Cluster {
    /// `count` fundamentalnodes, fully meshed, node 1 holding the payments key.
    fn new(count: u64) -> Self {
        let mut cluster = Cluster {
            chain: Arc::new(MemoryChain::with_height(TIP, NOW)),
            prober: Arc::new(StaticProber::default()),
            authority: SecretKey::generate(),
            nodes: Vec::new(),
        };
        for id in 1..=count {
            cluster.join(id, true, (1..=count).filter(|&p| p != id));
        }
        cluster
    }

    /// `count` fundamentalnodes in a line, each connected only to its
    /// neighbours.
    fn line(count: u64) -> Self {
        let mut cluster = Cluster {
            chain: Arc::new(MemoryChain::with_height(TIP, NOW)),
            prober: Arc::new(StaticProber::default()),
            authority: SecretKey::generate(),
            nodes: Vec::new(),
        };
        for id in 1..=count {
            let neighbours = [id.checked_sub(1), Some(id + 1)];
            cluster.join(
                id,
                true,
                neighbours.into_iter().flatten().filter(|&p| p >= 1 && p <= count),
            );
        }
        cluster
    }

    fn join(&mut self, id: u64, fundamentalnode: bool, peers: impl Iterator<Item = u64>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FundamentalnodeConfig::default();
        config.node.network = Network::Regtest;
        config.node.data_dir = dir.path().display().to_string();
        config.node.authority_pubkey =
            Some(hex::encode(self.authority.public_key().unwrap().as_bytes()));
        if id == 1 {
            config.node.payments_key = Some(self.authority.to_hex());
        }

        let wallet = Arc::new(MemoryWallet::default());
        if fundamentalnode {
            config.node.fundamentalnode = true;
            config.node.service_addr = Some(addr(id).to_string());
            config.node.operational_key = Some(SecretKey::generate().to_hex());
            fund(&self.chain, &wallet, id, 30 + 10 * id);
        }

        let transport = Arc::new(RecordingPeers::default());
        for p in peers {
            transport.connect(peer(p));
        }
        let services = Services::new(
            &config,
            Collaborators {
                chain: self.chain.clone(),
                wallet: wallet.clone(),
                peers: transport.clone(),
                prober: self.prober.clone(),
            },
        )
        .unwrap();
        self.nodes.push(TestNode {
            info: peer(id),
            peers: transport,
            services,
            config,
            wallet,
            _dir: dir,
        });
    }

    fn node(&self, id: u64) -> &TestNode {
        self.nodes.iter().find(|n| n.info.id == id).unwrap()
    }

    /// Deliver queued messages until every transport is quiet.
    fn route(&self) -> usize {
        let mut delivered = 0;
        loop {
            let mut quiet = true;
            for sender in &self.nodes {
                for (to, message) in sender.peers.take_sent() {
                    quiet = false;
                    if let Some(receiver) = self.nodes.iter().find(|n| n.info.id == to) {
                        receiver.services.on_message(&sender.info, message);
                        delivered += 1;
                    }
                }
            }
            if quiet {
                return delivered;
            }
        }
    }

    fn activate_all(&self) {
        for node in &self.nodes {
            assert!(node.services.agent.manage_status().is_running());
        }
        self.route();
    }

    /// Announce a new block to every node and run the probes it assigns.
    fn new_block(&self, height: u64) -> usize {
        let mut probes = 0;
        for node in &self.nodes {
            if let Some(assignment) = node.services.on_new_block(height) {
                node.services.run_probe(&assignment);
                probes += 1;
            }
        }
        self.route();
        probes
    }
}

/// Give `wallet` a collateral output confirmed at `height`.
fn fund(chain: &MemoryChain, wallet: &MemoryWallet, seed: u64, height: u64) -> OutPoint {
    let key = wallet.add_key(SecretKey::generate()).unwrap();
    let vin = OutPoint::new(fundamentalnode::sha256d(&seed.to_le_bytes()), 0);
    let script = key.p2pkh_script();
    chain.add_output(vin, COLLATERAL_AMOUNT, script.clone(), height);
    wallet.add_output(WalletOutput {
        outpoint: vin,
        value: COLLATERAL_AMOUNT,
        script,
    });
    vin
}

// ── Registration and resync ─────────────────────────────────────────────

#[test]
fn test_directories_converge_after_activation() {
    let cluster = Cluster::new(4);
    cluster.activate_all();

    let expected: Vec<OutPoint> = cluster
        .nodes
        .iter()
        .map(|n| n.services.agent.vin().unwrap())
        .collect();
    for node in &cluster.nodes {
        assert_eq!(node.services.registry.len(), 4);
        for vin in &expected {
            let record = node.services.registry.find(vin).unwrap();
            assert_eq!(record.state, NodeState::Enabled);
        }
        for other in &cluster.nodes {
            assert_eq!(node.peers.penalty_for(other.info.id), 0);
        }
    }
    // collateral stays locked in the owning wallet
    for node in &cluster.nodes {
        assert!(node.wallet.is_output_locked(&node.services.agent.vin().unwrap()));
    }
}

#[test]
fn test_late_joiner_resyncs_directory_and_winners() {
    let mut cluster = Cluster::new(3);
    cluster.activate_all();
    cluster.new_block(TIP);

    cluster.join(9, false, 1..=3);
    let late = cluster.node(9);
    assert!(late.services.registry.is_empty());
    assert_eq!(late.services.gossip.request_sync(), 3);
    assert!(late.services.gossip.sync_requested());
    cluster.route();

    let late = cluster.node(9);
    assert_eq!(late.services.registry.len(), 3);
    let height = TIP + WINNER_LEAD_BLOCKS;
    assert_eq!(
        late.services.payments.block_payee(height),
        cluster.node(1).services.payments.block_payee(height)
    );
    // enough peers were asked already
    assert_eq!(late.services.gossip.request_sync(), 0);
}

// ── Liveness ────────────────────────────────────────────────────────────

#[test]
fn test_pings_keep_distant_nodes_enabled() {
    let cluster = Cluster::line(3);
    cluster.activate_all();
    let first = cluster.node(1).services.agent.vin().unwrap();
    let far = &cluster.node(3).services;
    assert!(far.registry.find(&first).unwrap().is_enabled());

    let policy = cluster.node(1).config.timing.liveness_policy();
    let ping_every = cluster.node(1).config.timing.ping_seconds;
    let mut elapsed = 0;
    while elapsed <= policy.removal_secs {
        cluster.chain.advance_time(ping_every);
        elapsed += ping_every;
        for node in &cluster.nodes {
            node.services.agent.manage_status();
        }
        cluster.route();
        for node in &cluster.nodes {
            node.services.registry.check_and_remove(cluster.chain.as_ref());
        }
    }

    assert!(elapsed > policy.expiration_secs);
    let record = far.registry.find(&first).unwrap();
    assert_eq!(record.state, NodeState::Enabled);
    assert!(NOW + elapsed - record.last_seen < policy.expiration_secs);
    for node in &cluster.nodes {
        assert_eq!(node.services.registry.len(), 3);
    }
}

// ── Payments ────────────────────────────────────────────────────────────

#[test]
fn test_every_node_stores_the_authority_winner() {
    let cluster = Cluster::new(3);
    cluster.activate_all();

    for height in TIP..TIP + 5 {
        if height > TIP {
            cluster.chain.mine();
        }
        cluster.new_block(height);
        let target = height + WINNER_LEAD_BLOCKS;
        let authority = cluster.node(1).services.payments.winner(target).unwrap();
        for node in &cluster.nodes {
            assert_eq!(node.services.payments.winner(target), Some(authority.clone()));
        }
    }
    assert_eq!(
        cluster.node(1).services.payments.last_processed_height(),
        Some(TIP + 4 + WINNER_LEAD_BLOCKS)
    );
}

#[test]
fn test_recent_payees_are_not_paid_twice_in_a_row() {
    let cluster = Cluster::new(3);
    cluster.activate_all();

    let mut paid = Vec::new();
    for height in TIP..TIP + 3 {
        if height > TIP {
            cluster.chain.mine();
        }
        cluster.new_block(height);
        let winner = cluster
            .node(1)
            .services
            .payments
            .winner(height + WINNER_LEAD_BLOCKS)
            .unwrap();
        assert!(!paid.contains(&winner.vin), "paid twice within one rotation");
        paid.push(winner.vin);
    }
}

// ── Proof-of-service ────────────────────────────────────────────────────

#[test]
fn test_unreachable_node_is_evicted_everywhere() {
    let cluster = Cluster::new(3);
    cluster.activate_all();
    let victim = cluster.node(3);
    let victim_vin = victim.services.agent.vin().unwrap();
    cluster.prober.set_down(victim.info.addr, true);

    let mut height = TIP;
    cluster.new_block(height);
    while cluster
        .nodes
        .iter()
        .any(|n| n.services.registry.find(&victim_vin).unwrap().state != NodeState::PosError)
    {
        assert!(height < TIP + 300, "victim never evicted");
        height = cluster.chain.mine();
        cluster.new_block(height);
    }

    for node in &cluster.nodes {
        let record = node.services.registry.find(&victim_vin).unwrap();
        assert!(record.scanning_errors >= 6);
        assert!(record.scanning_errors <= 12);
        let eligible = node.services.registry.eligible(cluster.chain.as_ref(), 0, true);
        assert!(eligible.iter().all(|r| r.vin() != &victim_vin));
    }
}

#[test]
fn test_exactly_one_checker_per_height() {
    let cluster = Cluster::new(3);
    cluster.activate_all();
    assert_eq!(cluster.new_block(TIP), 1);
    for _ in 0..5 {
        let height = cluster.chain.mine();
        assert_eq!(cluster.new_block(height), 1);
    }
}

// ── Persistence ─────────────────────────────────────────────────────────

#[test]
fn test_restarted_node_restores_directory() {
    let cluster = Cluster::new(3);
    cluster.activate_all();
    let node = cluster.node(2);
    assert!(node.services.shutdown());

    let restarted = Services::new(
        &node.config,
        Collaborators {
            chain: cluster.chain.clone(),
            wallet: Arc::new(MemoryWallet::default()),
            peers: Arc::new(RecordingPeers::default()),
            prober: cluster.prober.clone(),
        },
    )
    .unwrap();
    assert!(restarted.load());
    assert_eq!(restarted.registry.len(), 3);
    assert_eq!(
        restarted.registry.find(&node.services.agent.vin().unwrap()),
        node.services.registry.find(&node.services.agent.vin().unwrap())
    );
}

#[test]
fn test_corrupt_cache_starts_empty() {
    let cluster = Cluster::new(2);
    cluster.activate_all();
    let node = cluster.node(1);
    assert!(node.services.shutdown());

    let path = node.services.store.path().to_path_buf();
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let restarted = Services::new(
        &node.config,
        Collaborators {
            chain: cluster.chain.clone(),
            wallet: Arc::new(MemoryWallet::default()),
            peers: Arc::new(RecordingPeers::default()),
            prober: cluster.prober.clone(),
        },
    )
    .unwrap();
    assert!(!restarted.load());
    assert!(restarted.registry.is_empty());
}

// ── Hostile input ───────────────────────────────────────────────────────

#[test]
fn test_forged_announce_is_penalized_and_dropped() {
    let cluster = Cluster::new(2);
    cluster.activate_all();
    let honest = cluster.node(1);
    let record = honest
        .services
        .registry
        .find(&honest.services.agent.vin().unwrap())
        .unwrap();

    let mut forged = Announce::from_record(&record, -1, 0);
    forged.vin = OutPoint::new([0xee; 32], 0);
    forged.sig_time += 1;

    let target = cluster.node(2);
    target
        .services
        .on_message(&peer(7), Message::Announce(forged.clone()));
    assert_eq!(target.peers.penalty_for(7), PENALTY_INVALID);
    assert!(target.services.registry.find(&forged.vin).is_none());
    assert_eq!(target.services.registry.len(), 2);
}

#[test]
fn test_syncing_node_ignores_gossip() {
    let cluster = Cluster::new(2);
    cluster.activate_all();
    let record = cluster
        .node(1)
        .services
        .registry
        .find(&cluster.node(1).services.agent.vin().unwrap())
        .unwrap();

    cluster.chain.set_initial_download(true);
    let target = cluster.node(2);
    target.services.registry.clear();
    target.services.on_message(
        &peer(1),
        Message::Announce(Announce::from_record(&record, 2, 0)),
    );
    assert!(target.services.registry.is_empty());
    assert_eq!(target.peers.penalty_for(1), 0);
}
