//! Interactive protocol demonstration.
//!
//! Three fundamentalnodes share one in-memory chain and talk through
//! recording transports: they register, converge on one directory, agree on
//! a payment winner, scan each other and persist the result.

use std::path::PathBuf;
use std::sync::Arc;

use crate::chain::memory::{MemoryChain, MemoryWallet, RecordingPeers, StaticProber};
use crate::chain::{OutPoint, PeerInfo, WalletOutput};
use crate::config::{FundamentalnodeConfig, Network};
use crate::constants::{COLLATERAL_AMOUNT, PROTOCOL_VERSION};
use crate::crypto::keys::SecretKey;
use crate::node::{Collaborators, Services};
use crate::registry::{LivenessPolicy, Registry};
use crate::storage::PersistentStore;

const NOW: i64 = 1_700_000_000;
const TIP: u64 = 200;
const NODES: usize = 3;

struct DemoNode {
    info: PeerInfo,
    peers: Arc<RecordingPeers>,
    services: Services,
    data_dir: PathBuf,
}

/// Deliver queued messages until every transport is quiet. Returns the
/// number of deliveries.
fn route(nodes: &[DemoNode]) -> usize {
    let mut delivered = 0;
    loop {
        let mut quiet = true;
        for sender in nodes {
            for (to, message) in sender.peers.take_sent() {
                quiet = false;
                if let Some(receiver) = nodes.iter().find(|n| n.info.id == to) {
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

fn build_nodes(
    chain: &Arc<MemoryChain>,
    prober: &Arc<StaticProber>,
    authority: &SecretKey,
) -> Result<Vec<DemoNode>, Box<dyn std::error::Error>> {
    let port = Network::Regtest.params().fundamentalnode_port;
    let infos: Vec<PeerInfo> = (0..NODES)
        .map(|i| PeerInfo {
            id: i as u64 + 1,
            addr: std::net::SocketAddr::from(([8, 8, 8, i as u8 + 1], port)),
            version: PROTOCOL_VERSION,
        })
        .collect();

    let mut nodes = Vec::with_capacity(NODES);
    for (i, info) in infos.iter().enumerate() {
        let wallet = Arc::new(MemoryWallet::default());
        let collateral = wallet
            .add_key(SecretKey::generate())
            .ok_or("wallet rejected key")?;
        let vin = OutPoint::new(crate::sha256d(&[i as u8]), 0);
        let script = collateral.p2pkh_script();
        chain.add_output(vin, COLLATERAL_AMOUNT, script.clone(), 40 + 10 * i as u64);
        wallet.add_output(WalletOutput {
            outpoint: vin,
            value: COLLATERAL_AMOUNT,
            script,
        });

        let peers = Arc::new(RecordingPeers::default());
        for other in infos.iter().filter(|o| o.id != info.id) {
            peers.connect(other.clone());
        }

        let data_dir = std::env::temp_dir().join(format!(
            "fundamentalnode-demo-{}-{}",
            std::process::id(),
            info.id
        ));
        let mut config = FundamentalnodeConfig::default();
        config.node.network = Network::Regtest;
        config.node.data_dir = data_dir.display().to_string();
        config.node.fundamentalnode = true;
        config.node.service_addr = Some(info.addr.to_string());
        config.node.operational_key = Some(SecretKey::generate().to_hex());
        config.node.authority_pubkey = Some(hex::encode(authority.public_key()?.as_bytes()));
        if i == 0 {
            config.node.payments_key = Some(authority.to_hex());
        }

        let services = Services::new(
            &config,
            Collaborators {
                chain: chain.clone(),
                wallet,
                peers: peers.clone(),
                prober: prober.clone(),
            },
        )?;
        nodes.push(DemoNode {
            info: info.clone(),
            peers,
            services,
            data_dir,
        });
    }
    Ok(nodes)
}

/// Run the protocol demonstration.
pub fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== FUNDAMENTALNODE: collateral-backed service tier ===\n");

    let chain = Arc::new(MemoryChain::with_height(TIP, NOW));
    let prober = Arc::new(StaticProber::default());
    let authority = SecretKey::generate();
    let nodes = build_nodes(&chain, &prober, &authority)?;

    // ────────────────────────────────────────────────────────
    // 1. REGISTRATION
    // ────────────────────────────────────────────────────────
    println!("[1] Activating {NODES} fundamentalnodes at height {TIP}...");
    for node in &nodes {
        let status = node.services.agent.manage_status();
        println!(
            "    {} -> {:?} (vin {})",
            node.info.addr,
            status,
            node.services.agent.vin().map(|v| v.short()).unwrap_or_default()
        );
    }
    let delivered = route(&nodes);
    println!("    Gossip settled after {delivered} deliveries");
    for node in &nodes {
        println!(
            "    {} lists {} nodes",
            node.info.addr,
            node.services.registry.len()
        );
    }

    // ────────────────────────────────────────────────────────
    // 2. PAYMENT CONSENSUS
    // ────────────────────────────────────────────────────────
    let pay_height = TIP + crate::constants::WINNER_LEAD_BLOCKS;
    println!("\n[2] Authority node elects the payee for height {pay_height}...");
    let mut probes = Vec::new();
    for node in &nodes {
        if let Some(assignment) = node.services.on_new_block(TIP) {
            probes.push((node, assignment));
        }
    }
    route(&nodes);
    for node in &nodes {
        match node.services.payments.block_payee(pay_height) {
            Some(payee) => println!("    {} pays {}", node.info.addr, payee),
            None => println!("    {} has no winner", node.info.addr),
        }
    }

    // ────────────────────────────────────────────────────────
    // 3. PROOF-OF-SERVICE SCANNING
    // ────────────────────────────────────────────────────────
    println!("\n[3] Scanning (quota {} checker per height)...", nodes[0].services.monitor.quota());
    for (checker, assignment) in &probes {
        prober.set_down(assignment.addr, true);
        println!(
            "    {} probes {} at {} (taken offline)",
            checker.info.addr,
            assignment.target.short(),
            assignment.addr
        );
        checker.services.run_probe(assignment);
    }
    route(&nodes);
    for (_, assignment) in &probes {
        for node in &nodes {
            let errors = node
                .services
                .registry
                .find(&assignment.target)
                .map(|r| r.scanning_errors)
                .unwrap_or_default();
            println!(
                "    {} counts {} error(s) for {}",
                node.info.addr,
                errors,
                assignment.target.short()
            );
        }
    }

    // ────────────────────────────────────────────────────────
    // 4. PERSISTENCE
    // ────────────────────────────────────────────────────────
    println!("\n[4] Dumping and reloading the directory cache...");
    let node = &nodes[1];
    node.services.shutdown();
    let restored = Registry::new(LivenessPolicy::default());
    let store = PersistentStore::new(
        node.services.store.path().to_path_buf(),
        Network::Regtest.params().magic,
    );
    let loaded = store.load(&restored, chain.as_ref());
    println!(
        "    {} -> loaded: {loaded}, {} nodes restored",
        store.path().display(),
        restored.len()
    );

    for node in &nodes {
        let _ = std::fs::remove_dir_all(&node.data_dir);
    }
    println!("\n=== Demo complete ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_converge_on_directory_and_winner() {
        let chain = Arc::new(MemoryChain::with_height(TIP, NOW));
        let prober = Arc::new(StaticProber::default());
        let authority = SecretKey::generate();
        let nodes = build_nodes(&chain, &prober, &authority).unwrap();

        for node in &nodes {
            assert!(node.services.agent.manage_status().is_running());
        }
        route(&nodes);
        assert!(nodes.iter().all(|n| n.services.registry.len() == NODES));

        let checkers: Vec<_> = nodes
            .iter()
            .filter_map(|n| n.services.on_new_block(TIP))
            .collect();
        route(&nodes);
        let height = TIP + crate::constants::WINNER_LEAD_BLOCKS;
        let payee = nodes[0].services.payments.block_payee(height).unwrap();
        assert!(nodes
            .iter()
            .all(|n| n.services.payments.block_payee(height) == Some(payee.clone())));
        assert_eq!(checkers.len(), 1);
    }
}
