//! Configuration file support for the fundamentalnode daemon.
//!
//! Loads optional `fundamentalnode.toml` from the data directory. If no
//! config file exists, defaults are used. Remote entries can also come from
//! the one-line-per-node `fundamentalnode.conf` format.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::{OutPoint, Script};
use crate::crypto::keys::{KeyError, PublicKey, SecretKey};
use crate::registry::LivenessPolicy;

/// Name of the TOML configuration file.
pub const CONFIG_FILE_NAME: &str = "fundamentalnode.toml";
/// Name of the legacy entry file.
pub const LEGACY_ENTRIES_FILE_NAME: &str = "fundamentalnode.conf";

const MAIN_AUTHORITY_PUBKEY: &str = "04351636759f760e78bdee87ab1c966b6a22e42601c21da396a7e6a5fc33787fd6bbbcf70f1bb5b1853352decc719cf9a37b55c9c1c4c48d4c9ff6998b2416137b";
const TEST_AUTHORITY_PUBKEY: &str = "04CBC82D432A42A05F9474A5554413A6166767C928DE669C40144DC585FB85F15E28035EADE398A6B8E38C24A001EAB50023124C4D8328C99EC2FDE47ED54B17BF";

/// Errors from configuration parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("could not parse fundamentalnode entry line {line}: {text}")]
    MalformedLine { line: usize, text: String },
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("invalid port in entry {alias} (must be {expected})")]
    InvalidPort { alias: String, expected: u16 },
    #[error("invalid collateral txid {0}")]
    InvalidTxid(String),
    #[error("invalid donation {0}")]
    InvalidDonation(String),
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
}

/// Which chain the node follows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Main,
    Test,
    Regtest,
}

/// Fixed per-network parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkParams {
    pub network: Network,
    /// Message-start bytes, also stamped into the cache file.
    pub magic: [u8; 4],
    /// The only port a fundamentalnode may announce.
    pub fundamentalnode_port: u16,
    pub collateral_amount: u64,
    pub min_confirmations: u32,
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    authority_pubkey: &'static str,
}

impl Network {
    pub fn params(self) -> NetworkParams {
        let (magic, port, authority_pubkey) = match self {
            Network::Main => ([0xd1, 0x2e, 0x1e, 0xe6], 5647, MAIN_AUTHORITY_PUBKEY),
            Network::Test => ([0xcd, 0xf2, 0xc0, 0xef], 30420, TEST_AUTHORITY_PUBKEY),
            Network::Regtest => ([0xfa, 0xbf, 0xb5, 0xda], 30420, TEST_AUTHORITY_PUBKEY),
        };
        NetworkParams {
            network: self,
            magic,
            fundamentalnode_port: port,
            collateral_amount: crate::constants::COLLATERAL_AMOUNT,
            min_confirmations: crate::constants::MIN_CONFIRMATIONS,
            protocol_version: crate::constants::PROTOCOL_VERSION,
            min_protocol_version: crate::constants::MIN_PROTOCOL_VERSION,
            authority_pubkey,
        }
    }
}

impl NetworkParams {
    /// The network's payment authority key.
    pub fn authority_key(&self) -> Result<PublicKey, KeyError> {
        PublicKey::from_hex(self.authority_pubkey)
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FundamentalnodeConfig {
    pub node: NodeConfig,
    pub timing: TimingConfig,
    #[serde(rename = "fundamentalnode")]
    pub entries: Vec<FundamentalnodeEntry>,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: String,
    /// Run the activation agent for this node.
    pub fundamentalnode: bool,
    /// External `ip:port` to announce.
    pub service_addr: Option<String>,
    /// Hex secret of the operational key.
    pub operational_key: Option<String>,
    /// Hex secret of the payment authority key.
    pub payments_key: Option<String>,
    /// Hex override of the network authority public key.
    pub authority_pubkey: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: Network::Main,
            data_dir: "./fundamentalnode-data".into(),
            fundamentalnode: false,
            service_addr: None,
            operational_key: None,
            payments_key: None,
            authority_pubkey: None,
        }
    }
}

/// Protocol thresholds. All in seconds unless noted.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub min_announce_seconds: i64,
    pub min_ping_seconds: i64,
    pub ping_seconds: i64,
    pub expiration_seconds: i64,
    pub removal_seconds: i64,
    pub dump_seconds: u64,
    pub list_resync_seconds: i64,
    pub sweep_seconds: u64,
    pub sync_poll_seconds: u64,
    pub scanning_error_threshold: u32,
    pub probe_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            min_announce_seconds: 10 * 60,
            min_ping_seconds: 30 * 60,
            ping_seconds: 5 * 60,
            expiration_seconds: 65 * 60,
            removal_seconds: 70 * 60,
            dump_seconds: 15 * 60,
            list_resync_seconds: 3 * 60 * 60,
            sweep_seconds: 60,
            sync_poll_seconds: 5,
            scanning_error_threshold: 6,
            probe_timeout_ms: 5000,
        }
    }
}

impl TimingConfig {
    pub fn liveness_policy(&self) -> LivenessPolicy {
        LivenessPolicy {
            expiration_secs: self.expiration_seconds,
            removal_secs: self.removal_seconds,
            scanning_error_threshold: self.scanning_error_threshold,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// A remotely controlled fundamentalnode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundamentalnodeEntry {
    pub alias: String,
    /// `ip:port` the node announces.
    pub address: String,
    /// Hex secret of the node's operational key.
    pub operational_key: String,
    /// Hex collateral txid.
    pub txid: String,
    pub output_index: u32,
    /// Hex donation script.
    #[serde(default)]
    pub donation_script: Option<String>,
    #[serde(default)]
    pub donation_percent: Option<u8>,
}

impl FundamentalnodeEntry {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }

    pub fn outpoint(&self) -> Result<OutPoint, ConfigError> {
        let bytes = hex::decode(self.txid.trim()).map_err(|_| ConfigError::InvalidTxid(self.txid.clone()))?;
        let txid: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidTxid(self.txid.clone()))?;
        Ok(OutPoint::new(txid, self.output_index))
    }

    pub fn secret_key(&self) -> Result<SecretKey, ConfigError> {
        Ok(SecretKey::from_hex(&self.operational_key)?)
    }

    /// Donation payee and share; an empty script when none is configured.
    pub fn donation(&self) -> Result<(Script, u8), ConfigError> {
        let Some(script) = &self.donation_script else {
            return Ok((Script::default(), 0));
        };
        let script = Script::from_hex(script).map_err(|_| ConfigError::InvalidDonation(script.clone()))?;
        let percent = self.donation_percent.unwrap_or(100);
        if percent > 100 {
            return Err(ConfigError::InvalidDonation(format!("{percent}%")));
        }
        Ok((script, percent))
    }

    /// Reject entries whose port is not the network's fundamentalnode port.
    pub fn check_port(&self, params: &NetworkParams) -> Result<(), ConfigError> {
        if self.socket_addr()?.port() != params.fundamentalnode_port {
            return Err(ConfigError::InvalidPort {
                alias: self.alias.clone(),
                expected: params.fundamentalnode_port,
            });
        }
        Ok(())
    }
}

/// Parse the legacy `alias ip:port privkey txid index [donation[:percent]]`
/// format. Blank lines and `#` comments are skipped.
pub fn parse_entries(text: &str, params: &NetworkParams) -> Result<Vec<FundamentalnodeEntry>, ConfigError> {
    let mut entries = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || ConfigError::MalformedLine {
            line: n + 1,
            text: line.to_string(),
        };
        let [alias, address, key, txid, index, rest @ ..] = fields.as_slice() else {
            return Err(malformed());
        };
        let output_index: u32 = index.parse().map_err(|_| malformed())?;
        let (donation_script, donation_percent) = match rest.first() {
            None => (None, None),
            Some(donation) => {
                let (script, percent) = match donation.split_once(':') {
                    Some((script, percent)) => {
                        let percent = percent
                            .parse()
                            .map_err(|_| ConfigError::InvalidDonation(donation.to_string()))?;
                        (script, percent)
                    }
                    None => (*donation, 100),
                };
                (Some(script.to_string()), Some(percent))
            }
        };
        let entry = FundamentalnodeEntry {
            alias: alias.to_string(),
            address: address.to_string(),
            operational_key: key.to_string(),
            txid: txid.to_string(),
            output_index,
            donation_script,
            donation_percent,
        };
        entry.donation()?;
        entry.check_port(params)?;
        entries.push(entry);
    }
    Ok(entries)
}

impl FundamentalnodeConfig {
    /// Load configuration from `fundamentalnode.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Append the entries of `fundamentalnode.conf` in `data_dir`, if present.
    pub fn load_legacy_entries(&mut self, data_dir: &Path) -> Result<usize, ConfigError> {
        let path = data_dir.join(LEGACY_ENTRIES_FILE_NAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let parsed = parse_entries(&text, &self.params())?;
        let count = parsed.len();
        self.entries.extend(parsed);
        Ok(count)
    }

    pub fn params(&self) -> NetworkParams {
        self.node.network.params()
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    /// Configured authority key override, else the network default.
    pub fn authority_key(&self) -> Result<PublicKey, ConfigError> {
        match &self.node.authority_pubkey {
            Some(hex) => Ok(PublicKey::from_hex(hex)?),
            None => Ok(self.params().authority_key()?),
        }
    }

    pub fn operational_key(&self) -> Result<Option<SecretKey>, ConfigError> {
        self.node
            .operational_key
            .as_deref()
            .map(SecretKey::from_hex)
            .transpose()
            .map_err(ConfigError::from)
    }

    /// The payments key, in the encoding of the authority key it must match.
    pub fn payments_key(&self) -> Result<Option<SecretKey>, ConfigError> {
        let Some(hex) = self.node.payments_key.as_deref() else {
            return Ok(None);
        };
        let compressed = self.authority_key()?.is_compressed();
        Ok(Some(SecretKey::from_hex(hex)?.with_compression(compressed)))
    }

    pub fn service_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.node
            .service_addr
            .as_deref()
            .map(|s| s.parse().map_err(|_| ConfigError::InvalidAddress(s.to_string())))
            .transpose()
    }

    /// Validate every configured entry against the network's port.
    pub fn validate_entries(&self) -> Result<(), ConfigError> {
        let params = self.params();
        for entry in &self.entries {
            entry.check_port(&params)?;
            entry.outpoint()?;
            entry.donation()?;
        }
        Ok(())
    }

    pub fn entry(&self, alias: &str) -> Option<&FundamentalnodeEntry> {
        self.entries.iter().find(|e| e.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID: &str = "1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn default_config_valid() {
        let config = FundamentalnodeConfig::default();
        assert_eq!(config.node.network, Network::Main);
        assert_eq!(config.timing.expiration_seconds, 3900);
        assert_eq!(config.timing.removal_seconds, 4200);
        assert!(!config.node.fundamentalnode);
        assert!(config.entries.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = format!(
            r#"
[node]
network = "test"
fundamentalnode = true
service_addr = "8.8.8.8:30420"

[timing]
ping_seconds = 60

[[fundamentalnode]]
alias = "fn1"
address = "8.8.4.4:30420"
operational_key = "{key}"
txid = "{TXID}"
output_index = 1
donation_script = "76a914000000000000000000000000000000000000000088ac"
donation_percent = 10
"#,
            key = SecretKey::generate().to_hex()
        );
        let config: FundamentalnodeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.node.network, Network::Test);
        assert_eq!(config.timing.ping_seconds, 60);
        assert_eq!(config.timing.min_ping_seconds, 1800);
        assert_eq!(config.entries.len(), 1);
        assert!(config.validate_entries().is_ok());
        let entry = config.entry("fn1").unwrap();
        assert_eq!(entry.outpoint().unwrap().vout, 1);
        assert_eq!(entry.donation().unwrap().1, 10);
        assert_eq!(
            config.service_addr().unwrap(),
            Some("8.8.8.8:30420".parse().unwrap())
        );
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = FundamentalnodeConfig::load(dir.path());
        assert_eq!(config.node.network, Network::Main);
    }

    #[test]
    fn broken_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[node\nnetwork = 3").unwrap();
        let config = FundamentalnodeConfig::load(dir.path());
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn legacy_lines_parse() {
        let params = Network::Main.params();
        let key = SecretKey::generate().to_hex();
        let text = format!(
            "# comment\n\nfn1 8.8.8.8:5647 {key} {TXID} 0\nfn2 8.8.4.4:5647 {key} {TXID} 1 a914:25\nfn3 8.8.4.5:5647 {key} {TXID} 2 a914\n"
        );
        let entries = parse_entries(&text, &params).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].donation_script, None);
        assert_eq!(entries[1].donation_percent, Some(25));
        assert_eq!(entries[2].donation_percent, Some(100));
    }

    #[test]
    fn legacy_wrong_port_rejected() {
        let params = Network::Main.params();
        let text = format!("fn1 8.8.8.8:30420 00 {TXID} 0\n");
        assert!(matches!(
            parse_entries(&text, &params),
            Err(ConfigError::InvalidPort { expected: 5647, .. })
        ));
    }

    #[test]
    fn legacy_short_line_rejected() {
        let params = Network::Test.params();
        assert!(matches!(
            parse_entries("fn1 8.8.8.8:30420 key", &params),
            Err(ConfigError::MalformedLine { line: 1, .. })
        ));
    }

    #[test]
    fn legacy_file_loaded_alongside_toml() {
        let dir = tempfile::tempdir().unwrap();
        let key = SecretKey::generate().to_hex();
        std::fs::write(
            dir.path().join(LEGACY_ENTRIES_FILE_NAME),
            format!("fn1 8.8.8.8:5647 {key} {TXID} 0\n"),
        )
        .unwrap();
        let mut config = FundamentalnodeConfig::load(dir.path());
        assert_eq!(config.load_legacy_entries(dir.path()).unwrap(), 1);
        assert!(config.entry("fn1").is_some());
    }

    #[test]
    fn network_authority_keys_parse() {
        assert!(Network::Main.params().authority_key().is_ok());
        assert!(Network::Test.params().authority_key().is_ok());
        assert_ne!(Network::Main.params().magic, Network::Regtest.params().magic);
    }
}
