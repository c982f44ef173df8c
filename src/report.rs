//! Directory listings for operators.

use std::str::FromStr;

use crate::chain::ChainView;
use crate::consensus::election::ElectionScorer;
use crate::registry::{NodeRecord, Registry};

/// What each listing row shows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListMode {
    /// Seconds between announce and last liveness.
    ActiveSeconds,
    Donation,
    /// `status protocol keyid txid lastseen activeseconds`
    Full,
    LastSeen,
    Protocol,
    /// Key id of the collateral key.
    PubKey,
    /// Proof-of-service error count.
    Pose,
    Rank,
    #[default]
    Status,
    Vin,
    Votes,
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("unknown list mode {0}")]
pub struct UnknownMode(String);

impl FromStr for ListMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "activeseconds" => ListMode::ActiveSeconds,
            "donation" => ListMode::Donation,
            "full" => ListMode::Full,
            "lastseen" => ListMode::LastSeen,
            "protocol" => ListMode::Protocol,
            "pubkey" => ListMode::PubKey,
            "pose" => ListMode::Pose,
            "rank" => ListMode::Rank,
            "status" => ListMode::Status,
            "vin" => ListMode::Vin,
            "votes" => ListMode::Votes,
            other => return Err(UnknownMode(other.to_string())),
        })
    }
}

/// One listing line, keyed by node address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportRow {
    pub addr: String,
    pub value: String,
}

/// List the directory. `filter` is a substring of the address, or of the
/// mode-specific value where the mode allows it (an exact version for
/// `protocol`). Rank needs a scorer and the chain's best height.
pub fn list(
    registry: &Registry,
    chain: &dyn ChainView,
    scorer: Option<&ElectionScorer>,
    mode: ListMode,
    filter: &str,
) -> Vec<ReportRow> {
    let keep = |addr: &str, extra: Option<&str>| {
        filter.is_empty() || addr.contains(filter) || extra.is_some_and(|e| e.contains(filter))
    };

    if mode == ListMode::Rank {
        let (Some(scorer), Some(height)) = (scorer, chain.best_height()) else {
            return Vec::new();
        };
        return scorer
            .ranks(registry, height, 0, true)
            .into_iter()
            .map(|(rank, r)| (r.identity.addr.to_string(), rank))
            .filter(|(addr, _)| keep(addr, None))
            .map(|(addr, rank)| ReportRow {
                addr,
                value: rank.to_string(),
            })
            .collect();
    }

    registry.check_all(chain);
    let now = chain.adjusted_time();
    let mut rows = Vec::new();
    for record in registry.records() {
        let addr = record.identity.addr.to_string();
        let value = match mode {
            ListMode::ActiveSeconds => Some(active_seconds(&record).to_string()),
            ListMode::LastSeen => Some(record.last_seen.to_string()),
            ListMode::Pose => Some(record.scanning_errors.to_string()),
            ListMode::Donation => {
                let value = if record.donation_percent == 0 {
                    String::new()
                } else {
                    format!("{}:{}", record.donation_script, record.donation_percent)
                };
                Some(value).filter(|v| keep(&addr, Some(v)))
            }
            ListMode::Protocol => {
                let version = record.identity.protocol_version.to_string();
                (filter.is_empty() || filter == version || addr.contains(filter)).then_some(version)
            }
            ListMode::PubKey => {
                let id = key_id(&record);
                keep(&addr, Some(&id)).then_some(id)
            }
            ListMode::Status => {
                let status = record.state.as_str().to_string();
                keep(&addr, Some(&status)).then_some(status)
            }
            ListMode::Vin => {
                let txid = hex::encode(record.vin().txid);
                keep(&addr, Some(&txid)).then_some(txid)
            }
            ListMode::Votes => {
                let label = record.vote_label(now).to_string();
                keep(&addr, Some(&label)).then_some(label)
            }
            ListMode::Full => {
                let line = format!(
                    "{:>10} {} {} {} {} {:>8}",
                    record.state.as_str(),
                    record.identity.protocol_version,
                    key_id(&record),
                    hex::encode(record.vin().txid),
                    record.last_seen,
                    active_seconds(&record),
                );
                keep(&addr, Some(&line)).then_some(line)
            }
            ListMode::Rank => None,
        };
        let Some(value) = value else { continue };
        if matches!(
            mode,
            ListMode::ActiveSeconds | ListMode::LastSeen | ListMode::Pose
        ) && !keep(&addr, None)
        {
            continue;
        }
        let addr = if mode == ListMode::Full {
            format!("{addr:>21}")
        } else {
            addr
        };
        rows.push(ReportRow { addr, value });
    }
    rows
}

fn active_seconds(record: &NodeRecord) -> i64 {
    record.last_seen - record.sig_time
}

fn key_id(record: &NodeRecord) -> String {
    hex::encode(record.identity.collateral_key.key_id())
}
