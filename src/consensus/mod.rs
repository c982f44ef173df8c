//! # Fundamentalnode consensus: election, payments and proof-of-service
//!
//! Every decision in this module is a pure function of two inputs all honest
//! nodes share: the directory ([`crate::registry::Registry`]) and the active
//! chain. Nothing is negotiated; nodes converge because they compute the same
//! thing and break ties the same way.
//!
//! ## Election
//!
//! Each node gets a score per block height:
//!
//! ```text
//! score(vin, h) = | H(blockHash(h)) - H(blockHash(h) ‖ (vin.txid + vin.n)) |
//! ```
//!
//! with `H` = double SHA-256 read as a little-endian 256-bit integer. Ranks
//! are descending score, ties by collateral outpoint.
//!
//! ## Payments
//!
//! ```text
//! new tip at height T:
//!   1. authority node picks the enabled node with the oldest collateral not
//!      paid in the last N winners (N = enabled count) for height T + 10
//!   2. donation split decided by bits of blockHash(T)
//!   3. signs (vin ‖ height ‖ payee) with the authority key and floods `fnw`
//!   4. receivers keep one winner per height; a competing winner replaces
//!      it only with a strictly higher tie-break score
//! ```
//!
//! ## Proof-of-service
//!
//! At each height the top 1% of ranks (at height − 5) probe the bottom 1%,
//! flooding signed reports. Reports adjust the target's error counter; six
//! errors evict the node for good.

pub mod election;
pub mod payments;
pub mod scanning;
