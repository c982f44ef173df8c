//! Gossip protocol: wire messages and their handlers.

pub mod gossip;
pub mod protocol;

pub use gossip::{GossipError, GossipProtocol};
pub use protocol::{decode_message, encode_message, Announce, Message, Ping, Vote};
