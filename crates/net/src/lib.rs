//! Peer message processing: the per-peer protocol state machine, headers
//! synchronization, block-download scheduling, inventory relay, and
//! misbehavior discipline of the node.
//!
//! The heavy collaborators (chain validation, mempool, connection manager)
//! are reached through the traits in [`collab`]; everything observable over
//! the wire lives in [`wire`].

pub mod bloom;
pub mod collab;
pub mod compact;
pub mod config;
pub mod download;
pub mod header_sync;
mod handlers;
pub mod peer;
pub mod processor;
pub mod state;
pub mod time;
pub mod wire;

pub use bloom::BloomFilter;
pub use collab::{BanReason, ChainEngine, ConnMan, TickScheduler, TxPool};
pub use config::NetConfig;
pub use peer::{HandshakePhase, PeerFlags, PeerId};
pub use processor::{BlockValidationVerdict, NetProcessor};
pub use time::{Clock, MockClock, SystemClock};
pub use wire::{NetAddress, NetMessage, RawMessage};
