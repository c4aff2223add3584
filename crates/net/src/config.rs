//! Networking configuration knobs.

use rookd_consensus::constants::{NODE_NETWORK, PROTOCOL_VERSION};

/// Misbehavior score at which a peer is marked for disconnection and ban.
pub const DEFAULT_BANSCORE_THRESHOLD: i32 = 100;
/// Default for announcing our fee filter to peers.
pub const DEFAULT_FEEFILTER: bool = true;
/// Default for relaying non-block messages from whitelisted peers.
pub const DEFAULT_WHITELISTRELAY: bool = true;
/// Default for relaying transactions from whitelisted peers even when they
/// would be filtered.
pub const DEFAULT_WHITELISTFORCERELAY: bool = true;
/// Default mempool ceiling used to derive the advertised fee filter, in MB.
pub const DEFAULT_MAX_MEMPOOL_MB: u64 = 300;
/// Floor for any fee filter we advertise, in base units per kB.
pub const DEFAULT_MIN_RELAY_TX_FEE: i64 = 1000;

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// `-banscore`
    pub ban_threshold: i32,
    /// `-feefilter`
    pub fee_filter: bool,
    /// `-whitelistrelay`
    pub whitelist_relay: bool,
    /// `-whitelistforcerelay`
    pub whitelist_force_relay: bool,
    /// `-maxmempool`
    pub max_mempool_mb: u64,
    /// `-dropmessagestest`: drop one in N received messages, 0 disables.
    pub drop_messages_test: u64,
    /// Whether we relay transactions at all (version message `relay` field).
    pub relay_txes: bool,
    /// Whether we accept inbound connections.
    pub listening: bool,
    /// Service bits we advertise.
    pub local_services: u64,
    pub user_agent: String,
    pub protocol_version: i32,
    /// Per-peer unprocessed-message budget before the receive side pauses.
    pub receive_flood_bytes: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ban_threshold: DEFAULT_BANSCORE_THRESHOLD,
            fee_filter: DEFAULT_FEEFILTER,
            whitelist_relay: DEFAULT_WHITELISTRELAY,
            whitelist_force_relay: DEFAULT_WHITELISTFORCERELAY,
            max_mempool_mb: DEFAULT_MAX_MEMPOOL_MB,
            drop_messages_test: 0,
            relay_txes: true,
            listening: true,
            local_services: NODE_NETWORK,
            user_agent: "/rookd:0.1.0/".to_string(),
            protocol_version: PROTOCOL_VERSION,
            receive_flood_bytes: 5_000_000,
        }
    }
}
