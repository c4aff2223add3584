//! Per-peer protocol state, kept under the processor's main lock.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use rookd_chain::BlockId;
use rookd_consensus::constants::INIT_PROTO_VERSION;
use rookd_consensus::Hash256;
use rand::Rng;

use crate::bloom::BloomFilter;
use crate::compact::PartialBlock;
use crate::wire::{Inv, NetAddress, RawMessage};

/// Cap on addresses queued for one peer.
pub const MAX_ADDR_TO_SEND: usize = 1000;
/// Cap on remembered announced inventory per peer.
pub const MAX_KNOWN_INVENTORY: usize = 50_000;
/// Cap on the pending ask-for schedule.
pub const MAX_ASK_FOR: usize = 50_000;
/// Spacing between repeated requests for the same inventory item.
pub const ASK_FOR_RETRY_MICROS: i64 = 2 * 60 * 1_000_000;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakePhase {
    New,
    VersionReceived,
    Connected,
}

/// Connection classification fixed at accept time.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerFlags {
    pub inbound: bool,
    pub whitelisted: bool,
    pub manual: bool,
    pub feeler: bool,
    pub one_shot: bool,
}

/// An outstanding block request in request order.
pub struct QueuedBlock {
    pub hash: Hash256,
    pub block_index: Option<BlockId>,
    pub validated_header: bool,
    /// Reconstruction state; present only for compact-block downloads.
    pub partial: Option<PartialBlock>,
}

/// A block rejection queued for delivery at the next checkpoint.
#[derive(Clone, Debug)]
pub struct BlockReject {
    pub code: u8,
    pub reason: String,
    pub hash: Hash256,
}

/// Outbound chain-quality timeout state.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainSyncTimeout {
    pub timeout: i64,
    pub work_header: Option<BlockId>,
    pub sent_getheaders: bool,
    pub protect: bool,
}

/// Insertion-ordered set with eviction, standing in for a rolling filter.
#[derive(Default)]
pub struct RollingSet {
    order: VecDeque<Hash256>,
    members: HashSet<Hash256>,
    capacity: usize,
}

impl RollingSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, hash: Hash256) {
        if !self.members.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.members.contains(hash)
    }
}

pub struct PeerState {
    pub addr: SocketAddr,
    pub name: String,
    pub flags: PeerFlags,
    pub time_connected: i64,

    // Handshake.
    pub phase: HandshakePhase,
    pub version: i32,
    pub send_version: i32,
    pub services: u64,
    /// Peer cannot serve us blocks (no NODE_NETWORK).
    pub client: bool,
    pub starting_height: i32,
    pub relay_txes: bool,
    pub time_offset: i64,
    pub currently_connected: bool,
    pub disconnect: bool,

    // Anti-DoS.
    pub misbehavior: i32,
    pub should_ban: bool,
    pub rejects: Vec<BlockReject>,

    // Block availability.
    pub best_known_block: Option<BlockId>,
    pub last_unknown_block: Option<Hash256>,
    pub last_common_block: Option<BlockId>,
    pub best_header_sent: Option<BlockId>,
    pub unconnecting_headers: i32,

    // Header sync and block download.
    pub sync_started: bool,
    pub headers_sync_timeout: i64,
    pub stalling_since: i64,
    pub blocks_in_flight: VecDeque<QueuedBlock>,
    pub downloading_since: i64,
    pub in_flight_valid_headers: i32,
    pub preferred_download: bool,

    // Announcement preferences and capabilities.
    pub prefer_headers: bool,
    pub prefer_header_and_ids: bool,
    pub provides_header_and_ids: bool,
    pub have_witness: bool,
    pub wants_cmpct_witness: bool,
    pub supports_desired_cmpct_version: bool,

    pub chain_sync: ChainSyncTimeout,
    pub last_block_announcement: i64,

    // Ping state.
    pub ping_nonce_sent: u64,
    pub ping_start: i64,
    pub ping_time: i64,
    pub min_ping_time: i64,
    pub ping_queued: bool,

    // Address relay.
    pub sent_addr: bool,
    pub sent_getaddr: bool,
    pub addr_known: HashSet<[u8; 18]>,
    pub addr_to_send: Vec<NetAddress>,
    pub next_addr_send: i64,
    pub next_local_addr_send: i64,

    // Inventory relay.
    pub blocks_to_announce: Vec<Hash256>,
    pub inv_blocks_to_send: Vec<Hash256>,
    pub tx_inv_to_send: BTreeSet<Hash256>,
    pub known_inventory: RollingSet,
    pub ask_for: VecDeque<(i64, Inv)>,
    pub ask_for_set: HashSet<Hash256>,
    pub next_inv_send: i64,

    // Serving.
    pub getdata_queue: VecDeque<Inv>,
    pub hash_continue: Option<Hash256>,
    pub send_mempool: bool,
    pub last_mempool_req: i64,

    // Filters.
    pub filter: Option<BloomFilter>,
    pub fee_filter_received: i64,
    pub fee_filter_sent: i64,
    pub next_send_fee_filter: i64,

    // Inbound queue.
    pub process_queue: VecDeque<RawMessage>,
    pub process_queue_bytes: usize,
    pub pause_recv: bool,

    pub last_block_time: i64,
    pub last_tx_time: i64,
}

impl PeerState {
    pub fn new(addr: SocketAddr, name: String, flags: PeerFlags, now_seconds: i64) -> Self {
        Self {
            addr,
            name,
            flags,
            time_connected: now_seconds,
            phase: HandshakePhase::New,
            version: 0,
            send_version: INIT_PROTO_VERSION,
            services: 0,
            client: true,
            starting_height: -1,
            relay_txes: false,
            time_offset: 0,
            currently_connected: false,
            disconnect: false,
            misbehavior: 0,
            should_ban: false,
            rejects: Vec::new(),
            best_known_block: None,
            last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            unconnecting_headers: 0,
            sync_started: false,
            headers_sync_timeout: 0,
            stalling_since: 0,
            blocks_in_flight: VecDeque::new(),
            downloading_since: 0,
            in_flight_valid_headers: 0,
            preferred_download: false,
            prefer_headers: false,
            prefer_header_and_ids: false,
            provides_header_and_ids: false,
            have_witness: false,
            wants_cmpct_witness: false,
            supports_desired_cmpct_version: false,
            chain_sync: ChainSyncTimeout::default(),
            last_block_announcement: 0,
            ping_nonce_sent: 0,
            ping_start: 0,
            ping_time: -1,
            min_ping_time: i64::MAX,
            ping_queued: false,
            sent_addr: false,
            sent_getaddr: false,
            addr_known: HashSet::new(),
            addr_to_send: Vec::new(),
            next_addr_send: 0,
            next_local_addr_send: 0,
            blocks_to_announce: Vec::new(),
            inv_blocks_to_send: Vec::new(),
            tx_inv_to_send: BTreeSet::new(),
            known_inventory: RollingSet::new(MAX_KNOWN_INVENTORY),
            ask_for: VecDeque::new(),
            ask_for_set: HashSet::new(),
            next_inv_send: 0,
            getdata_queue: VecDeque::new(),
            hash_continue: None,
            send_mempool: false,
            last_mempool_req: 0,
            filter: None,
            fee_filter_received: 0,
            fee_filter_sent: 0,
            next_send_fee_filter: 0,
            process_queue: VecDeque::new(),
            process_queue_bytes: 0,
            pause_recv: false,
            last_block_time: 0,
            last_tx_time: 0,
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Connected
    }

    /// Outbound peers eligible for the chain-quality eviction logic.
    pub fn is_outbound_disconnection_candidate(&self) -> bool {
        !(self.flags.inbound || self.flags.manual || self.flags.feeler || self.flags.one_shot)
    }

    pub fn add_address_known(&mut self, address: &NetAddress) {
        self.addr_known.insert(address.key());
    }

    /// Queue an address for relay, bounded with random replacement so a
    /// flood cannot grow the queue.
    pub fn push_address(&mut self, address: NetAddress) {
        if self.addr_known.contains(&address.key()) {
            return;
        }
        if self.addr_to_send.len() >= MAX_ADDR_TO_SEND {
            let slot = rand::thread_rng().gen_range(0..self.addr_to_send.len());
            self.addr_to_send[slot] = address;
        } else {
            self.addr_to_send.push(address);
        }
    }

    pub fn push_block_hash(&mut self, hash: Hash256) {
        self.blocks_to_announce.push(hash);
    }

    pub fn push_inventory(&mut self, inv: Inv) {
        if inv.is_tx_kind() {
            if !self.known_inventory.contains(&inv.hash) {
                self.tx_inv_to_send.insert(inv.hash);
            }
        } else if inv.is_block_kind() {
            self.inv_blocks_to_send.push(inv.hash);
        }
    }

    /// Schedule a data request; repeats for the same hash back off.
    pub fn ask_for(&mut self, inv: Inv, now_micros: i64) {
        if self.ask_for.len() >= MAX_ASK_FOR {
            return;
        }
        let request_at = if self.ask_for_set.contains(&inv.hash) {
            now_micros + ASK_FOR_RETRY_MICROS
        } else {
            now_micros
        };
        self.ask_for_set.insert(inv.hash);
        self.ask_for.push_back((request_at, inv));
    }
}
