//! The peer message processor: owns validation-facing peer state behind a
//! single lock, dispatches inbound messages, composes outbound traffic,
//! and runs the periodic eviction checks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use rookd_consensus::constants::{BIP0031_VERSION, FEEFILTER_VERSION, NODE_WITNESS};
use rookd_consensus::{hash256_to_hex, ChainParams, Hash256};
use rookd_log::{log_debug, log_error, log_info, log_warn};
use rookd_primitives::{Block, DecodeError, Transaction};

use crate::collab::{BanReason, ChainEngine, ConnMan, TickScheduler, TxPool};
use crate::compact::CompactBlock;
use crate::config::{NetConfig, DEFAULT_MIN_RELAY_TX_FEE};
use crate::download::{
    find_next_blocks_to_download, BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_TIMEOUT_PER_PEER,
    BLOCK_STALLING_TIMEOUT_MICROS, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
};
use crate::header_sync::{
    HEADERS_DOWNLOAD_TIMEOUT_BASE, HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER, MAX_BLOCKS_TO_ANNOUNCE,
};
use crate::peer::{BlockReject, PeerFlags, PeerId, PeerState};
use crate::state::{peer_has_header, NetState, MAX_CMPCT_ANNOUNCERS};
use crate::time::{poisson_next_send, Clock};
use crate::wire::{
    self, BlockLocator, FrameError, Inv, NetMessage, RawMessage, SendCmpct, MSG_BLOCK,
    MSG_CMPCT_BLOCK, MSG_FILTERED_BLOCK, MSG_TX, MSG_WITNESS_FLAG,
};

/// Largest inv/getdata message we accept.
pub const MAX_INV_SZ: usize = 50_000;
/// Keepalive ping cadence.
pub const PING_INTERVAL_MICROS: i64 = 2 * 60 * 1_000_000;
/// Average delay between address self-advertisements.
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL_SECS: i64 = 24 * 60 * 60;
/// Average delay between addr flushes to one peer.
pub const AVG_ADDRESS_BROADCAST_INTERVAL_SECS: i64 = 30;
/// Average delay between inventory trickles.
pub const INVENTORY_BROADCAST_INTERVAL_SECS: i64 = 5;
/// Average delay between feefilter updates.
pub const AVG_FEEFILTER_BROADCAST_INTERVAL_SECS: i64 = 10 * 60;
/// A substantially changed fee filter is re-sent within this long.
pub const MAX_FEEFILTER_CHANGE_DELAY_SECS: i64 = 5 * 60;
/// Outbound peers must match our tip's work within this long.
pub const CHAIN_SYNC_TIMEOUT_SECS: i64 = 20 * 60;
/// Grace period for the chain-sync getheaders probe.
pub const HEADERS_RESPONSE_TIME_SECS: i64 = 2 * 60;
/// Stale-tip detection cadence.
pub const STALE_CHECK_INTERVAL_SECS: i64 = 10 * 60;
/// Extra-outbound-peer eviction cadence.
pub const EXTRA_PEER_CHECK_INTERVAL_SECS: i64 = 45;
/// Peers younger than this are not considered for extra-peer eviction.
pub const MINIMUM_CONNECT_TIME_SECS: i64 = 30;
/// How many outbound peers may hold chain-sync protection at once.
pub const MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT: i32 = 4;
/// Peers below this version may be banned for invalid compact blocks.
pub const INVALID_CB_NO_BAN_VERSION: i32 = 70_015;

/// Domain separator for the deterministic address-relay randomizer.
pub const RANDOMIZER_ID_ADDRESS_RELAY: u64 = 0x3cac_0035_b586_6b90;

// Peer eviction must run more often than the stale-tip check it also
// drives.
const _: () = assert!(EXTRA_PEER_CHECK_INTERVAL_SECS < STALE_CHECK_INTERVAL_SECS);

/// Verdict reported by validation for a checked block.
#[derive(Clone, Debug)]
pub struct BlockValidationVerdict {
    pub valid: bool,
    pub dos_score: i32,
    pub reject_code: u8,
    pub reject_reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct NodeStateStats {
    pub misbehavior: i32,
    pub sync_height: i32,
    pub common_height: i32,
    pub heights_in_flight: Vec<i32>,
}

#[derive(Debug)]
pub enum HandlerError {
    /// Malformed payload; answered with a reject and tolerated.
    Decode(DecodeError),
    /// Handler aborted; already graded via misbehavior where warranted.
    Protocol(String),
}

impl From<DecodeError> for HandlerError {
    fn from(err: DecodeError) -> Self {
        HandlerError::Decode(err)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Decode(err) => write!(f, "{err}"),
            HandlerError::Protocol(reason) => write!(f, "{reason}"),
        }
    }
}

pub struct NetProcessor<C, T, N> {
    pub(crate) config: NetConfig,
    pub(crate) params: ChainParams,
    pub(crate) chain: Arc<C>,
    pub(crate) pool: Arc<T>,
    pub(crate) connman: Arc<N>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<NetState>,
    stale_tip_check_time: AtomicI64,
}

impl<C, T, N> NetProcessor<C, T, N>
where
    C: ChainEngine,
    T: TxPool,
    N: ConnMan,
{
    pub fn new(
        config: NetConfig,
        params: ChainParams,
        chain: Arc<C>,
        pool: Arc<T>,
        connman: Arc<N>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            params,
            chain,
            pool,
            connman,
            clock,
            state: Mutex::new(NetState::new()),
            stale_tip_check_time: AtomicI64::new(0),
        }
    }

    /// Register the periodic stale-tip/eviction tick.
    pub fn start(self: &Arc<Self>, scheduler: &dyn TickScheduler)
    where
        C: 'static,
        T: 'static,
        N: 'static,
    {
        let this = Arc::clone(self);
        scheduler.schedule_every(
            Duration::from_secs(EXTRA_PEER_CHECK_INTERVAL_SECS as u64),
            Box::new(move || this.check_for_stale_tip_and_evict_peers()),
        );
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NetState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Read access to the locked net state, for invariant checks in tests
    /// and status reporting.
    pub fn with_state<R>(&self, reader: impl FnOnce(&NetState) -> R) -> R {
        let state = self.state();
        reader(&state)
    }

    /// Mutable access to the locked net state. Intended for scenario setup
    /// in tests; production callers go through the message handlers.
    pub fn with_state_mut<R>(&self, writer: impl FnOnce(&mut NetState) -> R) -> R {
        let mut state = self.state();
        writer(&mut state)
    }

    // Node lifecycle.

    pub fn initialize_node(&self, id: PeerId, addr: SocketAddr, name: String, flags: PeerFlags) {
        let now = self.clock.unix_seconds();
        {
            let mut state = self.state();
            state.insert_peer(id, addr, name, flags, now);
        }
        if !flags.inbound {
            self.push_node_version(id, addr);
        }
    }

    /// Tear down a peer. Returns whether the address manager should record
    /// the connection as healthy.
    pub fn finalize_node(&self, id: PeerId) -> bool {
        let mut state = self.state();
        let removed = state.remove_peer(id);
        self.pool.remove_orphans_for_peer(id);
        match removed {
            Some(peer) => {
                log_debug!("cleared nodestate for peer={id}");
                peer.misbehavior == 0 && peer.currently_connected
            }
            None => false,
        }
    }

    pub fn peer_marked_for_disconnect(&self, id: PeerId) -> bool {
        self.state()
            .peer(id)
            .map(|peer| peer.disconnect)
            .unwrap_or(false)
    }

    pub fn get_node_state_stats(&self, id: PeerId) -> Option<NodeStateStats> {
        let state = self.state();
        let peer = state.peer(id)?;
        Some(NodeStateStats {
            misbehavior: peer.misbehavior,
            sync_height: peer
                .best_known_block
                .map(|index| self.chain.height(index))
                .unwrap_or(-1),
            common_height: peer
                .last_common_block
                .map(|index| self.chain.height(index))
                .unwrap_or(-1),
            heights_in_flight: peer
                .blocks_in_flight
                .iter()
                .filter_map(|queued| queued.block_index)
                .map(|index| self.chain.height(index))
                .collect(),
        })
    }

    pub(crate) fn push_node_version(&self, id: PeerId, addr: SocketAddr) {
        let height = self.chain.height(self.chain.tip());
        let addr_you = wire::NetAddress::from_socket(addr, 0, 0);
        let addr_me = wire::NetAddress {
            time: 0,
            services: self.config.local_services,
            ip: [0u8; 16],
            port: 0,
        };
        let nonce = self.connman.local_nonce(id);
        let message = wire::VersionMessage {
            version: self.config.protocol_version,
            services: self.config.local_services,
            timestamp: self.clock.unix_seconds(),
            addr_recv: addr_you,
            addr_from: addr_me,
            nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: height,
            relay: self.config.relay_txes,
        };
        log_debug!(
            "send version message: version {}, blocks={}, peer={}",
            self.config.protocol_version,
            height,
            id
        );
        self.connman.push_message(id, NetMessage::Version(message));
    }

    /// Queue a framed message for processing. Returns true when the peer's
    /// receive side should pause.
    pub fn enqueue_message(&self, id: PeerId, raw: RawMessage) -> bool {
        let mut state = self.state();
        let flood = self.config.receive_flood_bytes;
        let Some(peer) = state.peer_mut(id) else {
            return true;
        };
        peer.process_queue_bytes += raw.size();
        peer.process_queue.push_back(raw);
        peer.pause_recv = peer.process_queue_bytes > flood;
        peer.pause_recv
    }

    /// Process at most one queued message. Returns whether more work is
    /// pending for this peer.
    pub fn process_messages(&self, id: PeerId, interrupt: &AtomicBool) -> bool {
        self.process_getdata(id, interrupt);

        {
            let state = self.state();
            let Some(peer) = state.peer(id) else {
                return false;
            };
            if peer.disconnect {
                return false;
            }
            // Responses stay ordered: finish the getdata backlog first.
            if !peer.getdata_queue.is_empty() {
                return true;
            }
        }
        if self.connman.send_buffer_full(id) {
            return false;
        }

        let (raw, mut more_work) = {
            let mut state = self.state();
            let flood = self.config.receive_flood_bytes;
            let Some(peer) = state.peer_mut(id) else {
                return false;
            };
            let Some(raw) = peer.process_queue.pop_front() else {
                return false;
            };
            peer.process_queue_bytes = peer.process_queue_bytes.saturating_sub(raw.size());
            peer.pause_recv = peer.process_queue_bytes > flood;
            (raw, !peer.process_queue.is_empty())
        };

        let command = match wire::check_frame(&self.params.message_start, &raw) {
            Ok(command) => command,
            Err(err @ (FrameError::BadMagic | FrameError::BadChecksum)) => {
                // Framing is either broken or deliberately corrupted; this
                // connection carries nothing trustworthy anymore.
                log_warn!("process message: {err}, disconnecting peer={id}");
                self.mark_for_disconnect(id);
                return false;
            }
            Err(err) => {
                log_error!("process message: errors in header ({err}), peer={id}");
                return more_work;
            }
        };

        match self.process_message(id, &command, &raw.payload, interrupt) {
            Ok(()) => {}
            Err(HandlerError::Decode(err)) => {
                self.connman.push_message(
                    id,
                    NetMessage::Reject(wire::RejectMessage::new(
                        &command,
                        rookd_consensus::constants::REJECT_MALFORMED,
                        "error parsing message",
                    )),
                );
                log_error!(
                    "process message ({command}, {} bytes): {err}, peer={id}",
                    raw.payload.len()
                );
            }
            Err(HandlerError::Protocol(reason)) => {
                log_error!(
                    "process message ({command}, {} bytes) failed: {reason}, peer={id}",
                    raw.payload.len()
                );
            }
        }
        if interrupt.load(Ordering::Relaxed) {
            return false;
        }
        {
            let state = self.state();
            if let Some(peer) = state.peer(id) {
                if !peer.getdata_queue.is_empty() {
                    more_work = true;
                }
            }
        }
        {
            let mut state = self.state();
            self.send_rejects_and_check_if_banned(&mut state, id);
        }
        more_work
    }

    pub(crate) fn mark_for_disconnect(&self, id: PeerId) {
        {
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.disconnect = true;
            }
        }
        self.connman.disconnect(id);
    }

    pub(crate) fn fetch_flags(&self, peer: &PeerState) -> u32 {
        if self.config.local_services & NODE_WITNESS != 0 && peer.have_witness {
            MSG_WITNESS_FLAG
        } else {
            0
        }
    }

    pub(crate) fn can_direct_fetch(&self) -> bool {
        let tip_time = self.chain.header_time(self.chain.tip());
        tip_time
            > self.clock.adjusted_seconds() - self.params.consensus.pow_target_spacing * 20
    }

    pub(crate) fn already_have(&self, inv: &Inv) -> bool {
        if inv.is_tx_kind() {
            return self.pool.does_tx_exist(&inv.hash);
        }
        if inv.is_block_kind() {
            return self.chain.block_index(&inv.hash).is_some();
        }
        // Don't know what it is; claim we have one.
        true
    }

    // Reject/ban drain, shared by the message and send paths.

    pub(crate) fn send_rejects_and_check_if_banned(
        &self,
        state: &mut NetState,
        id: PeerId,
    ) -> bool {
        let (rejects, should_ban, addr, whitelisted, manual) = {
            let Some(peer) = state.peer_mut(id) else {
                return false;
            };
            let rejects: Vec<BlockReject> = peer.rejects.drain(..).collect();
            let should_ban = peer.should_ban;
            peer.should_ban = false;
            (
                rejects,
                should_ban,
                peer.addr,
                peer.flags.whitelisted,
                peer.flags.manual,
            )
        };
        for reject in rejects {
            self.connman.push_message(
                id,
                NetMessage::Reject(
                    wire::RejectMessage::new("block", reject.code, &reject.reason)
                        .with_hash(reject.hash),
                ),
            );
        }
        if !should_ban {
            return false;
        }
        if whitelisted {
            log_warn!("warning: not punishing whitelisted peer {addr}");
        } else if manual {
            log_warn!("warning: not punishing manually added peer {addr}");
        } else {
            if let Some(peer) = state.peer_mut(id) {
                peer.disconnect = true;
            }
            self.connman.disconnect(id);
            let local = wire::NetAddress::from_socket(addr, 0, 0).is_local();
            if local {
                log_warn!("warning: not banning local peer {addr}");
            } else {
                self.connman.ban(addr, BanReason::NodeMisbehaving);
            }
        }
        true
    }

    // Periodic eviction.

    pub(crate) fn consider_eviction(&self, state: &mut NetState, id: PeerId, now_seconds: i64) {
        let tip = self.chain.tip();
        let tip_work = self.chain.chain_work(tip);
        let mut probe: Option<Option<rookd_chain::BlockId>> = None;
        let mut drop_peer = false;
        {
            let Some(peer) = state.peer_mut(id) else {
                return;
            };
            if peer.chain_sync.protect
                || !peer.is_outbound_disconnection_candidate()
                || !peer.sync_started
            {
                return;
            }
            let best_work = peer
                .best_known_block
                .map(|index| self.chain.chain_work(index));
            if best_work.map(|work| work >= tip_work).unwrap_or(false) {
                // Caught up; clear any pending timeout.
                if peer.chain_sync.timeout != 0 {
                    peer.chain_sync.timeout = 0;
                    peer.chain_sync.work_header = None;
                    peer.chain_sync.sent_getheaders = false;
                }
            } else if peer.chain_sync.timeout == 0
                || (peer.chain_sync.work_header.is_some()
                    && best_work
                        .map(|work| {
                            peer.chain_sync
                                .work_header
                                .map(|header| work >= self.chain.chain_work(header))
                                .unwrap_or(false)
                        })
                        .unwrap_or(false))
            {
                // Behind our tip, noticed for the first time or caught up to
                // the previous benchmark: rebase the timeout on the new tip.
                peer.chain_sync.timeout = now_seconds + CHAIN_SYNC_TIMEOUT_SECS;
                peer.chain_sync.work_header = Some(tip);
                peer.chain_sync.sent_getheaders = false;
            } else if peer.chain_sync.timeout > 0 && now_seconds > peer.chain_sync.timeout {
                if peer.chain_sync.sent_getheaders {
                    drop_peer = true;
                } else {
                    peer.chain_sync.sent_getheaders = true;
                    peer.chain_sync.timeout = now_seconds + HEADERS_RESPONSE_TIME_SECS;
                    probe = Some(peer.chain_sync.work_header.and_then(|h| self.chain.prev(h)));
                }
            }
        }
        if drop_peer {
            log_info!("disconnecting outbound peer={id} for old chain");
            if let Some(peer) = state.peer_mut(id) {
                peer.disconnect = true;
            }
            self.connman.disconnect(id);
        } else if let Some(from) = probe {
            log_debug!("sending getheaders to outbound peer={id} to verify chain work");
            self.connman.push_message(
                id,
                NetMessage::GetHeaders(BlockLocator {
                    version: self.config.protocol_version as u32,
                    have: self.chain.locator(from),
                    stop: [0u8; 32],
                }),
            );
        }
    }

    pub fn evict_extra_outbound_peers(&self, now_seconds: i64) {
        if self.connman.extra_outbound_count() <= 0 {
            return;
        }
        let mut state = self.state();
        // The peer that least recently announced a new block goes, with
        // ties broken toward the newer connection.
        let mut worst: Option<(PeerId, i64)> = None;
        for (peer_id, peer) in state.peers.iter() {
            if !peer.is_outbound_disconnection_candidate() || peer.disconnect {
                continue;
            }
            if peer.chain_sync.protect {
                continue;
            }
            let replace = match worst {
                None => true,
                Some((worst_id, oldest)) => {
                    peer.last_block_announcement < oldest
                        || (peer.last_block_announcement == oldest && *peer_id > worst_id)
                }
            };
            if replace {
                worst = Some((*peer_id, peer.last_block_announcement));
            }
        }
        let Some((worst_peer, oldest_announcement)) = worst else {
            return;
        };
        let Some(peer) = state.peer_mut(worst_peer) else {
            return;
        };
        if now_seconds - peer.time_connected > MINIMUM_CONNECT_TIME_SECS
            && peer.blocks_in_flight.is_empty()
        {
            log_info!(
                "disconnecting extra outbound peer={worst_peer} (last block announcement at {oldest_announcement})"
            );
            peer.disconnect = true;
            self.connman.disconnect(worst_peer);
            // A replacement connected since the last stale-tip alarm; stop
            // soliciting extras until the tip looks stale again.
            self.connman.set_try_new_outbound_peer(false);
        } else {
            log_debug!(
                "keeping outbound peer={worst_peer} chosen for eviction (connect time {}, in flight {})",
                peer.time_connected,
                peer.blocks_in_flight.len()
            );
        }
    }

    fn tip_may_be_stale(&self, state: &mut NetState, now_seconds: i64) -> bool {
        if state.last_tip_update == 0 {
            state.last_tip_update = now_seconds;
        }
        state.last_tip_update
            < now_seconds - self.params.consensus.pow_target_spacing * 3
            && state.in_flight.is_empty()
    }

    pub fn check_for_stale_tip_and_evict_peers(&self) {
        let now_seconds = self.clock.unix_seconds();
        self.evict_extra_outbound_peers(now_seconds);

        if now_seconds > self.stale_tip_check_time.load(Ordering::Relaxed) {
            let mut state = self.state();
            if self.tip_may_be_stale(&mut state, now_seconds) {
                log_info!(
                    "potential stale tip detected, will try using an extra outbound peer (last tip update {} seconds ago)",
                    now_seconds - state.last_tip_update
                );
                self.connman.set_try_new_outbound_peer(true);
            } else if self.connman.get_try_new_outbound_peer() {
                self.connman.set_try_new_outbound_peer(false);
            }
            self.stale_tip_check_time
                .store(now_seconds + STALE_CHECK_INTERVAL_SECS, Ordering::Relaxed);
        }
    }

    // Validation notifications.

    pub fn block_connected(&self, block: &Block) {
        self.pool.remove_orphans_for_block(block);
        let mut state = self.state();
        state.last_tip_update = self.clock.unix_seconds();
    }

    pub fn updated_block_tip(
        &self,
        new_tip: rookd_chain::BlockId,
        fork: Option<rookd_chain::BlockId>,
        initial_download: bool,
    ) {
        let new_height = self.chain.height(new_tip);
        self.connman.set_best_height(new_height);

        if !initial_download {
            // Hashes of blocks that entered the best chain, newest first.
            let mut hashes = Vec::new();
            let mut walk = Some(new_tip);
            while let Some(at) = walk {
                if Some(at) == fork {
                    break;
                }
                hashes.push(self.chain.block_hash(at));
                if hashes.len() == MAX_BLOCKS_TO_ANNOUNCE {
                    break;
                }
                walk = self.chain.prev(at);
            }
            let mut state = self.state();
            for peer in state.peers.values_mut() {
                let floor = if peer.starting_height != -1 {
                    peer.starting_height - 2000
                } else {
                    0
                };
                if new_height > floor {
                    for hash in hashes.iter().rev() {
                        peer.push_block_hash(*hash);
                    }
                }
            }
            self.connman.wake_message_handler();
        }
    }

    pub fn block_checked(&self, hash: Hash256, verdict: &BlockValidationVerdict) {
        let mut state = self.state();
        let source = state.block_source.get(&hash).copied();
        if !verdict.valid {
            if let Some((source_peer, punishable)) = source {
                if verdict.reject_code > 0 {
                    if let Some(peer) = state.peer_mut(source_peer) {
                        peer.rejects.push(BlockReject {
                            code: verdict.reject_code,
                            reason: verdict.reject_reason.clone(),
                            hash,
                        });
                    }
                }
                if verdict.dos_score > 0 && punishable {
                    state.misbehaving(source_peer, verdict.dos_score, self.config.ban_threshold);
                }
            }
        } else if !self.chain.is_initial_block_download()
            && state.in_flight.len() == usize::from(state.in_flight.contains_key(&hash))
        {
            if let Some((source_peer, _)) = source {
                self.maybe_set_peer_as_announcing_header_and_ids(&mut state, source_peer);
            }
        }
        state.block_source.remove(&hash);
    }

    pub fn new_pow_valid_block(&self, _index: rookd_chain::BlockId, _block: &Block) {}

    /// Push a freshly validated tip to peers that asked for compact
    /// announcements and already know the parent.
    pub fn relay_cmpct_block(
        &self,
        index: rookd_chain::BlockId,
        cmpct: &CompactBlock,
        witness_enabled: bool,
    ) {
        let hash = self.chain.block_hash(index);
        let prev = self.chain.prev(index);
        let mut state = self.state();
        let ids: Vec<PeerId> = state.peers.keys().copied().collect();
        for id in ids {
            state.process_block_availability(id, self.chain.as_ref());
            let Some(peer) = state.peer(id) else { continue };
            if peer.version < INVALID_CB_NO_BAN_VERSION || peer.disconnect {
                continue;
            }
            let wants = peer.prefer_header_and_ids
                && (!witness_enabled || peer.wants_cmpct_witness)
                && !peer_has_header(peer, index, self.chain.as_ref())
                && prev
                    .map(|prev| peer_has_header(peer, prev, self.chain.as_ref()))
                    .unwrap_or(false);
            if wants {
                log_info!(
                    "sending header-and-ids {} to peer={id}",
                    hash256_to_hex(&hash)
                );
                self.connman
                    .push_message(id, NetMessage::CmpctBlock(cmpct.clone()));
                if let Some(peer) = state.peer_mut(id) {
                    peer.best_header_sent = Some(index);
                }
            }
        }
    }

    /// Keep at most three peers announcing via compact blocks, rotating
    /// the given peer to the back of the queue.
    pub(crate) fn maybe_set_peer_as_announcing_header_and_ids(
        &self,
        state: &mut NetState,
        id: PeerId,
    ) {
        let Some(peer) = state.peer(id) else {
            return;
        };
        // Never elect peers that can't provide the encoding we want.
        if !peer.supports_desired_cmpct_version {
            return;
        }
        if !peer.provides_header_and_ids {
            return;
        }
        if let Some(position) = state.cmpct_announcers.iter().position(|at| *at == id) {
            state.cmpct_announcers.remove(position);
            state.cmpct_announcers.push_back(id);
            return;
        }
        let version = if self.config.local_services & NODE_WITNESS != 0 {
            2
        } else {
            1
        };
        if state.cmpct_announcers.len() >= MAX_CMPCT_ANNOUNCERS {
            if let Some(evicted) = state.cmpct_announcers.pop_front() {
                self.connman.push_message(
                    evicted,
                    NetMessage::SendCmpct(SendCmpct {
                        announce: false,
                        version,
                    }),
                );
            }
        }
        self.connman.push_message(
            id,
            NetMessage::SendCmpct(SendCmpct {
                announce: true,
                version,
            }),
        );
        state.cmpct_announcers.push_back(id);
    }

    // Getdata serving.

    pub(crate) fn process_getdata(&self, id: PeerId, interrupt: &AtomicBool) {
        let mut not_found: Vec<Inv> = Vec::new();
        loop {
            if interrupt.load(Ordering::Relaxed) {
                return;
            }
            if self.connman.send_buffer_full(id) {
                break;
            }
            let inv = {
                let mut state = self.state();
                let Some(peer) = state.peer_mut(id) else {
                    return;
                };
                match peer.getdata_queue.pop_front() {
                    Some(inv) => inv,
                    None => break,
                }
            };
            if inv.is_block_kind() {
                self.serve_block(id, &inv);
                // One block response per pass keeps the drain cooperative.
                break;
            } else if inv.is_tx_kind() {
                let last_mempool_req = self
                    .state()
                    .peer(id)
                    .map(|peer| peer.last_mempool_req)
                    .unwrap_or(0);
                match self
                    .pool
                    .request_tx(&inv.hash, inv.wants_witness(), last_mempool_req)
                {
                    Some(tx) => {
                        let tx = if inv.wants_witness() {
                            tx
                        } else {
                            strip_witness_tx(tx)
                        };
                        self.connman.push_message(id, NetMessage::Tx(tx));
                    }
                    None => not_found.push(inv),
                }
            }
        }
        if !not_found.is_empty() {
            // Tell the peer so light clients don't wait on us forever.
            self.connman.push_message(id, NetMessage::NotFound(not_found));
        }
    }

    fn serve_block(&self, id: PeerId, inv: &Inv) {
        if inv.base_kind() == MSG_FILTERED_BLOCK {
            // Filtered block serving is not offered on this network surface.
            log_debug!("ignoring filtered block request from peer={id}");
            return;
        }
        let Some(block) = self.chain.net_request_block_data(&inv.hash) else {
            log_debug!(
                "peer={id} requested unknown block {}",
                hash256_to_hex(&inv.hash)
            );
            return;
        };
        match inv.base_kind() {
            MSG_CMPCT_BLOCK => {
                let (tip_height, block_height) = {
                    let index = self.chain.block_index(&inv.hash);
                    (
                        self.chain.height(self.chain.tip()),
                        index.map(|at| self.chain.height(at)).unwrap_or(0),
                    )
                };
                let wants_witness = self
                    .state()
                    .peer(id)
                    .map(|peer| peer.wants_cmpct_witness)
                    .unwrap_or(false);
                if tip_height - block_height < 5 {
                    let mut nonce_bytes = [0u8; 8];
                    rand::thread_rng().fill_bytes(&mut nonce_bytes);
                    let cmpct = CompactBlock::from_block(
                        &block,
                        u64::from_le_bytes(nonce_bytes),
                        wants_witness,
                    );
                    self.connman.push_message(id, NetMessage::CmpctBlock(cmpct));
                } else {
                    self.connman.push_message(id, NetMessage::Block(block));
                }
            }
            MSG_BLOCK => {
                let block = if inv.wants_witness() {
                    block
                } else {
                    strip_witness_block(block)
                };
                self.connman.push_message(id, NetMessage::Block(block));
            }
            _ => {
                self.connman.push_message(id, NetMessage::Block(block));
            }
        }
        // Served the continuation block: nudge the peer to ask for the next
        // batch by invoicing the tip.
        let continue_hit = {
            let mut state = self.state();
            match state.peer_mut(id) {
                Some(peer) if peer.hash_continue == Some(inv.hash) => {
                    peer.hash_continue = None;
                    true
                }
                _ => false,
            }
        };
        if continue_hit {
            let tip_hash = self.chain.block_hash(self.chain.tip());
            self.connman
                .push_message(id, NetMessage::Inv(vec![Inv::new(MSG_BLOCK, tip_hash)]));
        }
    }

    // Outbound composition.

    /// Compose everything due for this peer. Uses try-lock; on contention
    /// the pass is skipped and retried next cycle.
    pub fn send_messages(&self, id: PeerId, _interrupt: &AtomicBool) -> bool {
        let Ok(mut guard) = self.state.try_lock() else {
            return true;
        };
        let state = &mut *guard;
        {
            let Some(peer) = state.peer(id) else {
                return true;
            };
            if !peer.handshake_complete() || peer.disconnect {
                return true;
            }
        }
        let now = self.clock.unix_micros();
        let now_seconds = self.clock.unix_seconds();

        self.maybe_send_ping(state, id, now);
        if self.send_rejects_and_check_if_banned(state, id) {
            return true;
        }

        self.maybe_advertise_local_address(state, id, now);
        self.flush_addr_queue(state, id, now);

        let fetch = self.start_header_sync_if_needed(state, id, now);
        self.send_block_announcements(state, id);
        self.send_inventory_trickle(state, id, now);

        // Stall and timeout discipline.
        if let Some(peer) = state.peer(id) {
            if peer.stalling_since != 0
                && peer.stalling_since < now - BLOCK_STALLING_TIMEOUT_MICROS
            {
                // The download window cannot move: every missing block is
                // queued behind this peer.
                log_info!("peer={id} is stalling block download, disconnecting");
                self.mark_for_disconnect_locked(state, id);
                return true;
            }
        }
        if let Some(peer) = state.peer(id) {
            if let Some(front) = peer.blocks_in_flight.front() {
                let other_validated =
                    state.validated_download_peers - i32::from(peer.in_flight_valid_headers > 0);
                let limit = peer.downloading_since
                    + self.params.consensus.pow_target_spacing
                        * (BLOCK_DOWNLOAD_TIMEOUT_BASE
                            + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * i64::from(other_validated));
                if now > limit {
                    log_error!(
                        "timeout downloading block {} from peer={id}, disconnecting",
                        hash256_to_hex(&front.hash)
                    );
                    self.mark_for_disconnect_locked(state, id);
                    return true;
                }
            }
        }
        if self.check_headers_sync_timeout(state, id, now) {
            return true;
        }

        self.consider_eviction(state, id, now_seconds);

        self.request_blocks(state, id, fetch, now);
        self.request_non_blocks(state, id, now);
        self.maybe_send_fee_filter(state, id, now);
        true
    }

    pub(crate) fn mark_for_disconnect_locked(&self, state: &mut NetState, id: PeerId) {
        if let Some(peer) = state.peer_mut(id) {
            peer.disconnect = true;
        }
        self.connman.disconnect(id);
    }

    fn maybe_send_ping(&self, state: &mut NetState, id: PeerId, now: i64) {
        let Some(peer) = state.peer_mut(id) else {
            return;
        };
        let mut ping_send = peer.ping_queued;
        if peer.ping_nonce_sent == 0 && peer.ping_start + PING_INTERVAL_MICROS < now {
            // Latency probe and keepalive.
            ping_send = true;
        }
        if !ping_send {
            return;
        }
        let mut nonce = 0u64;
        while nonce == 0 {
            nonce = rand::thread_rng().next_u64();
        }
        peer.ping_queued = false;
        peer.ping_start = now;
        if peer.version > BIP0031_VERSION {
            peer.ping_nonce_sent = nonce;
            self.connman.push_message(id, NetMessage::Ping(Some(nonce)));
        } else {
            // Peer is too old for nonced pings; a pong will never arrive.
            peer.ping_nonce_sent = 0;
            self.connman.push_message(id, NetMessage::Ping(None));
        }
    }

    fn maybe_advertise_local_address(&self, state: &mut NetState, id: PeerId, now: i64) {
        if self.chain.is_initial_block_download() || !self.config.listening {
            return;
        }
        let due = state
            .peer(id)
            .map(|peer| peer.next_local_addr_send < now)
            .unwrap_or(false);
        if !due {
            return;
        }
        let local = self.connman.local_address(id);
        if let Some(peer) = state.peer_mut(id) {
            if let Some(local) = local {
                if local.is_routable() {
                    peer.push_address(local);
                }
            }
            peer.next_local_addr_send =
                poisson_next_send(now, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL_SECS);
        }
    }

    fn flush_addr_queue(&self, state: &mut NetState, id: PeerId, now: i64) {
        let Some(peer) = state.peer_mut(id) else {
            return;
        };
        if peer.next_addr_send >= now {
            return;
        }
        peer.next_addr_send = poisson_next_send(now, AVG_ADDRESS_BROADCAST_INTERVAL_SECS);
        let mut batch: Vec<wire::NetAddress> = Vec::with_capacity(peer.addr_to_send.len());
        let queued: Vec<wire::NetAddress> = peer.addr_to_send.drain(..).collect();
        for address in queued {
            if peer.addr_known.contains(&address.key()) {
                continue;
            }
            peer.add_address_known(&address);
            batch.push(address);
            if batch.len() >= 1000 {
                // Receivers reject larger addr messages.
                self.connman
                    .push_message(id, NetMessage::Addr(std::mem::take(&mut batch)));
            }
        }
        if !batch.is_empty() {
            self.connman.push_message(id, NetMessage::Addr(batch));
        }
    }

    /// Kick off headers sync when this peer is a suitable source. Returns
    /// whether this peer may be used for block download this pass.
    fn start_header_sync_if_needed(&self, state: &mut NetState, id: PeerId, now: i64) -> bool {
        let preferred_count = state.preferred_download_count;
        let sync_count = state.sync_started_count;
        let Some(peer) = state.peer_mut(id) else {
            return false;
        };
        // Download from nice peers, or from whoever is available if no nice
        // peer exists.
        let fetch = peer.preferred_download
            || (preferred_count == 0 && !peer.client && !peer.flags.one_shot);
        if peer.sync_started
            || peer.client
            || self.chain.is_importing()
            || self.chain.is_reindexing()
        {
            return fetch;
        }
        let best_header = self.chain.best_header();
        let best_header_time = self.chain.header_time(best_header);
        let near_today = best_header_time > self.clock.adjusted_seconds() - 24 * 60 * 60;
        if (sync_count == 0 && fetch) || near_today {
            peer.sync_started = true;
            peer.headers_sync_timeout = now
                + HEADERS_DOWNLOAD_TIMEOUT_BASE
                + HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER
                    * ((self.clock.adjusted_seconds() - best_header_time).max(0)
                        / self.params.consensus.pow_target_spacing);
            state.sync_started_count += 1;
            // Start one block back so a caught-up peer still answers with a
            // non-empty batch we can seed its best-known block from.
            let pivot = self.chain.prev(best_header).unwrap_or(best_header);
            log_debug!(
                "initial getheaders ({}) to peer={id}",
                self.chain.height(pivot)
            );
            self.connman.push_message(
                id,
                NetMessage::GetHeaders(BlockLocator {
                    version: self.config.protocol_version as u32,
                    have: self.chain.locator(Some(pivot)),
                    stop: [0u8; 32],
                }),
            );
        }
        fetch
    }

    /// Headers-sync stall handling; true when the peer was dropped.
    fn check_headers_sync_timeout(&self, state: &mut NetState, id: PeerId, now: i64) -> bool {
        let sync_count = state.sync_started_count;
        let preferred_count = state.preferred_download_count;
        let best_header = self.chain.best_header();
        let caught_up =
            self.chain.header_time(best_header) > self.clock.adjusted_seconds() - 24 * 60 * 60;
        let Some(peer) = state.peer_mut(id) else {
            return false;
        };
        if !peer.sync_started || peer.headers_sync_timeout == i64::MAX {
            return false;
        }
        if caught_up {
            // Once caught up, this cannot trigger anymore.
            peer.headers_sync_timeout = i64::MAX;
            return false;
        }
        if now > peer.headers_sync_timeout
            && sync_count == 1
            && preferred_count - i32::from(peer.preferred_download) >= 1
        {
            // Sole sync peer stalled and we have alternatives.
            if !peer.flags.whitelisted {
                log_info!("timeout downloading headers from peer={id}, disconnecting");
                self.mark_for_disconnect_locked(state, id);
                return true;
            }
            log_info!(
                "timeout downloading headers from whitelisted peer={id}, not disconnecting"
            );
            // Reset so another peer gets a chance at the next pass.
            peer.sync_started = false;
            peer.headers_sync_timeout = 0;
            state.sync_started_count -= 1;
        }
        false
    }

    fn send_block_announcements(&self, state: &mut NetState, id: PeerId) {
        state.process_block_availability(id, self.chain.as_ref());
        let Some(peer) = state.peer(id) else {
            return;
        };
        if peer.blocks_to_announce.is_empty() {
            return;
        }
        let mut revert_to_inv = (!peer.prefer_headers
            && (!peer.prefer_header_and_ids || peer.blocks_to_announce.len() > 1))
            || peer.blocks_to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
        let mut headers = Vec::new();
        let mut best_queued = None;
        if !revert_to_inv {
            let mut found_start = false;
            for hash in &peer.blocks_to_announce {
                let Some(index) = self.chain.block_index(hash) else {
                    revert_to_inv = true;
                    break;
                };
                if self.chain.active_at(self.chain.height(index)) != Some(index) {
                    // Reorged away from this block.
                    revert_to_inv = true;
                    break;
                }
                if let Some(prior) = best_queued {
                    if self.chain.prev(index) != Some(prior) {
                        // Announced blocks that do not connect to each other.
                        revert_to_inv = true;
                        break;
                    }
                }
                best_queued = Some(index);
                if found_start {
                    headers.push(self.chain.block_header(index));
                    continue;
                }
                if peer_has_header(peer, index, self.chain.as_ref()) {
                    continue;
                }
                let prev = self.chain.prev(index);
                let prev_known = match prev {
                    Some(prev) => peer_has_header(peer, prev, self.chain.as_ref()),
                    None => true,
                };
                if prev_known {
                    found_start = true;
                    headers.push(self.chain.block_header(index));
                } else {
                    // Nothing we send would connect.
                    revert_to_inv = true;
                    break;
                }
            }
        }

        if !revert_to_inv && !headers.is_empty() {
            if let Some(best) = best_queued {
                if headers.len() == 1 && peer.prefer_header_and_ids {
                    // Probably caught up: a single announcement can go
                    // compact.
                    let hash = self.chain.block_hash(best);
                    let wants_witness = peer.wants_cmpct_witness;
                    log_debug!(
                        "sending header-and-ids {} to peer={id}",
                        hash256_to_hex(&hash)
                    );
                    let cached = self.chain.most_recent_compact_block(&hash);
                    let cmpct = match cached {
                        Some(cmpct) => Some(cmpct),
                        None => self.chain.net_request_block_data(&hash).map(|block| {
                            let mut nonce_bytes = [0u8; 8];
                            rand::thread_rng().fill_bytes(&mut nonce_bytes);
                            CompactBlock::from_block(
                                &block,
                                u64::from_le_bytes(nonce_bytes),
                                wants_witness,
                            )
                        }),
                    };
                    if let Some(cmpct) = cmpct {
                        self.connman.push_message(id, NetMessage::CmpctBlock(cmpct));
                        if let Some(peer) = state.peer_mut(id) {
                            peer.best_header_sent = Some(best);
                        }
                    } else if let Some(peer) = state.peer_mut(id) {
                        peer.push_inventory(Inv::new(MSG_BLOCK, hash));
                    }
                } else if peer.prefer_headers {
                    log_debug!("sending {} header(s) to peer={id}", headers.len());
                    self.connman.push_message(id, NetMessage::Headers(headers));
                    if let Some(peer) = state.peer_mut(id) {
                        peer.best_header_sent = Some(best);
                    }
                } else {
                    revert_to_inv = true;
                }
            } else {
                revert_to_inv = true;
            }
        }

        if revert_to_inv {
            // Just inv the tip-most announcement; the peer's own sync logic
            // recovers the rest.
            let last = state
                .peer(id)
                .and_then(|peer| peer.blocks_to_announce.last().copied());
            if let Some(hash) = last {
                let known = self
                    .chain
                    .block_index(&hash)
                    .map(|index| {
                        state
                            .peer(id)
                            .map(|peer| peer_has_header(peer, index, self.chain.as_ref()))
                            .unwrap_or(true)
                    })
                    .unwrap_or(false);
                if !known {
                    if let Some(peer) = state.peer_mut(id) {
                        peer.push_inventory(Inv::new(MSG_BLOCK, hash));
                        log_debug!("sending inv peer={id} hash={}", hash256_to_hex(&hash));
                    }
                }
            }
        }
        if let Some(peer) = state.peer_mut(id) {
            peer.blocks_to_announce.clear();
        }
    }

    fn send_inventory_trickle(&self, state: &mut NetState, id: PeerId, now: i64) {
        let Some(peer) = state.peer_mut(id) else {
            return;
        };
        let mut inv: Vec<Inv> = Vec::new();
        for hash in peer.inv_blocks_to_send.drain(..) {
            inv.push(Inv::new(MSG_BLOCK, hash));
            if inv.len() == MAX_INV_SZ {
                self.connman
                    .push_message(id, NetMessage::Inv(std::mem::take(&mut inv)));
            }
        }

        let mut trickle = peer.flags.whitelisted;
        if peer.next_inv_send < now {
            trickle = true;
            // Outbound peers get half the delay; their privacy exposure is
            // lower.
            let interval = if peer.flags.inbound {
                INVENTORY_BROADCAST_INTERVAL_SECS
            } else {
                INVENTORY_BROADCAST_INTERVAL_SECS >> 1
            };
            peer.next_inv_send = poisson_next_send(now, interval);
        }
        if trickle {
            if !peer.relay_txes {
                peer.tx_inv_to_send.clear();
            }
            let candidates: Vec<Hash256> = peer.tx_inv_to_send.iter().copied().collect();
            let send_mempool = peer.send_mempool;
            let fee_filter = peer.fee_filter_received;
            let result =
                self.pool
                    .tx_inventory(send_mempool, fee_filter, peer.filter.as_ref(), candidates);
            if send_mempool {
                peer.send_mempool = false;
                peer.last_mempool_req = self.clock.unix_seconds();
            }
            peer.tx_inv_to_send.clear();
            for hash in result.keep {
                peer.tx_inv_to_send.insert(hash);
            }
            for hash in result.to_send {
                peer.known_inventory.insert(hash);
                inv.push(Inv::new(MSG_TX, hash));
                if inv.len() == MAX_INV_SZ {
                    self.connman
                        .push_message(id, NetMessage::Inv(std::mem::take(&mut inv)));
                }
            }
        }
        if !inv.is_empty() {
            self.connman.push_message(id, NetMessage::Inv(inv));
        }
    }

    fn request_blocks(&self, state: &mut NetState, id: PeerId, fetch: bool, now: i64) {
        let (client, in_flight_count) = match state.peer(id) {
            Some(peer) => (peer.client, peer.blocks_in_flight.len()),
            None => return,
        };
        if client
            || (!fetch && self.chain.is_initial_block_download())
            || in_flight_count >= MAX_BLOCKS_IN_TRANSIT_PER_PEER
        {
            return;
        }
        let budget = MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight_count;
        let (to_download, staller) =
            find_next_blocks_to_download(state, self.chain.as_ref(), id, budget);
        let mut get_data = Vec::with_capacity(to_download.len());
        for index in &to_download {
            let flags = state
                .peer(id)
                .map(|peer| self.fetch_flags(peer))
                .unwrap_or(0);
            let hash = self.chain.block_hash(*index);
            get_data.push(Inv::new(MSG_BLOCK | flags, hash));
            state.mark_block_in_flight(id, hash, Some(*index), now);
            log_debug!(
                "requesting block {} ({}) peer={id}",
                hash256_to_hex(&hash),
                self.chain.height(*index)
            );
        }
        if !get_data.is_empty() {
            self.connman.push_message(id, NetMessage::GetData(get_data));
        }
        let still_empty = state
            .peer(id)
            .map(|peer| peer.blocks_in_flight.is_empty())
            .unwrap_or(false);
        if still_empty {
            if let Some(staller) = staller {
                if let Some(peer) = state.peer_mut(staller) {
                    if peer.stalling_since == 0 {
                        peer.stalling_since = now;
                        log_debug!("stall started peer={staller}");
                    }
                }
            }
        }
    }

    fn request_non_blocks(&self, state: &mut NetState, id: PeerId, now: i64) {
        let mut get_data: Vec<Inv> = Vec::new();
        {
            let Some(peer) = state.peer_mut(id) else {
                return;
            };
            while let Some((due, inv)) = peer.ask_for.front().copied() {
                if due > now {
                    break;
                }
                peer.ask_for.pop_front();
                if !self.already_have(&inv) {
                    log_debug!("requesting {} peer={id}", hash256_to_hex(&inv.hash));
                    get_data.push(inv);
                    if get_data.len() >= 1000 {
                        self.connman
                            .push_message(id, NetMessage::GetData(std::mem::take(&mut get_data)));
                    }
                } else {
                    // Not asking: don't expect a response either.
                    peer.ask_for_set.remove(&inv.hash);
                }
            }
        }
        if !get_data.is_empty() {
            self.connman.push_message(id, NetMessage::GetData(get_data));
        }
    }

    fn maybe_send_fee_filter(&self, state: &mut NetState, id: PeerId, now: i64) {
        if !self.config.fee_filter {
            return;
        }
        let Some(peer) = state.peer_mut(id) else {
            return;
        };
        if peer.version < FEEFILTER_VERSION {
            return;
        }
        if peer.flags.whitelisted && self.config.whitelist_force_relay {
            return;
        }
        let current = self
            .pool
            .min_fee_rate(self.config.max_mempool_mb * 1_000_000);
        if now > peer.next_send_fee_filter {
            let filter = round_fee_filter(current).max(DEFAULT_MIN_RELAY_TX_FEE);
            if filter != peer.fee_filter_sent {
                self.connman.push_message(id, NetMessage::FeeFilter(filter));
                peer.fee_filter_sent = filter;
            }
            peer.next_send_fee_filter =
                poisson_next_send(now, AVG_FEEFILTER_BROADCAST_INTERVAL_SECS);
        } else if now + MAX_FEEFILTER_CHANGE_DELAY_SECS * 1_000_000 < peer.next_send_fee_filter
            && (current < 3 * peer.fee_filter_sent / 4 || current > 4 * peer.fee_filter_sent / 3)
        {
            // Substantial change: move the broadcast up.
            let jitter = (rand::random::<u64>() % MAX_FEEFILTER_CHANGE_DELAY_SECS as u64) as i64;
            peer.next_send_fee_filter = now + jitter * 1_000_000;
        }
    }
}

/// Round a fee rate to two significant digits so filter values leak less
/// about mempool composition.
pub(crate) fn round_fee_filter(rate: i64) -> i64 {
    if rate <= 0 {
        return 0;
    }
    let mut significand = rate;
    let mut scale = 1i64;
    while significand >= 100 {
        significand /= 10;
        scale *= 10;
    }
    significand * scale
}

pub(crate) fn strip_witness_tx(mut tx: Transaction) -> Transaction {
    for input in &mut tx.inputs {
        input.witness.clear();
    }
    tx
}

pub(crate) fn strip_witness_block(mut block: Block) -> Block {
    for tx in &mut block.txs {
        for input in &mut tx.inputs {
            input.witness.clear();
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_filter_rounding() {
        assert_eq!(round_fee_filter(0), 0);
        assert_eq!(round_fee_filter(999), 990);
        assert_eq!(round_fee_filter(1000), 1000);
        assert_eq!(round_fee_filter(123_456), 120_000);
        assert_eq!(round_fee_filter(45), 45);
    }
}
