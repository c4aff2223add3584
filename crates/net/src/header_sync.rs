//! Headers-first synchronization: processing announced headers, the
//! unconnecting-headers discipline, direct fetch near the tip, and the
//! compact-block ingestion paths that feed the same machinery.

use std::sync::atomic::{AtomicBool, Ordering};

use rookd_consensus::{hash256_to_hex, Hash256};
use rookd_log::{log_debug, log_error, log_info};
use rookd_primitives::{BlockHeader, Decoder};

use crate::collab::{ChainEngine, ConnMan, TxPool};
use crate::compact::{
    parse_blocktxn, parse_cmpctblock, BlockTxnRequest, BlockTxnResponse, FillStatus, InitStatus,
    PartialBlock,
};
use crate::download::MAX_BLOCKS_IN_TRANSIT_PER_PEER;
use crate::peer::PeerId;
use crate::processor::{HandlerError, NetProcessor, MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT};
use crate::state::MarkInFlight;
use crate::wire::{BlockLocator, Inv, NetMessage, MSG_BLOCK, MSG_CMPCT_BLOCK};

/// Largest headers batch a peer may send, and the size that means "there
/// is more where that came from".
pub const MAX_HEADERS_RESULTS: usize = 2000;
/// Announcements longer than this never come from honest block relay.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;
/// Consecutive unconnecting header messages tolerated between penalties.
pub const MAX_UNCONNECTING_HEADERS: i32 = 10;
/// Base headers-sync deadline.
pub const HEADERS_DOWNLOAD_TIMEOUT_BASE: i64 = 15 * 60 * 1_000_000;
/// Additional allowance per expected header.
pub const HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER: i64 = 1_000;

impl<C, T, N> NetProcessor<C, T, N>
where
    C: ChainEngine,
    T: TxPool,
    N: ConnMan,
{
    pub(crate) fn process_headers_msg(
        &self,
        id: PeerId,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        // Bypass full block deserialization: a headers payload is just
        // eighty-byte headers, each trailed by a zero transaction count.
        let mut decoder = Decoder::new(payload);
        let count = decoder.read_varint()?;
        if count as usize > MAX_HEADERS_RESULTS {
            let mut state = self.state();
            state.misbehaving(id, 20, self.config.ban_threshold);
            return Err(HandlerError::Protocol(format!(
                "headers message size = {count}"
            )));
        }
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            headers.push(BlockHeader::consensus_decode_from(&mut decoder)?);
            // Ignore the transaction count; it is zero on the wire.
            decoder.read_varint()?;
        }
        let punish_duplicate_invalid = {
            let state = self.state();
            match state.peer(id) {
                Some(peer) => !peer.flags.inbound && !peer.flags.manual,
                None => return Ok(()),
            }
        };
        self.process_headers_message(id, &headers, punish_duplicate_invalid)
    }

    /// Core headers handling, shared by the headers message and the
    /// announcement paths of compact blocks.
    pub(crate) fn process_headers_message(
        &self,
        id: PeerId,
        headers: &[BlockHeader],
        punish_duplicate_invalid: bool,
    ) -> Result<(), HandlerError> {
        if headers.is_empty() {
            // Nothing interesting; stop asking this peer for more headers.
            return Ok(());
        }

        let mut received_new_header = false;
        {
            let mut state = self.state();
            // A short batch whose first header does not connect looks like
            // a block announcement across a gap: ask for the connecting
            // headers instead of penalizing, up to a streak limit.
            if self.chain.block_index(&headers[0].prev_hash).is_none()
                && headers.len() < MAX_BLOCKS_TO_ANNOUNCE
            {
                let streak = match state.peer_mut(id) {
                    Some(peer) => {
                        peer.unconnecting_headers += 1;
                        peer.unconnecting_headers
                    }
                    None => return Ok(()),
                };
                self.connman.push_message(
                    id,
                    NetMessage::GetHeaders(BlockLocator {
                        version: self.config.protocol_version as u32,
                        have: self.chain.locator(Some(self.chain.best_header())),
                        stop: [0u8; 32],
                    }),
                );
                let last_hash = headers[headers.len() - 1].hash();
                log_debug!(
                    "received header {}: missing prev block {}, sending getheaders (peer={id}, unconnecting={streak})",
                    hash256_to_hex(&last_hash),
                    hash256_to_hex(&headers[0].prev_hash)
                );
                // Remember the tip announcement so this peer becomes a
                // download candidate once the headers arrive from anywhere.
                state.update_block_availability(id, &last_hash, self.chain.as_ref());
                if streak % MAX_UNCONNECTING_HEADERS == 0 {
                    state.misbehaving(id, 20, self.config.ban_threshold);
                }
                return Ok(());
            }

            let mut last_hash: Option<Hash256> = None;
            for header in headers {
                if let Some(expected) = last_hash {
                    if header.prev_hash != expected {
                        state.misbehaving(id, 20, self.config.ban_threshold);
                        return Err(HandlerError::Protocol(
                            "non-continuous headers sequence".to_string(),
                        ));
                    }
                }
                last_hash = Some(header.hash());
            }
            if let Some(last_hash) = last_hash {
                if self.chain.block_index(&last_hash).is_none() {
                    received_new_header = true;
                }
            }
        }

        let outcome = self.chain.process_new_block_headers(headers);
        if !outcome.accepted {
            {
                let mut state = self.state();
                if outcome.dos_score > 0 {
                    state.misbehaving(id, outcome.dos_score, self.config.ban_threshold);
                }
            }
            let duplicate_invalid = outcome
                .first_invalid
                .map(|hash| self.chain.block_index(&hash).is_some())
                .unwrap_or(false);
            if punish_duplicate_invalid && duplicate_invalid {
                // The peer announced a block we already know to be invalid
                // as part of its active chain; don't let it hold an
                // outbound slot.
                self.mark_for_disconnect(id);
            }
            return Err(HandlerError::Protocol(format!(
                "invalid header received: {}",
                outcome.reason
            )));
        }
        let Some(last_index) = outcome.last else {
            return Ok(());
        };

        let now = self.clock.unix_micros();
        let mut state = self.state();
        let state = &mut *state;

        if let Some(peer) = state.peer_mut(id) {
            if peer.unconnecting_headers > 0 {
                log_debug!(
                    "peer={id}: resetting unconnecting headers ({} -> 0)",
                    peer.unconnecting_headers
                );
            }
            peer.unconnecting_headers = 0;
        }
        let last_hash = self.chain.block_hash(last_index);
        state.update_block_availability(id, &last_hash, self.chain.as_ref());

        let tip = self.chain.tip();
        if received_new_header && self.chain.chain_work(last_index) > self.chain.chain_work(tip) {
            if let Some(peer) = state.peer_mut(id) {
                peer.last_block_announcement = self.clock.unix_seconds();
            }
        }

        if headers.len() == MAX_HEADERS_RESULTS {
            // A maximum-size batch: the peer likely has more headers for us.
            log_debug!(
                "more getheaders ({}) to end to peer={id}",
                self.chain.height(last_index)
            );
            self.connman.push_message(
                id,
                NetMessage::GetHeaders(BlockLocator {
                    version: self.config.protocol_version as u32,
                    have: self.chain.locator(Some(last_index)),
                    stop: [0u8; 32],
                }),
            );
        }

        // Direct fetch: when the set of validated headers ends at least as
        // heavy as our tip and we are near the present, request the bodies
        // immediately rather than waiting for the scheduler.
        let can_direct_fetch = self.can_direct_fetch();
        if can_direct_fetch
            && self.chain.is_valid_tree(last_index)
            && self.chain.chain_work(tip) <= self.chain.chain_work(last_index)
        {
            let have_witness = state
                .peer(id)
                .map(|peer| peer.have_witness)
                .unwrap_or(false);
            let mut to_fetch = Vec::new();
            let mut walk = Some(last_index);
            while let Some(at) = walk {
                if self.chain.contains(at) || to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                    break;
                }
                let hash = self.chain.block_hash(at);
                if !self.chain.has_data(at)
                    && !state.is_block_in_flight(&hash)
                    && (!self.chain.witness_enabled(self.chain.prev(at)) || have_witness)
                {
                    to_fetch.push(at);
                }
                walk = self.chain.prev(at);
            }
            let anchored = walk.map(|at| self.chain.contains(at)).unwrap_or(false);
            if !anchored {
                // A reorg this large while close to the tip is off; let the
                // parallel download logic sort it out.
                log_debug!(
                    "large reorg, won't direct fetch to {} ({})",
                    hash256_to_hex(&last_hash),
                    self.chain.height(last_index)
                );
            } else {
                let mut get_data: Vec<Inv> = Vec::new();
                for index in to_fetch.iter().rev() {
                    let (room, flags) = match state.peer(id) {
                        Some(peer) => (
                            peer.blocks_in_flight.len() < MAX_BLOCKS_IN_TRANSIT_PER_PEER,
                            self.fetch_flags(peer),
                        ),
                        None => break,
                    };
                    if !room {
                        break;
                    }
                    let hash = self.chain.block_hash(*index);
                    get_data.push(Inv::new(MSG_BLOCK | flags, hash));
                    state.mark_block_in_flight(id, hash, Some(*index), now);
                    log_debug!("requesting block {} from peer={id}", hash256_to_hex(&hash));
                }
                if get_data.len() > 1 {
                    log_debug!(
                        "downloading blocks toward {} ({}) via headers direct fetch",
                        hash256_to_hex(&last_hash),
                        self.chain.height(last_index)
                    );
                }
                if !get_data.is_empty() {
                    let supports_cmpct = state
                        .peer(id)
                        .map(|peer| peer.supports_desired_cmpct_version)
                        .unwrap_or(false);
                    let prior_valid = self
                        .chain
                        .prev(last_index)
                        .map(|prev| self.chain.is_valid_chain(prev))
                        .unwrap_or(false);
                    if supports_cmpct
                        && get_data.len() == 1
                        && state.in_flight.len() == 1
                        && prior_valid
                    {
                        // A single fresh block from a capable peer: prefer
                        // the compact encoding.
                        get_data[0] = Inv::new(MSG_CMPCT_BLOCK, get_data[0].hash);
                    }
                    self.connman.push_message(id, NetMessage::GetData(get_data));
                }
            }
        }

        // During initial download, outbound slots are too precious for
        // peers whose chain can never help us.
        if self.chain.is_initial_block_download() && headers.len() != MAX_HEADERS_RESULTS {
            let insufficient = state
                .peer(id)
                .and_then(|peer| peer.best_known_block)
                .map(|best| self.chain.chain_work(best) < self.chain.min_chain_work())
                .unwrap_or(false);
            let candidate = state
                .peer(id)
                .map(|peer| peer.is_outbound_disconnection_candidate())
                .unwrap_or(false);
            if insufficient && candidate {
                log_info!(
                    "disconnecting outbound peer={id} -- headers chain has insufficient work"
                );
                self.mark_for_disconnect_locked(state, id);
            }
        }

        // Outbound peers serving a chain at least as good as ours earn
        // protection from the chain-quality eviction, up to a quota.
        let eligible = state
            .peer(id)
            .map(|peer| {
                !peer.disconnect
                    && peer.is_outbound_disconnection_candidate()
                    && peer.best_known_block.is_some()
            })
            .unwrap_or(false);
        if eligible
            && state.protected_outbound_count < MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT
        {
            let qualifies = state
                .peer(id)
                .and_then(|peer| peer.best_known_block)
                .map(|best| self.chain.chain_work(best) >= self.chain.chain_work(tip))
                .unwrap_or(false);
            if qualifies {
                if let Some(peer) = state.peer_mut(id) {
                    if !peer.chain_sync.protect {
                        log_debug!("protecting outbound peer={id} from eviction");
                        peer.chain_sync.protect = true;
                        state.protected_outbound_count += 1;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn process_blocktxn_msg(
        &self,
        id: PeerId,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let response = parse_blocktxn(payload)?;
        self.handle_block_transactions(id, response, interrupt)
    }

    /// Shared tail of blocktxn processing; the compact-block handler jumps
    /// here with a synthesized empty response when nothing was missing.
    pub(crate) fn handle_block_transactions(
        &self,
        id: PeerId,
        response: BlockTxnResponse,
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let hash = response.block_hash;
        let mut block_to_process = None;
        {
            let mut state = self.state();
            if state.in_flight_owner(&hash) != Some(id) {
                log_error!(
                    "peer={id} sent us block transactions for block we weren't expecting"
                );
                return Ok(());
            }
            let fill = state.in_flight_entry_mut(&hash).and_then(|entry| {
                entry
                    .partial
                    .as_ref()
                    .map(|partial| partial.fill(&response.transactions))
            });
            let Some(fill) = fill else {
                log_error!(
                    "peer={id} sent us block transactions for block we weren't expecting"
                );
                return Ok(());
            };
            let now = self.clock.unix_micros();
            match fill {
                FillStatus::Invalid => {
                    // Clear the in-flight state so whitelisted peers can
                    // recover, then grade the abuse.
                    state.mark_block_received(&hash, now);
                    state.misbehaving(id, 100, self.config.ban_threshold);
                    log_error!(
                        "peer={id} sent us invalid compact block/non-matching block transactions"
                    );
                    return Ok(());
                }
                FillStatus::Failed => {
                    // Short-id collision: re-request the block in full.
                    let flags = state
                        .peer(id)
                        .map(|peer| self.fetch_flags(peer))
                        .unwrap_or(0);
                    self.connman.push_message(
                        id,
                        NetMessage::GetData(vec![Inv::new(MSG_BLOCK | flags, hash)]),
                    );
                    return Ok(());
                }
                FillStatus::Block(block) => {
                    state.mark_block_received(&hash, now);
                    // Compact announcements may be relayed before full
                    // validation; never punish the peer for this block.
                    state.block_source.insert(hash, (id, false));
                    block_to_process = Some(block);
                }
            }
        }
        if let Some(block) = block_to_process {
            if interrupt.load(Ordering::Relaxed) {
                return Ok(());
            }
            // We requested this block, so process it even when it is no
            // candidate for the new tip.
            let is_new = self.chain.process_new_block(&block, true);
            let mut state = self.state();
            if is_new {
                if let Some(peer) = state.peer_mut(id) {
                    peer.last_block_time = self.clock.unix_seconds();
                }
            } else {
                state.block_source.remove(&hash);
            }
        }
        Ok(())
    }

    pub(crate) fn process_cmpctblock_msg(
        &self,
        id: PeerId,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let cmpct = parse_cmpctblock(payload)?;
        let block_hash = cmpct.block_hash();

        let received_new_header;
        {
            let _state = self.state();
            if self.chain.block_index(&cmpct.header.prev_hash).is_none() {
                // Does not connect: instead of risking a penalty in header
                // acceptance, ask for the intermediate headers.
                if !self.chain.is_initial_block_download() {
                    self.connman.push_message(
                        id,
                        NetMessage::GetHeaders(BlockLocator {
                            version: self.config.protocol_version as u32,
                            have: self.chain.locator(Some(self.chain.best_header())),
                            stop: [0u8; 32],
                        }),
                    );
                }
                return Ok(());
            }
            received_new_header = self.chain.block_index(&block_hash).is_none();
        }

        let outcome = self
            .chain
            .process_new_block_headers(std::slice::from_ref(&cmpct.header));
        if !outcome.accepted {
            if outcome.dos_score > 0 {
                let mut state = self.state();
                state.misbehaving(id, outcome.dos_score, self.config.ban_threshold);
            }
            return Err(HandlerError::Protocol(format!(
                "peer={id} sent us invalid header via cmpctblock"
            )));
        }
        let Some(index) = outcome.last else {
            return Ok(());
        };

        enum Next {
            Done,
            JumpToBlockTxn(BlockTxnResponse),
            RevertToHeaders,
            Reconstructed(rookd_primitives::Block),
        }

        let now = self.clock.unix_micros();
        let next = {
            let mut state = self.state();
            let state = &mut *state;
            state.update_block_availability(id, &block_hash, self.chain.as_ref());

            let tip = self.chain.tip();
            if received_new_header
                && self.chain.chain_work(index) > self.chain.chain_work(tip)
            {
                if let Some(peer) = state.peer_mut(id) {
                    peer.last_block_announcement = self.clock.unix_seconds();
                }
            }

            let already_in_flight_to = state.in_flight_owner(&block_hash);
            let already_in_flight = already_in_flight_to.is_some();

            if self.chain.has_data(index) {
                // Nothing to do here.
                Next::Done
            } else if self.chain.chain_work(index) <= self.chain.chain_work(tip)
                || self.chain.n_tx(index) != 0
            {
                // We know something better, or had this block and pruned
                // it; our mempool is unlikely to help reconstruct.
                if already_in_flight {
                    let flags = state
                        .peer(id)
                        .map(|peer| self.fetch_flags(peer))
                        .unwrap_or(0);
                    self.connman.push_message(
                        id,
                        NetMessage::GetData(vec![Inv::new(MSG_BLOCK | flags, block_hash)]),
                    );
                }
                Next::Done
            } else if !already_in_flight && !self.can_direct_fetch() {
                // Not close to the tip: parallel block fetch will handle it.
                Next::Done
            } else if self.chain.witness_enabled(self.chain.prev(index))
                && !state
                    .peer(id)
                    .map(|peer| peer.supports_desired_cmpct_version)
                    .unwrap_or(false)
            {
                // Not worth processing compact blocks from peers on the
                // wrong version once witness rules apply.
                Next::Done
            } else if self.chain.height(index) <= self.chain.height(tip) + 2 {
                // Conservative window for direct reconstruction.
                let in_flight_count = state
                    .peer(id)
                    .map(|peer| peer.blocks_in_flight.len())
                    .unwrap_or(MAX_BLOCKS_IN_TRANSIT_PER_PEER);
                let claimable = (!already_in_flight
                    && in_flight_count < MAX_BLOCKS_IN_TRANSIT_PER_PEER)
                    || already_in_flight_to == Some(id);
                if claimable {
                    let mut fresh_claim = true;
                    if state.mark_block_in_flight(id, block_hash, Some(index), now)
                        == MarkInFlight::AlreadyOwnedBySamePeer
                    {
                        let has_partial = state
                            .in_flight_entry_mut(&block_hash)
                            .map(|entry| entry.partial.is_some())
                            .unwrap_or(false);
                        if has_partial {
                            log_debug!("peer={id} sent us a compact block we were already syncing");
                            fresh_claim = false;
                        }
                    }
                    if !fresh_claim {
                        Next::Done
                    } else {
                        let mempool = self.pool.snapshot();
                        match PartialBlock::init(&cmpct, &mempool) {
                            InitStatus::Invalid => {
                                state.mark_block_received(&block_hash, now);
                                state.misbehaving(id, 100, self.config.ban_threshold);
                                log_error!("peer={id} sent us an invalid compact block");
                                Next::Done
                            }
                            InitStatus::Failed => {
                                // Duplicate short ids; the block stays in
                                // flight, just fetch it whole.
                                let flags = state
                                    .peer(id)
                                    .map(|peer| self.fetch_flags(peer))
                                    .unwrap_or(0);
                                self.connman.push_message(
                                    id,
                                    NetMessage::GetData(vec![Inv::new(
                                        MSG_BLOCK | flags,
                                        block_hash,
                                    )]),
                                );
                                Next::Done
                            }
                            InitStatus::Ready(partial) => {
                                let missing = partial.missing_indexes();
                                if let Some(entry) = state.in_flight_entry_mut(&block_hash) {
                                    entry.partial = Some(partial);
                                }
                                if missing.is_empty() {
                                    // Everything reconstructed from the
                                    // mempool: continue on the blocktxn
                                    // path with an empty delivery.
                                    Next::JumpToBlockTxn(BlockTxnResponse {
                                        block_hash,
                                        transactions: Vec::new(),
                                    })
                                } else {
                                    self.connman.push_message(
                                        id,
                                        NetMessage::GetBlockTxn(BlockTxnRequest {
                                            block_hash,
                                            indexes: missing,
                                        }),
                                    );
                                    Next::Done
                                }
                            }
                        }
                    }
                } else {
                    // In flight from another peer, or this peer is full.
                    // Try to reconstruct from the mempool without claiming
                    // ownership; a success saves the round trips.
                    let mempool = self.pool.snapshot();
                    match PartialBlock::init(&cmpct, &mempool) {
                        InitStatus::Ready(partial) => match partial.fill(&[]) {
                            FillStatus::Block(block) => Next::Reconstructed(block),
                            _ => Next::Done,
                        },
                        _ => Next::Done,
                    }
                }
            } else if already_in_flight {
                // Far from the tip but requested: the mempool will be
                // useless, take the block whole.
                let flags = state
                    .peer(id)
                    .map(|peer| self.fetch_flags(peer))
                    .unwrap_or(0);
                self.connman.push_message(
                    id,
                    NetMessage::GetData(vec![Inv::new(MSG_BLOCK | flags, block_hash)]),
                );
                Next::Done
            } else {
                // An announcement beyond the reconstruction window gets the
                // same treatment as a headers message.
                Next::RevertToHeaders
            }
        };

        match next {
            Next::Done => Ok(()),
            Next::JumpToBlockTxn(response) => {
                self.handle_block_transactions(id, response, interrupt)
            }
            Next::RevertToHeaders => {
                // Compact announcements may precede full validation, so a
                // bad header here is never grounds for disconnection.
                self.process_headers_message(
                    id,
                    std::slice::from_ref(&cmpct.header),
                    false,
                )
            }
            Next::Reconstructed(block) => {
                {
                    let mut state = self.state();
                    state.block_source.insert(block_hash, (id, false));
                }
                if interrupt.load(Ordering::Relaxed) {
                    return Ok(());
                }
                // Requested-equivalent: we only reconstruct near the tip
                // with more work than ours, so force processing is safe.
                let is_new = self.chain.process_new_block(&block, true);
                {
                    let mut state = self.state();
                    if is_new {
                        if let Some(peer) = state.peer_mut(id) {
                            peer.last_block_time = self.clock.unix_seconds();
                        }
                    } else {
                        state.block_source.remove(&block_hash);
                    }
                    if self.chain.is_valid_transactions(index) {
                        // The block came through; clear the other peer's
                        // download slot only after validation so malleated
                        // announcements cannot disturb relay.
                        state.mark_block_received(&block_hash, self.clock.unix_micros());
                    }
                }
                Ok(())
            }
        }
    }
}
