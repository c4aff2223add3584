//! Per-command message handlers and the dispatch table.

use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use rookd_consensus::constants::{
    money_range, BIP0031_VERSION, CADDR_TIME_VERSION, MAX_SCRIPT_ELEMENT_SIZE,
    MIN_PEER_PROTO_VERSION, NODE_BLOOM, NODE_NETWORK, NODE_WITNESS, NO_BLOOM_VERSION,
    PROTOCOL_VERSION, REJECT_DUPLICATE, REJECT_NONSTANDARD, REJECT_OBSOLETE, SENDHEADERS_VERSION,
    SHORT_IDS_BLOCKS_VERSION,
};
use rookd_consensus::hash256_to_hex;
use rookd_log::{log_debug, log_error, log_info};
use rookd_primitives::{sha256d, Block, Decoder, Transaction};

use crate::bloom::{parse_filterload, BloomFilter};
use crate::collab::{BlockTxnReply, ChainEngine, ConnMan, TxPool};
use crate::compact::parse_getblocktxn;
use crate::peer::{HandshakePhase, PeerId};
use crate::processor::{HandlerError, NetProcessor, MAX_INV_SZ, RANDOMIZER_ID_ADDRESS_RELAY};
use crate::state::NetState;
use crate::wire::{
    self, BlockLocator, Inv, NetAddress, NetMessage, RejectMessage, MSG_BLOCK,
};

/// Largest addr message we accept.
pub const MAX_ADDR_SZ: usize = 1000;

impl<C, T, N> NetProcessor<C, T, N>
where
    C: ChainEngine,
    T: TxPool,
    N: ConnMan,
{
    /// Route one validated frame to its handler, enforcing the handshake
    /// preconditions.
    pub(crate) fn process_message(
        &self,
        id: PeerId,
        command: &str,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        log_debug!("received: {command} ({} bytes) peer={id}", payload.len());

        if self.config.drop_messages_test > 0
            && rand::thread_rng().gen_range(0..self.config.drop_messages_test) == 0
        {
            log_debug!("dropmessagestest dropping recv message");
            return Ok(());
        }

        if self.config.local_services & NODE_BLOOM == 0
            && matches!(command, "filterload" | "filteradd")
        {
            let version = self
                .state()
                .peer(id)
                .map(|peer| peer.version)
                .unwrap_or(0);
            if version >= NO_BLOOM_VERSION {
                let mut state = self.state();
                state.misbehaving(id, 100, self.config.ban_threshold);
                return Err(HandlerError::Protocol(
                    "bloom message from peer without service permission".to_string(),
                ));
            }
            self.mark_for_disconnect(id);
            return Ok(());
        }

        if command == "reject" {
            return self.process_reject_msg(id, payload);
        }
        if command == "version" {
            return self.process_version_msg(id, payload);
        }

        let (version_known, connected) = {
            let state = self.state();
            match state.peer(id) {
                Some(peer) => (peer.version != 0, peer.handshake_complete()),
                None => return Ok(()),
            }
        };
        if !version_known {
            // Must have a version message before anything else.
            let mut state = self.state();
            state.misbehaving(id, 1, self.config.ban_threshold);
            return Err(HandlerError::Protocol(
                "message received before version".to_string(),
            ));
        }
        if command == "verack" {
            return self.process_verack_msg(id);
        }
        if !connected {
            // Must have a verack message before anything else.
            let mut state = self.state();
            state.misbehaving(id, 1, self.config.ban_threshold);
            return Err(HandlerError::Protocol(
                "message received before verack".to_string(),
            ));
        }

        let quiet_import = self.chain.is_importing() || self.chain.is_reindexing();
        match command {
            "getaddr" => self.process_getaddr_msg(id),
            "addr" => self.process_addr_msg(id, payload, interrupt),
            "sendheaders" => self.process_sendheaders_msg(id),
            "sendcmpct" => self.process_sendcmpct_msg(id, payload),
            "ping" => self.process_ping_msg(id, payload),
            "pong" => self.process_pong_msg(id, payload),
            "filterload" => self.process_filterload_msg(id, payload),
            "filteradd" => self.process_filteradd_msg(id, payload),
            "filterclear" => self.process_filterclear_msg(id),
            "feefilter" => self.process_feefilter_msg(id, payload),
            "checkpoint" => self.process_checkpoint_msg(id, payload),
            "getcheckpoint" => self.process_getcheckpoint_msg(id, payload),
            "mempool" => self.process_mempool_msg(id),
            "getblocks" => self.process_getblocks_msg(id, payload),
            "inv" => self.process_inv_msg(id, payload, interrupt),
            "getheaders" => self.process_getheaders_msg(id, payload),
            "headers" if quiet_import => Ok(()),
            "headers" => self.process_headers_msg(id, payload),
            "getdata" => self.process_getdata_msg(id, payload, interrupt),
            "block" if quiet_import => Ok(()),
            "block" => self.process_block_msg(id, payload, interrupt),
            "tx" => self.process_tx_msg(id, payload),
            "getblocktxn" => self.process_getblocktxn_msg(id, payload),
            "blocktxn" if quiet_import => Ok(()),
            "blocktxn" => self.process_blocktxn_msg(id, payload, interrupt),
            "cmpctblock" if quiet_import => Ok(()),
            "cmpctblock" => self.process_cmpctblock_msg(id, payload, interrupt),
            "notfound" => {
                // We transmit notfound ourselves; stay quiet about it.
                Ok(())
            }
            other => {
                log_debug!("unknown command \"{other}\" from peer={id}");
                Ok(())
            }
        }
    }

    fn process_reject_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        // Never answer a reject with a reject; a parse failure is only
        // logged.
        match wire::parse_reject(payload) {
            Ok(reject) => {
                if let Some(hash) = reject.hash {
                    log_debug!(
                        "reject {} code {:#04x}: {}: hash {}",
                        reject.message,
                        reject.code,
                        reject.reason,
                        hash256_to_hex(&hash)
                    );
                } else {
                    log_debug!(
                        "reject {} code {:#04x}: {}",
                        reject.message,
                        reject.code,
                        reject.reason
                    );
                }
            }
            Err(_) => log_error!("unparseable reject message received, peer={id}"),
        }
        Ok(())
    }

    fn process_version_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        {
            let state = self.state();
            let Some(peer) = state.peer(id) else {
                return Ok(());
            };
            if peer.version != 0 {
                drop(state);
                self.connman.push_message(
                    id,
                    NetMessage::Reject(RejectMessage::new(
                        "version",
                        REJECT_DUPLICATE,
                        "Duplicate version message",
                    )),
                );
                let mut state = self.state();
                state.misbehaving(id, 1, self.config.ban_threshold);
                return Err(HandlerError::Protocol("duplicate version".to_string()));
            }
        }
        let message = wire::parse_version(payload)?;

        let (inbound, one_shot, feeler, addr) = {
            let state = self.state();
            match state.peer(id) {
                Some(peer) => (
                    peer.flags.inbound,
                    peer.flags.one_shot,
                    peer.flags.feeler,
                    peer.addr,
                ),
                None => return Ok(()),
            }
        };

        if !inbound && message.services & NODE_NETWORK == 0 {
            log_info!(
                "peer={id} does not offer the expected services ({:08x} offered); disconnecting",
                message.services
            );
            self.connman.push_message(
                id,
                NetMessage::Reject(RejectMessage::new(
                    "version",
                    REJECT_NONSTANDARD,
                    &format!("Expected to offer services {NODE_NETWORK:08x}"),
                )),
            );
            self.mark_for_disconnect(id);
            return Ok(());
        }
        if message.version < MIN_PEER_PROTO_VERSION {
            // Disconnect from peers older than this protocol version.
            log_info!("peer={id} using obsolete version {}; disconnecting", message.version);
            self.connman.push_message(
                id,
                NetMessage::Reject(RejectMessage::new(
                    "version",
                    REJECT_OBSOLETE,
                    &format!("Version must be {MIN_PEER_PROTO_VERSION} or greater"),
                )),
            );
            self.mark_for_disconnect(id);
            return Ok(());
        }
        if inbound && !self.connman.check_incoming_nonce(message.nonce) {
            log_info!("connected to self at {addr}, disconnecting");
            self.mark_for_disconnect(id);
            return Ok(());
        }

        // Be shy: answer an inbound version before greeting back.
        if inbound {
            self.push_node_version(id, addr);
        }
        self.connman.push_message(id, NetMessage::Verack);

        let send_version = message.version.min(PROTOCOL_VERSION);
        {
            let mut state = self.state();
            let Some(peer) = state.peer_mut(id) else {
                return Ok(());
            };
            peer.services = message.services;
            peer.client = message.services & NODE_NETWORK == 0;
            peer.starting_height = message.start_height;
            peer.relay_txes = message.relay;
            peer.send_version = send_version;
            peer.version = message.version;
            peer.have_witness = message.services & NODE_WITNESS != 0;
            peer.time_offset = message.timestamp - self.clock.unix_seconds();
            peer.phase = HandshakePhase::VersionReceived;
            state.update_preferred_download(id);
        }

        if !inbound {
            // Advertise our own address while we're at it.
            if self.config.listening && !self.chain.is_initial_block_download() {
                let local = self.connman.local_address(id);
                if let Some(local) = local {
                    if local.is_routable() {
                        let mut state = self.state();
                        if let Some(peer) = state.peer_mut(id) {
                            log_debug!("advertising address to peer={id}");
                            peer.push_address(local);
                        }
                    }
                }
            }
            // Ask for addresses when ours are scarce.
            if one_shot
                || message.version >= CADDR_TIME_VERSION
                || self.connman.address_count() < 1000
            {
                self.connman.push_message(id, NetMessage::GetAddr);
                let mut state = self.state();
                if let Some(peer) = state.peer_mut(id) {
                    peer.sent_getaddr = true;
                }
            }
            self.connman.mark_address_good(addr);
        }

        log_info!(
            "receive version message: {}: version {}, blocks={}, peer={id}",
            message.user_agent,
            message.version,
            message.start_height
        );

        // Feeler connections only verify liveness.
        if feeler {
            self.mark_for_disconnect(id);
        }
        Ok(())
    }

    fn process_verack_msg(&self, id: PeerId) -> Result<(), HandlerError> {
        let version = {
            let mut state = self.state();
            let Some(peer) = state.peer_mut(id) else {
                return Ok(());
            };
            peer.send_version = peer.version.min(PROTOCOL_VERSION);
            if !peer.flags.inbound {
                // Mark outbound connections healthy so the address manager
                // can update their timestamps at disconnect.
                peer.currently_connected = true;
            }
            peer.version
        };
        if version >= SENDHEADERS_VERSION {
            // Announce blocks with headers instead of invs when possible.
            self.connman.push_message(id, NetMessage::SendHeaders);
        }
        if version >= SHORT_IDS_BLOCKS_VERSION {
            // Offer both compact encodings without requesting compact
            // announcements ourselves.
            if self.config.local_services & NODE_WITNESS != 0 {
                self.connman.push_message(
                    id,
                    NetMessage::SendCmpct(wire::SendCmpct {
                        announce: false,
                        version: 2,
                    }),
                );
            }
            self.connman.push_message(
                id,
                NetMessage::SendCmpct(wire::SendCmpct {
                    announce: false,
                    version: 1,
                }),
            );
        }
        let mut state = self.state();
        if let Some(peer) = state.peer_mut(id) {
            peer.phase = HandshakePhase::Connected;
        }
        Ok(())
    }

    fn process_getaddr_msg(&self, id: PeerId) -> Result<(), HandlerError> {
        {
            let state = self.state();
            let Some(peer) = state.peer(id) else {
                return Ok(());
            };
            // Inbound-only, to blunt address-table fingerprinting.
            if !peer.flags.inbound {
                log_debug!("ignoring \"getaddr\" from outbound connection, peer={id}");
                return Ok(());
            }
            if peer.sent_addr {
                log_debug!("ignoring repeated \"getaddr\", peer={id}");
                return Ok(());
            }
        }
        let addresses = self.connman.addresses();
        let mut state = self.state();
        if let Some(peer) = state.peer_mut(id) {
            peer.sent_addr = true;
            peer.addr_to_send.clear();
            for address in addresses {
                peer.push_address(address);
            }
        }
        Ok(())
    }

    fn process_addr_msg(
        &self,
        id: PeerId,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let addresses = wire::parse_addr(payload)?;
        if addresses.len() > MAX_ADDR_SZ {
            let mut state = self.state();
            state.misbehaving(id, 20, self.config.ban_threshold);
            return Err(HandlerError::Protocol(format!(
                "message addr size() = {}",
                addresses.len()
            )));
        }
        let now = self.clock.adjusted_seconds();
        let since = now - 10 * 60;
        let batch_size = addresses.len();
        let (source_addr, sent_getaddr, one_shot) = {
            let state = self.state();
            match state.peer(id) {
                Some(peer) => (peer.addr, peer.sent_getaddr, peer.flags.one_shot),
                None => return Ok(()),
            }
        };
        let mut good: Vec<NetAddress> = Vec::with_capacity(batch_size);
        for mut address in addresses {
            if interrupt.load(Ordering::Relaxed) {
                return Ok(());
            }
            if address.services & NODE_NETWORK == 0 {
                continue;
            }
            if address.time <= 100_000_000 || i64::from(address.time) > now + 10 * 60 {
                address.time = (now - 5 * 24 * 60 * 60).max(0) as u32;
            }
            {
                let mut state = self.state();
                if let Some(peer) = state.peer_mut(id) {
                    peer.add_address_known(&address);
                }
            }
            let reachable = address.is_routable();
            if i64::from(address.time) > since
                && !sent_getaddr
                && batch_size <= 10
                && reachable
            {
                // Fresh unsolicited announcement: pass it along.
                let mut state = self.state();
                self.relay_address(&mut state, &address, reachable);
            }
            if reachable {
                good.push(address);
            }
        }
        self.connman.add_new_addresses(&good, source_addr);
        if batch_size < MAX_ADDR_SZ {
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.sent_getaddr = false;
            }
        }
        if one_shot {
            self.mark_for_disconnect(id);
        }
        Ok(())
    }

    /// Relay one address to a couple of deterministically chosen peers; the
    /// choice is stable for a day so their known-address sets stop repeats.
    fn relay_address(&self, state: &mut NetState, address: &NetAddress, reachable: bool) {
        let relay_count = if reachable { 2 } else { 1 };
        let digest = sha256d(&address.key());
        let mut addr_low = [0u8; 8];
        addr_low.copy_from_slice(&digest[..8]);
        let addr_hash = u64::from_le_bytes(addr_low);
        let day = (self.clock.unix_seconds() as u64).wrapping_add(addr_hash) / (24 * 60 * 60);

        let mut seed = self
            .connman
            .deterministic_randomizer(RANDOMIZER_ID_ADDRESS_RELAY);
        seed.write_u64(addr_hash << 32);
        seed.write_u64(day);

        let mut best: [(u64, Option<PeerId>); 2] = [(0, None), (0, None)];
        for (peer_id, peer) in state.peers.iter() {
            if peer.version < CADDR_TIME_VERSION || !peer.handshake_complete() {
                continue;
            }
            let mut hasher = seed.clone();
            hasher.write_u64(peer_id.0);
            let key = hasher.finish();
            for slot in 0..relay_count {
                if key > best[slot].0 {
                    best.copy_within(slot..relay_count - 1, slot + 1);
                    best[slot] = (key, Some(*peer_id));
                    break;
                }
            }
        }
        for (key, candidate) in best.iter().take(relay_count) {
            if *key == 0 {
                continue;
            }
            if let Some(peer_id) = candidate {
                if let Some(peer) = state.peer_mut(*peer_id) {
                    peer.push_address(address.clone());
                }
            }
        }
    }

    fn process_sendheaders_msg(&self, id: PeerId) -> Result<(), HandlerError> {
        let mut state = self.state();
        if let Some(peer) = state.peer_mut(id) {
            peer.prefer_headers = true;
        }
        Ok(())
    }

    fn process_sendcmpct_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let message = wire::parse_sendcmpct(payload)?;
        let witness_ok =
            self.config.local_services & NODE_WITNESS != 0 && message.version == 2;
        if message.version == 1 || witness_ok {
            let mut state = self.state();
            let Some(peer) = state.peer_mut(id) else {
                return Ok(());
            };
            // The first valid announcement locks in which encoding this
            // connection uses.
            if !peer.provides_header_and_ids {
                peer.provides_header_and_ids = true;
                peer.wants_cmpct_witness = message.version == 2;
            }
            if peer.wants_cmpct_witness == (message.version == 2) {
                peer.prefer_header_and_ids = message.announce;
            }
            if !peer.supports_desired_cmpct_version {
                peer.supports_desired_cmpct_version =
                    if self.config.local_services & NODE_WITNESS != 0 {
                        message.version == 2
                    } else {
                        message.version == 1
                    };
            }
        }
        Ok(())
    }

    fn process_ping_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let version = self
            .state()
            .peer(id)
            .map(|peer| peer.version)
            .unwrap_or(0);
        if version > BIP0031_VERSION {
            let nonce = wire::parse_nonce(payload)?;
            // Echoing the nonce lets the peer match overlapping pings.
            self.connman.push_message(id, NetMessage::Pong(nonce));
        }
        Ok(())
    }

    fn process_pong_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let now = self.clock.unix_micros();
        let mut finished = false;
        let mut problem: Option<&'static str> = None;
        if payload.len() >= 8 {
            let nonce = wire::parse_nonce(payload)?;
            let mut state = self.state();
            let Some(peer) = state.peer_mut(id) else {
                return Ok(());
            };
            if peer.ping_nonce_sent != 0 {
                if nonce == peer.ping_nonce_sent {
                    finished = true;
                    let elapsed = now - peer.ping_start;
                    if elapsed > 0 {
                        peer.ping_time = elapsed;
                        peer.min_ping_time = peer.min_ping_time.min(elapsed);
                    } else {
                        problem = Some("timing mishap");
                    }
                } else if nonce == 0 {
                    // Most likely a remote bug; cancel the ping.
                    finished = true;
                    problem = Some("nonce zero");
                } else {
                    // Normal when pings overlap.
                    problem = Some("nonce mismatch");
                }
            } else {
                problem = Some("unsolicited pong without ping");
            }
            if finished {
                peer.ping_nonce_sent = 0;
            }
        } else {
            finished = true;
            problem = Some("short payload");
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.ping_nonce_sent = 0;
            }
        }
        if let Some(problem) = problem {
            log_debug!("pong peer={id}: {problem}");
        }
        Ok(())
    }

    fn process_filterload_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let filter = parse_filterload(payload)?;
        let mut state = self.state();
        if !filter.is_within_size_constraints() {
            // There is no excuse for an oversized filter.
            state.misbehaving(id, 100, self.config.ban_threshold);
            return Ok(());
        }
        if let Some(peer) = state.peer_mut(id) {
            peer.filter = Some(filter);
            peer.relay_txes = true;
        }
        Ok(())
    }

    fn process_filteradd_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let data = wire::parse_filteradd(payload)?;
        let mut state = self.state();
        // No script data element may exceed this size, so neither may any
        // filter addition.
        let mut bad = data.len() > MAX_SCRIPT_ELEMENT_SIZE;
        if !bad {
            match state.peer_mut(id).and_then(|peer| peer.filter.as_mut()) {
                Some(filter) => filter.insert(&data),
                None => bad = true,
            }
        }
        if bad {
            state.misbehaving(id, 100, self.config.ban_threshold);
        }
        Ok(())
    }

    fn process_filterclear_msg(&self, id: PeerId) -> Result<(), HandlerError> {
        let mut state = self.state();
        if let Some(peer) = state.peer_mut(id) {
            if self.config.local_services & NODE_BLOOM != 0 {
                peer.filter = Some(BloomFilter::empty());
            }
            peer.relay_txes = true;
        }
        Ok(())
    }

    fn process_feefilter_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let rate = wire::parse_feefilter(payload)?;
        if money_range(rate) {
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.fee_filter_received = rate;
            }
            log_debug!("received: feefilter of {rate} from peer={id}");
        }
        Ok(())
    }

    fn process_checkpoint_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        if !self.chain.net_receive_checkpoint(payload) {
            return Err(HandlerError::Protocol(format!(
                "invalid checkpoint message from peer={id}"
            )));
        }
        Ok(())
    }

    fn process_getcheckpoint_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let height = wire::parse_getcheckpoint(payload)?;
        if let Some(response) = self.chain.net_request_checkpoint(height) {
            self.connman.push_message(id, response);
        }
        Ok(())
    }

    fn process_mempool_msg(&self, id: PeerId) -> Result<(), HandlerError> {
        let whitelisted = self
            .state()
            .peer(id)
            .map(|peer| peer.flags.whitelisted)
            .unwrap_or(false);
        if self.config.local_services & NODE_BLOOM == 0 && !whitelisted {
            log_debug!("mempool request with bloom filters disabled, disconnect peer={id}");
            self.mark_for_disconnect(id);
            return Ok(());
        }
        if self.connman.outbound_target_reached(true) && !whitelisted {
            log_debug!("mempool request with bandwidth limit reached, disconnect peer={id}");
            self.mark_for_disconnect(id);
            return Ok(());
        }
        let mut state = self.state();
        if let Some(peer) = state.peer_mut(id) {
            peer.send_mempool = true;
        }
        Ok(())
    }

    fn process_getblocks_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let locator = wire::parse_locator(payload)?;
        let hashes = self.chain.net_request_blocks(&locator.have, &locator.stop);
        let mut state = self.state();
        let Some(peer) = state.peer_mut(id) else {
            return Ok(());
        };
        for hash in &hashes {
            peer.push_inventory(Inv::new(MSG_BLOCK, *hash));
        }
        if hashes.len() >= 500 {
            // Remember where to continue from when the peer drains this
            // batch.
            peer.hash_continue = hashes.last().copied();
        }
        Ok(())
    }

    fn process_inv_msg(
        &self,
        id: PeerId,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let items = wire::parse_inv(payload)?;
        if items.len() > MAX_INV_SZ {
            let mut state = self.state();
            state.misbehaving(id, 20, self.config.ban_threshold);
            return Err(HandlerError::Protocol(format!(
                "message inv size() = {}",
                items.len()
            )));
        }
        let mut blocks_only = !self.config.relay_txes;
        let whitelisted = self
            .state()
            .peer(id)
            .map(|peer| peer.flags.whitelisted)
            .unwrap_or(false);
        if whitelisted && self.config.whitelist_relay {
            blocks_only = false;
        }
        let quiet_import = self.chain.is_importing() || self.chain.is_reindexing();

        let mut state = self.state();
        let fetch_flags = state.peer(id).map(|peer| self.fetch_flags(peer)).unwrap_or(0);
        for mut inv in items {
            if interrupt.load(Ordering::Relaxed) {
                return Ok(());
            }
            let already_have = self.already_have(&inv);
            log_debug!(
                "got inv: {} {} peer={id}",
                hash256_to_hex(&inv.hash),
                if already_have { "have" } else { "new" }
            );
            if inv.is_tx_kind() {
                inv.kind |= fetch_flags;
            }
            if inv.base_kind() == MSG_BLOCK {
                state.update_block_availability(id, &inv.hash, self.chain.as_ref());
                if !already_have && !quiet_import && !state.is_block_in_flight(&inv.hash) {
                    // Headers-first: never fetch the block straight off an
                    // inv; ask for the connecting headers instead.
                    self.connman.push_message(
                        id,
                        NetMessage::GetHeaders(BlockLocator {
                            version: self.config.protocol_version as u32,
                            have: self.chain.locator(Some(self.chain.best_header())),
                            stop: inv.hash,
                        }),
                    );
                    log_debug!(
                        "getheaders ({}) {} to peer={id}",
                        self.chain.height(self.chain.best_header()),
                        hash256_to_hex(&inv.hash)
                    );
                }
            } else {
                let now = self.clock.unix_micros();
                let ibd = self.chain.is_initial_block_download();
                if let Some(peer) = state.peer_mut(id) {
                    peer.known_inventory.insert(inv.hash);
                    if blocks_only {
                        log_debug!(
                            "transaction {} inv sent in violation of protocol peer={id}",
                            hash256_to_hex(&inv.hash)
                        );
                    } else if !already_have && !quiet_import && !ibd {
                        peer.ask_for(inv, now);
                    }
                }
            }
        }
        Ok(())
    }

    fn process_getheaders_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let locator = wire::parse_locator(payload)?;
        let whitelisted = self
            .state()
            .peer(id)
            .map(|peer| peer.flags.whitelisted)
            .unwrap_or(false);
        if self.chain.is_initial_block_download() && !whitelisted {
            log_debug!("ignoring getheaders from peer={id} during initial block download");
            return Ok(());
        }
        let (headers, best_sent) = self.chain.net_request_headers(&locator.have, &locator.stop);
        self.connman.push_message(id, NetMessage::Headers(headers));
        if let Some(best) = best_sent {
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.best_header_sent = Some(best);
            }
        }
        Ok(())
    }

    fn process_getdata_msg(
        &self,
        id: PeerId,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let items = wire::parse_inv(payload)?;
        if items.len() > MAX_INV_SZ {
            let mut state = self.state();
            state.misbehaving(id, 20, self.config.ban_threshold);
            return Err(HandlerError::Protocol(format!(
                "message getdata size() = {}",
                items.len()
            )));
        }
        log_debug!("received getdata ({} invsz) peer={id}", items.len());
        {
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.getdata_queue.extend(items);
            }
        }
        self.process_getdata(id, interrupt);
        Ok(())
    }

    fn process_block_msg(
        &self,
        id: PeerId,
        payload: &[u8],
        interrupt: &AtomicBool,
    ) -> Result<(), HandlerError> {
        let mut decoder = Decoder::new(payload);
        let block = Block::consensus_decode_from(&mut decoder)?;
        let hash = block.hash();
        log_debug!("received block {} peer={id}", hash256_to_hex(&hash));

        let force_processing = {
            let mut state = self.state();
            let now = self.clock.unix_micros();
            // Blocks we explicitly requested get processed even when they
            // are no candidate for the best chain.
            let requested = state.mark_block_received(&hash, now);
            state.block_source.insert(hash, (id, true));
            requested
        };
        if interrupt.load(Ordering::Relaxed) {
            return Ok(());
        }
        let is_new = self.chain.process_new_block(&block, force_processing);
        let mut state = self.state();
        if is_new {
            if let Some(peer) = state.peer_mut(id) {
                peer.last_block_time = self.clock.unix_seconds();
            }
        } else {
            state.block_source.remove(&hash);
        }
        Ok(())
    }

    fn process_tx_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let mut decoder = Decoder::new(payload);
        let tx = Transaction::consensus_decode_from(&mut decoder)?;
        let txid = tx.txid();
        {
            let mut state = self.state();
            if let Some(peer) = state.peer_mut(id) {
                peer.known_inventory.insert(txid);
                peer.ask_for_set.remove(&txid);
            }
        }
        let outcome = self.pool.accept_tx(id, &tx);
        let mut state = self.state();
        if outcome.is_new {
            if let Some(peer) = state.peer_mut(id) {
                peer.last_tx_time = self.clock.unix_seconds();
            }
        }
        if let Some((code, reason)) = &outcome.reject {
            self.connman.push_message(
                id,
                NetMessage::Reject(RejectMessage::new("tx", *code, reason).with_hash(txid)),
            );
        }
        if outcome.misbehavior > 0 {
            state.misbehaving(id, outcome.misbehavior, self.config.ban_threshold);
        }
        if !outcome.accepted {
            log_debug!("transaction {} rejected, peer={id}", hash256_to_hex(&txid));
        }
        Ok(())
    }

    fn process_getblocktxn_msg(&self, id: PeerId, payload: &[u8]) -> Result<(), HandlerError> {
        let request = parse_getblocktxn(payload)?;
        match self.chain.net_request_block_txn(&request) {
            BlockTxnReply::Txn(response) => {
                self.connman.push_message(id, NetMessage::BlockTxn(response));
            }
            BlockTxnReply::FullBlock(block) => {
                // Deep request: cheaper to send the whole block.
                self.connman.push_message(id, NetMessage::Block(block));
            }
            BlockTxnReply::Punish(points, reason) => {
                let mut state = self.state();
                state.misbehaving(id, points, self.config.ban_threshold);
                return Err(HandlerError::Protocol(reason.to_string()));
            }
            BlockTxnReply::Ignore => {}
        }
        Ok(())
    }
}

