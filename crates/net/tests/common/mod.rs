//! Shared harness: a scripted chain engine over the real header tree, a
//! recording connection manager, a configurable pool, and a settable clock.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use primitive_types::U256;
use rookd_chain::{BlockId, BlockTree, Validity};
use rookd_consensus::constants::{NODE_NETWORK, NODE_WITNESS, PROTOCOL_VERSION};
use rookd_consensus::{chain_params, Hash256, Network};
use rookd_net::bloom::BloomFilter;
use rookd_net::collab::{
    BanReason, BlockTxnReply, ChainEngine, ConnMan, HeaderProcessOutcome, TxAcceptOutcome,
    TxInventoryResult, TxPool,
};
use rookd_net::compact::{BlockTxnRequest, BlockTxnResponse, CompactBlock};
use rookd_net::peer::{PeerFlags, PeerId};
use rookd_net::wire::{self, MessageHeader, NetAddress, NetMessage, RawMessage, VersionMessage};
use rookd_net::{Clock, MockClock, NetConfig, NetProcessor};
use rookd_primitives::{Block, BlockHeader, Transaction};
use siphasher::sip::SipHasher24;

pub const BASE_TIME: i64 = 2_000_000_000;

struct ChainInner {
    tree: BlockTree,
    blocks: HashMap<Hash256, Block>,
    processed: Vec<Hash256>,
}

pub struct TestChain {
    inner: Mutex<ChainInner>,
    ibd: AtomicBool,
    min_work: Mutex<U256>,
    witness_height: Mutex<i32>,
}

impl TestChain {
    pub fn new(genesis_time: u32) -> Self {
        let genesis = BlockHeader {
            version: 1,
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            time: genesis_time,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        Self {
            inner: Mutex::new(ChainInner {
                tree: BlockTree::new(genesis),
                blocks: HashMap::new(),
                processed: Vec::new(),
            }),
            ibd: AtomicBool::new(false),
            min_work: Mutex::new(U256::zero()),
            witness_height: Mutex::new(i32::MAX),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().expect("test chain lock")
    }

    pub fn set_ibd(&self, value: bool) {
        self.ibd.store(value, Ordering::Relaxed);
    }

    pub fn set_min_work(&self, value: U256) {
        *self.min_work.lock().expect("min work lock") = value;
    }

    pub fn set_witness_height(&self, height: i32) {
        *self.witness_height.lock().expect("witness lock") = height;
    }

    /// Build a run of headers chaining from `parent` without inserting them.
    pub fn make_headers(&self, parent: BlockId, count: usize, salt: u32) -> Vec<BlockHeader> {
        let inner = self.inner();
        let mut prev_hash = inner.tree.hash(parent);
        let base_time = inner.tree.header(parent).time;
        drop(inner);
        let mut headers = Vec::with_capacity(count);
        for offset in 0..count {
            let header = BlockHeader {
                version: 4,
                prev_hash,
                merkle_root: [0u8; 32],
                time: base_time + 1 + offset as u32 + salt,
                bits: 0x207f_ffff,
                nonce: salt.wrapping_mul(100_000).wrapping_add(offset as u32),
            };
            prev_hash = header.hash();
            headers.push(header);
        }
        headers
    }

    /// Accept headers straight into the tree, returning their ids.
    pub fn insert_headers(&self, headers: &[BlockHeader]) -> Vec<BlockId> {
        let mut inner = self.inner();
        headers
            .iter()
            .map(|header| inner.tree.accept_header(header).expect("accept header"))
            .collect()
    }

    /// Pretend the block body arrived out of band.
    pub fn give_data(&self, id: BlockId) {
        let mut inner = self.inner();
        inner.tree.set_have_data(id, 1);
    }

    pub fn advance_tip(&self, id: BlockId) {
        let mut inner = self.inner();
        let mut walk = Some(id);
        while let Some(at) = walk {
            if !inner.tree.have_data(at) {
                inner.tree.set_have_data(at, 1);
            }
            inner.tree.raise_validity(at, Validity::Chain);
            walk = inner.tree.prev(at);
        }
        inner.tree.set_tip(id);
    }

    pub fn genesis(&self) -> BlockId {
        self.inner().tree.genesis()
    }

    pub fn processed_blocks(&self) -> Vec<Hash256> {
        self.inner().processed.clone()
    }

    pub fn store_block(&self, block: Block) -> BlockId {
        let mut inner = self.inner();
        let id = inner.tree.accept_header(&block.header).expect("accept");
        inner.tree.set_have_data(id, block.txs.len() as u32);
        inner.blocks.insert(block.hash(), block);
        id
    }
}

impl ChainEngine for TestChain {
    fn block_index(&self, hash: &Hash256) -> Option<BlockId> {
        self.inner().tree.lookup(hash)
    }

    fn block_hash(&self, id: BlockId) -> Hash256 {
        self.inner().tree.hash(id)
    }

    fn block_header(&self, id: BlockId) -> BlockHeader {
        self.inner().tree.header(id)
    }

    fn height(&self, id: BlockId) -> i32 {
        self.inner().tree.height(id)
    }

    fn chain_work(&self, id: BlockId) -> U256 {
        self.inner().tree.chain_work(id)
    }

    fn prev(&self, id: BlockId) -> Option<BlockId> {
        self.inner().tree.prev(id)
    }

    fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        self.inner().tree.ancestor(id, height)
    }

    fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> BlockId {
        self.inner().tree.last_common_ancestor(a, b)
    }

    fn header_time(&self, id: BlockId) -> i64 {
        self.inner().tree.header_time(id)
    }

    fn is_valid_tree(&self, id: BlockId) -> bool {
        self.inner().tree.is_valid(id, Validity::Tree)
    }

    fn is_valid_transactions(&self, id: BlockId) -> bool {
        self.inner().tree.is_valid(id, Validity::Transactions)
    }

    fn is_valid_chain(&self, id: BlockId) -> bool {
        self.inner().tree.is_valid(id, Validity::Chain)
    }

    fn has_data(&self, id: BlockId) -> bool {
        self.inner().tree.have_data(id)
    }

    fn n_tx(&self, id: BlockId) -> u32 {
        self.inner().tree.n_tx(id)
    }

    fn chain_tx(&self, id: BlockId) -> bool {
        self.inner().tree.chain_tx(id)
    }

    fn tip(&self) -> BlockId {
        self.inner().tree.tip()
    }

    fn active_at(&self, height: i32) -> Option<BlockId> {
        self.inner().tree.at_height(height)
    }

    fn contains(&self, id: BlockId) -> bool {
        self.inner().tree.contains(id)
    }

    fn best_header(&self) -> BlockId {
        self.inner().tree.best_header()
    }

    fn locator(&self, from: Option<BlockId>) -> Vec<Hash256> {
        self.inner().tree.locator(from)
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::Relaxed)
    }

    fn min_chain_work(&self) -> U256 {
        *self.min_work.lock().expect("min work lock")
    }

    fn witness_enabled(&self, prev: Option<BlockId>) -> bool {
        let threshold = *self.witness_height.lock().expect("witness lock");
        let height = match prev {
            Some(prev) => self.inner().tree.height(prev) + 1,
            None => 0,
        };
        height >= threshold
    }

    fn process_new_block_headers(&self, headers: &[BlockHeader]) -> HeaderProcessOutcome {
        let mut inner = self.inner();
        let mut last = None;
        for header in headers {
            match inner.tree.accept_header(header) {
                Ok(id) => last = Some(id),
                Err(err) => {
                    let dos_score = match err {
                        rookd_chain::AcceptError::PrevMissing(_) => 10,
                        _ => 100,
                    };
                    return HeaderProcessOutcome {
                        accepted: false,
                        last,
                        first_invalid: Some(header.hash()),
                        dos_score,
                        reason: "rejected",
                    };
                }
            }
        }
        match last {
            Some(last) => HeaderProcessOutcome::accepted(last),
            None => HeaderProcessOutcome {
                accepted: true,
                last: None,
                first_invalid: None,
                dos_score: 0,
                reason: "",
            },
        }
    }

    fn process_new_block(&self, block: &Block, _force_processing: bool) -> bool {
        let hash = block.hash();
        let mut inner = self.inner();
        let id = match inner.tree.lookup(&hash) {
            Some(id) => id,
            None => match inner.tree.accept_header(&block.header) {
                Ok(id) => id,
                Err(_) => return false,
            },
        };
        inner.processed.push(hash);
        if inner.tree.have_data(id) {
            return false;
        }
        inner.blocks.insert(hash, block.clone());
        inner.tree.set_have_data(id, block.txs.len() as u32);
        inner.tree.raise_validity(id, Validity::Transactions);
        true
    }

    fn net_request_headers(
        &self,
        _locator: &[Hash256],
        _stop: &Hash256,
    ) -> (Vec<BlockHeader>, Option<BlockId>) {
        (Vec::new(), None)
    }

    fn net_request_blocks(&self, _locator: &[Hash256], _stop: &Hash256) -> Vec<Hash256> {
        Vec::new()
    }

    fn net_request_block_data(&self, hash: &Hash256) -> Option<Block> {
        self.inner().blocks.get(hash).cloned()
    }

    fn net_request_block_txn(&self, request: &BlockTxnRequest) -> BlockTxnReply {
        let inner = self.inner();
        let Some(block) = inner.blocks.get(&request.block_hash) else {
            return BlockTxnReply::Ignore;
        };
        let mut transactions = Vec::new();
        for index in &request.indexes {
            match block.txs.get(*index as usize) {
                Some(tx) => transactions.push(tx.clone()),
                None => return BlockTxnReply::Punish(100, "out-of-bounds tx index"),
            }
        }
        BlockTxnReply::Txn(BlockTxnResponse {
            block_hash: request.block_hash,
            transactions,
        })
    }

    fn net_request_checkpoint(&self, _height: i32) -> Option<NetMessage> {
        None
    }

    fn net_receive_checkpoint(&self, _payload: &[u8]) -> bool {
        true
    }

    fn most_recent_compact_block(&self, _hash: &Hash256) -> Option<CompactBlock> {
        None
    }
}

#[derive(Default)]
pub struct TestPool {
    pub mempool: Mutex<Vec<Transaction>>,
}

impl TestPool {
    pub fn add(&self, tx: Transaction) {
        self.mempool.lock().expect("mempool lock").push(tx);
    }
}

impl TxPool for TestPool {
    fn does_tx_exist(&self, hash: &Hash256) -> bool {
        self.mempool
            .lock()
            .expect("mempool lock")
            .iter()
            .any(|tx| tx.txid() == *hash)
    }

    fn accept_tx(&self, _from: PeerId, _tx: &Transaction) -> TxAcceptOutcome {
        TxAcceptOutcome::default()
    }

    fn request_tx(
        &self,
        hash: &Hash256,
        _with_witness: bool,
        _last_mempool_request: i64,
    ) -> Option<Transaction> {
        self.mempool
            .lock()
            .expect("mempool lock")
            .iter()
            .find(|tx| tx.txid() == *hash)
            .cloned()
    }

    fn tx_inventory(
        &self,
        _send_mempool: bool,
        _fee_filter: i64,
        _filter: Option<&BloomFilter>,
        candidates: Vec<Hash256>,
    ) -> TxInventoryResult {
        TxInventoryResult {
            to_send: candidates,
            keep: Vec::new(),
        }
    }

    fn remove_orphans_for_block(&self, _block: &Block) {}

    fn remove_orphans_for_peer(&self, _peer: PeerId) {}

    fn min_fee_rate(&self, _max_mempool_bytes: u64) -> i64 {
        1000
    }

    fn snapshot(&self) -> Vec<Transaction> {
        self.mempool.lock().expect("mempool lock").clone()
    }
}

#[derive(Default)]
pub struct RecordingConnMan {
    pub messages: Mutex<Vec<(PeerId, NetMessage)>>,
    pub disconnected: Mutex<Vec<PeerId>>,
    pub banned: Mutex<Vec<SocketAddr>>,
    pub try_new_outbound: AtomicBool,
    pub extra_outbound: AtomicI32,
    pub best_height: AtomicI32,
}

impl RecordingConnMan {
    pub fn take_messages(&self) -> Vec<(PeerId, NetMessage)> {
        std::mem::take(&mut *self.messages.lock().expect("messages lock"))
    }

    pub fn commands_for(&self, peer: PeerId) -> Vec<String> {
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .filter(|(id, _)| *id == peer)
            .map(|(_, message)| message.command().to_string())
            .collect()
    }

    pub fn messages_for(&self, peer: PeerId) -> Vec<NetMessage> {
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .filter(|(id, _)| *id == peer)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().expect("messages lock").clear();
    }

    pub fn was_disconnected(&self, peer: PeerId) -> bool {
        self.disconnected
            .lock()
            .expect("disconnect lock")
            .contains(&peer)
    }
}

impl ConnMan for RecordingConnMan {
    fn push_message(&self, peer: PeerId, message: NetMessage) {
        self.messages
            .lock()
            .expect("messages lock")
            .push((peer, message));
    }

    fn disconnect(&self, peer: PeerId) {
        self.disconnected
            .lock()
            .expect("disconnect lock")
            .push(peer);
    }

    fn ban(&self, addr: SocketAddr, _reason: BanReason) {
        self.banned.lock().expect("ban lock").push(addr);
    }

    fn mark_address_good(&self, _addr: SocketAddr) {}

    fn addresses(&self) -> Vec<NetAddress> {
        Vec::new()
    }

    fn address_count(&self) -> usize {
        2000
    }

    fn add_new_addresses(&self, _addresses: &[NetAddress], _source: SocketAddr) {}

    fn check_incoming_nonce(&self, _nonce: u64) -> bool {
        true
    }

    fn outbound_target_reached(&self, _historical_block_serving: bool) -> bool {
        false
    }

    fn set_try_new_outbound_peer(&self, value: bool) {
        self.try_new_outbound.store(value, Ordering::Relaxed);
    }

    fn get_try_new_outbound_peer(&self) -> bool {
        self.try_new_outbound.load(Ordering::Relaxed)
    }

    fn extra_outbound_count(&self) -> i32 {
        self.extra_outbound.load(Ordering::Relaxed)
    }

    fn set_best_height(&self, height: i32) {
        self.best_height.store(height, Ordering::Relaxed);
    }

    fn wake_message_handler(&self) {}

    fn local_nonce(&self, _peer: PeerId) -> u64 {
        0x4242_4242_4242_4242
    }

    fn send_buffer_full(&self, _peer: PeerId) -> bool {
        false
    }

    fn local_address(&self, _peer: PeerId) -> Option<NetAddress> {
        None
    }

    fn deterministic_randomizer(&self, id: u64) -> SipHasher24 {
        SipHasher24::new_with_keys(7 ^ id, 11)
    }
}

/// A throwaway transaction; `coinbase` shapes the input like a generation
/// transaction.
pub fn make_tx(tag: u8, coinbase: bool) -> Transaction {
    use rookd_primitives::{OutPoint, TxIn, TxOut};
    Transaction {
        version: 2,
        inputs: vec![TxIn {
            prevout: if coinbase {
                OutPoint::null()
            } else {
                OutPoint {
                    hash: [tag; 32],
                    index: 0,
                }
            },
            script_sig: vec![tag],
            sequence: 0xffff_ffff,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut {
            value: 50_000 + i64::from(tag),
            script_pubkey: vec![0x51, tag],
        }],
        lock_time: 0,
    }
}

/// A filler body for an already-built header; the stub engine does not
/// re-check merkle commitments.
pub fn build_block(header: &BlockHeader) -> Block {
    Block {
        header: *header,
        txs: vec![make_tx(1, true)],
    }
}

/// A structurally consistent block: the header commits to the given
/// transactions.
pub fn build_block_with_txs(prev_hash: Hash256, time: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 4,
            prev_hash,
            merkle_root: rookd_primitives::merkle_root(&txids),
            time,
            bits: 0x207f_ffff,
            nonce: 7,
        },
        txs,
    }
}

pub struct Harness {
    pub processor: Arc<NetProcessor<TestChain, TestPool, RecordingConnMan>>,
    pub chain: Arc<TestChain>,
    pub pool: Arc<TestPool>,
    pub connman: Arc<RecordingConnMan>,
    pub clock: Arc<MockClock>,
    pub magic: [u8; 4],
}

impl Harness {
    pub fn new() -> Self {
        // Genesis ten minutes before "now": close enough for direct fetch.
        Self::with_genesis_age(600)
    }

    pub fn with_genesis_age(age_seconds: i64) -> Self {
        let params = chain_params(Network::Regtest);
        let magic = params.message_start;
        let chain = Arc::new(TestChain::new((BASE_TIME - age_seconds) as u32));
        let pool = Arc::new(TestPool::default());
        let connman = Arc::new(RecordingConnMan::default());
        let clock = Arc::new(MockClock::new(BASE_TIME));
        let config = NetConfig {
            local_services: NODE_NETWORK | NODE_WITNESS
                | rookd_consensus::constants::NODE_BLOOM,
            ..NetConfig::default()
        };
        let processor = Arc::new(NetProcessor::new(
            config,
            params,
            Arc::clone(&chain),
            Arc::clone(&pool),
            Arc::clone(&connman),
            Arc::clone(&clock) as Arc<dyn rookd_net::Clock>,
        ));
        Self {
            processor,
            chain,
            pool,
            connman,
            clock,
            magic,
        }
    }

    pub fn add_peer(&self, id: u64, flags: PeerFlags) -> PeerId {
        let peer = PeerId(id);
        let addr: SocketAddr = format!("10.0.{}.{}:8333", id / 250, (id % 250) + 1)
            .parse()
            .expect("peer addr");
        self.processor
            .initialize_node(peer, addr, format!("peer{id}"), flags);
        peer
    }

    /// Full handshake for a peer advertising the given services.
    pub fn connect_peer(&self, id: u64, flags: PeerFlags, services: u64, start_height: i32) -> PeerId {
        let peer = self.add_peer(id, flags);
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services,
            timestamp: self.clock.unix_seconds(),
            addr_recv: NetAddress {
                time: 0,
                services: 0,
                ip: [0u8; 16],
                port: 0,
            },
            addr_from: NetAddress {
                time: 0,
                services,
                ip: [0u8; 16],
                port: 0,
            },
            nonce: 0x9900 + id,
            user_agent: "/peer:1.0/".to_string(),
            start_height,
            relay: true,
        };
        self.deliver(peer, &NetMessage::Version(version));
        self.deliver(peer, &NetMessage::Verack);
        self.connman.clear();
        peer
    }

    /// Frame and feed one message through the full processing path.
    pub fn deliver(&self, peer: PeerId, message: &NetMessage) {
        let bytes = wire::frame_message(&self.magic, message);
        self.deliver_frame(peer, &bytes);
    }

    pub fn deliver_frame(&self, peer: PeerId, bytes: &[u8]) {
        let mut header = [0u8; wire::HEADER_SIZE];
        header.copy_from_slice(&bytes[..wire::HEADER_SIZE]);
        let raw = RawMessage {
            header: MessageHeader::decode(&header),
            payload: bytes[wire::HEADER_SIZE..].to_vec(),
        };
        self.processor.enqueue_message(peer, raw);
        let interrupt = AtomicBool::new(false);
        while self.processor.process_messages(peer, &interrupt) {}
    }

    pub fn tick_send(&self, peer: PeerId) {
        let interrupt = AtomicBool::new(false);
        self.processor.send_messages(peer, &interrupt);
    }

    pub fn misbehavior_of(&self, peer: PeerId) -> i32 {
        self.processor
            .get_node_state_stats(peer)
            .map(|stats| stats.misbehavior)
            .unwrap_or(-1)
    }
}
