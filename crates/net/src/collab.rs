//! Trait seams to the node's heavyweight collaborators: chain validation,
//! the transaction pool, the connection manager, and the periodic
//! scheduler. The processor only ever talks to these interfaces.

use std::net::SocketAddr;
use std::time::Duration;

use primitive_types::U256;
use rookd_chain::BlockId;
use rookd_consensus::Hash256;
use rookd_primitives::{Block, BlockHeader, Transaction};
use siphasher::sip::SipHasher24;

use crate::bloom::BloomFilter;
use crate::compact::{BlockTxnRequest, BlockTxnResponse, CompactBlock};
use crate::peer::PeerId;
use crate::wire::{NetAddress, NetMessage};

/// Result of handing a batch of headers to the validator.
#[derive(Clone, Debug)]
pub struct HeaderProcessOutcome {
    pub accepted: bool,
    /// Index entry of the last header when the batch was accepted.
    pub last: Option<BlockId>,
    /// Hash of the first header that failed validation.
    pub first_invalid: Option<Hash256>,
    /// Misbehavior points the failure is worth; zero for benign failures.
    pub dos_score: i32,
    pub reason: &'static str,
}

impl HeaderProcessOutcome {
    pub fn accepted(last: BlockId) -> Self {
        Self {
            accepted: true,
            last: Some(last),
            first_invalid: None,
            dos_score: 0,
            reason: "",
        }
    }
}

/// Reply produced by the engine for a `getblocktxn` request.
pub enum BlockTxnReply {
    Txn(BlockTxnResponse),
    /// The block is too deep to index quickly; answer with the full block.
    FullBlock(Block),
    Punish(i32, &'static str),
    Ignore,
}

/// Chain/validation collaborator. Header-tree entries are addressed by
/// [`BlockId`]s that stay valid for the engine's lifetime.
pub trait ChainEngine: Send + Sync {
    // Index lookups.
    fn block_index(&self, hash: &Hash256) -> Option<BlockId>;
    fn block_hash(&self, id: BlockId) -> Hash256;
    fn block_header(&self, id: BlockId) -> BlockHeader;
    fn height(&self, id: BlockId) -> i32;
    fn chain_work(&self, id: BlockId) -> U256;
    fn prev(&self, id: BlockId) -> Option<BlockId>;
    fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId>;
    fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> BlockId;
    fn header_time(&self, id: BlockId) -> i64;
    fn is_valid_tree(&self, id: BlockId) -> bool;
    fn is_valid_transactions(&self, id: BlockId) -> bool;
    fn is_valid_chain(&self, id: BlockId) -> bool;
    fn has_data(&self, id: BlockId) -> bool;
    /// Transaction count when the block was ever stored, zero otherwise.
    fn n_tx(&self, id: BlockId) -> u32;
    fn chain_tx(&self, id: BlockId) -> bool;

    // Active chain.
    fn tip(&self) -> BlockId;
    fn active_at(&self, height: i32) -> Option<BlockId>;
    fn contains(&self, id: BlockId) -> bool;
    fn best_header(&self) -> BlockId;
    fn locator(&self, from: Option<BlockId>) -> Vec<Hash256>;

    // Node status.
    fn is_initial_block_download(&self) -> bool;
    fn is_reindexing(&self) -> bool {
        false
    }
    fn is_importing(&self) -> bool {
        false
    }
    fn min_chain_work(&self) -> U256;
    /// Witness rules active for a block whose parent is `prev`.
    fn witness_enabled(&self, prev: Option<BlockId>) -> bool;

    // Validation entry points. Callers must not hold the net lock.
    fn process_new_block_headers(&self, headers: &[BlockHeader]) -> HeaderProcessOutcome;
    /// Returns whether the block was new to the node.
    fn process_new_block(&self, block: &Block, force_processing: bool) -> bool;

    // Net-serving calls that know how to compose wire responses.
    fn net_request_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> (Vec<BlockHeader>, Option<BlockId>);
    fn net_request_blocks(&self, locator: &[Hash256], stop: &Hash256) -> Vec<Hash256>;
    fn net_request_block_data(&self, hash: &Hash256) -> Option<Block>;
    fn net_request_block_txn(&self, request: &BlockTxnRequest) -> BlockTxnReply;
    fn net_request_checkpoint(&self, height: i32) -> Option<NetMessage>;
    fn net_receive_checkpoint(&self, payload: &[u8]) -> bool;
    /// Cache of the most recently relayed compact block, if it matches.
    fn most_recent_compact_block(&self, hash: &Hash256) -> Option<CompactBlock>;
}

/// Result of offering a transaction to the pool.
#[derive(Clone, Debug, Default)]
pub struct TxAcceptOutcome {
    pub accepted: bool,
    pub is_new: bool,
    pub misbehavior: i32,
    pub reject: Option<(u8, String)>,
}

/// Transaction inventory the pool decided to announce this trickle.
#[derive(Clone, Debug, Default)]
pub struct TxInventoryResult {
    /// Hashes to announce now.
    pub to_send: Vec<Hash256>,
    /// Hashes to retain for a later trickle.
    pub keep: Vec<Hash256>,
}

/// Mempool collaborator.
pub trait TxPool: Send + Sync {
    fn does_tx_exist(&self, hash: &Hash256) -> bool;
    fn accept_tx(&self, from: PeerId, tx: &Transaction) -> TxAcceptOutcome;
    fn request_tx(
        &self,
        hash: &Hash256,
        with_witness: bool,
        last_mempool_request: i64,
    ) -> Option<Transaction>;
    fn tx_inventory(
        &self,
        send_mempool: bool,
        fee_filter: i64,
        filter: Option<&BloomFilter>,
        candidates: Vec<Hash256>,
    ) -> TxInventoryResult;
    fn remove_orphans_for_block(&self, block: &Block);
    fn remove_orphans_for_peer(&self, peer: PeerId);
    /// Current mempool minimum fee rate given the configured ceiling.
    fn min_fee_rate(&self, max_mempool_bytes: u64) -> i64;
    /// Pool contents for compact-block reconstruction.
    fn snapshot(&self) -> Vec<Transaction>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BanReason {
    NodeMisbehaving,
}

/// Connection manager: sockets, the address table, and outbound policy.
pub trait ConnMan: Send + Sync {
    fn push_message(&self, peer: PeerId, message: NetMessage);
    /// Transport-level close request, independent of the disconnect flag
    /// the processor keeps on peer state.
    fn disconnect(&self, peer: PeerId);
    fn ban(&self, addr: SocketAddr, reason: BanReason);
    fn mark_address_good(&self, addr: SocketAddr);
    fn addresses(&self) -> Vec<NetAddress>;
    fn address_count(&self) -> usize;
    fn add_new_addresses(&self, addresses: &[NetAddress], source: SocketAddr);
    /// False when the nonce belongs to one of our own version messages.
    fn check_incoming_nonce(&self, nonce: u64) -> bool;
    fn outbound_target_reached(&self, historical_block_serving: bool) -> bool;
    fn set_try_new_outbound_peer(&self, value: bool);
    fn get_try_new_outbound_peer(&self) -> bool;
    /// Outbound connections beyond the configured target.
    fn extra_outbound_count(&self) -> i32;
    fn set_best_height(&self, height: i32);
    fn wake_message_handler(&self);
    /// Nonce carried in the version message we send to this peer, used to
    /// detect connections to ourselves.
    fn local_nonce(&self, peer: PeerId) -> u64;
    fn send_buffer_full(&self, peer: PeerId) -> bool;
    /// Our own address as this peer should see it, for advertisement.
    fn local_address(&self, peer: PeerId) -> Option<NetAddress>;
    /// Keyed hasher stable for the process lifetime.
    fn deterministic_randomizer(&self, id: u64) -> SipHasher24;
}

/// Periodic task scheduler.
pub trait TickScheduler {
    fn schedule_every(&self, period: Duration, task: Box<dyn FnMut() + Send + 'static>);
}
