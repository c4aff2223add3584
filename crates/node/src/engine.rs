//! Header-tree chain engine backing the daemon: structural header
//! acceptance, in-memory block bodies, and the serving calls the network
//! core delegates to.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use primitive_types::U256;
use rookd_chain::{AcceptError, BlockId, BlockTree, Validity};
use rookd_consensus::constants::REJECT_INVALID;
use rookd_consensus::{ChainParams, Hash256};
use rookd_log::log_debug;
use rookd_net::collab::{BlockTxnReply, ChainEngine, HeaderProcessOutcome};
use rookd_net::compact::{BlockTxnRequest, BlockTxnResponse, CompactBlock};
use rookd_net::processor::BlockValidationVerdict;
use rookd_net::wire::NetMessage;
use rookd_primitives::{Block, BlockHeader, Encoder};

use crate::MAX_HEADERS_REPLY;

/// Blocks this deep no longer answer getblocktxn with transactions.
const MAX_BLOCKTXN_DEPTH: i32 = 10;

/// Validation-side happenings the daemon's event loop forwards to the
/// network core.
pub enum EngineEvent {
    BlockChecked {
        hash: Hash256,
        verdict: BlockValidationVerdict,
    },
    BlockConnected {
        block: Box<Block>,
    },
    UpdatedTip {
        new_tip: BlockId,
        fork: Option<BlockId>,
        initial_download: bool,
    },
}

struct ChainInner {
    tree: BlockTree,
    blocks: HashMap<Hash256, Block>,
}

pub struct HeaderChain {
    inner: Mutex<ChainInner>,
    min_work: U256,
    witness_activation_height: i32,
    events: Sender<EngineEvent>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

impl HeaderChain {
    pub fn new(params: &ChainParams, events: Sender<EngineEvent>) -> Self {
        let genesis = BlockHeader {
            version: params.genesis_version,
            prev_hash: [0u8; 32],
            merkle_root: params.genesis_merkle_root,
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        };
        Self {
            inner: Mutex::new(ChainInner {
                tree: BlockTree::new(genesis),
                blocks: HashMap::new(),
            }),
            min_work: U256::from_little_endian(&params.consensus.min_chain_work),
            witness_activation_height: params.consensus.witness_activation_height,
            events,
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best tip candidate: the most-work valid entry whose whole ancestry
    /// has data.
    fn best_connectable(tree: &BlockTree) -> BlockId {
        let mut best = tree.genesis();
        for id in tree.ids() {
            if tree.is_failed(id) || !tree.chain_tx(id) {
                continue;
            }
            if tree.chain_work(id) > tree.chain_work(best) {
                best = id;
            }
        }
        best
    }
}

impl ChainEngine for HeaderChain {
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
        let inner = self.inner();
        let tip = inner.tree.tip();
        if inner.tree.chain_work(tip) < self.min_work {
            return true;
        }
        inner.tree.header_time(tip) < unix_now() - 24 * 60 * 60
    }

    fn min_chain_work(&self) -> U256 {
        self.min_work
    }

    fn witness_enabled(&self, prev: Option<BlockId>) -> bool {
        let height = match prev {
            Some(prev) => self.inner().tree.height(prev) + 1,
            None => 0,
        };
        height >= self.witness_activation_height
    }

    fn process_new_block_headers(&self, headers: &[BlockHeader]) -> HeaderProcessOutcome {
        let mut inner = self.inner();
        let mut last = None;
        for header in headers {
            match inner.tree.accept_header(header) {
                Ok(id) => last = Some(id),
                Err(err) => {
                    let dos_score = match err {
                        AcceptError::PrevMissing(_) => 10,
                        AcceptError::BadPrev => 100,
                        AcceptError::DuplicateInvalid => 100,
                        AcceptError::BadBits => 50,
                    };
                    let reason = match err {
                        AcceptError::PrevMissing(_) => "prev-blk-not-found",
                        AcceptError::BadPrev => "bad-prevblk",
                        AcceptError::DuplicateInvalid => "duplicate-invalid",
                        AcceptError::BadBits => "bad-diffbits",
                    };
                    return HeaderProcessOutcome {
                        accepted: false,
                        last,
                        first_invalid: Some(header.hash()),
                        dos_score,
                        reason,
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
        let initial_download = self.is_initial_block_download();
        let mut inner = self.inner();
        let id = match inner.tree.lookup(&hash) {
            Some(id) => id,
            None => match inner.tree.accept_header(&block.header) {
                Ok(id) => id,
                Err(err) => {
                    drop(inner);
                    let _ = self.events.send(EngineEvent::BlockChecked {
                        hash,
                        verdict: BlockValidationVerdict {
                            valid: false,
                            dos_score: 10,
                            reject_code: REJECT_INVALID,
                            reject_reason: err.to_string(),
                        },
                    });
                    return false;
                }
            },
        };
        if inner.tree.have_data(id) {
            return false;
        }
        if block.merkle_root() != block.header.merkle_root {
            inner.tree.mark_failed(id);
            drop(inner);
            let _ = self.events.send(EngineEvent::BlockChecked {
                hash,
                verdict: BlockValidationVerdict {
                    valid: false,
                    dos_score: 100,
                    reject_code: REJECT_INVALID,
                    reject_reason: "bad-txnmrklroot".to_string(),
                },
            });
            return false;
        }

        inner.blocks.insert(hash, block.clone());
        inner.tree.set_have_data(id, block.txs.len() as u32);
        inner.tree.raise_validity(id, Validity::Transactions);

        let old_tip = inner.tree.tip();
        let best = Self::best_connectable(&inner.tree);
        let mut tip_moved = false;
        let mut fork = None;
        if best != old_tip && inner.tree.chain_work(best) > inner.tree.chain_work(old_tip) {
            fork = Some(inner.tree.last_common_ancestor(best, old_tip));
            inner.tree.set_tip(best);
            let mut walk = Some(best);
            while let Some(at) = walk {
                if Some(at) == fork {
                    break;
                }
                inner.tree.raise_validity(at, Validity::Chain);
                walk = inner.tree.prev(at);
            }
            tip_moved = true;
        }
        drop(inner);

        let _ = self.events.send(EngineEvent::BlockChecked {
            hash,
            verdict: BlockValidationVerdict {
                valid: true,
                dos_score: 0,
                reject_code: 0,
                reject_reason: String::new(),
            },
        });
        let _ = self.events.send(EngineEvent::BlockConnected {
            block: Box::new(block.clone()),
        });
        if tip_moved {
            let _ = self.events.send(EngineEvent::UpdatedTip {
                new_tip: best,
                fork,
                initial_download,
            });
        }
        true
    }

    fn net_request_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> (Vec<BlockHeader>, Option<BlockId>) {
        let inner = self.inner();
        let tree = &inner.tree;
        let mut anchor_height = 0;
        for candidate in locator {
            if let Some(entry) = tree.lookup(candidate) {
                if tree.contains(entry) {
                    anchor_height = tree.height(entry);
                    break;
                }
            }
        }
        let mut headers = Vec::new();
        let mut best = None;
        let mut height = anchor_height + 1;
        while headers.len() < MAX_HEADERS_REPLY {
            let Some(id) = tree.at_height(height) else {
                break;
            };
            headers.push(tree.header(id));
            best = Some(id);
            if tree.hash(id) == *stop {
                break;
            }
            height += 1;
        }
        (headers, best)
    }

    fn net_request_blocks(&self, locator: &[Hash256], stop: &Hash256) -> Vec<Hash256> {
        let inner = self.inner();
        let tree = &inner.tree;
        let mut anchor_height = 0;
        for candidate in locator {
            if let Some(entry) = tree.lookup(candidate) {
                if tree.contains(entry) {
                    anchor_height = tree.height(entry);
                    break;
                }
            }
        }
        let mut hashes = Vec::new();
        let mut height = anchor_height + 1;
        while hashes.len() < 500 {
            let Some(id) = tree.at_height(height) else {
                break;
            };
            if !tree.have_data(id) {
                break;
            }
            hashes.push(tree.hash(id));
            if tree.hash(id) == *stop {
                break;
            }
            height += 1;
        }
        hashes
    }

    fn net_request_block_data(&self, hash: &Hash256) -> Option<Block> {
        self.inner().blocks.get(hash).cloned()
    }

    fn net_request_block_txn(&self, request: &BlockTxnRequest) -> BlockTxnReply {
        let inner = self.inner();
        let Some(id) = inner.tree.lookup(&request.block_hash) else {
            return BlockTxnReply::Ignore;
        };
        let Some(block) = inner.blocks.get(&request.block_hash) else {
            return BlockTxnReply::Ignore;
        };
        if inner.tree.height(id) < inner.tree.tip_height() - MAX_BLOCKTXN_DEPTH {
            // Old enough that the requester is better served by the block.
            log_debug!("getblocktxn for deep block answered in full");
            return BlockTxnReply::FullBlock(block.clone());
        }
        let mut transactions = Vec::with_capacity(request.indexes.len());
        for index in &request.indexes {
            match block.txs.get(*index as usize) {
                Some(tx) => transactions.push(tx.clone()),
                None => {
                    return BlockTxnReply::Punish(
                        100,
                        "getblocktxn with out-of-bounds tx indices",
                    )
                }
            }
        }
        BlockTxnReply::Txn(BlockTxnResponse {
            block_hash: request.block_hash,
            transactions,
        })
    }

    fn net_request_checkpoint(&self, height: i32) -> Option<NetMessage> {
        let inner = self.inner();
        let id = inner.tree.at_height(height)?;
        let mut encoder = Encoder::with_capacity(36);
        encoder.write_i32_le(height);
        encoder.write_hash_le(&inner.tree.hash(id));
        Some(NetMessage::Checkpoint(encoder.into_inner()))
    }

    fn net_receive_checkpoint(&self, payload: &[u8]) -> bool {
        // A checkpoint is advisory here: height plus hash, sanity-checked
        // against our own chain when we have it.
        let mut decoder = rookd_primitives::Decoder::new(payload);
        let Ok(height) = decoder.read_i32_le() else {
            return false;
        };
        let Ok(hash) = decoder.read_hash() else {
            return false;
        };
        let inner = self.inner();
        match inner.tree.at_height(height) {
            Some(id) => inner.tree.hash(id) == hash,
            None => true,
        }
    }

    fn most_recent_compact_block(&self, _hash: &Hash256) -> Option<CompactBlock> {
        None
    }
}
