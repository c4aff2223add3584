//! BIP 152 compact block relay: wire types, short transaction IDs, and
//! mempool-assisted block reconstruction.

use std::collections::HashMap;
use std::hash::Hasher;

use rookd_consensus::Hash256;
use rookd_primitives::{merkle_root, sha256, Block, BlockHeader, DecodeError, Decoder, Encoder, Transaction};
use siphasher::sip::SipHasher24;

/// Upper bound on transactions a compact block may claim; far above any
/// block that fits the message size limit.
const MAX_COMPACT_TX_COUNT: usize = 100_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefilledTransaction {
    /// Absolute index within the block.
    pub index: u32,
    pub tx: Transaction,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    pub short_ids: Vec<u64>,
    pub prefilled: Vec<PrefilledTransaction>,
}

impl CompactBlock {
    /// Build an announcement for a fully known block, prefilled with the
    /// coinbase the way relaying nodes do.
    pub fn from_block(block: &Block, nonce: u64, use_witness_ids: bool) -> Self {
        let mut short_ids = Vec::with_capacity(block.txs.len().saturating_sub(1));
        let keys = short_id_keys(&block.header, nonce);
        for tx in block.txs.iter().skip(1) {
            let txid = if use_witness_ids { tx.wtxid() } else { tx.txid() };
            short_ids.push(short_id(keys, &txid));
        }
        let prefilled = block
            .txs
            .first()
            .map(|coinbase| PrefilledTransaction {
                index: 0,
                tx: coinbase.clone(),
            })
            .into_iter()
            .collect();
        Self {
            header: block.header,
            nonce,
            short_ids,
            prefilled,
        }
    }

    pub fn block_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn total_tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    pub fn short_id_of(&self, txid: &Hash256) -> u64 {
        short_id(short_id_keys(&self.header, self.nonce), txid)
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        self.header.consensus_encode_to(encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_varint(self.short_ids.len() as u64);
        for id in &self.short_ids {
            encoder.write_u32_le(*id as u32);
            encoder.write_u16_le((*id >> 32) as u16);
        }
        encoder.write_varint(self.prefilled.len() as u64);
        let mut last_index: i64 = -1;
        for prefilled in &self.prefilled {
            let diff = i64::from(prefilled.index) - last_index - 1;
            encoder.write_varint(diff as u64);
            prefilled.tx.consensus_encode_to(encoder, true);
            last_index = i64::from(prefilled.index);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let nonce = decoder.read_u64_le()?;
        let id_count = decoder.read_length()?;
        if id_count > MAX_COMPACT_TX_COUNT {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut short_ids = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            let low = u64::from(decoder.read_u32_le()?);
            let high = u64::from(decoder.read_u16_le()?);
            short_ids.push(low | (high << 32));
        }
        let prefilled_count = decoder.read_length()?;
        if prefilled_count > MAX_COMPACT_TX_COUNT {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut prefilled = Vec::with_capacity(prefilled_count);
        let mut last_index: i64 = -1;
        for _ in 0..prefilled_count {
            let diff = decoder.read_varint()?;
            let index = last_index + 1 + i64::try_from(diff).map_err(|_| DecodeError::SizeTooLarge)?;
            if index > i64::from(u16::MAX) {
                return Err(DecodeError::InvalidValue("prefilled index"));
            }
            let tx = Transaction::consensus_decode_from(decoder)?;
            prefilled.push(PrefilledTransaction {
                index: index as u32,
                tx,
            });
            last_index = index;
        }
        Ok(Self {
            header,
            nonce,
            short_ids,
            prefilled,
        })
    }
}

pub fn parse_cmpctblock(payload: &[u8]) -> Result<CompactBlock, DecodeError> {
    let mut decoder = Decoder::new(payload);
    CompactBlock::consensus_decode_from(&mut decoder)
}

/// SipHash keys for a block's short IDs: the first 16 bytes of
/// SHA256(header ‖ nonce).
fn short_id_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut encoder = Encoder::with_capacity(88);
    header.consensus_encode_to(&mut encoder);
    encoder.write_u64_le(nonce);
    let digest = sha256(&encoder.into_inner());
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&digest[0..8]);
    k1.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
}

fn short_id(keys: (u64, u64), txid: &Hash256) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(keys.0, keys.1);
    hasher.write(txid);
    hasher.finish() & 0x0000_ffff_ffff_ffff
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockTxnRequest {
    pub block_hash: Hash256,
    pub indexes: Vec<u32>,
}

impl BlockTxnRequest {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        encoder.write_varint(self.indexes.len() as u64);
        let mut last_index: i64 = -1;
        for index in &self.indexes {
            let diff = i64::from(*index) - last_index - 1;
            encoder.write_varint(diff as u64);
            last_index = i64::from(*index);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let block_hash = decoder.read_hash()?;
        let count = decoder.read_length()?;
        if count > MAX_COMPACT_TX_COUNT {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut indexes = Vec::with_capacity(count);
        let mut last_index: i64 = -1;
        for _ in 0..count {
            let diff = decoder.read_varint()?;
            let index = last_index + 1 + i64::try_from(diff).map_err(|_| DecodeError::SizeTooLarge)?;
            if index > i64::from(u16::MAX) {
                return Err(DecodeError::InvalidValue("blocktxn index"));
            }
            indexes.push(index as u32);
            last_index = index;
        }
        Ok(Self {
            block_hash,
            indexes,
        })
    }
}

pub fn parse_getblocktxn(payload: &[u8]) -> Result<BlockTxnRequest, DecodeError> {
    let mut decoder = Decoder::new(payload);
    BlockTxnRequest::consensus_decode_from(&mut decoder)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockTxnResponse {
    pub block_hash: Hash256,
    pub transactions: Vec<Transaction>,
}

impl BlockTxnResponse {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.block_hash);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode_to(encoder, true);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let block_hash = decoder.read_hash()?;
        let count = decoder.read_length()?;
        if count > MAX_COMPACT_TX_COUNT {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode_from(decoder)?);
        }
        Ok(Self {
            block_hash,
            transactions,
        })
    }
}

pub fn parse_blocktxn(payload: &[u8]) -> Result<BlockTxnResponse, DecodeError> {
    let mut decoder = Decoder::new(payload);
    BlockTxnResponse::consensus_decode_from(&mut decoder)
}

/// Outcome of initializing reconstruction state from an announcement.
pub enum InitStatus {
    Ready(PartialBlock),
    /// Structurally bad announcement; worth misbehavior points.
    Invalid,
    /// Short-ID collision inside the block; fall back to a full request.
    Failed,
}

/// Outcome of merging delivered transactions into the reconstruction.
pub enum FillStatus {
    Block(Block),
    /// The response does not line up with what was requested.
    Invalid,
    /// Reconstructed data does not hash to the committed merkle root.
    Failed,
}

/// Reconstruction state for a block announced via compact encoding.
pub struct PartialBlock {
    header: BlockHeader,
    txs: Vec<Option<Transaction>>,
}

impl PartialBlock {
    pub fn init(cmpct: &CompactBlock, mempool: &[Transaction]) -> InitStatus {
        let total = cmpct.total_tx_count();
        if total == 0 || total > MAX_COMPACT_TX_COUNT {
            return InitStatus::Invalid;
        }
        let mut txs: Vec<Option<Transaction>> = vec![None; total];
        for prefilled in &cmpct.prefilled {
            let index = prefilled.index as usize;
            if index >= total || txs[index].is_some() {
                return InitStatus::Invalid;
            }
            txs[index] = Some(prefilled.tx.clone());
        }
        // Short IDs fill the remaining slots in order.
        let mut slot_of_id: HashMap<u64, usize> = HashMap::with_capacity(cmpct.short_ids.len());
        let mut short_iter = cmpct.short_ids.iter();
        for (slot, entry) in txs.iter().enumerate() {
            if entry.is_some() {
                continue;
            }
            let Some(id) = short_iter.next() else {
                return InitStatus::Invalid;
            };
            if slot_of_id.insert(*id, slot).is_some() {
                return InitStatus::Failed;
            }
        }
        if short_iter.next().is_some() {
            return InitStatus::Invalid;
        }
        let keys = short_id_keys(&cmpct.header, cmpct.nonce);
        for tx in mempool {
            let id = short_id(keys, &tx.wtxid());
            if let Some(slot) = slot_of_id.get(&id) {
                if txs[*slot].is_none() {
                    txs[*slot] = Some(tx.clone());
                }
            }
        }
        InitStatus::Ready(PartialBlock {
            header: cmpct.header,
            txs,
        })
    }

    pub fn is_tx_available(&self, index: usize) -> bool {
        self.txs.get(index).map(Option::is_some).unwrap_or(false)
    }

    pub fn missing_indexes(&self) -> Vec<u32> {
        self.txs
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_none())
            .map(|(index, _)| index as u32)
            .collect()
    }

    /// Merge the peer's response into the gaps and assemble the block.
    pub fn fill(&self, provided: &[Transaction]) -> FillStatus {
        let missing = self.txs.iter().filter(|tx| tx.is_none()).count();
        if provided.len() != missing {
            return FillStatus::Invalid;
        }
        let mut supplied = provided.iter();
        let mut txs = Vec::with_capacity(self.txs.len());
        for slot in &self.txs {
            match slot {
                Some(tx) => txs.push(tx.clone()),
                None => match supplied.next() {
                    Some(tx) => txs.push(tx.clone()),
                    None => return FillStatus::Invalid,
                },
            }
        }
        let block = Block {
            header: self.header,
            txs,
        };
        let txids: Vec<Hash256> = block.txs.iter().map(Transaction::txid).collect();
        if merkle_root(&txids) != self.header.merkle_root {
            return FillStatus::Failed;
        }
        FillStatus::Block(block)
    }
}
