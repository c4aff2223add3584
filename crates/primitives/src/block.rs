//! Block header and block types.

use rookd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_hash: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialize(&self, with_witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder, with_witness);
        encoder.into_inner()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder, with_witness: bool) {
        self.header.consensus_encode_to(encoder);
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            tx.consensus_encode_to(encoder, with_witness);
        }
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let raw_count = decoder.read_varint()?;
        let count = usize::try_from(raw_count).map_err(|_| DecodeError::SizeTooLarge)?;
        if count > decoder.remaining() {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut txs = Vec::with_capacity(count);
        for _ in 0..count {
            txs.push(Transaction::consensus_decode_from(decoder)?);
        }
        Ok(Self { header, txs })
    }

    pub fn merkle_root(&self) -> Hash256 {
        merkle_root(&self.txs.iter().map(Transaction::txid).collect::<Vec<_>>())
    }
}

/// Pairwise double-SHA256 merkle root; the last node is duplicated on odd
/// levels, matching the chain's historical construction.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut joined = [0u8; 64];
            joined[..32].copy_from_slice(&left);
            joined[32..].copy_from_slice(&right);
            next.push(sha256d(&joined));
        }
        level = next;
    }
    level[0]
}
