//! BIP 37 bloom filter as loaded by light clients.

use rookd_primitives::{DecodeError, Decoder, Encoder, OutPoint, Transaction};

/// Largest serialized filter a peer may load, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Largest hash-function count a peer may request.
pub const MAX_HASH_FUNCS: u32 = 50;

pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

#[derive(Clone, Debug)]
pub struct BloomFilter {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl BloomFilter {
    /// An empty filter matching nothing, as installed by `filterclear`.
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            hash_funcs: 0,
            tweak: 0,
            flags: BLOOM_UPDATE_ALL,
        }
    }

    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_HASH_FUNCS
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = n.wrapping_mul(0xfba4_c795).wrapping_add(self.tweak);
        (murmur3_32(seed, data) as usize) % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, data);
            self.data[index >> 3] |= 1 << (7 & index);
        }
    }

    pub fn insert_outpoint(&mut self, outpoint: &OutPoint) {
        let mut encoder = Encoder::with_capacity(36);
        outpoint.consensus_encode_to(&mut encoder);
        self.insert(&encoder.into_inner());
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        for n in 0..self.hash_funcs {
            let index = self.bit_index(n, data);
            if self.data[index >> 3] & (1 << (7 & index)) == 0 {
                return false;
            }
        }
        true
    }

    /// Whether the transaction matches; on a data-element match the spent
    /// outpoint is folded in so chained spends keep matching.
    pub fn is_relevant_and_update(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();
        let mut found = self.contains(&txid);
        for (index, output) in tx.outputs.iter().enumerate() {
            let mut matched = false;
            for element in script_push_elements(&output.script_pubkey) {
                if !element.is_empty() && self.contains(element) {
                    matched = true;
                    break;
                }
            }
            if matched {
                found = true;
                if self.flags == BLOOM_UPDATE_ALL {
                    self.insert_outpoint(&OutPoint {
                        hash: txid,
                        index: index as u32,
                    });
                }
            }
        }
        if found {
            return true;
        }
        for input in &tx.inputs {
            let mut encoder = Encoder::with_capacity(36);
            input.prevout.consensus_encode_to(&mut encoder);
            if self.contains(&encoder.into_inner()) {
                return true;
            }
            for element in script_push_elements(&input.script_sig) {
                if !element.is_empty() && self.contains(element) {
                    return true;
                }
            }
        }
        false
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.data);
        encoder.write_u32_le(self.hash_funcs);
        encoder.write_u32_le(self.tweak);
        encoder.write_u8(self.flags);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            data: decoder.read_var_bytes()?,
            hash_funcs: decoder.read_u32_le()?,
            tweak: decoder.read_u32_le()?,
            flags: decoder.read_u8()?,
        })
    }
}

pub fn parse_filterload(payload: &[u8]) -> Result<BloomFilter, DecodeError> {
    let mut decoder = Decoder::new(payload);
    BloomFilter::consensus_decode_from(&mut decoder)
}

/// Iterate the pushed data elements of a script, skipping opcodes.
fn script_push_elements(script: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let mut cursor = 0usize;
    std::iter::from_fn(move || {
        while cursor < script.len() {
            let opcode = script[cursor];
            cursor += 1;
            let length = match opcode {
                1..=75 => opcode as usize,
                76 => {
                    let len = *script.get(cursor)? as usize;
                    cursor += 1;
                    len
                }
                77 => {
                    let bytes = script.get(cursor..cursor + 2)?;
                    cursor += 2;
                    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                }
                78 => {
                    let bytes = script.get(cursor..cursor + 4)?;
                    cursor += 4;
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                _ => continue,
            };
            let element = script.get(cursor..cursor + length)?;
            cursor += length;
            return Some(element);
        }
        None
    })
}

/// 32-bit MurmurHash3, the hash BIP 37 filters are defined over.
pub fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (index, byte) in tail.iter().enumerate() {
            k1 |= u32::from(*byte) << (8 * index);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur_reference_vectors() {
        assert_eq!(murmur3_32(0, b""), 0);
        assert_eq!(murmur3_32(0xfba4_c795, b""), 0x6a39_6f08);
        assert_eq!(murmur3_32(0, b"\x00"), 0x514e_28b7);
    }

    #[test]
    fn insert_then_contains() {
        let mut filter = BloomFilter {
            data: vec![0u8; 64],
            hash_funcs: 5,
            tweak: 0xdead_beef,
            flags: BLOOM_UPDATE_ALL,
        };
        let element = [0xabu8; 20];
        assert!(!filter.contains(&element));
        filter.insert(&element);
        assert!(filter.contains(&element));
        assert!(!filter.contains(&[0x01u8; 20]));
    }

    #[test]
    fn size_constraints() {
        let oversized = BloomFilter {
            data: vec![0u8; MAX_BLOOM_FILTER_SIZE + 1],
            hash_funcs: 1,
            tweak: 0,
            flags: 0,
        };
        assert!(!oversized.is_within_size_constraints());
        let greedy = BloomFilter {
            data: vec![0u8; 8],
            hash_funcs: MAX_HASH_FUNCS + 1,
            tweak: 0,
            flags: 0,
        };
        assert!(!greedy.is_within_size_constraints());
    }

    #[test]
    fn script_elements_parsed() {
        // OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        let elements: Vec<&[u8]> = script_push_elements(&script).collect();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0], &[0x11; 20][..]);
    }

    #[test]
    fn roundtrip_encoding() {
        let filter = BloomFilter {
            data: vec![1, 2, 3, 4],
            hash_funcs: 3,
            tweak: 99,
            flags: BLOOM_UPDATE_NONE,
        };
        let mut encoder = Encoder::new();
        filter.consensus_encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let decoded = parse_filterload(&bytes).expect("decode");
        assert_eq!(decoded.data, filter.data);
        assert_eq!(decoded.hash_funcs, filter.hash_funcs);
        assert_eq!(decoded.tweak, filter.tweak);
        assert_eq!(decoded.flags, filter.flags);
    }
}
