//! Chain-wide constants and parameters shared across the node.

pub mod constants;
pub mod params;

pub use params::{chain_params, ChainParams, ConsensusParams, Network};

/// A 256-bit hash in wire order (little-endian when viewed as an integer).
pub type Hash256 = [u8; 32];

/// Render a hash the way block explorers print it (byte-reversed hex).
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_byte_reversed() {
        let mut hash = [0u8; 32];
        hash[31] = 0xab;
        let hex = hash256_to_hex(&hash);
        assert!(hex.starts_with("ab"));
        assert_eq!(hex.len(), 64);
    }
}
