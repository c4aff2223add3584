//! Per-network chain parameters.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// Consensus-side parameters the networking layer needs to reason about.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// Proof-of-work limit, little-endian 256-bit target.
    pub pow_limit: Hash256,
    /// Expected seconds between blocks.
    pub pow_target_spacing: i64,
    /// Minimum accumulated work before block download starts, little-endian.
    pub min_chain_work: Hash256,
    /// Height at which witness commitments become mandatory.
    pub witness_activation_height: i32,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// First four bytes of every framed message on this network.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub genesis_version: i32,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub genesis_merkle_root: Hash256,
    pub consensus: ConsensusParams,
}

fn le_bytes_from_u64(low: u64) -> Hash256 {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&low.to_le_bytes());
    out
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            genesis_version: 1,
            genesis_time: 1_231_006_505,
            genesis_bits: 0x1d00_ffff,
            genesis_nonce: 2_083_236_893,
            genesis_merkle_root: {
                let mut root = [0u8; 32];
                root[0] = 0x3b;
                root[1] = 0xa3;
                root
            },
            consensus: ConsensusParams {
                pow_limit: {
                    let mut limit = [0xffu8; 32];
                    limit[31] = 0x00;
                    limit[30] = 0x00;
                    limit[29] = 0xff;
                    limit
                },
                pow_target_spacing: 600,
                min_chain_work: le_bytes_from_u64(0x0000_0010_0001_0001),
                witness_activation_height: 481_824,
            },
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18_333,
            genesis_version: 1,
            genesis_time: 1_296_688_602,
            genesis_bits: 0x1d00_ffff,
            genesis_nonce: 414_098_458,
            genesis_merkle_root: {
                let mut root = [0u8; 32];
                root[0] = 0x3b;
                root[1] = 0xa3;
                root
            },
            consensus: ConsensusParams {
                pow_limit: {
                    let mut limit = [0xffu8; 32];
                    limit[31] = 0x00;
                    limit[30] = 0x00;
                    limit[29] = 0xff;
                    limit
                },
                pow_target_spacing: 600,
                min_chain_work: le_bytes_from_u64(0x0000_0000_0001_0001),
                witness_activation_height: 834_624,
            },
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18_444,
            genesis_version: 1,
            genesis_time: 1_296_688_602,
            genesis_bits: 0x207f_ffff,
            genesis_nonce: 2,
            genesis_merkle_root: {
                let mut root = [0u8; 32];
                root[0] = 0x3b;
                root[1] = 0xa3;
                root
            },
            consensus: ConsensusParams {
                pow_limit: {
                    let mut limit = [0xffu8; 32];
                    limit[31] = 0x7f;
                    limit
                },
                pow_target_spacing: 600,
                min_chain_work: [0u8; 32],
                witness_activation_height: 0,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_roundtrip() {
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("main"), Some(Network::Mainnet));
        assert!(Network::parse("other").is_none());
    }

    #[test]
    fn magic_bytes_differ_per_network() {
        let main = chain_params(Network::Mainnet);
        let test = chain_params(Network::Testnet);
        let reg = chain_params(Network::Regtest);
        assert_ne!(main.message_start, test.message_start);
        assert_ne!(main.message_start, reg.message_start);
    }

    #[test]
    fn regtest_has_no_minimum_work() {
        let reg = chain_params(Network::Regtest);
        assert_eq!(reg.consensus.min_chain_work, [0u8; 32]);
    }
}
