//! Protocol-wide constants shared across networking and validation.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// Version used for messages exchanged before the handshake completes.
pub const INIT_PROTO_VERSION: i32 = 209;
/// Oldest protocol version we keep a connection with.
pub const MIN_PEER_PROTO_VERSION: i32 = 31_800;
/// BIP 31: ping expects a pong with a nonce above this version.
pub const BIP0031_VERSION: i32 = 60_000;
/// Addresses carry timestamps from this version on.
pub const CADDR_TIME_VERSION: i32 = 31_402;
/// BIP 130: "sendheaders" is understood from this version on.
pub const SENDHEADERS_VERSION: i32 = 70_012;
/// BIP 133: "feefilter" is understood from this version on.
pub const FEEFILTER_VERSION: i32 = 70_013;
/// BIP 152: compact blocks are understood from this version on.
pub const SHORT_IDS_BLOCKS_VERSION: i32 = 70_014;
/// BIP 111: unsolicited bloom filters are a protocol violation from here on.
pub const NO_BLOOM_VERSION: i32 = 70_011;

/// Service bit: node can serve the full block chain.
pub const NODE_NETWORK: u64 = 1;
/// Service bit: node accepts bloom-filtered connections (BIP 111).
pub const NODE_BLOOM: u64 = 1 << 2;
/// Service bit: node can serve witness data (BIP 144).
pub const NODE_WITNESS: u64 = 1 << 3;

/// Hard cap on any framed P2P payload.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;
/// Maximum length of a peer's advertised user agent.
pub const MAX_SUBVERSION_LENGTH: usize = 256;
/// Maximum length of the reason string inside a reject message.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;
/// Maximum size of a pushed script element, which bounds filteradd data.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// One coin in base units.
pub const COIN: i64 = 100_000_000;
/// Upper bound for monetary values carried in fee filters.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Reject message codes (BIP 61 era).
pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_NONSTANDARD: u8 = 0x40;

pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(-1));
        assert!(!money_range(MAX_MONEY + 1));
    }
}
