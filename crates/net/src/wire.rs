//! Byte-exact wire codec: message framing plus every payload this node
//! emits or consumes.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use rookd_consensus::constants::{MAX_PROTOCOL_MESSAGE_LENGTH, MAX_REJECT_MESSAGE_LENGTH, MAX_SUBVERSION_LENGTH};
use rookd_consensus::Hash256;
use rookd_primitives::{sha256d, Block, BlockHeader, DecodeError, Decoder, Encoder, Transaction};

use crate::bloom::BloomFilter;
use crate::compact::{BlockTxnRequest, BlockTxnResponse, CompactBlock};

pub const HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;

/// Inventory type codes, including the witness and compact extensions.
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_CMPCT_BLOCK: u32 = 4;
pub const MSG_WITNESS_FLAG: u32 = 1 << 30;
pub const MSG_WITNESS_TX: u32 = MSG_TX | MSG_WITNESS_FLAG;
pub const MSG_WITNESS_BLOCK: u32 = MSG_BLOCK | MSG_WITNESS_FLAG;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Inv {
    pub kind: u32,
    pub hash: Hash256,
}

impl Inv {
    pub fn new(kind: u32, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn base_kind(&self) -> u32 {
        self.kind & !MSG_WITNESS_FLAG
    }

    pub fn is_block_kind(&self) -> bool {
        matches!(
            self.base_kind(),
            MSG_BLOCK | MSG_FILTERED_BLOCK | MSG_CMPCT_BLOCK
        )
    }

    pub fn is_tx_kind(&self) -> bool {
        self.base_kind() == MSG_TX
    }

    pub fn wants_witness(&self) -> bool {
        self.kind & MSG_WITNESS_FLAG != 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetAddress {
    pub time: u32,
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: SocketAddr, services: u64, time: u32) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            time,
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip6),
        };
        SocketAddr::new(ip, self.port)
    }

    /// Stable map key: ip plus port.
    pub fn key(&self) -> [u8; 18] {
        let mut key = [0u8; 18];
        key[..16].copy_from_slice(&self.ip);
        key[16..].copy_from_slice(&self.port.to_be_bytes());
        key
    }

    pub fn is_routable(&self) -> bool {
        let addr = self.socket_addr();
        if self.port == 0 {
            return false;
        }
        match addr.ip() {
            IpAddr::V4(v4) => {
                !(v4.is_unspecified() || v4.is_loopback() || v4.is_private() || v4.is_link_local())
            }
            IpAddr::V6(v6) => !(v6.is_unspecified() || v6.is_loopback()),
        }
    }

    pub fn is_local(&self) -> bool {
        match self.socket_addr().ip() {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified(),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }
    }

    fn encode_to(&self, encoder: &mut Encoder, with_time: bool) {
        if with_time {
            encoder.write_u32_le(self.time);
        }
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_bytes(&self.port.to_be_bytes());
    }

    fn decode_from(decoder: &mut Decoder<'_>, with_time: bool) -> Result<Self, DecodeError> {
        let time = if with_time { decoder.read_u32_le()? } else { 0 };
        let services = decoder.read_u64_le()?;
        let ip = decoder.read_fixed::<16>()?;
        let port_bytes = decoder.read_fixed::<2>()?;
        Ok(Self {
            time,
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockLocator {
    pub version: u32,
    pub have: Vec<Hash256>,
    pub stop: Hash256,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SendCmpct {
    pub announce: bool,
    pub version: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub hash: Option<Hash256>,
}

impl RejectMessage {
    pub fn new(message: &str, code: u8, reason: &str) -> Self {
        let mut reason = reason.to_string();
        reason.truncate(MAX_REJECT_MESSAGE_LENGTH);
        Self {
            message: message.to_string(),
            code,
            reason,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Hash256) -> Self {
        self.hash = Some(hash);
        self
    }
}

/// Every message this node can push to a peer.
#[derive(Clone, Debug)]
pub enum NetMessage {
    Version(VersionMessage),
    Verack,
    Addr(Vec<NetAddress>),
    GetAddr,
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    NotFound(Vec<Inv>),
    GetBlocks(BlockLocator),
    GetHeaders(BlockLocator),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    MemPool,
    Ping(Option<u64>),
    Pong(u64),
    Reject(RejectMessage),
    SendHeaders,
    FeeFilter(i64),
    SendCmpct(SendCmpct),
    CmpctBlock(CompactBlock),
    GetBlockTxn(BlockTxnRequest),
    BlockTxn(BlockTxnResponse),
    FilterLoad(BloomFilter),
    FilterAdd(Vec<u8>),
    FilterClear,
    Checkpoint(Vec<u8>),
    GetCheckpoint(i32),
}

impl NetMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetMessage::Version(_) => "version",
            NetMessage::Verack => "verack",
            NetMessage::Addr(_) => "addr",
            NetMessage::GetAddr => "getaddr",
            NetMessage::Inv(_) => "inv",
            NetMessage::GetData(_) => "getdata",
            NetMessage::NotFound(_) => "notfound",
            NetMessage::GetBlocks(_) => "getblocks",
            NetMessage::GetHeaders(_) => "getheaders",
            NetMessage::Headers(_) => "headers",
            NetMessage::Block(_) => "block",
            NetMessage::Tx(_) => "tx",
            NetMessage::MemPool => "mempool",
            NetMessage::Ping(_) => "ping",
            NetMessage::Pong(_) => "pong",
            NetMessage::Reject(_) => "reject",
            NetMessage::SendHeaders => "sendheaders",
            NetMessage::FeeFilter(_) => "feefilter",
            NetMessage::SendCmpct(_) => "sendcmpct",
            NetMessage::CmpctBlock(_) => "cmpctblock",
            NetMessage::GetBlockTxn(_) => "getblocktxn",
            NetMessage::BlockTxn(_) => "blocktxn",
            NetMessage::FilterLoad(_) => "filterload",
            NetMessage::FilterAdd(_) => "filteradd",
            NetMessage::FilterClear => "filterclear",
            NetMessage::Checkpoint(_) => "checkpoint",
            NetMessage::GetCheckpoint(_) => "getcheckpoint",
        }
    }

    pub fn serialize_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            NetMessage::Version(msg) => {
                encoder.write_i32_le(msg.version);
                encoder.write_u64_le(msg.services);
                encoder.write_i64_le(msg.timestamp);
                msg.addr_recv.encode_to(&mut encoder, false);
                msg.addr_from.encode_to(&mut encoder, false);
                encoder.write_u64_le(msg.nonce);
                encoder.write_var_str(&msg.user_agent);
                encoder.write_i32_le(msg.start_height);
                encoder.write_bool(msg.relay);
            }
            NetMessage::Verack
            | NetMessage::GetAddr
            | NetMessage::MemPool
            | NetMessage::SendHeaders
            | NetMessage::FilterClear => {}
            NetMessage::Addr(addresses) => {
                encoder.write_varint(addresses.len() as u64);
                for address in addresses {
                    address.encode_to(&mut encoder, true);
                }
            }
            NetMessage::Inv(items) | NetMessage::GetData(items) | NetMessage::NotFound(items) => {
                encoder.write_varint(items.len() as u64);
                for item in items {
                    encoder.write_u32_le(item.kind);
                    encoder.write_hash_le(&item.hash);
                }
            }
            NetMessage::GetBlocks(locator) | NetMessage::GetHeaders(locator) => {
                encoder.write_u32_le(locator.version);
                encoder.write_varint(locator.have.len() as u64);
                for hash in &locator.have {
                    encoder.write_hash_le(hash);
                }
                encoder.write_hash_le(&locator.stop);
            }
            NetMessage::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode_to(&mut encoder);
                    // Headers carry an empty transaction list on the wire.
                    encoder.write_varint(0);
                }
            }
            NetMessage::Block(block) => {
                block.consensus_encode_to(&mut encoder, true);
            }
            NetMessage::Tx(tx) => {
                tx.consensus_encode_to(&mut encoder, true);
            }
            NetMessage::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    encoder.write_u64_le(*nonce);
                }
            }
            NetMessage::Pong(nonce) => {
                encoder.write_u64_le(*nonce);
            }
            NetMessage::Reject(reject) => {
                encoder.write_var_str(&reject.message);
                encoder.write_u8(reject.code);
                encoder.write_var_str(&reject.reason);
                if let Some(hash) = &reject.hash {
                    encoder.write_hash_le(hash);
                }
            }
            NetMessage::FeeFilter(rate) => {
                encoder.write_i64_le(*rate);
            }
            NetMessage::SendCmpct(msg) => {
                encoder.write_bool(msg.announce);
                encoder.write_u64_le(msg.version);
            }
            NetMessage::CmpctBlock(block) => {
                block.consensus_encode_to(&mut encoder);
            }
            NetMessage::GetBlockTxn(request) => {
                request.consensus_encode_to(&mut encoder);
            }
            NetMessage::BlockTxn(response) => {
                response.consensus_encode_to(&mut encoder);
            }
            NetMessage::FilterLoad(filter) => {
                filter.consensus_encode_to(&mut encoder);
            }
            NetMessage::FilterAdd(data) => {
                encoder.write_var_bytes(data);
            }
            NetMessage::Checkpoint(payload) => {
                encoder.write_bytes(payload);
            }
            NetMessage::GetCheckpoint(height) => {
                encoder.write_i32_le(*height);
            }
        }
        encoder.into_inner()
    }
}

/// 24-byte frame header preceding every payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Self {
            magic,
            command,
            length,
            checksum,
        }
    }

    /// Command as text; `None` when padding is malformed or a byte is not
    /// printable ASCII.
    pub fn command_str(&self) -> Option<String> {
        let end = self
            .command
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_SIZE);
        if self.command[end..].iter().any(|byte| *byte != 0) {
            return None;
        }
        let name = &self.command[..end];
        if name.is_empty() || !name.iter().all(|byte| byte.is_ascii_graphic()) {
            return None;
        }
        Some(String::from_utf8_lossy(name).into_owned())
    }
}

/// A framed message as delivered by the transport; the dispatcher validates
/// magic and checksum itself so framing abuse is graded, not assumed away.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameError {
    BadMagic,
    BadCommand,
    Oversized,
    BadChecksum,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadMagic => write!(f, "invalid message start"),
            FrameError::BadCommand => write!(f, "malformed command field"),
            FrameError::Oversized => write!(f, "payload exceeds protocol limit"),
            FrameError::BadChecksum => write!(f, "payload checksum mismatch"),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Validate a raw frame against the network magic. Returns the command.
pub fn check_frame(magic: &[u8; 4], raw: &RawMessage) -> Result<String, FrameError> {
    if &raw.header.magic != magic {
        return Err(FrameError::BadMagic);
    }
    let command = raw.header.command_str().ok_or(FrameError::BadCommand)?;
    if raw.header.length as usize != raw.payload.len()
        || raw.payload.len() > MAX_PROTOCOL_MESSAGE_LENGTH
    {
        return Err(FrameError::Oversized);
    }
    if checksum(&raw.payload) != raw.header.checksum {
        return Err(FrameError::BadChecksum);
    }
    Ok(command)
}

/// Serialize a full frame ready for the socket.
pub fn frame_message(magic: &[u8; 4], message: &NetMessage) -> Vec<u8> {
    let payload = message.serialize_payload();
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(magic);
    let mut command = [0u8; COMMAND_SIZE];
    let name = message.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&command);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(&payload));
    out.extend_from_slice(&payload);
    out
}

// Payload parsers for inbound traffic.

pub fn parse_version(payload: &[u8]) -> Result<VersionMessage, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    let addr_recv = NetAddress::decode_from(&mut decoder, false)?;
    // Fields below are optional for ancient peers; default like the legacy
    // deserializer did.
    let mut message = VersionMessage {
        version,
        services,
        timestamp,
        addr_recv,
        addr_from: NetAddress {
            time: 0,
            services: 0,
            ip: [0u8; 16],
            port: 0,
        },
        nonce: 1,
        user_agent: String::new(),
        start_height: -1,
        relay: true,
    };
    if !decoder.is_empty() {
        message.addr_from = NetAddress::decode_from(&mut decoder, false)?;
        message.nonce = decoder.read_u64_le()?;
    }
    if !decoder.is_empty() {
        let user_agent = decoder.read_var_str()?;
        if user_agent.len() > MAX_SUBVERSION_LENGTH {
            return Err(DecodeError::SizeTooLarge);
        }
        message.user_agent = user_agent;
    }
    if !decoder.is_empty() {
        message.start_height = decoder.read_i32_le()?;
    }
    if !decoder.is_empty() {
        message.relay = decoder.read_bool()?;
    }
    Ok(message)
}

pub fn parse_addr(payload: &[u8]) -> Result<Vec<NetAddress>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_length()?;
    let mut addresses = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        addresses.push(NetAddress::decode_from(&mut decoder, true)?);
    }
    Ok(addresses)
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<Inv>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_length()?;
    let mut items = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let kind = decoder.read_u32_le()?;
        let hash = decoder.read_hash()?;
        items.push(Inv { kind, hash });
    }
    Ok(items)
}

pub fn parse_locator(payload: &[u8]) -> Result<BlockLocator, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_u32_le()?;
    let count = decoder.read_length()?;
    let mut have = Vec::with_capacity(count.min(101));
    for _ in 0..count {
        have.push(decoder.read_hash()?);
    }
    let stop = decoder.read_hash()?;
    Ok(BlockLocator {
        version,
        have,
        stop,
    })
}

pub fn parse_sendcmpct(payload: &[u8]) -> Result<SendCmpct, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let announce = decoder.read_bool()?;
    let version = decoder.read_u64_le()?;
    Ok(SendCmpct { announce, version })
}

pub fn parse_nonce(payload: &[u8]) -> Result<u64, DecodeError> {
    let mut decoder = Decoder::new(payload);
    decoder.read_u64_le()
}

pub fn parse_feefilter(payload: &[u8]) -> Result<i64, DecodeError> {
    let mut decoder = Decoder::new(payload);
    decoder.read_i64_le()
}

pub fn parse_getcheckpoint(payload: &[u8]) -> Result<i32, DecodeError> {
    let mut decoder = Decoder::new(payload);
    decoder.read_i32_le()
}

pub fn parse_reject(payload: &[u8]) -> Result<RejectMessage, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let message = decoder.read_var_str()?;
    if message.len() > COMMAND_SIZE {
        return Err(DecodeError::SizeTooLarge);
    }
    let code = decoder.read_u8()?;
    let reason = decoder.read_var_str()?;
    if reason.len() > MAX_REJECT_MESSAGE_LENGTH {
        return Err(DecodeError::SizeTooLarge);
    }
    let hash = if (message == "block" || message == "tx") && decoder.remaining() >= 32 {
        Some(decoder.read_hash()?)
    } else {
        None
    };
    Ok(RejectMessage {
        message,
        code,
        reason,
        hash,
    })
}

pub fn parse_filteradd(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    decoder.read_var_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookd_consensus::constants::{NODE_NETWORK, NODE_WITNESS};

    fn sample_version() -> VersionMessage {
        VersionMessage {
            version: 70_015,
            services: NODE_NETWORK | NODE_WITNESS,
            timestamp: 1_700_000_000,
            addr_recv: NetAddress::from_socket("203.0.113.7:8333".parse().unwrap(), NODE_NETWORK, 0),
            addr_from: NetAddress::from_socket("0.0.0.0:0".parse().unwrap(), NODE_NETWORK, 0),
            nonce: 0x1122_3344_5566_7788,
            user_agent: "/rookd:0.1.0/".to_string(),
            start_height: 812_345,
            relay: true,
        }
    }

    #[test]
    fn version_payload_layout() {
        let message = NetMessage::Version(sample_version());
        let payload = message.serialize_payload();
        // version + services + timestamp
        assert_eq!(&payload[0..4], &70_015i32.to_le_bytes());
        assert_eq!(&payload[4..12], &(NODE_NETWORK | NODE_WITNESS).to_le_bytes());
        // two addresses without timestamps: 26 bytes each
        let agent_offset = 4 + 8 + 8 + 26 + 26 + 8;
        assert_eq!(payload[agent_offset], 13); // var_str length
        assert_eq!(&payload[agent_offset + 1..agent_offset + 14], b"/rookd:0.1.0/");
        // trailing relay flag
        assert_eq!(*payload.last().unwrap(), 1);
        let parsed = parse_version(&payload).expect("parse");
        assert_eq!(parsed, sample_version());
    }

    #[test]
    fn version_tolerates_missing_tail() {
        let full = NetMessage::Version(sample_version()).serialize_payload();
        // Strip relay + start_height + user agent + addr_from/nonce.
        let truncated = &full[..4 + 8 + 8 + 26];
        let parsed = parse_version(truncated).expect("parse");
        assert_eq!(parsed.start_height, -1);
        assert!(parsed.relay);
        assert_eq!(parsed.nonce, 1);
    }

    #[test]
    fn frame_roundtrip() {
        let magic = [0xf9, 0xbe, 0xb4, 0xd9];
        let message = NetMessage::Ping(Some(7));
        let bytes = frame_message(&magic, &message);
        assert_eq!(bytes.len(), HEADER_SIZE + 8);
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = MessageHeader::decode(&header);
        let raw = RawMessage {
            header,
            payload: bytes[HEADER_SIZE..].to_vec(),
        };
        assert_eq!(check_frame(&magic, &raw).expect("frame"), "ping");
    }

    #[test]
    fn frame_rejects_bad_magic_and_checksum() {
        let magic = [0xf9, 0xbe, 0xb4, 0xd9];
        let bytes = frame_message(&magic, &NetMessage::Verack);
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let mut raw = RawMessage {
            header: MessageHeader::decode(&header),
            payload: Vec::new(),
        };
        assert_eq!(
            check_frame(&[0, 1, 2, 3], &raw),
            Err(FrameError::BadMagic)
        );
        raw.header.checksum = [0xde, 0xad, 0xbe, 0xef];
        assert_eq!(check_frame(&magic, &raw), Err(FrameError::BadChecksum));
    }

    #[test]
    fn command_padding_must_be_null() {
        let magic = [0xf9, 0xbe, 0xb4, 0xd9];
        let bytes = frame_message(&magic, &NetMessage::Verack);
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let mut decoded = MessageHeader::decode(&header);
        decoded.command[11] = b'x';
        assert!(decoded.command_str().is_none());
    }

    #[test]
    fn headers_payload_appends_zero_tx_counts() {
        let header = BlockHeader {
            version: 4,
            prev_hash: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 3,
            bits: 0x207f_ffff,
            nonce: 4,
        };
        let payload = NetMessage::Headers(vec![header, header]).serialize_payload();
        assert_eq!(payload.len(), 1 + 2 * 81);
        assert_eq!(payload[1 + 80], 0);
        assert_eq!(payload[1 + 81 + 80], 0);
    }

    #[test]
    fn inv_roundtrip() {
        let items = vec![
            Inv::new(MSG_BLOCK, [9u8; 32]),
            Inv::new(MSG_WITNESS_TX, [7u8; 32]),
        ];
        let payload = NetMessage::Inv(items.clone()).serialize_payload();
        assert_eq!(parse_inv(&payload).expect("parse"), items);
        assert!(items[0].is_block_kind());
        assert!(items[1].is_tx_kind());
        assert!(items[1].wants_witness());
    }

    #[test]
    fn reject_hash_only_for_block_and_tx() {
        let reject = RejectMessage::new("block", 0x10, "bad-header").with_hash([5u8; 32]);
        let payload = NetMessage::Reject(reject.clone()).serialize_payload();
        let parsed = parse_reject(&payload).expect("parse");
        assert_eq!(parsed, reject);

        let plain = RejectMessage::new("version", 0x11, "obsolete");
        let payload = NetMessage::Reject(plain.clone()).serialize_payload();
        assert_eq!(parse_reject(&payload).expect("parse"), plain);
    }

    #[test]
    fn locator_roundtrip() {
        let locator = BlockLocator {
            version: 70_015,
            have: vec![[1u8; 32], [2u8; 32]],
            stop: [0u8; 32],
        };
        let payload = NetMessage::GetHeaders(locator.clone()).serialize_payload();
        assert_eq!(parse_locator(&payload).expect("parse"), locator);
    }
}
