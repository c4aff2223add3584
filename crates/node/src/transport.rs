//! Framed socket I/O. The transport only length-caps and delivers frames;
//! magic and checksum grading stays with the message processor.

use rookd_consensus::constants::MAX_PROTOCOL_MESSAGE_LENGTH;
use rookd_net::wire::{self, MessageHeader, NetMessage, RawMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub async fn read_raw_message(stream: &mut OwnedReadHalf) -> Result<RawMessage, String> {
    let mut header_bytes = [0u8; wire::HEADER_SIZE];
    stream
        .read_exact(&mut header_bytes)
        .await
        .map_err(|err| err.to_string())?;
    let header = MessageHeader::decode(&header_bytes);
    let length = header.length as usize;
    if length > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(format!("oversized payload ({length} bytes)"));
    }
    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| err.to_string())?;
    Ok(RawMessage { header, payload })
}

pub async fn write_message(
    stream: &mut OwnedWriteHalf,
    magic: &[u8; 4],
    message: &NetMessage,
) -> Result<(), String> {
    let bytes = wire::frame_message(magic, message);
    stream
        .write_all(&bytes)
        .await
        .map_err(|err| err.to_string())?;
    Ok(())
}
