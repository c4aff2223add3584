//! Transaction type with witness-aware consensus serialization.

use rookd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    /// Witness stack for this input; empty when the input carries none.
    pub witness: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.serialize(false))
    }

    pub fn wtxid(&self) -> Hash256 {
        if self.has_witness() {
            sha256d(&self.serialize(true))
        } else {
            self.txid()
        }
    }

    pub fn serialize(&self, with_witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder, with_witness);
        encoder.into_inner()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder, with_witness: bool) {
        let witness = with_witness && self.has_witness();
        encoder.write_i32_le(self.version);
        if witness {
            encoder.write_u8(0x00);
            encoder.write_u8(0x01);
        }
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.consensus_encode_to(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        if witness {
            for input in &self.inputs {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let mut input_count = decoder.read_varint()?;
        let mut segwit = false;
        if input_count == 0 {
            let flag = decoder.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidValue("witness flag"));
            }
            segwit = true;
            input_count = decoder.read_varint()?;
        }
        let input_count = bounded_count(input_count, decoder)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let prevout = OutPoint::consensus_decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            inputs.push(TxIn {
                prevout,
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }
        let output_count = bounded_count(decoder.read_varint()?, decoder)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        if segwit {
            for input in &mut inputs {
                let items = bounded_count(decoder.read_varint()?, decoder)?;
                let mut stack = Vec::with_capacity(items);
                for _ in 0..items {
                    stack.push(decoder.read_var_bytes()?);
                }
                input.witness = stack;
            }
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

/// Element counts are bounded by the bytes left: every encoded element
/// occupies at least one byte, so anything larger is malformed.
fn bounded_count(raw: u64, decoder: &Decoder<'_>) -> Result<usize, DecodeError> {
    let count = usize::try_from(raw).map_err(|_| DecodeError::SizeTooLarge)?;
    if count > decoder.remaining() {
        return Err(DecodeError::SizeTooLarge);
    }
    Ok(count)
}
