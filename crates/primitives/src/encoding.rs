//! Consensus wire serialization primitives.
//!
//! Integers are little-endian; lengths use the canonical compact-size
//! encoding. Decoding rejects non-minimal length prefixes so that a
//! re-encoded message is always byte-identical to its source.

use std::fmt;

use rookd_consensus::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    UnexpectedEnd,
    SizeTooLarge,
    NonCanonicalVarInt,
    InvalidValue(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEnd => write!(f, "end of data"),
            DecodeError::SizeTooLarge => write!(f, "size too large"),
            DecodeError::NonCanonicalVarInt => write!(f, "non-canonical compact size"),
            DecodeError::InvalidValue(what) => write!(f, "invalid value: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Default)]
pub struct Encoder {
    bytes: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.bytes.push(u8::from(value));
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.bytes.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.bytes.push(value as u8);
        } else if value <= 0xffff {
            self.bytes.push(0xfd);
            self.bytes.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= 0xffff_ffff {
            self.bytes.push(0xfe);
            self.bytes.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            self.bytes.push(0xff);
            self.bytes.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn write_var_bytes(&mut self, data: &[u8]) {
        self.write_varint(data.len() as u64);
        self.bytes.extend_from_slice(data);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.position >= self.bytes.len()
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEnd);
        }
        let start = self.position;
        self.position += count;
        Ok(&self.bytes[start..self.position])
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let tag = self.read_u8()?;
        match tag {
            0xfd => {
                let value = u64::from(self.read_u16_le()?);
                if value < 0xfd {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                Ok(value)
            }
            0xfe => {
                let value = u64::from(self.read_u32_le()?);
                if value <= 0xffff {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                Ok(value)
            }
            0xff => {
                let value = self.read_u64_le()?;
                if value <= 0xffff_ffff {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                Ok(value)
            }
            small => Ok(u64::from(small)),
        }
    }

    /// Read a compact-size length that must fit the remaining input.
    pub fn read_length(&mut self) -> Result<usize, DecodeError> {
        let raw = self.read_varint()?;
        let length = usize::try_from(raw).map_err(|_| DecodeError::SizeTooLarge)?;
        if length > self.remaining() {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(length)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let length = self.read_length()?;
        Ok(self.read_bytes(length)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidValue("utf-8 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint().expect("decode"), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn varint_rejects_non_canonical() {
        // 0xfd prefix carrying a value that fits a single byte.
        let mut decoder = Decoder::new(&[0xfd, 0x01, 0x00]);
        assert_eq!(decoder.read_varint(), Err(DecodeError::NonCanonicalVarInt));

        let mut decoder = Decoder::new(&[0xfe, 0xff, 0xff, 0x00, 0x00]);
        assert_eq!(decoder.read_varint(), Err(DecodeError::NonCanonicalVarInt));
    }

    #[test]
    fn length_must_fit_input() {
        let mut decoder = Decoder::new(&[0x05, 0xaa]);
        assert_eq!(decoder.read_length(), Err(DecodeError::SizeTooLarge));
    }

    #[test]
    fn truncated_read_reports_end() {
        let mut decoder = Decoder::new(&[0x01, 0x02]);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn var_str_roundtrip() {
        let mut encoder = Encoder::new();
        encoder.write_var_str("/rookd:0.1.0/");
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_var_str().expect("decode"), "/rookd:0.1.0/");
    }
}
