use rookd_consensus::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_vectors() {
        let single = sha256(b"");
        assert_eq!(single[0], 0xe3);
        assert_eq!(single[31], 0x55);
        let double = sha256d(b"");
        assert_eq!(double[0], 0x5d);
        assert_eq!(double[1], 0xf6);
    }
}
