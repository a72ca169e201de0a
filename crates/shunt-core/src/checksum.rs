//! Frame arg-region checksums.

use crate::CodecError;

/// Checksum algorithm declared by the first frame of a call and repeated by
/// its continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ChecksumType {
    None = 0x00,
    #[default]
    Crc32 = 0x01,
    Farmhash = 0x02,
    Crc32C = 0x03,
}

impl ChecksumType {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Crc32),
            0x02 => Ok(Self::Farmhash),
            0x03 => Ok(Self::Crc32C),
            other => Err(CodecError::UnknownChecksum(other)),
        }
    }

    /// Bytes the checksum value occupies on the wire.
    pub fn value_len(&self) -> usize {
        match self {
            Self::None => 0,
            _ => 4,
        }
    }

    /// Checksum the given arg region.
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            Self::None => 0,
            Self::Crc32 => crc32fast::hash(data),
            Self::Farmhash => farmhash::fingerprint32(data),
            Self::Crc32C => crc32c::crc32c(data),
        }
    }

    /// Verify a received frame's arg region against its declared checksum.
    pub fn verify(&self, data: &[u8], expected: u32) -> Result<(), CodecError> {
        let actual = self.compute(data);
        if *self != Self::None && actual != expected {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for t in [
            ChecksumType::None,
            ChecksumType::Crc32,
            ChecksumType::Farmhash,
            ChecksumType::Crc32C,
        ] {
            assert_eq!(ChecksumType::from_u8(t as u8).unwrap(), t);
        }
        assert!(ChecksumType::from_u8(0x04).is_err());
    }

    #[test]
    fn value_lengths() {
        assert_eq!(ChecksumType::None.value_len(), 0);
        assert_eq!(ChecksumType::Crc32.value_len(), 4);
        assert_eq!(ChecksumType::Farmhash.value_len(), 4);
        assert_eq!(ChecksumType::Crc32C.value_len(), 4);
    }

    #[test]
    fn algorithms_disagree_on_nontrivial_input() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let crc32 = ChecksumType::Crc32.compute(data);
        let crc32c = ChecksumType::Crc32C.compute(data);
        let farm = ChecksumType::Farmhash.compute(data);
        assert_ne!(crc32, crc32c);
        assert_ne!(crc32, farm);
    }

    #[test]
    fn verify_catches_corruption() {
        let data = b"some args";
        let sum = ChecksumType::Crc32.compute(data);
        assert!(ChecksumType::Crc32.verify(data, sum).is_ok());
        assert!(ChecksumType::Crc32.verify(b"some argz", sum).is_err());
        // None never fails verification.
        assert!(ChecksumType::None.verify(data, 0xFFFF_FFFF).is_ok());
    }
}
