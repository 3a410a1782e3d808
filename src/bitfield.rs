//! Per-piece presence vector sent once at connection start and updated by
//! HAVE messages thereafter. Bit ordering is MSB-first within each byte
//! (spec §4.3); spare bits past `num_pieces` must be zero.
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

#[derive(Debug, Error)]
pub enum BitfieldError {
    #[error("bitfield is {got} bytes, expected {expected} for {num_pieces} pieces")]
    WrongLength {
        got: usize,
        expected: usize,
        num_pieces: usize,
    },
    #[error("spare bits past piece count must be zero")]
    NonZeroSpareBits,
}

fn byte_len(num_pieces: usize) -> usize {
    num_pieces.div_ceil(8)
}

impl Bitfield {
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; byte_len(num_pieces)],
            num_pieces,
        }
    }

    pub fn from_wire_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self, BitfieldError> {
        let expected = byte_len(num_pieces);
        if bytes.len() != expected {
            return Err(BitfieldError::WrongLength {
                got: bytes.len(),
                expected,
                num_pieces,
            });
        }
        let field = Self {
            bytes: bytes.to_vec(),
            num_pieces,
        };
        if field.has_nonzero_spare_bits() {
            return Err(BitfieldError::NonZeroSpareBits);
        }
        Ok(field)
    }

    fn has_nonzero_spare_bits(&self) -> bool {
        let spare = self.num_pieces % 8;
        if spare == 0 {
            return false;
        }
        let mask = 0xFFu8 >> spare;
        self.bytes.last().is_some_and(|&b| b & mask != 0)
    }

    pub fn to_wire_bytes(&self) -> Bytes {
        Bytes::from(self.bytes.clone())
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte = index / 8;
        let bit = index % 8;
        (self.bytes[byte] & (0x80 >> bit)) != 0
    }

    pub fn set(&mut self, index: usize) {
        assert!(index < self.num_pieces, "piece index out of range");
        let byte = index / 8;
        let bit = index % 8;
        self.bytes[byte] |= 0x80 >> bit;
    }

    pub fn is_complete(&self) -> bool {
        (0..self.num_pieces).all(|i| self.has(i))
    }

    pub fn count_set(&self) -> usize {
        (0..self.num_pieces).filter(|&i| self.has(i)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.num_pieces).map(move |i| self.has(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_has_round_trip() {
        let mut bf = Bitfield::empty(10);
        bf.set(0);
        bf.set(9);
        assert!(bf.has(0));
        assert!(bf.has(9));
        assert!(!bf.has(1));
    }

    #[test]
    fn msb_first_bit_order() {
        let mut bf = Bitfield::empty(8);
        bf.set(0);
        assert_eq!(bf.to_wire_bytes().as_ref(), &[0b1000_0000]);
    }

    #[test]
    fn rejects_nonzero_spare_bits() {
        // 10 pieces -> 2 bytes, 6 spare bits in the last byte that must be 0.
        let bytes = [0xFFu8, 0xFF];
        assert!(matches!(
            Bitfield::from_wire_bytes(&bytes, 10),
            Err(BitfieldError::NonZeroSpareBits)
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Bitfield::from_wire_bytes(&[0, 0, 0], 10),
            Err(BitfieldError::WrongLength { .. })
        ));
    }

    #[test]
    fn is_complete_tracks_all_pieces() {
        let mut bf = Bitfield::empty(3);
        assert!(!bf.is_complete());
        bf.set(0);
        bf.set(1);
        bf.set(2);
        assert!(bf.is_complete());
        assert_eq!(bf.count_set(), 3);
    }
}
