//! A single piece's block bitmap and lazily materialised assembly buffer
//! (spec §4.9): blocks arrive out of order over the wire, get dropped into
//! a buffer sized on first write, and `verify()` checks the assembled bytes
//! against the piece's SHA-1 before handing them to FileWriter.
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const BLOCK_LEN: u32 = 16 * 1024;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("block begin {begin} + len {len} exceeds piece length {piece_len}")]
    BlockOutOfRange { begin: u32, len: u32, piece_len: u32 },
    #[error("verify() called before all blocks were received")]
    Incomplete,
    #[error("assembled piece data does not match its expected SHA-1")]
    HashMismatch,
}

/// Tracks which blocks of a piece have arrived and assembles them into one
/// contiguous buffer, allocated only once the first block lands.
pub struct Piece {
    pub index: u32,
    length: u32,
    expected_hash: [u8; 20],
    received: Vec<bool>,
    buffer: Option<Vec<u8>>,
    received_count: usize,
}

fn num_blocks(piece_len: u32) -> usize {
    piece_len.div_ceil(BLOCK_LEN) as usize
}

pub fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let start = block_index as u32 * BLOCK_LEN;
    piece_len.saturating_sub(start).min(BLOCK_LEN)
}

impl Piece {
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20]) -> Self {
        Self {
            index,
            length,
            expected_hash,
            received: vec![false; num_blocks(length)],
            buffer: None,
            received_count: 0,
        }
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn num_blocks(&self) -> usize {
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.received.len()
    }

    /// Blocks still missing, as `(begin, len)` pairs in ascending offset
    /// order, per the spec's "request missing blocks in ascending offset
    /// order" rule.
    pub fn missing_blocks(&self) -> Vec<(u32, u32)> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, got)| !**got)
            .map(|(i, _)| (i as u32 * BLOCK_LEN, block_len(self.length, i)))
            .collect()
    }

    pub fn record_block(&mut self, begin: u32, data: &[u8]) -> Result<(), PieceError> {
        let len = data.len() as u32;
        if begin.checked_add(len).is_none_or(|end| end > self.length) {
            return Err(PieceError::BlockOutOfRange { begin, len, piece_len: self.length });
        }
        let block_index = (begin / BLOCK_LEN) as usize;
        let buffer = self.buffer.get_or_insert_with(|| vec![0u8; self.length as usize]);
        buffer[begin as usize..begin as usize + data.len()].copy_from_slice(data);
        if !self.received[block_index] {
            self.received[block_index] = true;
            self.received_count += 1;
        }
        Ok(())
    }

    /// Checks the assembled buffer's SHA-1 against the expected piece hash
    /// and, on success, returns (and consumes) the assembled bytes.
    pub fn verify(&mut self) -> Result<Vec<u8>, PieceError> {
        if !self.is_complete() {
            return Err(PieceError::Incomplete);
        }
        let buffer = self.buffer.take().unwrap_or_default();
        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let digest = hasher.finalize();
        if digest.as_slice() == self.expected_hash {
            Ok(buffer)
        } else {
            self.reset();
            Err(PieceError::HashMismatch)
        }
    }

    /// Drops all received blocks, e.g. after a failed verify or a strike
    /// against the peer(s) that served them.
    pub fn reset(&mut self) {
        self.buffer = None;
        self.received.iter_mut().for_each(|b| *b = false);
        self.received_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn assembles_out_of_order_blocks_and_verifies() {
        let data = vec![7u8; (BLOCK_LEN * 2 + 100) as usize];
        let hash = hash_of(&data);
        let mut piece = Piece::new(0, data.len() as u32, hash);
        assert_eq!(piece.num_blocks(), 3);

        piece.record_block(BLOCK_LEN * 2, &data[(BLOCK_LEN * 2) as usize..]).unwrap();
        assert!(!piece.is_complete());
        piece.record_block(0, &data[..BLOCK_LEN as usize]).unwrap();
        piece.record_block(BLOCK_LEN, &data[BLOCK_LEN as usize..(BLOCK_LEN * 2) as usize]).unwrap();
        assert!(piece.is_complete());

        let assembled = piece.verify().unwrap();
        assert_eq!(assembled, data);
    }

    #[test]
    fn verify_before_complete_errors() {
        let mut piece = Piece::new(0, BLOCK_LEN, [0u8; 20]);
        assert!(matches!(piece.verify(), Err(PieceError::Incomplete)));
    }

    #[test]
    fn hash_mismatch_resets_and_errors() {
        let mut piece = Piece::new(0, BLOCK_LEN, [0xAAu8; 20]);
        piece.record_block(0, &vec![1u8; BLOCK_LEN as usize]).unwrap();
        assert!(matches!(piece.verify(), Err(PieceError::HashMismatch)));
        assert!(!piece.is_complete());
        assert_eq!(piece.missing_blocks().len(), 1);
    }

    #[test]
    fn rejects_out_of_range_block() {
        let mut piece = Piece::new(0, BLOCK_LEN, [0u8; 20]);
        let err = piece.record_block(BLOCK_LEN - 10, &vec![0u8; 20]).unwrap_err();
        assert!(matches!(err, PieceError::BlockOutOfRange { .. }));
    }
}
