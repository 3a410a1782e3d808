//! Block assembly, SHA-1 verification, and piece-to-file storage (C9).
pub mod file_map;
pub mod file_writer;
pub mod piece;

pub use file_map::{piece_file_ranges, FileEntry, FileRange};
pub use file_writer::{FileWriter, FileWriterError, VerifyReport};
pub use piece::{block_len, Piece, PieceError, BLOCK_LEN};
