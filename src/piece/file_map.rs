//! Maps a piece index to the (possibly several) file byte ranges it
//! occupies, by walking the ordered file list with running offsets (spec
//! §4.9). Grounded on the teacher's `TorrentFile::file_paths_for_piece`,
//! which performs the same overlap test but only returns paths; here we
//! also need the exact `(file_offset, len)` slice within each file so
//! FileWriter can issue byte-addressed writes.
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRange {
    pub file_idx: usize,
    pub file_offset: u64,
    pub len: u64,
}

/// Byte ranges within `files` covered by piece `index`, given `piece_length`
/// and the torrent's total length (needed since the last piece is usually
/// shorter than `piece_length`).
pub fn piece_file_ranges(
    index: u32,
    piece_length: u64,
    total_length: u64,
    files: &[FileEntry],
) -> Vec<FileRange> {
    let abs_start = index as u64 * piece_length;
    if abs_start >= total_length {
        return Vec::new();
    }
    let abs_end = (abs_start + piece_length).min(total_length);

    let mut ranges = Vec::new();
    let mut cursor = 0u64;
    for (file_idx, file) in files.iter().enumerate() {
        let file_start = cursor;
        let file_end = file_start + file.length;
        cursor = file_end;
        if file_end <= abs_start || file_start >= abs_end {
            continue;
        }
        let overlap_start = abs_start.max(file_start);
        let overlap_end = abs_end.min(file_end);
        ranges.push(FileRange {
            file_idx,
            file_offset: overlap_start - file_start,
            len: overlap_end - overlap_start,
        });
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(length: u64) -> FileEntry {
        FileEntry { path: PathBuf::from("f"), length }
    }

    #[test]
    fn single_file_piece_within_bounds() {
        let files = vec![entry(1000)];
        let ranges = piece_file_ranges(2, 100, 1000, &files);
        assert_eq!(ranges, vec![FileRange { file_idx: 0, file_offset: 200, len: 100 }]);
    }

    #[test]
    fn piece_spans_two_files() {
        let files = vec![entry(150), entry(150)];
        // piece_length 100: piece 1 covers bytes [100,200), split at file boundary 150.
        let ranges = piece_file_ranges(1, 100, 300, &files);
        assert_eq!(
            ranges,
            vec![
                FileRange { file_idx: 0, file_offset: 100, len: 50 },
                FileRange { file_idx: 1, file_offset: 0, len: 50 },
            ]
        );
    }

    #[test]
    fn last_piece_truncated_to_total_length() {
        let files = vec![entry(250)];
        let ranges = piece_file_ranges(2, 100, 250, &files);
        assert_eq!(ranges, vec![FileRange { file_idx: 0, file_offset: 200, len: 50 }]);
    }

    #[test]
    fn out_of_range_piece_yields_nothing() {
        let files = vec![entry(100)];
        assert!(piece_file_ranges(5, 100, 100, &files).is_empty());
    }
}
