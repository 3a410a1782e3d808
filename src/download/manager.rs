//! Per-torrent piece scheduler: rarest-first selection, endgame mode,
//! per-peer pipelining, and failure/timeout handling (spec §4.10).
use crate::bitfield::Bitfield;
use crate::peer::ConnId;
use crate::piece::Piece;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

pub const DEFAULT_PENDING_CAP: usize = 5;
pub const DEFAULT_ENDGAME_THRESHOLD: usize = 20;
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A block request to issue: which peer, which piece, which byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub conn_id: ConnId,
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// What happened when a PIECE message arrived for an outstanding request.
pub enum BlockOutcome {
    /// Block stored, piece still incomplete. Any other peers that had this
    /// exact block outstanding (endgame duplicates) should be sent CANCEL.
    Stored { cancel_to: Vec<ConnId> },
    /// Block didn't correspond to any pending/active request; ignored.
    Stale,
    /// Piece fully assembled and its hash matches. Caller must durably
    /// write `data` via FileWriter before calling [`DownloadManager::confirm_piece_written`].
    PieceComplete { index: u32, data: Vec<u8>, cancel_to: Vec<ConnId> },
    /// Piece fully assembled but the hash didn't match. `contributors` are
    /// the peers whose blocks built this piece; the caller should strike
    /// each of them (spec: "add a strike to the peer(s) that served its
    /// blocks").
    PieceFailed { index: u32, contributors: Vec<ConnId> },
}

/// A request that timed out (no PIECE within [`BLOCK_TIMEOUT`]). The
/// offending peer should take a peer-manager health hit; the block is
/// already requeued (simply dropped from `pending`) by the time this is
/// returned.
#[derive(Debug, Clone, Copy)]
pub struct TimedOutBlock {
    pub conn_id: ConnId,
    pub index: u32,
    pub begin: u32,
}

struct PeerState {
    bitfield: Bitfield,
    peer_choking: bool,
    /// (index, begin) -> when requested.
    pending: HashMap<(u32, u32), Instant>,
}

impl PeerState {
    fn new(num_pieces: usize) -> Self {
        Self { bitfield: Bitfield::empty(num_pieces), peer_choking: true, pending: HashMap::new() }
    }
}

struct ActivePiece {
    piece: Piece,
    /// Contributors: conn_ids that have sent at least one block for this
    /// piece. Used to assign strikes if the assembled hash is wrong.
    contributors: HashSet<ConnId>,
}

pub struct DownloadManager {
    num_pieces: usize,
    piece_length: u32,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    completed: HashSet<u32>,
    active: HashMap<u32, ActivePiece>,
    availability: Vec<u32>,
    peers: HashMap<ConnId, PeerState>,
    our_bitfield: Bitfield,
    pending_cap: usize,
    endgame_threshold: usize,
    /// `None` selects every piece (spec §6 `set_file_selection(..., all)`);
    /// `Some(set)` restricts rarest-first/endgame candidates to pieces that
    /// overlap a selected file (spec §6 `set_file_selection(..., indices)`).
    wanted: Option<HashSet<u32>>,
}

fn piece_len(index: u32, piece_length: u32, total_length: u64, num_pieces: usize) -> u32 {
    if index as usize == num_pieces - 1 {
        let full = piece_length as u64 * (num_pieces - 1) as u64;
        (total_length - full) as u32
    } else {
        piece_length
    }
}

impl DownloadManager {
    pub fn new(piece_length: u32, total_length: u64, piece_hashes: Vec<[u8; 20]>) -> Self {
        Self::with_caps(piece_length, total_length, piece_hashes, DEFAULT_PENDING_CAP, DEFAULT_ENDGAME_THRESHOLD)
    }

    pub fn with_caps(
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
        pending_cap: usize,
        endgame_threshold: usize,
    ) -> Self {
        let num_pieces = piece_hashes.len();
        Self {
            num_pieces,
            piece_length,
            total_length,
            piece_hashes,
            completed: HashSet::new(),
            active: HashMap::new(),
            availability: vec![0; num_pieces],
            peers: HashMap::new(),
            our_bitfield: Bitfield::empty(num_pieces),
            pending_cap,
            endgame_threshold,
            wanted: None,
        }
    }

    /// Restricts future scheduling to `pieces`; `None` re-selects everything
    /// (spec §6 `set_file_selection`). Does not affect pieces already
    /// completed or in flight.
    pub fn set_wanted_pieces(&mut self, pieces: Option<HashSet<u32>>) {
        self.wanted = pieces;
    }

    fn is_wanted(&self, index: u32) -> bool {
        self.wanted.as_ref().is_none_or(|w| w.contains(&index))
    }

    /// `completed.size` counts only wanted pieces, so a partial file
    /// selection can still reach "done" (spec §6).
    pub fn is_done(&self) -> bool {
        (0..self.num_pieces as u32).filter(|i| self.is_wanted(*i)).all(|i| self.completed.contains(&i))
    }

    pub fn our_bitfield(&self) -> &Bitfield {
        &self.our_bitfield
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn completed_indices(&self) -> Vec<u32> {
        self.completed.iter().copied().collect()
    }

    /// Trusts `index` as already verified without replaying the
    /// block-assembly path, for resume without `verify_on_resume` (spec
    /// §4.15/§6, scenario S6) and for clearing a piece that failed
    /// store-verification back to not-completed is the caller's job via a
    /// fresh [`DownloadManager`] (completed is append-only here).
    pub fn mark_completed(&mut self, index: u32) {
        self.completed.insert(index);
        self.our_bitfield.set(index as usize);
    }

    fn in_endgame(&self) -> bool {
        let remaining = (0..self.num_pieces as u32)
            .filter(|i| self.is_wanted(*i) && !self.completed.contains(i))
            .count();
        remaining <= self.endgame_threshold
    }

    pub fn add_peer(&mut self, conn_id: ConnId) {
        self.peers.insert(conn_id, PeerState::new(self.num_pieces));
    }

    /// Drops all bookkeeping for a disconnected peer; its bitmap
    /// contribution is removed from availability and its in-flight
    /// requests simply vanish from `pending`, making the blocks eligible
    /// for reassignment on the next [`Self::schedule_requests`] call.
    pub fn remove_peer(&mut self, conn_id: ConnId) {
        if let Some(peer) = self.peers.remove(&conn_id) {
            for index in 0..self.num_pieces {
                if peer.bitfield.has(index) {
                    self.availability[index] = self.availability[index].saturating_sub(1);
                }
            }
        }
        for active in self.active.values_mut() {
            active.contributors.remove(&conn_id);
        }
    }

    pub fn record_bitfield(&mut self, conn_id: ConnId, bitfield: Bitfield) {
        if let Some(peer) = self.peers.get_mut(&conn_id) {
            for index in 0..self.num_pieces {
                if bitfield.has(index) {
                    self.availability[index] += 1;
                }
            }
            peer.bitfield = bitfield;
        }
    }

    pub fn record_have(&mut self, conn_id: ConnId, index: u32) {
        if let Some(peer) = self.peers.get_mut(&conn_id) {
            if (index as usize) < self.num_pieces && !peer.bitfield.has(index as usize) {
                peer.bitfield.set(index as usize);
                self.availability[index as usize] += 1;
            }
        }
    }

    pub fn set_peer_choking(&mut self, conn_id: ConnId, choking: bool) {
        if let Some(peer) = self.peers.get_mut(&conn_id) {
            peer.peer_choking = choking;
        }
    }

    fn eligible_peers_for(&self, index: u32) -> Vec<ConnId> {
        self.peers
            .iter()
            .filter(|(_, p)| !p.peer_choking && p.bitfield.has(index as usize))
            .map(|(&conn_id, _)| conn_id)
            .collect()
    }

    fn ensure_active(&mut self, index: u32) -> &mut ActivePiece {
        let piece_length = self.piece_length;
        let total_length = self.total_length;
        let num_pieces = self.num_pieces;
        let hash = self.piece_hashes[index as usize];
        self.active.entry(index).or_insert_with(|| ActivePiece {
            piece: Piece::new(index, piece_len(index, piece_length, total_length, num_pieces), hash),
            contributors: HashSet::new(),
        })
    }

    /// Rarest-first (or, in endgame, every-remaining-piece) block request
    /// planning, respecting each peer's pipeline cap (spec §4.10).
    #[instrument(skip(self))]
    pub fn schedule_requests(&mut self) -> Vec<BlockRequest> {
        if self.is_done() {
            return Vec::new();
        }
        if self.in_endgame() {
            return self.schedule_endgame();
        }
        self.schedule_rarest_first()
    }

    fn schedule_endgame(&mut self) -> Vec<BlockRequest> {
        let remaining: Vec<u32> = (0..self.num_pieces as u32)
            .filter(|i| self.is_wanted(*i) && !self.completed.contains(i))
            .collect();
        for &index in &remaining {
            self.ensure_active(index);
        }

        let mut requests = Vec::new();
        for (&conn_id, peer) in self.peers.iter_mut() {
            if peer.peer_choking {
                continue;
            }
            for &index in &remaining {
                if peer.pending.len() >= self.pending_cap {
                    break;
                }
                if !peer.bitfield.has(index as usize) {
                    continue;
                }
                let Some(active) = self.active.get(&index) else { continue };
                for (begin, length) in active.piece.missing_blocks() {
                    if peer.pending.len() >= self.pending_cap {
                        break;
                    }
                    if peer.pending.contains_key(&(index, begin)) {
                        continue;
                    }
                    peer.pending.insert((index, begin), Instant::now());
                    requests.push(BlockRequest { conn_id, index, begin, length });
                }
            }
        }
        requests
    }

    fn schedule_rarest_first(&mut self) -> Vec<BlockRequest> {
        let mut candidates: Vec<u32> = (0..self.num_pieces as u32)
            .filter(|&i| {
                self.is_wanted(i)
                    && self.availability[i as usize] > 0
                    && !self.completed.contains(&i)
                    && !self.active.contains_key(&i)
            })
            .collect();
        candidates.sort_by_key(|&i| (self.availability[i as usize], i));

        let mut requests = Vec::new();
        for index in candidates {
            let eligible = self.eligible_peers_for(index);
            let Some(&conn_id) = eligible.iter().find(|&&c| {
                self.peers.get(&c).is_some_and(|p| p.pending.len() < self.pending_cap)
            }) else {
                continue;
            };
            self.ensure_active(index);
            let active = self.active.get(&index).unwrap();
            let peer = self.peers.get_mut(&conn_id).unwrap();
            for (begin, length) in active.piece.missing_blocks() {
                if peer.pending.len() >= self.pending_cap {
                    break;
                }
                peer.pending.insert((index, begin), Instant::now());
                requests.push(BlockRequest { conn_id, index, begin, length });
            }
        }

        // Also keep filling pipelines for pieces already active and assigned
        // to a peer with spare pipeline capacity (e.g. after a partial fill).
        let active_indices: Vec<u32> = self.active.keys().copied().collect();
        for index in active_indices {
            let eligible = self.eligible_peers_for(index);
            for conn_id in eligible {
                let peer = self.peers.get_mut(&conn_id).unwrap();
                if peer.pending.len() >= self.pending_cap {
                    continue;
                }
                let Some(active) = self.active.get(&index) else { continue };
                for (begin, length) in active.piece.missing_blocks() {
                    if peer.pending.len() >= self.pending_cap {
                        break;
                    }
                    if peer.pending.contains_key(&(index, begin)) {
                        continue;
                    }
                    peer.pending.insert((index, begin), Instant::now());
                    requests.push(BlockRequest { conn_id, index, begin, length });
                }
            }
        }
        requests
    }

    /// A PIECE message arrived from `conn_id`. Returns what should happen
    /// next; see [`BlockOutcome`].
    pub fn on_block_received(&mut self, conn_id: ConnId, index: u32, begin: u32, data: &[u8]) -> BlockOutcome {
        let was_pending = self.peers.get_mut(&conn_id).map(|p| p.pending.remove(&(index, begin)).is_some()).unwrap_or(false);
        if !was_pending && !self.in_endgame() {
            return BlockOutcome::Stale;
        }
        let is_complete = {
            let Some(active) = self.active.get_mut(&index) else {
                return BlockOutcome::Stale;
            };
            if active.piece.record_block(begin, data).is_err() {
                return BlockOutcome::Stale;
            }
            active.contributors.insert(conn_id);
            active.piece.is_complete()
        };

        // Any other peer with this exact block outstanding (endgame
        // duplicates) gets cancelled now that one copy arrived.
        let cancel_to: Vec<ConnId> = self
            .peers
            .iter_mut()
            .filter(|(&c, _)| c != conn_id)
            .filter_map(|(&c, p)| p.pending.remove(&(index, begin)).map(|_| c))
            .collect();

        if !is_complete {
            return BlockOutcome::Stored { cancel_to };
        }

        let mut active = self.active.remove(&index).unwrap();
        match active.piece.verify() {
            Ok(data) => {
                debug!(index, "piece verified");
                BlockOutcome::PieceComplete { index, data, cancel_to }
            }
            Err(_) => BlockOutcome::PieceFailed { index, contributors: active.contributors.drain().collect() },
        }
    }

    /// Call once FileWriter has durably written a [`BlockOutcome::PieceComplete`]
    /// piece. Marks it completed, updates our bitfield, and returns the set
    /// of connected peers HAVE(index) should be broadcast to.
    pub fn confirm_piece_written(&mut self, index: u32) -> Vec<ConnId> {
        self.completed.insert(index);
        self.our_bitfield.set(index as usize);
        self.peers.keys().copied().collect()
    }

    /// Drops the expired pending requests and returns them so the caller
    /// can send CANCEL and apply a peer health hit (spec §4.10/§4.11).
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<TimedOutBlock> {
        let mut timed_out = Vec::new();
        for (&conn_id, peer) in self.peers.iter_mut() {
            let expired: Vec<(u32, u32)> = peer
                .pending
                .iter()
                .filter(|(_, &requested_at)| now.duration_since(requested_at) > BLOCK_TIMEOUT)
                .map(|(&key, _)| key)
                .collect();
            for (index, begin) in expired {
                peer.pending.remove(&(index, begin));
                timed_out.push(TimedOutBlock { conn_id, index, begin });
            }
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn full_bitfield(num_pieces: usize) -> Bitfield {
        let mut bf = Bitfield::empty(num_pieces);
        for i in 0..num_pieces {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn rarest_first_assigns_to_unchoking_peer_with_the_piece() {
        let piece_data = vec![5u8; 16 * 1024];
        let hashes = vec![hash_of(&piece_data); 3];
        let mut dm = DownloadManager::new(16 * 1024, 16 * 1024 * 3, hashes);
        dm.add_peer(1);
        dm.record_bitfield(1, full_bitfield(3));
        dm.set_peer_choking(1, false);

        let requests = dm.schedule_requests();
        assert!(!requests.is_empty());
        assert!(requests.iter().all(|r| r.conn_id == 1));
    }

    #[test]
    fn choked_peer_gets_no_requests() {
        let hashes = vec![[0u8; 20]; 1];
        let mut dm = DownloadManager::new(16 * 1024, 16 * 1024, hashes);
        dm.add_peer(1);
        dm.record_bitfield(1, full_bitfield(1));
        let requests = dm.schedule_requests();
        assert!(requests.is_empty());
    }

    #[test]
    fn full_piece_round_trip_marks_completed() {
        let piece_data = vec![9u8; 16 * 1024];
        let hash = hash_of(&piece_data);
        let mut dm = DownloadManager::new(16 * 1024, 16 * 1024, vec![hash]);
        dm.add_peer(1);
        dm.record_bitfield(1, full_bitfield(1));
        dm.set_peer_choking(1, false);

        let requests = dm.schedule_requests();
        assert_eq!(requests.len(), 1);
        let req = requests[0];
        let outcome = dm.on_block_received(req.conn_id, req.index, req.begin, &piece_data);
        match outcome {
            BlockOutcome::PieceComplete { index, data, .. } => {
                assert_eq!(index, 0);
                assert_eq!(data, piece_data);
                let peers = dm.confirm_piece_written(index);
                assert_eq!(peers, vec![1]);
            }
            _ => panic!("expected piece complete"),
        }
        assert!(dm.is_done());
        assert!(dm.our_bitfield().has(0));
    }

    #[test]
    fn hash_mismatch_reports_contributors() {
        let mut dm = DownloadManager::new(16 * 1024, 16 * 1024, vec![[0xAAu8; 20]]);
        dm.add_peer(1);
        dm.record_bitfield(1, full_bitfield(1));
        dm.set_peer_choking(1, false);
        let requests = dm.schedule_requests();
        let req = requests[0];
        let outcome = dm.on_block_received(req.conn_id, req.index, req.begin, &vec![1u8; 16 * 1024]);
        match outcome {
            BlockOutcome::PieceFailed { contributors, .. } => assert_eq!(contributors, vec![1]),
            _ => panic!("expected piece failed"),
        }
        assert!(!dm.is_done());
    }

    #[test]
    fn timeouts_are_swept_after_block_timeout() {
        let mut dm = DownloadManager::new(16 * 1024, 16 * 1024, vec![[0u8; 20]]);
        dm.add_peer(1);
        dm.record_bitfield(1, full_bitfield(1));
        dm.set_peer_choking(1, false);
        let _ = dm.schedule_requests();

        let future = Instant::now() + BLOCK_TIMEOUT + Duration::from_secs(1);
        let timed_out = dm.sweep_timeouts(future);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].conn_id, 1);
    }

    #[test]
    fn disconnect_drops_availability_contribution() {
        let mut dm = DownloadManager::new(16 * 1024, 16 * 1024 * 2, vec![[0u8; 20]; 2]);
        dm.add_peer(1);
        dm.record_bitfield(1, full_bitfield(2));
        assert_eq!(dm.availability, vec![1, 1]);
        dm.remove_peer(1);
        assert_eq!(dm.availability, vec![0, 0]);
    }
}
