//! Global priority queue and concurrency cap across torrents (spec §4.13).
//! Grounded on the teacher's absence of a queue concept: modeled here as a
//! plain, synchronous bookkeeping struct (no tokio task of its own) that
//! `Engine` consults and mutates directly, matching the teacher's general
//! preference for small, directly-owned state over another actor layer
//! where no concurrent access is required.
use crate::ids::InfoHash;
use crate::torrent::Priority;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    Queued,
    Paused,
    Completed,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    info_hash: InfoHash,
    priority: Priority,
    added_at: Instant,
    state: QueueState,
}

/// Orders by (priority descending, added_at ascending), matching the
/// `QueueEntry` ordering rule (spec §3 data model).
fn queue_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.added_at.cmp(&b.added_at))
}

/// Tracks which torrents are active/queued/paused/completed and enforces
/// `max_concurrent`, promoting queued torrents as slots free (spec §4.13).
pub struct QueueManager {
    entries: HashMap<InfoHash, QueueEntry>,
    max_concurrent: usize,
}

impl QueueManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self { entries: HashMap::new(), max_concurrent }
    }

    /// Adds a torrent as queued (or active immediately if a slot is free),
    /// returning the state it was placed in.
    pub fn add(&mut self, info_hash: InfoHash, priority: Priority) -> QueueState {
        let state = if self.active_count() < self.max_concurrent { QueueState::Active } else { QueueState::Queued };
        self.entries.insert(info_hash, QueueEntry { info_hash, priority, added_at: Instant::now(), state });
        state
    }

    pub fn remove(&mut self, info_hash: &InfoHash) {
        self.entries.remove(info_hash);
        self.promote_if_room();
    }

    pub fn state_of(&self, info_hash: &InfoHash) -> Option<QueueState> {
        self.entries.get(info_hash).map(|e| e.state)
    }

    fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.state == QueueState::Active).count()
    }

    /// Sorted queued-state entries, highest-priority/earliest first.
    fn queued_sorted(&self) -> Vec<InfoHash> {
        let mut queued: Vec<&QueueEntry> = self.entries.values().filter(|e| e.state == QueueState::Queued).collect();
        queued.sort_by(|a, b| queue_order(a, b));
        queued.into_iter().map(|e| e.info_hash).collect()
    }

    /// Promotes the highest-priority queued torrent into any free active
    /// slot. Called after pause/complete/remove frees a slot.
    pub fn promote_if_room(&mut self) -> Vec<InfoHash> {
        let mut promoted = Vec::new();
        while self.active_count() < self.max_concurrent {
            let Some(next) = self.queued_sorted().into_iter().next() else { break };
            if let Some(entry) = self.entries.get_mut(&next) {
                entry.state = QueueState::Active;
                promoted.push(next);
            }
        }
        promoted
    }

    /// Moves an active torrent to paused, freeing its slot for promotion.
    pub fn pause(&mut self, info_hash: &InfoHash) -> Vec<InfoHash> {
        if let Some(entry) = self.entries.get_mut(info_hash) {
            entry.state = QueueState::Paused;
        }
        self.promote_if_room()
    }

    /// Moves a paused/queued torrent back to queued (it re-enters
    /// contention for an active slot rather than jumping straight back in).
    pub fn resume(&mut self, info_hash: &InfoHash) -> Vec<InfoHash> {
        if let Some(entry) = self.entries.get_mut(info_hash) {
            entry.state = QueueState::Queued;
            entry.added_at = Instant::now();
        }
        self.promote_if_room()
    }

    pub fn mark_completed(&mut self, info_hash: &InfoHash) -> Vec<InfoHash> {
        if let Some(entry) = self.entries.get_mut(info_hash) {
            entry.state = QueueState::Completed;
        }
        self.promote_if_room()
    }

    /// Re-sorts and re-applies priority; does not itself move anything
    /// between active/queued (spec: "Re-sort after priority changes").
    pub fn set_priority(&mut self, info_hash: &InfoHash, priority: Priority) {
        if let Some(entry) = self.entries.get_mut(info_hash) {
            entry.priority = priority;
        }
    }

    /// `setMaxConcurrent(m<active)` pauses the lowest-priority/latest-added
    /// excess (spec §4.13); `m>=active` just raises the cap and promotes.
    pub fn set_max_concurrent(&mut self, max_concurrent: usize) -> Vec<InfoHash> {
        self.max_concurrent = max_concurrent;
        let mut active: Vec<&QueueEntry> = self.entries.values().filter(|e| e.state == QueueState::Active).collect();
        active.sort_by(|a, b| queue_order(a, b));
        let excess: Vec<InfoHash> = active.into_iter().skip(max_concurrent).map(|e| e.info_hash).collect();
        for info_hash in &excess {
            if let Some(entry) = self.entries.get_mut(info_hash) {
                entry.state = QueueState::Paused;
            }
        }
        self.promote_if_room();
        excess
    }

    /// Explicit `start`: promotes immediately if a slot is free, otherwise
    /// bumps the torrent to high priority and to the queue head (spec
    /// §4.13) by back-dating `added_at` ahead of every other queued entry.
    pub fn start(&mut self, info_hash: &InfoHash) -> QueueState {
        if self.active_count() < self.max_concurrent {
            if let Some(entry) = self.entries.get_mut(info_hash) {
                entry.state = QueueState::Active;
                return QueueState::Active;
            }
        }
        let earliest = self.entries.values().map(|e| e.added_at).min();
        if let Some(entry) = self.entries.get_mut(info_hash) {
            entry.priority = Priority::High;
            entry.state = QueueState::Queued;
            if let Some(earliest) = earliest {
                entry.added_at = earliest - head_bump_epsilon();
            }
        }
        QueueState::Queued
    }
}

/// A fixed sub-nanosecond epsilon used only to order a bumped entry ahead
/// of whatever was previously earliest; avoids depending on wall-clock
/// `Instant::now()` ordering guarantees across back-to-back calls.
fn head_bump_epsilon() -> std::time::Duration {
    std::time::Duration::from_nanos(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ih(byte: u8) -> InfoHash {
        InfoHash::from_bytes([byte; 20])
    }

    #[test]
    fn fills_active_up_to_cap_then_queues() {
        let mut q = QueueManager::new(2);
        assert_eq!(q.add(ih(1), Priority::Normal), QueueState::Active);
        assert_eq!(q.add(ih(2), Priority::Normal), QueueState::Active);
        assert_eq!(q.add(ih(3), Priority::Normal), QueueState::Queued);
    }

    #[test]
    fn promotes_highest_priority_queued_on_free_slot() {
        let mut q = QueueManager::new(1);
        q.add(ih(1), Priority::Normal);
        q.add(ih(2), Priority::Low);
        q.add(ih(3), Priority::High);
        let promoted = q.pause(&ih(1));
        assert_eq!(promoted, vec![ih(3)]);
        assert_eq!(q.state_of(&ih(3)), Some(QueueState::Active));
    }

    #[test]
    fn set_max_concurrent_pauses_excess() {
        let mut q = QueueManager::new(3);
        q.add(ih(1), Priority::High);
        q.add(ih(2), Priority::Normal);
        q.add(ih(3), Priority::Low);
        let paused = q.set_max_concurrent(1);
        assert_eq!(paused, vec![ih(3), ih(2)]);
        assert_eq!(q.state_of(&ih(1)), Some(QueueState::Active));
    }

    #[test]
    fn start_promotes_immediately_when_slot_free() {
        let mut q = QueueManager::new(2);
        q.add(ih(1), Priority::Normal);
        q.add(ih(2), Priority::Normal);
        q.pause(&ih(2));
        assert_eq!(q.start(&ih(2)), QueueState::Active);
    }

    #[test]
    fn start_bumps_to_head_when_no_slot() {
        let mut q = QueueManager::new(1);
        q.add(ih(1), Priority::Normal);
        q.add(ih(2), Priority::Low);
        q.add(ih(3), Priority::Low);
        let state = q.start(&ih(3));
        assert_eq!(state, QueueState::Queued);
        assert_eq!(q.queued_sorted().first(), Some(&ih(3)));
    }
}
