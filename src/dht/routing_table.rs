//! Kademlia routing table: 160 k-buckets keyed by XOR-distance bit index
//! (spec §4.6).
use crate::ids::NodeId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const NUM_BUCKETS: usize = 160;
pub const BUCKET_CAPACITY: usize = 8;
pub const BUCKET_REFRESH_IDLE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddNodeOutcome {
    #[error("node added")]
    Added,
    #[error("node already present, refreshed")]
    Refreshed,
    #[error("bucket full")]
    BucketFull,
    #[error("refused to add ourselves")]
    IsSelf,
}

struct Bucket {
    /// Ordered oldest -> newest (spec §4.6).
    contacts: Vec<(Contact, Instant)>,
    last_refreshed: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            contacts: Vec::with_capacity(BUCKET_CAPACITY),
            last_refreshed: now,
        }
    }
}

pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        let now = Instant::now();
        Self {
            our_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new(now)).collect(),
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    fn bucket_for(&self, id: &NodeId) -> Option<usize> {
        self.our_id.bucket_index(id)
    }

    /// Applies the add_node state machine from spec §4.6: never add
    /// ourselves, refresh-and-move-to-tail if present, append if room, else
    /// `BucketFull` so the caller can ping-and-evict the oldest entry.
    pub fn add_node(&mut self, contact: Contact) -> AddNodeOutcome {
        let Some(bucket_idx) = self.bucket_for(&contact.id) else {
            return AddNodeOutcome::IsSelf;
        };
        let now = Instant::now();
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(pos) = bucket.contacts.iter().position(|(c, _)| c.id == contact.id) {
            let (_, _) = bucket.contacts.remove(pos);
            bucket.contacts.push((contact, now));
            bucket.last_refreshed = now;
            return AddNodeOutcome::Refreshed;
        }

        if bucket.contacts.len() < BUCKET_CAPACITY {
            bucket.contacts.push((contact, now));
            bucket.last_refreshed = now;
            AddNodeOutcome::Added
        } else {
            AddNodeOutcome::BucketFull
        }
    }

    /// Evicts the oldest (head) entry of the bucket holding `id`, typically
    /// called after a ping to that entry times out.
    pub fn evict_oldest(&mut self, id: &NodeId) -> Option<Contact> {
        let bucket_idx = self.bucket_for(id)?;
        let bucket = &mut self.buckets[bucket_idx];
        if bucket.contacts.is_empty() {
            None
        } else {
            Some(bucket.contacts.remove(0).0)
        }
    }

    pub fn oldest_in_bucket_of(&self, id: &NodeId) -> Option<Contact> {
        let bucket_idx = self.bucket_for(id)?;
        self.buckets[bucket_idx].contacts.first().map(|(c, _)| *c)
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(bucket_idx) = self.bucket_for(id) {
            self.buckets[bucket_idx].contacts.retain(|(c, _)| c.id != *id);
        }
    }

    /// All contacts across every bucket, sorted by ascending XOR distance
    /// to `target`, truncated to `n` (spec §4.6).
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.buckets.iter().flat_map(|b| b.contacts.iter().map(|(c, _)| *c)).collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(n);
        all
    }

    /// Buckets idle longer than [`BUCKET_REFRESH_IDLE`]; callers should
    /// `find_node` a random id within each to keep it fresh (spec §4.6).
    pub fn buckets_needing_refresh(&self) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| now.duration_since(b.last_refreshed) > BUCKET_REFRESH_IDLE)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: NodeId) -> Contact {
        Contact { id, addr: SocketAddr::from(([127, 0, 0, 1], 6881)) }
    }

    #[test]
    fn refuses_to_add_self() {
        let our_id = NodeId::random();
        let mut table = RoutingTable::new(our_id);
        assert_eq!(table.add_node(contact(our_id)), AddNodeOutcome::IsSelf);
    }

    #[test]
    fn add_then_refresh_moves_to_tail() {
        let our_id = NodeId::random();
        let mut table = RoutingTable::new(our_id);
        let other = NodeId::random();
        assert_eq!(table.add_node(contact(other)), AddNodeOutcome::Added);
        assert_eq!(table.add_node(contact(other)), AddNodeOutcome::Refreshed);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn bucket_full_when_capacity_reached() {
        let our_id = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(our_id);
        // All these ids share bucket 0 (first bit set, rest zero varies low bits).
        for i in 0..BUCKET_CAPACITY {
            let mut bytes = [0u8; 20];
            bytes[19] = 0x80 | (i as u8);
            bytes[0] = 0x80;
            let outcome = table.add_node(contact(NodeId::from_bytes(bytes)));
            assert_eq!(outcome, AddNodeOutcome::Added);
        }
        let mut overflow = [0u8; 20];
        overflow[0] = 0x80;
        overflow[19] = 0xFF;
        assert_eq!(table.add_node(contact(NodeId::from_bytes(overflow))), AddNodeOutcome::BucketFull);
    }

    #[test]
    fn closest_sorts_by_xor_distance() {
        let our_id = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(our_id);
        let mut far = [0u8; 20];
        far[0] = 0b0000_0001;
        let mut near = [0u8; 20];
        near[19] = 0b0000_0001;
        table.add_node(contact(NodeId::from_bytes(far)));
        table.add_node(contact(NodeId::from_bytes(near)));

        let closest = table.closest(&our_id, 2);
        assert_eq!(closest[0].id, NodeId::from_bytes(near));
        assert_eq!(closest[1].id, NodeId::from_bytes(far));
    }
}
