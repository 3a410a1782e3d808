//! 20-byte identifiers used throughout the engine: the info-hash that names a
//! torrent, and the node/peer ids used in the peer-wire and DHT protocols.
use rand::RngCore;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("expected a 40-char hex or 32-char base32 string, got {0} chars")]
    BadLength(usize),
    #[error("invalid hex digit")]
    BadHex,
    #[error("invalid base32 digit")]
    BadBase32,
}

macro_rules! id20 {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; 20]);

        impl $name {
            pub fn random() -> Self {
                let mut bytes = [0u8; 20];
                rand::rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_bytes(bytes: [u8; 20]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                if bytes.len() != 20 {
                    return None;
                }
                let mut arr = [0u8; 20];
                arr.copy_from_slice(bytes);
                Some(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; 20] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, IdParseError> {
                if s.len() != 40 {
                    return Err(IdParseError::BadLength(s.len()));
                }
                let bytes = hex::decode(s).map_err(|_| IdParseError::BadHex)?;
                Ok(Self::from_slice(&bytes).expect("hex::decode of 40 chars yields 20 bytes"))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

id20!(InfoHash);
id20!(NodeId);
id20!(PeerId);

impl PeerId {
    /// `-RT0001-` followed by 12 random bytes, per the Azureus-style peer id
    /// convention used throughout the corpus this engine is descended from.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        let prefix = b"-RT0001-";
        bytes[..prefix.len()].copy_from_slice(prefix);
        rand::rng().fill_bytes(&mut bytes[prefix.len()..]);
        Self(bytes)
    }
}

impl NodeId {
    /// XOR distance to another id, used as the Kademlia metric (spec §4.6).
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index in `[0, 160)` of the most significant set bit of `self XOR
    /// other`, i.e. `159 - msb(self XOR other)`. Two equal ids have no such
    /// bit; callers must special-case that (no bucket holds the zero
    /// distance, since nodes never add themselves).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_idx, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                let bit_idx = byte.leading_zeros() as usize;
                return Some(byte_idx * 8 + bit_idx);
            }
        }
        None
    }
}

/// Lexicographic (big-endian) comparison of two XOR distances to `target`,
/// matching `Buffer.compare(dist(a,t), dist(b,t))` from the spec's testable
/// properties.
pub fn compare_distance(a: &NodeId, b: &NodeId, target: &NodeId) -> std::cmp::Ordering {
    let da = a.distance(target);
    let db = b.distance(target);
    da.cmp(&db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        let id = InfoHash::random();
        assert_eq!(InfoHash::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn distance_symmetric_and_zero_on_equal() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 20]);
    }

    #[test]
    fn bucket_index_matches_msb_rule() {
        let mut a = [0u8; 20];
        let mut b = [0u8; 20];
        a[0] = 0b0000_0001;
        b[0] = 0b0000_0000;
        let na = NodeId::from_bytes(a);
        let nb = NodeId::from_bytes(b);
        // distance byte 0 = 0b00000001, msb index within byte = 7 (from the
        // left), so bucket_index = 0*8 + 7 = 7.
        assert_eq!(na.bucket_index(&nb), Some(7));
    }

    #[test]
    fn compare_distance_is_consistent() {
        let t = NodeId::random();
        let a = NodeId::random();
        let b = NodeId::random();
        let expect = a.distance(&t).cmp(&b.distance(&t));
        assert_eq!(compare_distance(&a, &b, &t), expect);
    }
}
