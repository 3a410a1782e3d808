//! The 68-byte BitTorrent handshake.
//!
//! `19 | "BitTorrent protocol" | reserved[8] | info_hash[20] | peer_id[20]`
//!
//! Bit `0x10` of `reserved[5]` advertises BEP 10 extension-protocol support
//! (spec §4.3); we always set it on outbound handshakes since ut_metadata
//! (BEP 9) depends on it.
use super::{WireError, WireResult};
use crate::ids::{InfoHash, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    pub async fn write<W: tokio::io::AsyncWrite + Unpin>(&self, writer: &mut W) -> WireResult<()> {
        writer.write_all(&self.serialize()).await?;
        Ok(())
    }

    pub async fn read<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> WireResult<Self> {
        let mut buf = [0u8; 68];
        reader.read_exact(&mut buf).await?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8; 68]) -> WireResult<Self> {
        if buf[0] != 19 || &buf[1..20] != PROTOCOL {
            return Err(WireError::InvalidProtocol);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let info_hash = InfoHash::from_slice(&buf[28..48]).expect("slice is 20 bytes");
        let peer_id = PeerId::from_slice(&buf[48..68]).expect("slice is 20 bytes");
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn validate(&self, expected: &InfoHash) -> WireResult<()> {
        if self.info_hash != *expected {
            return Err(WireError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let hs = Handshake::new(InfoHash::random(), PeerId::generate());
        let bytes = hs.serialize();
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, hs);
        assert!(parsed.supports_extensions());
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(b"NotBitTorrentProto!");
        assert!(matches!(Handshake::parse(&buf), Err(WireError::InvalidProtocol)));
    }

    #[test]
    fn rejects_wrong_length_byte() {
        let mut buf = [0u8; 68];
        buf[0] = 20;
        buf[1..20].copy_from_slice(PROTOCOL);
        assert!(matches!(Handshake::parse(&buf), Err(WireError::InvalidProtocol)));
    }

    #[test]
    fn validate_detects_mismatch() {
        let hs = Handshake::new(InfoHash::random(), PeerId::generate());
        let other = InfoHash::random();
        assert!(matches!(hs.validate(&other), Err(WireError::InfoHashMismatch)));
    }
}
