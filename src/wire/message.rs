//! Framed peer-wire messages: `len:u32 | id:u8 | payload`. `len == 0` is a
//! keep-alive. `tokio::io::AsyncReadExt::read_exact` already loops until it
//! has the requested number of bytes, which is what gives us "handle
//! fragmented TCP reads" for free; we just read `len` in two steps (4-byte
//! prefix, then `len` bytes) rather than parsing a caller-supplied buffer.
use super::{WireError, WireResult};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// `16 KiB` block size plus the 9-byte PIECE header (id + index + begin) plus
/// a little slack, per spec §4.3: "Reject `len > 16 KiB + 13` for PIECE".
pub const MAX_PIECE_MESSAGE_LEN: u32 = 16 * 1024 + 13;
/// Generous bound for any other message kind, to cap buffer growth from a
/// misbehaving or malicious peer.
const MAX_OTHER_MESSAGE_LEN: u32 = 32 * 1024;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;
const ID_EXTENDED: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Extended { id: u8, payload: Bytes },
}

impl PeerMessage {
    fn id(&self) -> Option<u8> {
        match self {
            PeerMessage::KeepAlive => None,
            PeerMessage::Choke => Some(ID_CHOKE),
            PeerMessage::Unchoke => Some(ID_UNCHOKE),
            PeerMessage::Interested => Some(ID_INTERESTED),
            PeerMessage::NotInterested => Some(ID_NOT_INTERESTED),
            PeerMessage::Have { .. } => Some(ID_HAVE),
            PeerMessage::Bitfield(_) => Some(ID_BITFIELD),
            PeerMessage::Request { .. } => Some(ID_REQUEST),
            PeerMessage::Piece { .. } => Some(ID_PIECE),
            PeerMessage::Cancel { .. } => Some(ID_CANCEL),
            PeerMessage::Port(_) => Some(ID_PORT),
            PeerMessage::Extended { .. } => Some(ID_EXTENDED),
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => Vec::new(),
            PeerMessage::Have { index } => index.to_be_bytes().to_vec(),
            PeerMessage::Bitfield(bits) => bits.to_vec(),
            PeerMessage::Request { index, begin, length }
            | PeerMessage::Cancel { index, begin, length } => {
                let mut buf = Vec::with_capacity(12);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }
            PeerMessage::Piece { index, begin, block } => {
                let mut buf = Vec::with_capacity(8 + block.len());
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            PeerMessage::Port(port) => port.to_be_bytes().to_vec(),
            PeerMessage::Extended { id, payload } => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }
}

pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PeerMessage,
) -> WireResult<()> {
    let Some(id) = message.id() else {
        writer.write_all(&0u32.to_be_bytes()).await?;
        return Ok(());
    };
    let payload = message.encode_payload();
    let len = 1 + payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[id]).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> WireResult<PeerMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = BigEndian::read_u32(&len_buf);

    if len == 0 {
        return Ok(PeerMessage::KeepAlive);
    }

    let mut id_buf = [0u8; 1];
    reader.read_exact(&mut id_buf).await?;
    let id = id_buf[0];
    let payload_len = len - 1;

    let max = if id == ID_PIECE { MAX_PIECE_MESSAGE_LEN } else { MAX_OTHER_MESSAGE_LEN };
    if len > max {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;
    parse_payload(id, Bytes::from(payload))
}

fn parse_payload(id: u8, payload: Bytes) -> WireResult<PeerMessage> {
    match id {
        ID_CHOKE => Ok(PeerMessage::Choke),
        ID_UNCHOKE => Ok(PeerMessage::Unchoke),
        ID_INTERESTED => Ok(PeerMessage::Interested),
        ID_NOT_INTERESTED => Ok(PeerMessage::NotInterested),
        ID_HAVE => {
            require_len(&payload, 4, "have")?;
            Ok(PeerMessage::Have { index: BigEndian::read_u32(&payload) })
        }
        ID_BITFIELD => Ok(PeerMessage::Bitfield(payload)),
        ID_REQUEST | ID_CANCEL => {
            require_len(&payload, 12, "request/cancel")?;
            let index = BigEndian::read_u32(&payload[0..4]);
            let begin = BigEndian::read_u32(&payload[4..8]);
            let length = BigEndian::read_u32(&payload[8..12]);
            Ok(if id == ID_REQUEST {
                PeerMessage::Request { index, begin, length }
            } else {
                PeerMessage::Cancel { index, begin, length }
            })
        }
        ID_PIECE => {
            if payload.len() < 8 {
                return Err(WireError::MalformedPayload("piece shorter than header".to_string()));
            }
            let index = BigEndian::read_u32(&payload[0..4]);
            let begin = BigEndian::read_u32(&payload[4..8]);
            let block = payload.slice(8..);
            Ok(PeerMessage::Piece { index, begin, block })
        }
        ID_PORT => {
            require_len(&payload, 2, "port")?;
            Ok(PeerMessage::Port(BigEndian::read_u16(&payload)))
        }
        ID_EXTENDED => {
            if payload.is_empty() {
                return Err(WireError::MalformedPayload("extended message missing id byte".to_string()));
            }
            Ok(PeerMessage::Extended { id: payload[0], payload: payload.slice(1..) })
        }
        other => Err(WireError::UnknownMessageId(other)),
    }
}

fn require_len(payload: &[u8], expected: usize, what: &str) -> WireResult<()> {
    if payload.len() != expected {
        return Err(WireError::MalformedPayload(format!(
            "{what} payload must be {expected} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(msg: PeerMessage) -> PeerMessage {
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        read_message(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_keepalive() {
        assert_eq!(round_trip(PeerMessage::KeepAlive).await, PeerMessage::KeepAlive);
    }

    #[tokio::test]
    async fn round_trips_have_and_request() {
        assert_eq!(round_trip(PeerMessage::Have { index: 7 }).await, PeerMessage::Have { index: 7 });
        let req = PeerMessage::Request { index: 1, begin: 2, length: 16384 };
        assert_eq!(round_trip(req.clone()).await, req);
    }

    #[tokio::test]
    async fn round_trips_piece_with_block() {
        let piece = PeerMessage::Piece { index: 0, begin: 0, block: Bytes::from_static(b"hello") };
        assert_eq!(round_trip(piece.clone()).await, piece);
    }

    #[tokio::test]
    async fn rejects_oversized_piece_frame() {
        let mut buf = Vec::new();
        let len = MAX_PIECE_MESSAGE_LEN + 1;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(ID_PIECE);
        buf.extend(std::iter::repeat(0u8).take(len as usize - 1));
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(read_message(&mut cursor).await, Err(WireError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn reads_multiple_messages_from_one_buffer() {
        let mut buf = Vec::new();
        write_message(&mut buf, &PeerMessage::Unchoke).await.unwrap();
        write_message(&mut buf, &PeerMessage::Interested).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_message(&mut cursor).await.unwrap(), PeerMessage::Unchoke);
        assert_eq!(read_message(&mut cursor).await.unwrap(), PeerMessage::Interested);
    }
}
