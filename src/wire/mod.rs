use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("frame length is zero")]
    EmptyFrame,

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("handshake payload must be 40 bytes, got {0}")]
    BadHandshakeLen(usize),

    #[error("request payload must be 8 bytes, got {0}")]
    BadRequestLen(usize),

    #[error("piece payload must be at least 8 bytes, got {0}")]
    BadPieceLen(usize),

    #[error("have payload must be 4 bytes, got {0}")]
    BadHaveLen(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// One of the five message kinds spec'd for the peer wire protocol.
/// Handshake travels through the same length-prefixed frame as every
/// other message — id 0 with a fixed 40-byte payload — rather than a
/// separate pre-frame handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake { info_hash: [u8; 20], peer_id: [u8; 20] },
    Bitfield(Vec<u8>),
    Request { piece_idx: u32, offset: u32 },
    Piece { piece_idx: u32, offset: u32, data: Vec<u8> },
    Have { piece_idx: u32 },
}

impl Message {
    fn id(&self) -> u8 {
        match self {
            Message::Handshake { .. } => 0,
            Message::Bitfield(_) => 1,
            Message::Request { .. } => 2,
            Message::Piece { .. } => 3,
            Message::Have { .. } => 4,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Handshake { info_hash, .. } => {
                write!(f, "handshake info_hash={}", hex::encode(info_hash))
            }
            Message::Bitfield(bf) => write!(f, "bitfield ({} bytes)", bf.len()),
            Message::Request { piece_idx, offset } => {
                write!(f, "request piece {piece_idx} offset {offset}")
            }
            Message::Piece { piece_idx, offset, data } => {
                write!(f, "piece {piece_idx} offset {offset} ({} bytes)", data.len())
            }
            Message::Have { piece_idx } => write!(f, "have piece {piece_idx}"),
        }
    }
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::Handshake { info_hash, peer_id } => {
                dst.put_u32(1 + 40);
                dst.put_u8(0);
                dst.extend_from_slice(&info_hash);
                dst.extend_from_slice(&peer_id);
            }
            Message::Bitfield(bf) => {
                dst.put_u32(1 + bf.len() as u32);
                dst.put_u8(1);
                dst.extend_from_slice(&bf);
            }
            Message::Request { piece_idx, offset } => {
                dst.put_u32(1 + 8);
                dst.put_u8(2);
                dst.put_u32(piece_idx);
                dst.put_u32(offset);
            }
            Message::Piece { piece_idx, offset, data } => {
                dst.put_u32(1 + 8 + data.len() as u32);
                dst.put_u8(3);
                dst.put_u32(piece_idx);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Have { piece_idx } => {
                dst.put_u32(1 + 4);
                dst.put_u8(4);
                dst.put_u32(piece_idx);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.remaining() < 4 {
            return Ok(None);
        }

        let len = {
            let mut peeker = std::io::Cursor::new(&src[..]);
            peeker.get_u32() as usize
        };

        if src.remaining() < 4 + len {
            return Ok(None);
        }
        src.advance(4);

        if len == 0 {
            return Err(WireError::EmptyFrame);
        }

        let id = src.get_u8();
        let payload_len = len - 1;

        let msg = match id {
            0 => {
                if payload_len != 40 {
                    return Err(WireError::BadHandshakeLen(payload_len));
                }
                let mut info_hash = [0u8; 20];
                src.copy_to_slice(&mut info_hash);
                let mut peer_id = [0u8; 20];
                src.copy_to_slice(&mut peer_id);
                Message::Handshake { info_hash, peer_id }
            }
            1 => {
                let mut bf = vec![0u8; payload_len];
                src.copy_to_slice(&mut bf);
                Message::Bitfield(bf)
            }
            2 => {
                if payload_len != 8 {
                    return Err(WireError::BadRequestLen(payload_len));
                }
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                Message::Request { piece_idx, offset }
            }
            3 => {
                if payload_len < 8 {
                    return Err(WireError::BadPieceLen(payload_len));
                }
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0u8; payload_len - 8];
                src.copy_to_slice(&mut data);
                Message::Piece { piece_idx, offset, data }
            }
            4 => {
                if payload_len != 4 {
                    return Err(WireError::BadHaveLen(payload_len));
                }
                let piece_idx = src.get_u32();
                Message::Have { piece_idx }
            }
            other => return Err(WireError::InvalidMessageId(other)),
        };

        Ok(Some(msg))
    }
}
