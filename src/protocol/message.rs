use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::peer::PeerError;
use crate::{Bitfield, PieceIndex};

/// Frames may carry at most one 32 MiB piece (the piece length ceiling)
/// plus its header; a larger length prefix is a protocol violation, not
/// an allocation request.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024 + 64;

/// The type byte of each frame.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
  Bitfield = 0,
  Have = 1,
  Request = 2,
  Piece = 3,
  Cancel = 4,
  Complete = 5,
  AnnouncePiece = 6,
}

impl TryFrom<u8> for MessageId {
  type Error = PeerError;

  fn try_from(value: u8) -> Result<Self, PeerError> {
    match value {
      0 => Ok(MessageId::Bitfield),
      1 => Ok(MessageId::Have),
      2 => Ok(MessageId::Request),
      3 => Ok(MessageId::Piece),
      4 => Ok(MessageId::Cancel),
      5 => Ok(MessageId::Complete),
      6 => Ok(MessageId::AnnouncePiece),
      other => Err(PeerError::UnknownMessageId(other)),
    }
  }
}

/// The messages exchanged between peers after the handshake.
///
/// Transfers are whole-piece granular: one `Request` asks for one piece,
/// one `Piece` carries its full bytes.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum Message {
  /// A zero-length frame; keeps otherwise quiet connections alive.
  KeepAlive,
  /// Complete piece possession, sent once on connection start.
  Bitfield(Bitfield),
  /// A piece newly completed by the sender.
  Have { piece_index: PieceIndex },
  /// Request for a whole piece.
  Request { piece_index: PieceIndex },
  /// Response carrying a whole piece's bytes.
  Piece { piece_index: PieceIndex, data: Bytes },
  /// Withdraw an outstanding request.
  Cancel { piece_index: PieceIndex },
  /// The sender has the whole torrent; the receiver may close this
  /// connection to free a slot.
  Complete,
  /// Gossip that a piece is newly available in the swarm; accounted the
  /// same as `Have`.
  AnnouncePiece { piece_index: PieceIndex },
}

impl Message {
  /// The wire id of this message, or `None` for keepalives, which have
  /// no type byte.
  pub fn id(&self) -> Option<MessageId> {
    match self {
      Message::KeepAlive => None,
      Message::Bitfield(_) => Some(MessageId::Bitfield),
      Message::Have { .. } => Some(MessageId::Have),
      Message::Request { .. } => Some(MessageId::Request),
      Message::Piece { .. } => Some(MessageId::Piece),
      Message::Cancel { .. } => Some(MessageId::Cancel),
      Message::Complete => Some(MessageId::Complete),
      Message::AnnouncePiece { .. } => Some(MessageId::AnnouncePiece),
    }
  }
}

/// Codec for the length-prefixed frame format:
///
/// ```txt
/// <frame len><type><payload>
/// |---4 B----|-1 B-|-len-1 B-|
/// ```
///
/// The length prefix is big-endian and counts the type byte plus the
/// payload; a length of zero is a keepalive.
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
  type Error = PeerError;

  fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), PeerError> {
    match msg {
      Message::KeepAlive => {
        buf.put_u32(0);
      }
      Message::Bitfield(bitfield) => {
        let raw = bitfield.as_raw_slice();
        buf.reserve(4 + 1 + raw.len());
        buf.put_u32(1 + raw.len() as u32);
        buf.put_u8(MessageId::Bitfield as u8);
        buf.extend_from_slice(raw);
      }
      Message::Have { piece_index } => {
        encode_piece_index_msg(buf, MessageId::Have, piece_index)?;
      }
      Message::Request { piece_index } => {
        encode_piece_index_msg(buf, MessageId::Request, piece_index)?;
      }
      Message::Piece { piece_index, data } => {
        let index = index_to_u32(piece_index)?;
        buf.reserve(4 + 1 + 4 + data.len());
        buf.put_u32(1 + 4 + data.len() as u32);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(index);
        buf.extend_from_slice(&data);
      }
      Message::Cancel { piece_index } => {
        encode_piece_index_msg(buf, MessageId::Cancel, piece_index)?;
      }
      Message::Complete => {
        buf.put_u32(1);
        buf.put_u8(MessageId::Complete as u8);
      }
      Message::AnnouncePiece { piece_index } => {
        encode_piece_index_msg(buf, MessageId::AnnouncePiece, piece_index)?;
      }
    }
    Ok(())
  }
}

impl Decoder for MessageCodec {
  type Item = Message;
  type Error = PeerError;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, PeerError> {
    if buf.len() < 4 {
      return Ok(None);
    }
    // peek the length prefix without consuming it, as the rest of the
    // frame may not have arrived yet
    let mut peek = Cursor::new(&buf[..]);
    let frame_len = peek.get_u32() as usize;

    if frame_len == 0 {
      buf.advance(4);
      return Ok(Some(Message::KeepAlive));
    }
    if frame_len > MAX_FRAME_LEN {
      return Err(PeerError::FrameTooLarge(frame_len));
    }
    if buf.len() < 4 + frame_len {
      // reserve so the next socket read can bring the full frame in one
      // allocation
      buf.reserve(4 + frame_len - buf.len());
      return Ok(None);
    }

    buf.advance(4);
    let id = MessageId::try_from(buf.get_u8())?;
    let payload_len = frame_len - 1;

    let msg = match id {
      MessageId::Bitfield => {
        let raw = buf.copy_to_bytes(payload_len);
        Message::Bitfield(Bitfield::from_vec(raw.to_vec()))
      }
      MessageId::Have => Message::Have {
        piece_index: decode_piece_index(buf, payload_len)?,
      },
      MessageId::Request => Message::Request {
        piece_index: decode_piece_index(buf, payload_len)?,
      },
      MessageId::Piece => {
        if payload_len < 4 {
          return Err(PeerError::Io(truncated_frame()));
        }
        let piece_index = buf.get_u32() as PieceIndex;
        let data = buf.copy_to_bytes(payload_len - 4);
        Message::Piece { piece_index, data }
      }
      MessageId::Cancel => Message::Cancel {
        piece_index: decode_piece_index(buf, payload_len)?,
      },
      MessageId::Complete => {
        if payload_len != 0 {
          return Err(PeerError::Io(truncated_frame()));
        }
        Message::Complete
      }
      MessageId::AnnouncePiece => Message::AnnouncePiece {
        piece_index: decode_piece_index(buf, payload_len)?,
      },
    };
    Ok(Some(msg))
  }
}

fn encode_piece_index_msg(
  buf: &mut BytesMut,
  id: MessageId,
  piece_index: PieceIndex,
) -> Result<(), PeerError> {
  let index = index_to_u32(piece_index)?;
  buf.reserve(4 + 1 + 4);
  buf.put_u32(1 + 4);
  buf.put_u8(id as u8);
  buf.put_u32(index);
  Ok(())
}

fn decode_piece_index(buf: &mut BytesMut, payload_len: usize) -> Result<PieceIndex, PeerError> {
  if payload_len != 4 {
    return Err(PeerError::Io(truncated_frame()));
  }
  Ok(buf.get_u32() as PieceIndex)
}

fn index_to_u32(piece_index: PieceIndex) -> Result<u32, PeerError> {
  u32::try_from(piece_index).map_err(|_| PeerError::InvalidPieceIndex(piece_index))
}

fn truncated_frame() -> std::io::Error {
  std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed frame payload")
}
