use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::peer::PeerError;
use crate::{InfoHash, PeerId};

/// The protocol magic opening every handshake, "bswm" as big-endian
/// bytes. Anything else on the socket aborts the connection.
pub const PROTOCOL_MAGIC: u32 = 0x6273_776d;

/// The protocol version this build speaks. A peer advertising any other
/// version gets the connection dropped and nothing else.
pub const PROTOCOL_VERSION: u8 = 1;

/// The namespace string may not exceed its u16 length prefix.
const MAX_NAMESPACE_LEN: usize = u16::MAX as usize;

/// The message sent by both sides before any frame.
///
/// Wire format, big-endian throughout:
///
/// ```txt
/// <magic><version><peer id><info hash><ns len><namespace>
/// |-4 B--|--1 B---|--20 B--|---20 B---|--2 B--|--ns len B-|
/// ```
///
/// The dialing side sends its handshake first; the accepting side
/// validates it and replies with its own handshake followed by its
/// bitfield.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
  pub peer_id: PeerId,
  pub info_hash: InfoHash,
  pub namespace: String,
}

impl Handshake {
  pub fn new(peer_id: PeerId, info_hash: InfoHash, namespace: String) -> Self {
    Handshake {
      peer_id,
      info_hash,
      namespace,
    }
  }

  /// The encoded length of this handshake, in bytes.
  #[allow(clippy::len_without_is_empty)]
  pub fn len(&self) -> usize {
    4 + 1 + 20 + 20 + 2 + self.namespace.len()
  }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
  type Error = PeerError;

  fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), PeerError> {
    debug_assert!(handshake.namespace.len() <= MAX_NAMESPACE_LEN);
    buf.reserve(handshake.len());
    buf.put_u32(PROTOCOL_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.extend_from_slice(handshake.peer_id.as_bytes());
    buf.extend_from_slice(handshake.info_hash.as_bytes());
    buf.put_u16(handshake.namespace.len() as u16);
    buf.extend_from_slice(handshake.namespace.as_bytes());
    Ok(())
  }
}

impl Decoder for HandshakeCodec {
  type Item = Handshake;
  type Error = PeerError;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, PeerError> {
    // the fixed-size prefix up to and including the namespace length
    const PREFIX_LEN: usize = 4 + 1 + 20 + 20 + 2;

    // `get_*` extractors consume bytes by advancing the buffer's cursor,
    // but we may not have the whole message yet, so peek via a cursor
    // and only commit once the full handshake is present
    if buf.len() < 5 {
      return Ok(None);
    }
    let mut peek = Cursor::new(&buf[..]);
    let magic = peek.get_u32();
    if magic != PROTOCOL_MAGIC {
      return Err(PeerError::BadMagic(magic));
    }
    let version = peek.get_u8();
    if version != PROTOCOL_VERSION {
      return Err(PeerError::UnsupportedVersion(version));
    }

    if buf.len() < PREFIX_LEN {
      return Ok(None);
    }
    peek.advance(20 + 20);
    let namespace_len = peek.get_u16() as usize;
    if buf.len() < PREFIX_LEN + namespace_len {
      return Ok(None);
    }

    // full handshake present; now consume for real
    buf.advance(4 + 1);
    let mut peer_id = [0; 20];
    buf.copy_to_slice(&mut peer_id);
    let mut info_hash = [0; 20];
    buf.copy_to_slice(&mut info_hash);
    let namespace_len = buf.get_u16() as usize;
    let namespace = String::from_utf8(buf.copy_to_bytes(namespace_len).to_vec())
      .map_err(|_| PeerError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "namespace is not valid utf-8",
      )))?;

    Ok(Some(Handshake {
      peer_id: PeerId::from_bytes(peer_id),
      info_hash: InfoHash::from_bytes(info_hash),
      namespace,
    }))
  }
}
