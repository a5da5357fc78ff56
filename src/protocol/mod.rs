pub mod handshake;
pub mod message;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use message::{Message, MessageCodec, MessageId, MAX_FRAME_LEN};

#[cfg(test)]
mod tests {
  use bytes::{BufMut, Bytes, BytesMut};
  use tokio_util::codec::{Decoder, Encoder};

  use super::*;
  use crate::error::peer::PeerError;
  use crate::{Bitfield, InfoHash, PeerId};

  /// Tests a stream of arbitrary messages to ensure that not only do
  /// they encode and then decode correctly (like the individual test
  /// cases ascertain), but that the buffer cursor is properly advanced
  /// by the codec implementation in both cases.
  #[test]
  fn test_message_stream() {
    let (handshake, encoded_handshake) = make_handshake();
    let msgs = [
      make_bitfield(),
      make_keep_alive(),
      make_have(),
      make_request(),
      make_piece(),
      make_piece(),
      make_keep_alive(),
      make_cancel(),
      make_announce_piece(),
      make_piece(),
      make_complete(),
      make_have(),
    ];

    // create a byte stream of all the above messages
    let msgs_len = msgs.iter().fold(0, |acc, (_, encoded)| acc + encoded.len());
    let mut read_buf = BytesMut::with_capacity(msgs_len);
    read_buf.extend_from_slice(&encoded_handshake);
    for (_, encoded) in &msgs {
      read_buf.extend_from_slice(encoded);
    }

    // decode messages one by one from the byte stream in the same order
    // as they were encoded, starting with the handshake
    let decoded_handshake = HandshakeCodec.decode(&mut read_buf).unwrap();
    assert_eq!(decoded_handshake, Some(handshake));
    for (msg, _) in &msgs {
      let decoded_msg = MessageCodec.decode(&mut read_buf).unwrap();
      assert_eq!(decoded_msg.unwrap(), *msg);
    }
    assert!(read_buf.is_empty());
  }

  /// Simulates a closer to real world use case than `test_message_stream`
  /// by progressively loading up the codec's read buffer with the encoded
  /// message bytes, asserting that messages are decoded correctly even if
  /// their bytes arrive in different chunks.
  #[test]
  fn test_chunked_message_stream() {
    let mut read_buf = BytesMut::new();

    // start with the handshake by adding only the first half of it to
    // the buffer
    let (handshake, encoded_handshake) = make_handshake();
    let handshake_split_pos = encoded_handshake.len() / 2;
    read_buf.extend_from_slice(&encoded_handshake[0..handshake_split_pos]);

    // can't decode the handshake without the full message
    assert!(HandshakeCodec.decode(&mut read_buf).unwrap().is_none());

    // the handshake should successfully decode with the second half
    read_buf.extend_from_slice(&encoded_handshake[handshake_split_pos..]);
    let decoded_handshake = HandshakeCodec.decode(&mut read_buf).unwrap();
    assert_eq!(decoded_handshake, Some(handshake));

    let msgs = [
      make_bitfield(),
      make_have(),
      make_request(),
      make_piece(),
      make_cancel(),
      make_announce_piece(),
      make_complete(),
    ];

    // go through all the above messages and do the same procedure as
    // with the handshake: add the first half, fail to decode, add the
    // second half, decode successfully
    for (msg, encoded) in &msgs {
      let split_pos = encoded.len() / 2;
      read_buf.extend_from_slice(&encoded[0..split_pos]);
      assert!(MessageCodec.decode(&mut read_buf).unwrap().is_none());
      read_buf.extend_from_slice(&encoded[split_pos..]);
      let decoded_msg = MessageCodec.decode(&mut read_buf).unwrap();
      assert_eq!(decoded_msg.unwrap(), *msg);
    }
  }

  /// Tests the encoding and subsequent decoding of a valid handshake.
  #[test]
  fn test_handshake_codec() {
    let (handshake, expected_encoded) = make_handshake();

    // encode handshake
    let mut encoded = BytesMut::with_capacity(expected_encoded.len());
    HandshakeCodec.encode(handshake.clone(), &mut encoded).unwrap();
    assert_eq!(encoded, expected_encoded);

    // don't decode handshake if there aren't enough bytes in the source
    // buffer
    let mut partial_encoded = BytesMut::from(&encoded[0..30]);
    let decoded = HandshakeCodec.decode(&mut partial_encoded).unwrap();
    assert_eq!(decoded, None);

    // decode the same handshake
    let decoded = HandshakeCodec.decode(&mut encoded).unwrap();
    assert_eq!(decoded, Some(handshake));
  }

  #[test]
  fn test_handshake_rejects_bad_magic() {
    let mut buf = BytesMut::new();
    buf.put_u32(0xdead_beef);
    buf.put_u8(PROTOCOL_VERSION);
    buf.extend_from_slice(&[0; 42]);
    assert!(matches!(
      HandshakeCodec.decode(&mut buf),
      Err(PeerError::BadMagic(0xdead_beef))
    ));
  }

  #[test]
  fn test_handshake_rejects_unsupported_version() {
    let mut buf = BytesMut::new();
    buf.put_u32(PROTOCOL_MAGIC);
    buf.put_u8(PROTOCOL_VERSION + 1);
    buf.extend_from_slice(&[0; 42]);
    assert!(matches!(
      HandshakeCodec.decode(&mut buf),
      Err(PeerError::UnsupportedVersion(_))
    ));
  }

  #[test]
  fn test_unknown_message_id_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u32(1);
    buf.put_u8(9);
    assert!(matches!(
      MessageCodec.decode(&mut buf),
      Err(PeerError::UnknownMessageId(9))
    ));
  }

  #[test]
  fn test_oversized_frame_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u32(MAX_FRAME_LEN as u32 + 1);
    buf.put_u8(MessageId::Piece as u8);
    assert!(matches!(
      MessageCodec.decode(&mut buf),
      Err(PeerError::FrameTooLarge(_))
    ));
  }

  #[test]
  fn test_keep_alive_codec() {
    let (msg, expected_encoded) = make_keep_alive();
    assert_message_codec(msg, expected_encoded);
  }

  #[test]
  fn test_bitfield_codec() {
    let (msg, expected_encoded) = make_bitfield();
    assert_message_codec(msg, expected_encoded);
  }

  #[test]
  fn test_empty_bitfield_codec() {
    let msg = Message::Bitfield(Bitfield::new());
    let encoded = {
      let mut buf = BytesMut::new();
      buf.put_u32(1);
      buf.put_u8(MessageId::Bitfield as u8);
      buf.freeze()
    };
    assert_message_codec(msg, encoded);
  }

  #[test]
  fn test_have_codec() {
    let (msg, expected_encoded) = make_have();
    assert_message_codec(msg, expected_encoded);
  }

  #[test]
  fn test_request_codec() {
    let (msg, expected_encoded) = make_request();
    assert_message_codec(msg, expected_encoded);
  }

  #[test]
  fn test_piece_codec() {
    let (msg, expected_encoded) = make_piece();
    assert_message_codec(msg, expected_encoded);
  }

  /// A frame carrying a piece of the maximum piece length still round
  /// trips.
  #[test]
  fn test_max_size_piece_codec() {
    let data = vec![0x5a; 32 * 1024 * 1024];
    let msg = Message::Piece {
      piece_index: 7,
      data: Bytes::from(data.clone()),
    };
    let encoded = {
      let mut buf = BytesMut::with_capacity(data.len() + 16);
      buf.put_u32(1 + 4 + data.len() as u32);
      buf.put_u8(MessageId::Piece as u8);
      buf.put_u32(7);
      buf.extend_from_slice(&data);
      buf.freeze()
    };
    assert_message_codec(msg, encoded);
  }

  #[test]
  fn test_cancel_codec() {
    let (msg, expected_encoded) = make_cancel();
    assert_message_codec(msg, expected_encoded);
  }

  #[test]
  fn test_complete_codec() {
    let (msg, expected_encoded) = make_complete();
    assert_message_codec(msg, expected_encoded);
  }

  #[test]
  fn test_announce_piece_codec() {
    let (msg, expected_encoded) = make_announce_piece();
    assert_message_codec(msg, expected_encoded);
  }

  /// Helper that asserts a message is encoded and subsequently decoded
  /// correctly.
  fn assert_message_codec(msg: Message, expected_encoded: Bytes) {
    // encode message
    let mut encoded = BytesMut::with_capacity(expected_encoded.len());
    MessageCodec.encode(msg.clone(), &mut encoded).unwrap();
    assert_eq!(encoded, expected_encoded);

    // don't decode message if there aren't enough bytes in the source
    // buffer
    let mut partial_encoded = BytesMut::from(&encoded[0..encoded.len() - 1]);
    let decoded = MessageCodec.decode(&mut partial_encoded).unwrap();
    assert_eq!(decoded, None);

    // decode the same message
    let decoded = MessageCodec.decode(&mut encoded).unwrap();
    assert_eq!(decoded, Some(msg));
  }

  /// Returns a `Handshake` and its expected encoded variant.
  fn make_handshake() -> (Handshake, Bytes) {
    let peer_id = PeerId::from_bytes(*b"bswm-2023-0000000001");
    let info_hash = InfoHash::from_bytes(*b"da39a3ee5e6b4b0d3255");
    let namespace = "prod/images";
    let handshake = Handshake::new(peer_id, info_hash, namespace.into());

    let encoded = {
      let mut buf = BytesMut::with_capacity(handshake.len());
      buf.put_u32(PROTOCOL_MAGIC);
      buf.put_u8(PROTOCOL_VERSION);
      buf.extend_from_slice(peer_id.as_bytes());
      buf.extend_from_slice(info_hash.as_bytes());
      buf.put_u16(namespace.len() as u16);
      buf.extend_from_slice(namespace.as_bytes());
      buf.freeze()
    };

    (handshake, encoded)
  }

  fn make_keep_alive() -> (Message, Bytes) {
    (Message::KeepAlive, Bytes::from_static(&[0; 4]))
  }

  /// Returns `Bitfield` and its expected encoded variant.
  fn make_bitfield() -> (Message, Bytes) {
    let bitfield = Bitfield::from_vec(vec![0b1100_1001, 0b1000_0011, 0b1111_1011]);
    let encoded = {
      // NOTE: `bitfield.len()` returns the number of _bits_
      let frame_len = 1 + bitfield.len() / 8;
      let mut buf = BytesMut::with_capacity(4 + frame_len);
      buf.put_u32(frame_len as u32);
      buf.put_u8(MessageId::Bitfield as u8);
      buf.extend_from_slice(bitfield.as_raw_slice());
      buf.freeze()
    };
    (Message::Bitfield(bitfield), encoded)
  }

  fn make_have() -> (Message, Bytes) {
    let piece_index = 42;
    (
      Message::Have { piece_index },
      make_piece_index_encoded(MessageId::Have, piece_index),
    )
  }

  fn make_request() -> (Message, Bytes) {
    let piece_index = 42;
    (
      Message::Request { piece_index },
      make_piece_index_encoded(MessageId::Request, piece_index),
    )
  }

  fn make_piece() -> (Message, Bytes) {
    let piece_index = 42;
    let data = vec![0x4a; 0x4000];
    let encoded = {
      let frame_len = 1 + 4 + data.len();
      let mut buf = BytesMut::with_capacity(4 + frame_len);
      buf.put_u32(frame_len as u32);
      buf.put_u8(MessageId::Piece as u8);
      buf.put_u32(piece_index as u32);
      buf.extend_from_slice(&data);
      buf.freeze()
    };
    let msg = Message::Piece {
      piece_index,
      data: data.into(),
    };
    (msg, encoded)
  }

  fn make_cancel() -> (Message, Bytes) {
    let piece_index = 42;
    (
      Message::Cancel { piece_index },
      make_piece_index_encoded(MessageId::Cancel, piece_index),
    )
  }

  fn make_complete() -> (Message, Bytes) {
    let encoded = {
      let mut buf = BytesMut::with_capacity(5);
      buf.put_u32(1);
      buf.put_u8(MessageId::Complete as u8);
      buf.freeze()
    };
    (Message::Complete, encoded)
  }

  fn make_announce_piece() -> (Message, Bytes) {
    let piece_index = 7;
    (
      Message::AnnouncePiece { piece_index },
      make_piece_index_encoded(MessageId::AnnouncePiece, piece_index),
    )
  }

  /// Helper for the messages that carry a single piece index.
  fn make_piece_index_encoded(id: MessageId, piece_index: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 5);
    buf.put_u32(1 + 4);
    buf.put_u8(id as u8);
    buf.put_u32(piece_index as u32);
    buf.freeze()
  }
}
