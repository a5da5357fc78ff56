pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Errors in a single peer connection.
///
/// These never escalate past the connection: the scheduler closes the
/// connection, records the failure against the peer, and moves on.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
  #[error("channel error")]
  /// The channel between a connection pump and the scheduler died.
  Channel,

  #[error("bad handshake magic {0:#010x}")]
  /// The first four bytes of the handshake were not the protocol magic.
  BadMagic(u32),

  #[error("unsupported protocol version {0}")]
  /// The peer speaks a protocol version we do not. Per the contract the
  /// peer receives a reset and nothing else.
  UnsupportedVersion(u8),

  #[error("handshake info hash mismatch")]
  /// The peer's advertised info hash did not match the torrent's.
  InfoHashMismatch,

  #[error("handshake timed out")]
  Timeout,

  #[error("peer identity does not match the dialed peer")]
  /// The handshake's peer id is not the one the tracker advertised for
  /// this address.
  UnexpectedPeerId,

  #[error("unknown message id {0}")]
  /// The frame's type byte is outside the defined message set.
  UnknownMessageId(u8),

  #[error("frame of {0} bytes exceeds the maximum")]
  /// A length prefix larger than the biggest legal frame; treated as a
  /// protocol violation, not an allocation request.
  FrameTooLarge(usize),

  #[error("piece index {0} out of range")]
  InvalidPieceIndex(usize),

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<IoError> for PeerError {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for PeerError {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}

impl From<tokio::time::error::Elapsed> for PeerError {
  fn from(_: tokio::time::error::Elapsed) -> Self {
    Self::Timeout
  }
}
