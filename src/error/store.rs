pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors returned by the content-addressable store.
///
/// These are non-fatal to the process: callers either surface them to the
/// operation that triggered them or recover locally (e.g. a delete refused
/// with [`StoreError::InUse`] is retried after references drop).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("store entry already exists")]
  /// A download entry for the digest already exists in either state.
  AlreadyExists,

  #[error("store entry not found")]
  /// No entry for the digest in either state.
  NotFound,

  #[error("cache entry is referenced")]
  /// The cache entry's persisted refcount is above zero.
  InUse,

  #[error("download has incomplete pieces")]
  /// Promotion was requested before every piece reached `Complete`.
  NotReady,

  #[error("invalid piece status byte {0}")]
  /// The status sidecar holds a byte outside the defined encoding.
  InvalidStatus(u8),

  #[error("piece index {0} out of range")]
  /// The piece index does not exist for the entry's metainfo.
  InvalidPieceIndex(usize),

  #[error("corrupt sidecar: {0}")]
  /// A sidecar file could not be decoded.
  CorruptSidecar(String),

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<std::io::Error> for StoreError {
  fn from(value: std::io::Error) -> Self {
    if value.kind() == std::io::ErrorKind::NotFound {
      Self::NotFound
    } else {
      Self::Io(value)
    }
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(value: serde_json::Error) -> Self {
    Self::CorruptSidecar(value.to_string())
  }
}
