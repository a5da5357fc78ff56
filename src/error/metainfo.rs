pub use serde_bencode::Error as BencodeError;

pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
  #[error("blob not found")]
  /// Neither the local store nor the origin knows the digest. Terminal
  /// for the download that asked.
  NotFound,

  #[error("invalid blob length")]
  /// Zero-length blobs have no pieces and cannot be distributed.
  InvalidLength,

  #[error("invalid piece hashes")]
  /// The piece hash concatenation is not a multiple of 20 bytes or does
  /// not match the piece count implied by the lengths.
  InvalidPieces,

  #[error("{0}")]
  /// The canonical info dictionary could not be encoded for hashing.
  Bencode(BencodeError),

  #[error("{0}")]
  /// The sidecar document could not be encoded or decoded.
  Json(serde_json::Error),

  #[error("{0}")]
  /// Transient HTTP failure talking to the origin; retried with backoff.
  Http(reqwest::Error),
}

impl From<BencodeError> for MetainfoError {
  fn from(value: BencodeError) -> Self {
    Self::Bencode(value)
  }
}

impl From<serde_json::Error> for MetainfoError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

impl From<reqwest::Error> for MetainfoError {
  fn from(value: reqwest::Error) -> Self {
    Self::Http(value)
  }
}
