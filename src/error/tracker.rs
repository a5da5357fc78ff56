pub use reqwest::Error as HttpError;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
  #[error("infohash not known to tracker")]
  /// The tracker answered 404; the announce is retried after the
  /// configured interval.
  NotFound,

  #[error("tracker rejected announce with status {0}")]
  /// A non-success status outside the defined contract.
  Rejected(u16),

  #[error("no healthy tracker host")]
  /// Every sampled host failed; the announce loop backs off.
  AllHostsFailed,

  #[error("{0}")]
  Http(HttpError),
}

impl From<HttpError> for TrackerError {
  fn from(value: HttpError) -> Self {
    Self::Http(value)
  }
}
