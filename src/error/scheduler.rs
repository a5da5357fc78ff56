use std::fmt;

pub type DownloadResult = std::result::Result<(), DownloadError>;

/// The typed error a session's completion signal carries.
///
/// Cloned into every waiter, so variants hold rendered messages rather
/// than the underlying non-clonable sources.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
  #[error("blob not found")]
  /// The digest is unknown to both the origin and the tracker.
  NotFound,

  #[error("blob failed digest verification")]
  /// The fully assembled file did not hash to the digest. Fatal for the
  /// session; the download entry is discarded.
  Corrupt,

  #[error("storage error: {0}")]
  /// The store could not persist the download (e.g. disk full).
  Storage(String),

  #[error("origin unavailable: {0}")]
  /// Metainfo resolution failed transiently and retries were exhausted.
  Origin(String),

  #[error("download timed out")]
  /// The caller's deadline passed. The session itself may live on for
  /// other waiters.
  Timeout,

  #[error("download cancelled: {0}")]
  Cancelled(CancelReason),
}

/// Why a session was torn down before completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
  /// The caller asked for removal of the torrent.
  Removed,
  /// The scheduler is shutting down.
  Shutdown,
  /// The session sat without waiters or progress past its idle policy.
  Idle,
}

impl fmt::Display for CancelReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CancelReason::Removed => f.write_str("removed"),
      CancelReason::Shutdown => f.write_str("shutdown"),
      CancelReason::Idle => f.write_str("idle"),
    }
  }
}

/// A reloaded configuration document was rejected wholesale; the previous
/// configuration stays in effect.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid config: {field}: {reason}")]
pub struct ConfigError {
  pub field: &'static str,
  pub reason: &'static str,
}

impl ConfigError {
  pub(crate) fn new(field: &'static str, reason: &'static str) -> Self {
    ConfigError { field, reason }
  }
}
