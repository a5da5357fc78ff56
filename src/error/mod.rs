//! Set of module Error
pub mod metainfo;
pub mod peer;
pub mod scheduler;
pub mod store;
pub mod tracker;

pub use metainfo::{MetainfoError, Result as MetainfoResult};
pub use peer::{PeerError, Result as PeerResult};
pub use scheduler::{CancelReason, ConfigError, DownloadError, DownloadResult};
pub use store::{Result as StoreResult, StoreError};
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};
pub use tracker::{Result as TrackerResult, TrackerError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the scheduler's public control surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("channel error")]
  /// The channel on which some component was listening or sending died;
  /// in practice this means the scheduler has shut down.
  Channel,

  #[error("{0}")]
  /// Holds global IO related errors.
  Io(IoError),

  #[error("{0}")]
  /// An error from the content-addressable store.
  Store(#[from] StoreError),

  #[error("{0}")]
  /// A download failed; carries the typed reason given to waiters.
  Download(#[from] DownloadError),

  #[error("{0}")]
  /// A reloaded configuration document was rejected.
  Config(#[from] ConfigError),

  #[error("unhealthy: {0}")]
  /// A probe found the process not making progress.
  Unhealthy(String),
}

impl From<IoError> for Error {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for Error {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}
