pub mod announce;
pub mod client;
pub mod response;
mod test;

pub use announce::{AnnouncePeer, AnnounceRequest, PeerContext};
pub use client::AnnounceClient;
pub use response::{AnnounceResponse, PeerInfo};

/// The announce contract encodes durations as integer seconds.
pub(crate) mod seconds {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let secs = u64::deserialize(d)?;
    Ok(Duration::from_secs(secs))
  }
}
