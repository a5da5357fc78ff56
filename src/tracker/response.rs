use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::PeerId;

/// One peer in an announce response. Ephemeral: the set is replaced by
/// the next announce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
  pub peer_id: PeerId,
  pub ip: IpAddr,
  pub port: u16,
  /// The peer has every piece and can serve the whole torrent.
  #[serde(default)]
  pub complete: bool,
  /// Dial preference; lower is dialed first. Trackers rank origins and
  /// same-zone peers ahead of the rest.
  #[serde(default)]
  pub priority: u32,
}

impl PeerInfo {
  pub fn addr(&self) -> SocketAddr {
    SocketAddr::new(self.ip, self.port)
  }
}

/// The body of a successful announce response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceResponse {
  pub peers: Vec<PeerInfo>,
  /// How long the announcer should wait before re-announcing.
  #[serde(with = "super::seconds")]
  pub interval: Duration,
}
