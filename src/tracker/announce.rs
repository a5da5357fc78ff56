use std::net::{IpAddr, SocketAddr};

use serde_derive::{Deserialize, Serialize};

use crate::{Digest, InfoHash, PeerId};

/// This process's identity in the swarm, immutable after startup and
/// sent with every announce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContext {
  pub peer_id: PeerId,
  /// The address peers should dial.
  pub ip: IpAddr,
  pub port: u16,
  /// Failure-domain labels, opaque to the core; the tracker may use
  /// them to prefer nearby peers.
  pub zone: String,
  pub cluster: String,
  /// Whether this process is an origin host. Origins always announce
  /// complete and are never evicted by trackers.
  pub origin: bool,
}

impl PeerContext {
  pub fn addr(&self) -> SocketAddr {
    SocketAddr::new(self.ip, self.port)
  }
}

/// The body of `POST /announce/{infohash}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnounceRequest {
  pub digest: Digest,
  pub info_hash: InfoHash,
  pub peer: AnnouncePeer,
}

/// The announcing peer: its context plus the per-torrent complete bit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnouncePeer {
  #[serde(flatten)]
  pub context: PeerContext,
  /// Whether the announcer has every piece of this torrent.
  pub complete: bool,
}
