//! This module defines types used to configure the agent core and its parts.
//!
//! [`Conf`] is fixed for the process lifetime. [`SchedulerConf`] is the
//! hot-reloadable tunable set: it deserializes from a JSON document in
//! which every field is optional (missing fields keep their defaults) and
//! is validated wholesale before the scheduler swaps it in.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde_derive::{Deserialize, Serialize};
use url::Url;

use crate::{error::ConfigError, PeerId};

/// The global configuration for the agent core and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
  pub peer: PeerConf,
  pub store: StoreConf,
  pub tracker: TrackerConf,
  pub origin: OriginConf,
  pub scheduler: SchedulerConf,
}

impl Conf {
  /// Returns a configuration with reasonable defaults, except for the
  /// store root and listen address, as it is not sensible to guess those
  /// for the user. A fresh peer id is generated for the process.
  pub fn new(root_dir: impl Into<PathBuf>, listen_addr: SocketAddr) -> Self {
    Self {
      peer: PeerConf {
        peer_id: PeerId::random(),
        listen_addr,
        zone: String::new(),
        cluster: String::new(),
      },
      store: StoreConf {
        root_dir: root_dir.into(),
      },
      tracker: TrackerConf { hosts: Vec::new() },
      origin: OriginConf { hosts: Vec::new() },
      scheduler: SchedulerConf::default(),
    }
  }
}

/// Identity of this agent process in the swarm.
#[derive(Debug, Clone)]
pub struct PeerConf {
  /// The id announced to the tracker and sent in every handshake.
  pub peer_id: PeerId,
  /// The address on which the scheduler listens for peers; also the
  /// address advertised in announces.
  pub listen_addr: SocketAddr,
  /// Failure-domain labels forwarded to the tracker, opaque to the core.
  pub zone: String,
  pub cluster: String,
}

/// Configuration of the content-addressable store.
#[derive(Debug, Clone)]
pub struct StoreConf {
  /// The directory under which the `download/` and `cache/` states live.
  pub root_dir: PathBuf,
}

/// The tracker endpoints available for announcing.
#[derive(Debug, Clone)]
pub struct TrackerConf {
  pub hosts: Vec<Url>,
}

/// The origin endpoints used to resolve metainfo on local miss.
#[derive(Debug, Clone)]
pub struct OriginConf {
  pub hosts: Vec<Url>,
}

/// The reloadable tunables.
///
/// Durations are encoded as integer milliseconds in the JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConf {
  /// Fallback announce cadence when the tracker supplies no interval.
  #[serde(with = "millis")]
  pub announce_interval: Duration,
  /// Uniform random delay added to each announce to spread tracker load.
  #[serde(with = "millis")]
  pub announce_jitter: Duration,

  /// Active connections that moved no piece in either direction for this
  /// long are closed.
  #[serde(with = "millis")]
  pub idle_conn_ttl: Duration,
  /// Cadence of keepalive frames on otherwise quiet connections.
  #[serde(with = "millis")]
  pub keepalive_interval: Duration,
  /// A connection with no inbound traffic at all for this long is
  /// presumed dead and closed.
  #[serde(with = "millis")]
  pub conn_idle_timeout: Duration,

  /// Upper bound on concurrent active connections per torrent.
  pub max_open_conn_per_torrent: usize,
  /// Process-wide ceiling on active connections.
  pub max_global_conn: usize,
  /// Gate on in-flight dials per torrent.
  pub max_pending_dials_per_torrent: usize,

  /// How long a piece request may stay outstanding before it is
  /// cancelled and re-dispatched.
  #[serde(with = "millis")]
  pub piece_timeout: Duration,
  /// The pipelined request window per connection.
  pub pending_request_window: usize,
  /// Outside endgame, a piece may be in flight to at most this many
  /// peers at once.
  pub max_pending_per_piece: usize,
  /// Missing-piece count at which endgame begins. `None` derives it as
  /// 2% of the piece count with a floor of 4.
  pub endgame_threshold: Option<usize>,

  /// How long a (peer, infohash) pair stays blacklisted.
  #[serde(with = "millis")]
  pub blacklist_duration: Duration,
  /// Bound on the blacklist map.
  pub blacklist_max_entries: usize,

  /// How long a completed session keeps seeding after its last piece was
  /// served.
  #[serde(with = "millis")]
  pub seeding_ttl: Duration,
  /// Deadline inherited by `download` calls that supply none.
  #[serde(with = "millis")]
  pub download_timeout: Duration,
  /// A downloading session that completed no piece for this long while
  /// holding peers counts as stalled.
  #[serde(with = "millis")]
  pub stall_timeout: Duration,

  /// Cache eviction starts above this many bytes.
  pub cache_capacity_bytes: u64,
  /// Unreferenced cache entries idle past this age are evictable.
  #[serde(with = "millis")]
  pub cache_eviction_ttl: Duration,
}

impl Default for SchedulerConf {
  fn default() -> Self {
    SchedulerConf {
      // Discovery has to be fast: a layer pulled by a whole fleet should
      // find peers within seconds of the first download.
      announce_interval: Duration::from_secs(3),
      announce_jitter: Duration::from_millis(500),
      idle_conn_ttl: Duration::from_secs(60),
      keepalive_interval: Duration::from_secs(10),
      conn_idle_timeout: Duration::from_secs(30),
      max_open_conn_per_torrent: 10,
      max_global_conn: 1000,
      max_pending_dials_per_torrent: 10,
      piece_timeout: Duration::from_secs(20),
      pending_request_window: 16,
      max_pending_per_piece: 1,
      endgame_threshold: None,
      blacklist_duration: Duration::from_secs(30),
      blacklist_max_entries: 1024,
      seeding_ttl: Duration::from_secs(300),
      download_timeout: Duration::from_secs(600),
      stall_timeout: Duration::from_secs(60),
      cache_capacity_bytes: 100 * 1024 * 1024 * 1024,
      cache_eviction_ttl: Duration::from_secs(24 * 3600),
    }
  }
}

impl SchedulerConf {
  /// Parses and validates a reload document. The previous configuration
  /// must stay in effect if this returns an error.
  pub fn from_json(doc: &[u8]) -> Result<Self, ConfigError> {
    let conf: SchedulerConf = serde_json::from_slice(doc)
      .map_err(|_| ConfigError::new("document", "not a valid config document"))?;
    conf.validate()?;
    Ok(conf)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_open_conn_per_torrent == 0 {
      return Err(ConfigError::new("maxOpenConnPerTorrent", "must be positive"));
    }
    if self.max_global_conn == 0 {
      return Err(ConfigError::new("maxGlobalConn", "must be positive"));
    }
    if self.max_pending_dials_per_torrent == 0 {
      return Err(ConfigError::new(
        "maxPendingDialsPerTorrent",
        "must be positive",
      ));
    }
    if self.pending_request_window == 0 {
      return Err(ConfigError::new("pendingRequestWindow", "must be positive"));
    }
    if self.max_pending_per_piece == 0 {
      return Err(ConfigError::new("maxPendingPerPiece", "must be positive"));
    }
    if self.piece_timeout.is_zero() {
      return Err(ConfigError::new("pieceTimeout", "must be positive"));
    }
    if self.blacklist_max_entries == 0 {
      return Err(ConfigError::new("blacklistMaxEntries", "must be positive"));
    }
    if self.download_timeout.is_zero() {
      return Err(ConfigError::new("downloadTimeout", "must be positive"));
    }
    if self.cache_capacity_bytes == 0 {
      return Err(ConfigError::new("cacheCapacityBytes", "must be positive"));
    }
    Ok(())
  }

  /// The effective endgame threshold for a torrent of `piece_count`
  /// pieces.
  pub fn endgame_threshold_for(&self, piece_count: usize) -> usize {
    self.endgame_threshold.unwrap_or_else(|| (piece_count / 50).max(4))
  }
}

/// Serialize a `Duration` as an integer count of milliseconds.
pub(crate) mod millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let ms = u64::deserialize(d)?;
    Ok(Duration::from_millis(ms))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_document_keeps_defaults() {
    let conf = SchedulerConf::from_json(br#"{"maxOpenConnPerTorrent": 2}"#).unwrap();
    assert_eq!(conf.max_open_conn_per_torrent, 2);
    let defaults = SchedulerConf::default();
    assert_eq!(conf.max_global_conn, defaults.max_global_conn);
    assert_eq!(conf.piece_timeout, defaults.piece_timeout);
  }

  #[test]
  fn test_durations_encode_as_millis() {
    let conf = SchedulerConf::from_json(br#"{"pieceTimeout": 1500}"#).unwrap();
    assert_eq!(conf.piece_timeout, Duration::from_millis(1500));
  }

  #[test]
  fn test_invalid_document_rejected_wholesale() {
    assert!(SchedulerConf::from_json(br#"{"maxGlobalConn": 0}"#).is_err());
    assert!(SchedulerConf::from_json(b"not json").is_err());
  }

  #[test]
  fn test_endgame_threshold_auto() {
    let conf = SchedulerConf::default();
    assert_eq!(conf.endgame_threshold_for(3), 4);
    assert_eq!(conf.endgame_threshold_for(1000), 20);
    let fixed = SchedulerConf {
      endgame_threshold: Some(7),
      ..SchedulerConf::default()
    };
    assert_eq!(fixed.endgame_threshold_for(1000), 7);
  }
}
