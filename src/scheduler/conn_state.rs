//! Connection admission bookkeeping and the blacklist.
//!
//! The manager never owns a socket: it tracks which (peer, infohash)
//! pairs have a live connection or an in-flight dial, enforces the
//! per-torrent and global caps, and holds the transient penalty list.
//! Sessions own the connections themselves; the cycle between session,
//! connection and manager is broken by keying everything here on
//! [`ConnKey`].

use std::{
  collections::{HashMap, HashSet},
  fmt,
  time::{Duration, Instant},
};

use serde_derive::Serialize;

use crate::conf::SchedulerConf;
use crate::{InfoHash, PeerId};

/// Identity of one connection for its whole lifetime: a connection talks
/// to exactly one peer about exactly one torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnKey {
  pub peer_id: PeerId,
  pub info_hash: InfoHash,
}

impl fmt::Display for ConnKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.peer_id, self.info_hash)
  }
}

/// Why a candidate was not admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deny {
  /// The candidate is this process.
  SelfConnection,
  /// A connection or dial for this key already exists in the same
  /// direction.
  Duplicate,
  /// A simultaneous dial was resolved in favour of the other side.
  LostTieBreak,
  Blacklisted,
  TorrentCapReached,
  GlobalCapReached,
  DialCapReached,
}

impl fmt::Display for Deny {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let reason = match self {
      Deny::SelfConnection => "self connection",
      Deny::Duplicate => "duplicate connection",
      Deny::LostTieBreak => "lost simultaneous-dial tie break",
      Deny::Blacklisted => "blacklisted",
      Deny::TorrentCapReached => "per-torrent connection cap reached",
      Deny::GlobalCapReached => "global connection cap reached",
      Deny::DialCapReached => "pending dial cap reached",
    };
    f.write_str(reason)
  }
}

/// How an admitted connection enters the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
  Admitted,
  /// Admitted, but an existing connection for the same key lost the tie
  /// break; the caller must close it.
  ReplacesExisting,
}

/// One diagnostic row of the blacklist snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct BlacklistEntry {
  pub peer_id: PeerId,
  pub info_hash: InfoHash,
  /// Time until the pair may be dialed again.
  #[serde(with = "crate::conf::millis")]
  pub remaining: Duration,
}

/// An active connection's bookkeeping row.
#[derive(Clone, Copy, Debug)]
struct ActiveConn {
  /// Whether this process initiated the connection; decides tie breaks.
  local_initiated: bool,
}

pub(crate) struct ConnStateManager {
  local_peer: PeerId,
  active: HashMap<InfoHash, HashMap<PeerId, ActiveConn>>,
  pending_dials: HashMap<InfoHash, HashSet<PeerId>>,
  global_count: usize,
  blacklist: HashMap<(PeerId, InfoHash), Instant>,
}

impl ConnStateManager {
  pub fn new(local_peer: PeerId) -> Self {
    ConnStateManager {
      local_peer,
      active: HashMap::new(),
      pending_dials: HashMap::new(),
      global_count: 0,
      blacklist: HashMap::new(),
    }
  }

  /// Whether a dial to this candidate may start now.
  pub fn check_dial(&self, key: &ConnKey, conf: &SchedulerConf) -> Result<(), Deny> {
    if key.peer_id == self.local_peer {
      return Err(Deny::SelfConnection);
    }
    if self.is_blacklisted(key, Instant::now()) {
      return Err(Deny::Blacklisted);
    }
    if self.conn_for(key).is_some() {
      return Err(Deny::Duplicate);
    }
    let pending = self
      .pending_dials
      .get(&key.info_hash)
      .map(|dials| dials.len())
      .unwrap_or(0);
    if self
      .pending_dials
      .get(&key.info_hash)
      .map(|dials| dials.contains(&key.peer_id))
      .unwrap_or(false)
    {
      return Err(Deny::Duplicate);
    }
    if pending >= conf.max_pending_dials_per_torrent {
      return Err(Deny::DialCapReached);
    }
    self.check_caps(&key.info_hash, conf)?;
    Ok(())
  }

  pub fn note_dial_started(&mut self, key: &ConnKey) {
    self
      .pending_dials
      .entry(key.info_hash)
      .or_default()
      .insert(key.peer_id);
  }

  pub fn note_dial_finished(&mut self, key: &ConnKey) {
    if let Some(dials) = self.pending_dials.get_mut(&key.info_hash) {
      dials.remove(&key.peer_id);
      if dials.is_empty() {
        self.pending_dials.remove(&key.info_hash);
      }
    }
  }

  /// Admits a handshaken connection into the active table.
  ///
  /// Simultaneous dials (one connection per direction for the same key)
  /// are resolved in favour of the side initiated by the
  /// lexicographically smaller peer id; the loser is refused with
  /// [`Deny::LostTieBreak`] or, when the loser is already in the table,
  /// reported via [`Admission::ReplacesExisting`] for the caller to
  /// close.
  pub fn admit(
    &mut self,
    key: &ConnKey,
    local_initiated: bool,
    conf: &SchedulerConf,
  ) -> Result<Admission, Deny> {
    if key.peer_id == self.local_peer {
      return Err(Deny::SelfConnection);
    }
    if self.is_blacklisted(key, Instant::now()) {
      return Err(Deny::Blacklisted);
    }

    if let Some(existing) = self.conn_for(key) {
      if existing.local_initiated == local_initiated {
        return Err(Deny::Duplicate);
      }
      // one connection per direction: keep the one initiated by the
      // smaller peer id
      let local_wins = self.local_peer < key.peer_id;
      if local_wins == local_initiated {
        // the new connection is the winner; replace in place, counts
        // are unchanged
        if let Some(conn) = self
          .active
          .get_mut(&key.info_hash)
          .and_then(|conns| conns.get_mut(&key.peer_id))
        {
          conn.local_initiated = local_initiated;
        }
        return Ok(Admission::ReplacesExisting);
      }
      return Err(Deny::LostTieBreak);
    }

    // an incoming connection may also race a pending dial of ours
    if !local_initiated
      && self
        .pending_dials
        .get(&key.info_hash)
        .map(|dials| dials.contains(&key.peer_id))
        .unwrap_or(false)
    {
      let local_wins = self.local_peer < key.peer_id;
      if local_wins {
        return Err(Deny::LostTieBreak);
      }
      // the dial will be refused as the loser when it completes
    }

    self.check_caps(&key.info_hash, conf)?;

    self
      .active
      .entry(key.info_hash)
      .or_default()
      .insert(key.peer_id, ActiveConn { local_initiated });
    self.global_count += 1;
    Ok(Admission::Admitted)
  }

  pub fn note_closed(&mut self, key: &ConnKey) {
    if let Some(conns) = self.active.get_mut(&key.info_hash) {
      if conns.remove(&key.peer_id).is_some() {
        self.global_count -= 1;
      }
      if conns.is_empty() {
        self.active.remove(&key.info_hash);
      }
    }
  }

  pub fn active_count(&self, info_hash: &InfoHash) -> usize {
    self.active.get(info_hash).map(|c| c.len()).unwrap_or(0)
  }

  pub fn global_count(&self) -> usize {
    self.global_count
  }

  /// Inserts a penalty for the pair. The map is bounded: when full,
  /// expired entries are collected first, then the entry closest to
  /// expiry makes room.
  pub fn blacklist(&mut self, key: &ConnKey, conf: &SchedulerConf) {
    let now = Instant::now();
    if self.blacklist.len() >= conf.blacklist_max_entries {
      self.gc_blacklist(now);
    }
    if self.blacklist.len() >= conf.blacklist_max_entries {
      if let Some(soonest) = self
        .blacklist
        .iter()
        .min_by_key(|(_, expiry)| **expiry)
        .map(|(k, _)| *k)
      {
        self.blacklist.remove(&soonest);
      }
    }
    log::info!(
      "Blacklisting {}@{} for {:?}",
      key.peer_id,
      key.info_hash,
      conf.blacklist_duration
    );
    self
      .blacklist
      .insert((key.peer_id, key.info_hash), now + conf.blacklist_duration);
  }

  pub fn is_blacklisted(&self, key: &ConnKey, now: Instant) -> bool {
    self
      .blacklist
      .get(&(key.peer_id, key.info_hash))
      .map(|expiry| *expiry > now)
      .unwrap_or(false)
  }

  pub fn gc_blacklist(&mut self, now: Instant) {
    self.blacklist.retain(|_, expiry| *expiry > now);
  }

  pub fn snapshot(&self, now: Instant) -> Vec<BlacklistEntry> {
    let mut entries: Vec<BlacklistEntry> = self
      .blacklist
      .iter()
      .filter(|(_, expiry)| **expiry > now)
      .map(|((peer_id, info_hash), expiry)| BlacklistEntry {
        peer_id: *peer_id,
        info_hash: *info_hash,
        remaining: *expiry - now,
      })
      .collect();
    entries.sort_by(|a, b| b.remaining.cmp(&a.remaining));
    entries
  }

  fn conn_for(&self, key: &ConnKey) -> Option<ActiveConn> {
    self
      .active
      .get(&key.info_hash)
      .and_then(|conns| conns.get(&key.peer_id))
      .copied()
  }

  fn check_caps(&self, info_hash: &InfoHash, conf: &SchedulerConf) -> Result<(), Deny> {
    if self.active_count(info_hash) >= conf.max_open_conn_per_torrent {
      return Err(Deny::TorrentCapReached);
    }
    if self.global_count >= conf.max_global_conn {
      return Err(Deny::GlobalCapReached);
    }
    Ok(())
  }
}
