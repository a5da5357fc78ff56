//! Per-torrent orchestration.
//!
//! A session drives one blob from metainfo resolution through announce,
//! download, verification and seeding:
//!
//! `FetchingMetainfo → Announcing → Downloading → Seeding → Draining →
//! Done`, with `Errored` as the failure exit. All methods here run on
//! the scheduler actor; anything that blocks (store IO, hashing, HTTP,
//! dialing) is spawned as a task that reports back through the event
//! channel.

use std::{
  collections::HashMap,
  sync::{atomic::Ordering, Arc},
  time::{Duration, Instant},
};

use rand::Rng;
use sha1::{Digest as _, Sha1};
use tokio::sync::oneshot;

use super::conn::{self, Conn, ConnState};
use super::conn_state::{Admission, ConnKey, ConnStateManager, Deny};
use super::dispatcher::Dispatcher;
use super::{CloseReason, Ctx, Established, Event, PieceOutcome, Resolved};
use crate::conf::SchedulerConf;
use crate::error::metainfo::MetainfoError;
use crate::error::peer::PeerError;
use crate::error::scheduler::{CancelReason, DownloadError, DownloadResult};
use crate::error::store::StoreError;
use crate::error::tracker::TrackerError;
use crate::metainfo::Metainfo;
use crate::origin::OriginClient;
use crate::protocol::{Handshake, Message};
use crate::store::{EntryState, PieceStatus, StoreHandle};
use crate::tracker::{AnnouncePeer, AnnounceRequest};
use crate::{Bitfield, Digest, InfoHash, PeerId, PieceIndex, Sha1Hash};

/// How often metainfo resolution retries a transient origin failure
/// before giving up.
const ORIGIN_ATTEMPTS: u32 = 3;
const ORIGIN_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Announce backoff is bounded regardless of the failure streak.
const MAX_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
  FetchingMetainfo,
  Announcing,
  Downloading,
  Seeding,
  Draining,
  Errored,
  Done,
}

/// One caller blocked on this session's completion.
struct Waiter {
  tx: oneshot::Sender<DownloadResult>,
  deadline: Instant,
}

/// Everything that exists only once metainfo is known.
struct Torrent {
  metainfo: Arc<Metainfo>,
  info_hash: InfoHash,
  dispatcher: Dispatcher,
  conns: HashMap<PeerId, Conn>,
  /// Dial candidates from the last announce, sorted by priority.
  candidates: Vec<(PeerId, std::net::SocketAddr)>,
  finalize_in_flight: bool,
}

pub(crate) struct Session {
  digest: Digest,
  namespace: String,
  state: SessionState,
  torrent: Option<Torrent>,
  waiters: Vec<Waiter>,
  announce_in_flight: bool,
  next_announce: Instant,
  announce_failures: u32,
  /// Last time a piece completed or the session otherwise advanced.
  last_progress: Instant,
  /// Last time this session was useful to anyone (served or received).
  idle_since: Instant,
  /// Set while the session holds a persisted reference on its cache
  /// entry (seeding).
  holds_cache_ref: bool,
}

impl Session {
  /// Creates the session and starts metainfo resolution.
  pub fn new(digest: Digest, namespace: String, ctx: &Ctx) -> Self {
    let now = Instant::now();
    spawn_resolve(digest, namespace.clone(), ctx);
    Session {
      digest,
      namespace,
      state: SessionState::FetchingMetainfo,
      torrent: None,
      waiters: Vec::new(),
      announce_in_flight: false,
      next_announce: now,
      announce_failures: 0,
      last_progress: now,
      idle_since: now,
      holds_cache_ref: false,
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn is_finished(&self) -> bool {
    matches!(self.state, SessionState::Done | SessionState::Errored)
  }

  pub fn info_hash(&self) -> Option<InfoHash> {
    self.torrent.as_ref().map(|t| t.info_hash)
  }

  /// Registers a caller. A session that already has the blob completes
  /// the waiter immediately; the signal fires at most once per waiter.
  pub fn add_waiter(&mut self, tx: oneshot::Sender<DownloadResult>, deadline: Instant) {
    match self.state {
      SessionState::Seeding | SessionState::Draining => {
        self.idle_since = Instant::now();
        let _ = tx.send(Ok(()));
      }
      _ => self.waiters.push(Waiter { tx, deadline }),
    }
  }

  /// Outcome of metainfo resolution. Returns the info hash so the
  /// scheduler can index the session for inbound connections.
  pub fn on_metainfo_resolved(
    &mut self,
    result: Result<Resolved, DownloadError>,
    ctx: &Ctx,
    mgr: &mut ConnStateManager,
  ) -> Option<InfoHash> {
    let resolved = match result {
      Ok(resolved) => resolved,
      Err(e) => {
        self.fail(e, mgr, ctx);
        return None;
      }
    };

    let info_hash = resolved.metainfo.info_hash();
    let dispatcher = Dispatcher::new(info_hash, ctx.peer_context.peer_id, resolved.own);
    let complete = dispatcher.is_complete();
    self.torrent = Some(Torrent {
      metainfo: resolved.metainfo,
      info_hash,
      dispatcher,
      conns: HashMap::new(),
      candidates: Vec::new(),
      finalize_in_flight: false,
    });

    if resolved.cached {
      // the blob was on disk, verified, all along
      self.holds_cache_ref = true;
      self.enter_seeding();
    } else if complete {
      // resumed entry with every piece already written; verify and
      // promote before declaring success
      self.state = SessionState::Downloading;
      self.spawn_finalize(ctx);
    } else {
      self.state = SessionState::Announcing;
    }
    self.next_announce = Instant::now();
    self.last_progress = Instant::now();
    log::info!(
      "Session {} resolved metainfo, {} pieces, state {:?}",
      self.digest,
      self.torrent.as_ref().map(|t| t.dispatcher.piece_count()).unwrap_or(0),
      self.state
    );
    Some(info_hash)
  }

  pub fn should_announce(&self, now: Instant) -> bool {
    !self.announce_in_flight
      && self.torrent.is_some()
      && matches!(
        self.state,
        SessionState::Announcing | SessionState::Downloading | SessionState::Seeding
      )
      && now >= self.next_announce
  }

  pub fn spawn_announce(&mut self, ctx: &Ctx) {
    let Some(t) = &self.torrent else { return };
    let req = AnnounceRequest {
      digest: self.digest,
      info_hash: t.info_hash,
      peer: AnnouncePeer {
        context: ctx.peer_context.clone(),
        complete: t.dispatcher.is_complete(),
      },
    };
    self.announce_in_flight = true;
    let client = ctx.announce.clone();
    let event_tx = ctx.event_tx.clone();
    let digest = self.digest;
    tokio::spawn(async move {
      let result = client.announce(&req).await;
      let _ = event_tx.send(Event::Announced { digest, result }).await;
    });
  }

  pub fn on_announced(
    &mut self,
    result: Result<crate::tracker::AnnounceResponse, TrackerError>,
    conf: &SchedulerConf,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    self.announce_in_flight = false;
    let now = Instant::now();

    match result {
      Ok(resp) => {
        self.announce_failures = 0;
        let interval = if resp.interval.is_zero() {
          conf.announce_interval
        } else {
          resp.interval
        };
        self.next_announce = now + interval + announce_jitter(conf);

        if let Some(t) = &mut self.torrent {
          let mut peers = resp.peers;
          peers.retain(|p| p.peer_id != ctx.peer_context.peer_id);
          peers.sort_by_key(|p| p.priority);
          t.candidates = peers.into_iter().map(|p| (p.peer_id, p.addr())).collect();
        }
        if self.state == SessionState::Announcing {
          self.state = SessionState::Downloading;
          self.last_progress = now;
        }
        self.try_dials(conf, mgr, ctx);
      }
      Err(TrackerError::NotFound) => {
        // the tracker has not seen this infohash yet; retry at the
        // normal cadence
        self.next_announce = now + conf.announce_interval + announce_jitter(conf);
      }
      Err(e) => {
        self.announce_failures += 1;
        let exp = self.announce_failures.min(5);
        let backoff = conf
          .announce_interval
          .saturating_mul(2u32.saturating_pow(exp))
          .min(MAX_ANNOUNCE_BACKOFF);
        self.next_announce = now + backoff + announce_jitter(conf);
        log::warn!(
          "Session {} announce failed ({} in a row): {}",
          self.digest,
          self.announce_failures,
          e
        );
      }
    }
  }

  /// Walks the candidate list and starts dials past admission.
  fn try_dials(&mut self, conf: &SchedulerConf, mgr: &mut ConnStateManager, ctx: &Ctx) {
    if self.state != SessionState::Downloading {
      return;
    }
    let Some(t) = &self.torrent else { return };
    let candidates = t.candidates.clone();
    let info_hash = t.info_hash;

    for (peer_id, addr) in candidates {
      let Some(t) = &self.torrent else { return };
      if t.conns.contains_key(&peer_id) {
        continue;
      }
      let key = ConnKey { peer_id, info_hash };
      match mgr.check_dial(&key, conf) {
        Ok(()) => {
          mgr.note_dial_started(&key);
          let handshake = Handshake::new(
            ctx.peer_context.peer_id,
            info_hash,
            self.namespace.clone(),
          );
          tokio::spawn(conn::dial(key, addr, handshake, ctx.event_tx.clone()));
        }
        Err(Deny::TorrentCapReached | Deny::GlobalCapReached | Deny::DialCapReached) => break,
        Err(deny) => {
          log::trace!("Not dialing {}: {}", key, deny);
        }
      }
    }
  }

  pub fn on_dial_done(
    &mut self,
    key: ConnKey,
    addr: std::net::SocketAddr,
    result: Result<Established, PeerError>,
    conf: &SchedulerConf,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    mgr.note_dial_finished(&key);
    let established = match result {
      Ok(established) => established,
      Err(e) => {
        log::info!("Dial {} failed: {}", key, e);
        mgr.blacklist(&key, conf);
        return;
      }
    };

    let Some(t) = &mut self.torrent else { return };
    match mgr.admit(&key, true, conf) {
      Err(deny) => {
        log::debug!("Dropping dialed connection {}: {}", key, deny);
      }
      Ok(admission) => {
        if admission == Admission::ReplacesExisting {
          // the replaced conn is closed without touching the manager's
          // counts; its entry was rewritten in place
          if let Some(mut old) = t.conns.remove(&key.peer_id) {
            old.close();
          }
        }
        let mut c = conn::start(
          key,
          addr,
          true,
          established.io,
          established.read_buf,
          None,
          ctx.event_tx.clone(),
        );
        c.try_send(Message::Bitfield(t.dispatcher.own().clone()));
        t.conns.insert(key.peer_id, c);
      }
    }
  }

  /// An inbound connection that already passed the handshake read.
  pub fn on_incoming(
    &mut self,
    handshake: Handshake,
    established: Established,
    addr: std::net::SocketAddr,
    conf: &SchedulerConf,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    let Some(t) = &mut self.torrent else { return };
    let key = ConnKey {
      peer_id: handshake.peer_id,
      info_hash: t.info_hash,
    };
    match mgr.admit(&key, false, conf) {
      Err(deny) => {
        // dropping the socket is the refusal
        log::debug!("Refusing inbound connection {}: {}", key, deny);
      }
      Ok(admission) => {
        if admission == Admission::ReplacesExisting {
          if let Some(mut old) = t.conns.remove(&key.peer_id) {
            old.close();
          }
        }
        let reply = Handshake::new(
          ctx.peer_context.peer_id,
          t.info_hash,
          self.namespace.clone(),
        );
        let mut c = conn::start(
          key,
          addr,
          false,
          established.io,
          established.read_buf,
          Some(reply),
          ctx.event_tx.clone(),
        );
        c.try_send(Message::Bitfield(t.dispatcher.own().clone()));
        t.conns.insert(key.peer_id, c);
      }
    }
  }

  pub fn on_frame(
    &mut self,
    key: ConnKey,
    conn_id: u64,
    msg: Message,
    conf: &SchedulerConf,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    let digest = self.digest;
    let Some(t) = &mut self.torrent else { return };
    let piece_count = t.dispatcher.piece_count();
    let peer_id = key.peer_id;
    let Some(c) = t.conns.get_mut(&peer_id) else { return };
    if c.id != conn_id {
      return;
    }
    c.last_seen = Instant::now();

    match msg {
      Message::KeepAlive => {}
      Message::Bitfield(mut pieces) => {
        // the wire bitfield is padded to a byte boundary
        pieces.resize(piece_count, false);
        if let Some(prev) = c.remote_pieces.take() {
          t.dispatcher.peer_left(&peer_id, &prev);
          let Some(c) = t.conns.get_mut(&peer_id) else { return };
          c.remote_complete = pieces.all();
          c.remote_pieces = Some(pieces.clone());
        } else {
          c.remote_complete = pieces.all();
          c.remote_pieces = Some(pieces.clone());
        }
        t.dispatcher.peer_joined(&pieces);
        pump_peer(t, &peer_id, conf, &ctx.store, digest);
      }
      Message::Have { piece_index } | Message::AnnouncePiece { piece_index } => {
        if piece_index >= piece_count {
          log::warn!("Peer {} sent out-of-range piece index", key);
          mgr.blacklist(&key, conf);
          close_peer(t, &peer_id, mgr);
          return;
        }
        match &mut c.remote_pieces {
          Some(pieces) => {
            if !pieces[piece_index] {
              pieces.set(piece_index, true);
              c.remote_complete = pieces.all();
              t.dispatcher.peer_has(piece_index);
            }
          }
          None => {
            let mut pieces = Bitfield::repeat(false, piece_count);
            pieces.set(piece_index, true);
            c.remote_pieces = Some(pieces.clone());
            t.dispatcher.peer_joined(&pieces);
          }
        }
        pump_peer(t, &peer_id, conf, &ctx.store, digest);
      }
      Message::Request { piece_index } => {
        if piece_index >= piece_count || !t.dispatcher.own()[piece_index] {
          log::debug!("Peer {} requested piece {} we lack", key, piece_index);
          return;
        }
        c.stats.pieces_out += 1;
        c.last_piece_activity = Instant::now();
        self.idle_since = Instant::now();

        let offset = t.metainfo.piece_offset(piece_index);
        let len = t.metainfo.piece_len_at(piece_index) as usize;
        let store = ctx.store.clone();
        let out = c.sender();
        tokio::spawn(async move {
          match store.read_piece_at(digest, offset, len).await {
            Ok(bytes) => {
              let _ = out
                .send(Message::Piece {
                  piece_index,
                  data: bytes.into(),
                })
                .await;
            }
            Err(e) => log::warn!("Serving piece {} of {} failed: {}", piece_index, digest, e),
          }
        });
      }
      Message::Piece { piece_index, data } => {
        if c.pending.remove(&piece_index).is_none() {
          // not ours to account; drop it
          log::debug!("Peer {} sent unrequested piece {}", key, piece_index);
          return;
        }
        c.stats.pieces_in += 1;
        c.last_piece_activity = Instant::now();
        let Some(expected) = t.metainfo.piece_hash(piece_index) else { return };
        let offset = t.metainfo.piece_offset(piece_index);
        spawn_verify_write(ctx, digest, piece_index, offset, expected, data, peer_id);
        pump_peer(t, &peer_id, conf, &ctx.store, digest);
      }
      Message::Cancel { .. } => {
        // whole pieces are served as soon as the request is seen; there
        // is no queue to withdraw from
      }
      Message::Complete => {
        c.remote_complete = true;
        match &mut c.remote_pieces {
          Some(pieces) => {
            for index in 0..piece_count {
              if !pieces[index] {
                pieces.set(index, true);
                t.dispatcher.peer_has(index);
              }
            }
          }
          None => {
            let pieces = Bitfield::repeat(true, piece_count);
            c.remote_pieces = Some(pieces.clone());
            t.dispatcher.peer_joined(&pieces);
          }
        }
        if t.dispatcher.is_complete() {
          // both sides have everything; the link serves no one
          close_peer(t, &peer_id, mgr);
        } else {
          pump_peer(t, &peer_id, conf, &ctx.store, digest);
        }
      }
    }
  }

  pub fn on_piece_done(
    &mut self,
    piece: PieceIndex,
    from: PeerId,
    outcome: PieceOutcome,
    conf: &SchedulerConf,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    let digest = self.digest;
    let Some(t) = &mut self.torrent else { return };
    match outcome {
      PieceOutcome::Written => {
        self.last_progress = Instant::now();
        let losers = t.dispatcher.mark_received(piece, &from);
        for loser in losers {
          if let Some(c) = t.conns.get_mut(&loser) {
            if c.pending.remove(&piece).is_some() {
              c.try_send(Message::Cancel { piece_index: piece });
            }
          }
        }
        for c in t.conns.values_mut() {
          c.try_send(Message::Have { piece_index: piece });
        }
        if t.dispatcher.is_complete() {
          self.spawn_finalize(ctx);
        } else {
          pump_all(t, conf, &ctx.store, digest);
        }
      }
      PieceOutcome::HashMismatch => {
        log::warn!("Piece {} from {} failed verification", piece, from);
        if let Some(c) = t.conns.get_mut(&from) {
          c.stats.hash_failures += 1;
          c.stats.reliability -= 1;
        }
        let key = ConnKey {
          peer_id: from,
          info_hash: t.info_hash,
        };
        mgr.blacklist(&key, conf);
        t.dispatcher.mark_failed(&from, piece);
        close_peer(t, &from, mgr);

        let store = ctx.store.clone();
        tokio::spawn(async move {
          let _ = store.set_piece_status(digest, piece, PieceStatus::Empty).await;
        });
        pump_all(t, conf, &ctx.store, digest);
      }
      PieceOutcome::Stale => {
        // the entry is gone (removal raced the write); the write was
        // attempted and discarded, nothing to update
      }
      PieceOutcome::Failed(e) => {
        log::error!("Persisting piece {} of {} failed: {}", piece, digest, e);
        self.fail(DownloadError::Storage(e), mgr, ctx);
      }
    }
  }

  fn spawn_finalize(&mut self, ctx: &Ctx) {
    let Some(t) = &mut self.torrent else { return };
    if t.finalize_in_flight {
      return;
    }
    t.finalize_in_flight = true;
    let store = ctx.store.clone();
    let event_tx = ctx.event_tx.clone();
    let digest = self.digest;
    tokio::spawn(async move {
      let result = finalize(&store, digest).await;
      let _ = event_tx.send(Event::Finalized { digest, result }).await;
    });
  }

  pub fn on_finalized(
    &mut self,
    result: Result<(), DownloadError>,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    if let Some(t) = &mut self.torrent {
      t.finalize_in_flight = false;
    }
    match result {
      Ok(()) => {
        self.holds_cache_ref = true;
        self.enter_seeding();
        if let Some(t) = &mut self.torrent {
          let mutual: Vec<PeerId> = t
            .conns
            .iter_mut()
            .map(|(peer, c)| {
              c.try_send(Message::Complete);
              (*peer, c.remote_complete)
            })
            .filter(|(_, complete)| *complete)
            .map(|(peer, _)| peer)
            .collect();
          for peer in mutual {
            close_peer(t, &peer, mgr);
          }
        }
        // advertise the complete bit without waiting a full interval
        self.next_announce = Instant::now();
        log::info!("Session {} complete, seeding", self.digest);
      }
      Err(DownloadError::Corrupt) => {
        log::error!("Assembled blob {} failed digest verification", self.digest);
        let store = ctx.store.clone();
        let digest = self.digest;
        tokio::spawn(async move {
          let _ = store.delete_download(digest).await;
        });
        self.fail(DownloadError::Corrupt, mgr, ctx);
      }
      Err(e) => self.fail(e, mgr, ctx),
    }
  }

  pub fn on_conn_closed(
    &mut self,
    key: ConnKey,
    conn_id: u64,
    reason: CloseReason,
    mgr: &mut ConnStateManager,
  ) {
    let Some(t) = &mut self.torrent else { return };
    let matches_current = t
      .conns
      .get(&key.peer_id)
      .map(|c| c.id == conn_id)
      .unwrap_or(false);
    if !matches_current {
      return;
    }
    log::info!("Connection {} closed: {}", key, reason);
    close_peer(t, &key.peer_id, mgr);
    if self.state == SessionState::Downloading && t.conns.is_empty() {
      // lost every peer; go back to the tracker right away
      self.next_announce = Instant::now();
    }
  }

  /// Periodic work: waiter deadlines, announce cadence, request
  /// timeouts, keepalives, idle closes, stall and seeding policies.
  pub fn tick(
    &mut self,
    now: Instant,
    conf: &SchedulerConf,
    mgr: &mut ConnStateManager,
    ctx: &Ctx,
  ) {
    // expire waiters; a timed-out caller does not cancel the session
    // while others remain
    let mut i = 0;
    while i < self.waiters.len() {
      if self.waiters[i].deadline <= now {
        let waiter = self.waiters.swap_remove(i);
        let _ = waiter.tx.send(Err(DownloadError::Timeout));
      } else if self.waiters[i].tx.is_closed() {
        self.waiters.swap_remove(i);
      } else {
        i += 1;
      }
    }

    if self.should_announce(now) {
      self.spawn_announce(ctx);
    }

    let digest = self.digest;
    if let Some(t) = &mut self.torrent {
      let mut to_close: Vec<PeerId> = Vec::new();
      for (peer, c) in t.conns.iter_mut() {
        // piece request timeouts: cancel, credit back, penalize
        let timed_out: Vec<PieceIndex> = c
          .pending
          .iter()
          .filter(|(_, sent)| now.duration_since(**sent) >= conf.piece_timeout)
          .map(|(index, _)| *index)
          .collect();
        for index in timed_out {
          c.pending.remove(&index);
          c.stats.timeouts += 1;
          c.stats.reliability -= 1;
          c.try_send(Message::Cancel { piece_index: index });
          t.dispatcher.credit(peer, index);
          log::debug!("Request for piece {} to {} timed out", index, peer);
        }

        if now.duration_since(c.last_sent) >= conf.keepalive_interval {
          c.try_send(Message::KeepAlive);
        }
        if now.duration_since(c.last_seen) >= conf.conn_idle_timeout {
          log::info!("Connection {} idle past timeout", c.key);
          to_close.push(*peer);
          continue;
        }
        if now.duration_since(c.last_piece_activity) >= conf.idle_conn_ttl {
          log::debug!("Connection {} moved no pieces for the idle TTL", c.key);
          to_close.push(*peer);
        }
      }
      for peer in to_close {
        close_peer(t, &peer, mgr);
      }
      pump_all(t, conf, &ctx.store, digest);
    }

    match self.state {
      SessionState::Downloading => {
        if now.duration_since(self.last_progress) >= conf.stall_timeout {
          if self.waiters.is_empty() {
            log::info!("Cancelling stalled waiterless session {}", self.digest);
            self.cancel(CancelReason::Idle, mgr, ctx);
          } else {
            // stalled with callers still waiting: push discovery
            self.next_announce = now;
          }
        }
      }
      SessionState::Seeding => {
        if now.duration_since(self.idle_since) >= conf.seeding_ttl {
          log::info!("Session {} seeded idle past TTL, draining", self.digest);
          self.state = SessionState::Draining;
          self.drain(mgr, ctx);
        }
      }
      _ => {}
    }
  }

  /// Health check: a downloading session is healthy while it has made
  /// progress within the stall timeout.
  pub fn probe(&self, now: Instant, conf: &SchedulerConf) -> Result<(), String> {
    if self.state == SessionState::Downloading
      && now.duration_since(self.last_progress) >= conf.stall_timeout
    {
      return Err(format!("download {} is stalled", self.digest));
    }
    Ok(())
  }

  /// Fatal teardown on behalf of the caller: removal or shutdown.
  pub fn cancel(&mut self, reason: CancelReason, mgr: &mut ConnStateManager, ctx: &Ctx) {
    log::info!("Cancelling session {}: {}", self.digest, reason);
    for waiter in self.waiters.drain(..) {
      let _ = waiter.tx.send(Err(DownloadError::Cancelled(reason)));
    }
    self.teardown(mgr, ctx);
    self.state = SessionState::Done;
  }

  fn fail(&mut self, error: DownloadError, mgr: &mut ConnStateManager, ctx: &Ctx) {
    log::warn!("Session {} failed: {}", self.digest, error);
    for waiter in self.waiters.drain(..) {
      let _ = waiter.tx.send(Err(error.clone()));
    }
    self.teardown(mgr, ctx);
    self.state = SessionState::Errored;
  }

  fn enter_seeding(&mut self) {
    self.state = SessionState::Seeding;
    self.idle_since = Instant::now();
    for waiter in self.waiters.drain(..) {
      let _ = waiter.tx.send(Ok(()));
    }
  }

  fn drain(&mut self, mgr: &mut ConnStateManager, ctx: &Ctx) {
    self.teardown(mgr, ctx);
    self.state = SessionState::Done;
  }

  fn teardown(&mut self, mgr: &mut ConnStateManager, ctx: &Ctx) {
    if let Some(t) = &mut self.torrent {
      let peers: Vec<PeerId> = t.conns.keys().copied().collect();
      for peer in peers {
        close_peer(t, &peer, mgr);
      }
    }
    if self.holds_cache_ref {
      self.holds_cache_ref = false;
      let store = ctx.store.clone();
      let digest = self.digest;
      tokio::spawn(async move {
        let _ = store.dec_ref(digest).await;
      });
    }
  }
}

/// Removes a peer's connection, stops its pumps and credits back its
/// in-flight requests.
fn close_peer(t: &mut Torrent, peer: &PeerId, mgr: &mut ConnStateManager) {
  if let Some(mut c) = t.conns.remove(peer) {
    c.close();
    mgr.note_closed(&c.key);
    log::debug!(
      "Conn {} ({}, {}) closed after {:?}: {}B in / {}B out, {} pieces in / {} out, \
       {} timeouts, {} hash failures, reliability {}",
      c.key,
      c.addr,
      if c.local_initiated { "outbound" } else { "inbound" },
      c.stats.created_at.elapsed(),
      c.stats.bytes_in.load(Ordering::Relaxed),
      c.stats.bytes_out.load(Ordering::Relaxed),
      c.stats.pieces_in,
      c.stats.pieces_out,
      c.stats.timeouts,
      c.stats.hash_failures,
      c.stats.reliability
    );
    let pieces = c
      .remote_pieces
      .take()
      .unwrap_or_else(|| Bitfield::repeat(false, t.dispatcher.piece_count()));
    t.dispatcher.peer_left(peer, &pieces);
  }
}

/// Fills one connection's request pipeline from the dispatcher.
fn pump_peer(
  t: &mut Torrent,
  peer: &PeerId,
  conf: &SchedulerConf,
  store: &StoreHandle,
  digest: Digest,
) {
  let Some(c) = t.conns.get(peer) else { return };
  if c.state != ConnState::Active {
    return;
  }
  let Some(remote) = c.remote_pieces.clone() else { return };
  let window = conf
    .pending_request_window
    .saturating_sub(c.pending.len())
    .min(c.send_capacity());
  if window == 0 {
    return;
  }

  let picks = t.dispatcher.pick(peer, &remote, window, conf);
  if picks.is_empty() {
    return;
  }

  let now = Instant::now();
  let mut sent: Vec<PieceIndex> = Vec::with_capacity(picks.len());
  let mut refused: Vec<PieceIndex> = Vec::new();
  {
    let Some(c) = t.conns.get_mut(peer) else {
      refused = picks;
      for index in refused {
        t.dispatcher.credit(peer, index);
      }
      return;
    };
    let mut picks = picks.into_iter();
    for index in picks.by_ref() {
      if c.try_send(Message::Request { piece_index: index }) {
        c.pending.insert(index, now);
        sent.push(index);
      } else {
        // queue full: stop issuing through this connection
        refused.push(index);
        break;
      }
    }
    refused.extend(picks);
  }
  for index in refused {
    t.dispatcher.credit(peer, index);
  }

  for index in sent {
    let store = store.clone();
    tokio::spawn(async move {
      let _ = store.set_piece_status(digest, index, PieceStatus::Pending).await;
    });
  }
}

fn pump_all(t: &mut Torrent, conf: &SchedulerConf, store: &StoreHandle, digest: Digest) {
  let peers: Vec<PeerId> = t.conns.keys().copied().collect();
  for peer in peers {
    pump_peer(t, &peer, conf, store, digest);
  }
}

fn announce_jitter(conf: &SchedulerConf) -> Duration {
  let ms = conf.announce_jitter.as_millis() as u64;
  if ms == 0 {
    return Duration::ZERO;
  }
  Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

/// Verifies piece bytes off the actor and, only on a hash match, writes
/// them at their final offset and marks the piece complete.
fn spawn_verify_write(
  ctx: &Ctx,
  digest: Digest,
  piece: PieceIndex,
  offset: u64,
  expected: Sha1Hash,
  data: bytes::Bytes,
  from: PeerId,
) {
  let store = ctx.store.clone();
  let event_tx = ctx.event_tx.clone();
  tokio::spawn(async move {
    let outcome = verify_and_write(&store, digest, piece, offset, expected, data).await;
    let _ = event_tx
      .send(Event::PieceDone {
        digest,
        piece,
        from,
        outcome,
      })
      .await;
  });
}

async fn verify_and_write(
  store: &StoreHandle,
  digest: Digest,
  piece: PieceIndex,
  offset: u64,
  expected: Sha1Hash,
  data: bytes::Bytes,
) -> PieceOutcome {
  // hashing a multi-MiB piece belongs on the blocking pool
  let hashed = tokio::task::spawn_blocking(move || {
    let hash = Sha1::digest(&data);
    (hash.as_slice() == expected, data)
  })
  .await;
  let (matches, data) = match hashed {
    Ok(result) => result,
    Err(e) => return PieceOutcome::Failed(e.to_string()),
  };
  if !matches {
    return PieceOutcome::HashMismatch;
  }

  match store.write_piece_at(digest, offset, data).await {
    Ok(()) => {}
    Err(StoreError::NotFound) => return PieceOutcome::Stale,
    Err(e) => {
      // the data file may now hold a torn piece; poison it so a
      // restart re-downloads rather than trusts it
      let _ = store.set_piece_status(digest, piece, PieceStatus::Dirty).await;
      return PieceOutcome::Failed(e.to_string());
    }
  }
  match store.set_piece_status(digest, piece, PieceStatus::Complete).await {
    Ok(()) => PieceOutcome::Written,
    Err(StoreError::NotFound) => PieceOutcome::Stale,
    Err(e) => PieceOutcome::Failed(e.to_string()),
  }
}

/// Verifies the assembled blob end to end and promotes it. Holds a cache
/// reference on success.
async fn finalize(store: &StoreHandle, digest: Digest) -> Result<(), DownloadError> {
  let storage = |e: StoreError| DownloadError::Storage(e.to_string());

  // a resumed entry may already be cached and verified
  if let Some(EntryState::Cache) = store.state_of(digest).await.map_err(storage)? {
    store.inc_ref(digest).await.map_err(storage)?;
    return Ok(());
  }

  let actual = store.hash_download(digest).await.map_err(storage)?;
  if actual != digest {
    return Err(DownloadError::Corrupt);
  }
  store.move_to_cache(digest).await.map_err(storage)?;
  store.inc_ref(digest).await.map_err(storage)?;
  Ok(())
}

fn spawn_resolve(digest: Digest, namespace: String, ctx: &Ctx) {
  let store = ctx.store.clone();
  let origin = ctx.origin.clone();
  let event_tx = ctx.event_tx.clone();
  tokio::spawn(async move {
    let result = resolve(&store, &origin, &namespace, digest).await;
    let _ = event_tx.send(Event::MetainfoResolved { digest, result }).await;
  });
}

/// Resolves metainfo (store sidecar first, then origin), creating or
/// resuming the download entry, and reports what the session starts
/// from.
async fn resolve(
  store: &StoreHandle,
  origin: &OriginClient,
  namespace: &str,
  digest: Digest,
) -> Result<Resolved, DownloadError> {
  let storage = |e: StoreError| DownloadError::Storage(e.to_string());

  match store.state_of(digest).await.map_err(storage)? {
    Some(EntryState::Cache) => {
      let metainfo = store.read_metainfo(digest).await.map_err(storage)?;
      store.inc_ref(digest).await.map_err(storage)?;
      let piece_count = metainfo.piece_count();
      Ok(Resolved {
        metainfo: Arc::new(metainfo),
        own: Bitfield::repeat(true, piece_count),
        cached: true,
      })
    }
    Some(EntryState::Download) => {
      let metainfo = store.read_metainfo(digest).await.map_err(storage)?;
      let own = store.download_bitfield(digest).await.map_err(storage)?;
      Ok(Resolved {
        metainfo: Arc::new(metainfo),
        own,
        cached: false,
      })
    }
    None => {
      let mut attempt = 0;
      let metainfo = loop {
        match origin.fetch_metainfo(namespace, &digest).await {
          Ok(metainfo) => break metainfo,
          Err(MetainfoError::NotFound) => return Err(DownloadError::NotFound),
          Err(e) => {
            attempt += 1;
            if attempt >= ORIGIN_ATTEMPTS {
              return Err(DownloadError::Origin(e.to_string()));
            }
            tokio::time::sleep(ORIGIN_RETRY_BACKOFF * attempt).await;
          }
        }
      };
      let metainfo = Arc::new(metainfo);
      let piece_count = metainfo.piece_count();
      match store.create_download(Arc::clone(&metainfo)).await {
        Ok(()) => Ok(Resolved {
          metainfo,
          own: Bitfield::repeat(false, piece_count),
          cached: false,
        }),
        Err(StoreError::AlreadyExists) => {
          // raced another creator; resume whatever exists now
          let own = store.download_bitfield(digest).await.map_err(storage)?;
          Ok(Resolved {
            metainfo,
            own,
            cached: false,
          })
        }
        Err(e) => Err(storage(e)),
      }
    }
  }
}
