//! The process-level scheduler: single owner of every session.
//!
//! The scheduler runs as one tokio task — the actor — selecting over its
//! control channel, its bounded IO-event channel, the peer listener and
//! a periodic tick. All session and admission state is mutated only
//! here; connection pumps, dials, store IO, hashing and HTTP run as
//! tasks that report back as [`Event`]s. The user talks to the actor
//! through a [`SchedulerHandle`], the same restricted-handle shape a
//! torrent engine exposes.

mod conn;
mod conn_state;
mod dispatcher;
mod session;

pub use conn_state::BlacklistEntry;

use std::{
  collections::HashMap,
  net::SocketAddr,
  sync::Arc,
  time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio::{
  net::{TcpListener, TcpStream},
  sync::{mpsc, oneshot},
  task,
  time::MissedTickBehavior,
};

use crate::conf::{Conf, SchedulerConf};
use crate::error::peer::PeerError;
use crate::error::scheduler::{CancelReason, ConfigError, DownloadError, DownloadResult};
use crate::error::store::StoreError;
use crate::error::tracker::TrackerError;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::origin::OriginClient;
use crate::protocol::Handshake;
use crate::store::{CaStore, StoreHandle};
use crate::tracker::{AnnounceClient, AnnounceResponse, PeerContext};
use crate::{Bitfield, Digest, InfoHash, PeerId, PieceIndex};

use conn_state::ConnKey;
use session::Session;

/// Bound of the actor's event queue; pumps block on it, which is the
/// backpressure boundary of the whole process.
const EVENT_QUEUE_LEN: usize = 1024;

const TICK_INTERVAL: Duration = Duration::from_millis(500);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Control-plane commands from the handle.
pub enum Command {
  Download {
    namespace: String,
    digest: Digest,
    /// `None` inherits the scheduler's `download_timeout`.
    deadline: Option<Duration>,
    tx: oneshot::Sender<DownloadResult>,
  },
  RemoveTorrent {
    digest: Digest,
    tx: oneshot::Sender<Result<()>>,
  },
  Probe {
    tx: oneshot::Sender<Result<()>>,
  },
  Reload {
    conf: SchedulerConf,
    tx: oneshot::Sender<std::result::Result<(), ConfigError>>,
  },
  BlacklistSnapshot {
    tx: oneshot::Sender<Vec<BlacklistEntry>>,
  },
  Shutdown {
    tx: oneshot::Sender<()>,
  },
}

/// Completion events delivered to the actor by IO tasks.
pub(crate) enum Event {
  IncomingHandshake {
    io: TcpStream,
    read_buf: BytesMut,
    handshake: Handshake,
    addr: SocketAddr,
  },
  DialDone {
    key: ConnKey,
    addr: SocketAddr,
    result: std::result::Result<Established, PeerError>,
  },
  Frame {
    key: ConnKey,
    conn_id: u64,
    msg: crate::protocol::Message,
  },
  ConnClosed {
    key: ConnKey,
    conn_id: u64,
    reason: CloseReason,
  },
  MetainfoResolved {
    digest: Digest,
    result: std::result::Result<Resolved, DownloadError>,
  },
  Announced {
    digest: Digest,
    result: std::result::Result<AnnounceResponse, TrackerError>,
  },
  PieceDone {
    digest: Digest,
    piece: PieceIndex,
    from: PeerId,
    outcome: PieceOutcome,
  },
  Finalized {
    digest: Digest,
    result: std::result::Result<(), DownloadError>,
  },
}

/// A handshaken socket plus whatever bytes followed the handshake.
pub(crate) struct Established {
  pub io: TcpStream,
  pub read_buf: BytesMut,
}

/// What metainfo resolution found on disk (or created).
pub(crate) struct Resolved {
  pub metainfo: Arc<Metainfo>,
  pub own: Bitfield,
  /// The entry was already cached and verified.
  pub cached: bool,
}

pub(crate) enum PieceOutcome {
  /// Verified and persisted at its final offset.
  Written,
  /// The bytes do not hash to the metainfo entry.
  HashMismatch,
  /// The download entry disappeared while the write was in flight; the
  /// write was discarded.
  Stale,
  /// The store could not persist the piece.
  Failed(String),
}

#[derive(Debug)]
pub(crate) enum CloseReason {
  PeerClosed,
  Error(String),
}

impl std::fmt::Display for CloseReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CloseReason::PeerClosed => f.write_str("peer closed"),
      CloseReason::Error(e) => write!(f, "error: {}", e),
    }
  }
}

/// Shared collaborators handed to sessions for spawning IO work.
pub(crate) struct Ctx {
  pub peer_context: PeerContext,
  pub store: StoreHandle,
  pub announce: AnnounceClient,
  pub origin: OriginClient,
  pub event_tx: mpsc::Sender<Event>,
}

/// Spawns the scheduler: opens the store (running recovery), binds the
/// peer listener, and starts the actor task.
pub async fn spawn(conf: Conf) -> Result<SchedulerHandle> {
  log::info!("Spawning scheduler task");
  conf.scheduler.validate()?;

  let root = conf.store.root_dir.clone();
  let store = task::spawn_blocking(move || CaStore::open(root))
    .await
    .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
  let store = StoreHandle::new(store);

  let listener = TcpListener::bind(conf.peer.listen_addr).await?;
  let local_addr = listener.local_addr()?;

  let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
  let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_LEN);

  let peer_context = PeerContext {
    peer_id: conf.peer.peer_id,
    ip: local_addr.ip(),
    port: local_addr.port(),
    zone: conf.peer.zone.clone(),
    cluster: conf.peer.cluster.clone(),
    origin: false,
  };

  let mut scheduler = Scheduler {
    ctx: Ctx {
      peer_context,
      store,
      announce: AnnounceClient::new(conf.tracker.hosts),
      origin: OriginClient::new(conf.origin.hosts),
      event_tx,
    },
    conf: conf.scheduler,
    sessions: HashMap::new(),
    by_info_hash: HashMap::new(),
    mgr: conn_state::ConnStateManager::new(conf.peer.peer_id),
    cmd_rx,
    event_rx,
    listener,
    last_sweep: Instant::now(),
  };

  let join_handle = task::spawn(async move { scheduler.run().await });
  Ok(SchedulerHandle {
    cmd_tx,
    local_addr,
    join_handle: Some(join_handle),
  })
}

/// A handle to the running scheduler.
pub struct SchedulerHandle {
  cmd_tx: mpsc::UnboundedSender<Command>,
  local_addr: SocketAddr,
  join_handle: Option<task::JoinHandle<()>>,
}

impl SchedulerHandle {
  /// The address the scheduler accepts peers on.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Downloads a blob into the cache, inheriting the configured
  /// `download_timeout` as its deadline. Idempotent: concurrent and
  /// repeated calls share one session per digest.
  pub async fn download(&self, namespace: &str, digest: Digest) -> DownloadResult {
    self.download_with_deadline(namespace, digest, None).await
  }

  /// Like [`download`](Self::download) with an explicit deadline. A
  /// timed-out call abandons only this waiter; the underlying session
  /// lives on while others wait.
  pub async fn download_with_deadline(
    &self,
    namespace: &str,
    digest: Digest,
    deadline: Option<Duration>,
  ) -> DownloadResult {
    let (tx, rx) = oneshot::channel();
    let cmd = Command::Download {
      namespace: namespace.to_string(),
      digest,
      deadline,
      tx,
    };
    if self.cmd_tx.send(cmd).is_err() {
      return Err(DownloadError::Cancelled(CancelReason::Shutdown));
    }
    rx.await
      .unwrap_or(Err(DownloadError::Cancelled(CancelReason::Shutdown)))
  }

  /// Cancels the blob's session, if any, and deletes its store state.
  pub async fn remove_torrent(&self, digest: Digest) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::RemoveTorrent { digest, tx })
      .map_err(|_| Error::Channel)?;
    rx.await.map_err(|_| Error::Channel)?
  }

  /// Health check.
  pub async fn probe(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::Probe { tx })
      .map_err(|_| Error::Channel)?;
    rx.await.map_err(|_| Error::Channel)?
  }

  /// Atomically swaps the reloadable tunables. An invalid document is
  /// rejected wholesale and the previous configuration stays in effect.
  pub async fn reload(&self, conf: SchedulerConf) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::Reload { conf, tx })
      .map_err(|_| Error::Channel)?;
    rx.await.map_err(|_| Error::Channel)?.map_err(Error::from)
  }

  /// Diagnostic snapshot of the blacklist.
  pub async fn blacklist_snapshot(&self) -> Result<Vec<BlacklistEntry>> {
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::BlacklistSnapshot { tx })
      .map_err(|_| Error::Channel)?;
    rx.await.map_err(|_| Error::Channel)
  }

  /// Cancels every session and stops the actor.
  ///
  /// # Panics
  ///
  /// Panics if the scheduler has already been shut down.
  pub async fn shutdown(mut self) -> Result<()> {
    log::trace!("Shutting down scheduler task");
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::Shutdown { tx })
      .map_err(|_| Error::Channel)?;
    let _ = rx.await;
    self
      .join_handle
      .take()
      .expect("scheduler already shut down")
      .await
      .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(())
  }
}

struct Scheduler {
  ctx: Ctx,
  conf: SchedulerConf,
  /// Sessions are keyed by digest (what callers name); the infohash
  /// index routes wire-level events.
  sessions: HashMap<Digest, Session>,
  by_info_hash: HashMap<InfoHash, Digest>,
  mgr: conn_state::ConnStateManager,
  cmd_rx: mpsc::UnboundedReceiver<Command>,
  event_rx: mpsc::Receiver<Event>,
  listener: TcpListener,
  last_sweep: Instant,
}

/// What one iteration of the actor loop selected.
enum Step {
  Cmd(Option<Command>),
  Event(Event),
  Accepted(std::io::Result<(TcpStream, SocketAddr)>),
  Tick,
}

impl Scheduler {
  async fn run(&mut self) {
    log::info!("Starting scheduler event loop");
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      let step = tokio::select! {
        cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
        Some(event) = self.event_rx.recv() => Step::Event(event),
        accepted = self.listener.accept() => Step::Accepted(accepted),
        _ = tick.tick() => Step::Tick,
      };

      match step {
        Step::Cmd(None) => {
          // every handle is gone; treat as shutdown
          self.shutdown();
          break;
        }
        Step::Cmd(Some(cmd)) => {
          if self.handle_cmd(cmd) {
            break;
          }
        }
        Step::Event(event) => self.handle_event(event),
        Step::Accepted(Ok((io, addr))) => self.handle_accept(io, addr),
        Step::Accepted(Err(e)) => log::warn!("Accept failed: {}", e),
        Step::Tick => self.handle_tick(),
      }
      self.reap();
    }
    log::info!("Scheduler event loop stopped");
  }

  /// Returns true when the actor should stop.
  fn handle_cmd(&mut self, cmd: Command) -> bool {
    match cmd {
      Command::Download {
        namespace,
        digest,
        deadline,
        tx,
      } => {
        let deadline = Instant::now() + deadline.unwrap_or(self.conf.download_timeout);
        let session = self
          .sessions
          .entry(digest)
          .or_insert_with(|| Session::new(digest, namespace, &self.ctx));
        session.add_waiter(tx, deadline);
      }
      Command::RemoveTorrent { digest, tx } => self.remove_torrent(digest, tx),
      Command::Probe { tx } => {
        let _ = tx.send(self.probe());
      }
      Command::Reload { conf, tx } => {
        let result = conf.validate();
        if result.is_ok() {
          log::info!("Reloaded scheduler config");
          self.conf = conf;
        }
        let _ = tx.send(result);
      }
      Command::BlacklistSnapshot { tx } => {
        let _ = tx.send(self.mgr.snapshot(Instant::now()));
      }
      Command::Shutdown { tx } => {
        self.shutdown();
        let _ = tx.send(());
        return true;
      }
    }
    false
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::MetainfoResolved { digest, result } => {
        match self.sessions.get_mut(&digest) {
          Some(session) => {
            if let Some(info_hash) =
              session.on_metainfo_resolved(result, &self.ctx, &mut self.mgr)
            {
              self.by_info_hash.insert(info_hash, digest);
            }
          }
          None => {
            // the session was removed while resolving; balance the
            // cache reference the resolver may have taken
            if let Ok(resolved) = result {
              if resolved.cached {
                self.spawn_dec_ref(digest);
              }
            }
          }
        }
      }
      Event::Announced { digest, result } => {
        if let Some(session) = self.sessions.get_mut(&digest) {
          session.on_announced(result, &self.conf, &mut self.mgr, &self.ctx);
        }
      }
      Event::DialDone { key, addr, result } => {
        let digest = self.by_info_hash.get(&key.info_hash).copied();
        match digest.and_then(|d| self.sessions.get_mut(&d)) {
          Some(session) => {
            session.on_dial_done(key, addr, result, &self.conf, &mut self.mgr, &self.ctx)
          }
          None => self.mgr.note_dial_finished(&key),
        }
      }
      Event::IncomingHandshake {
        io,
        read_buf,
        handshake,
        addr,
      } => {
        let digest = self.by_info_hash.get(&handshake.info_hash).copied();
        match digest.and_then(|d| self.sessions.get_mut(&d)) {
          Some(session) => session.on_incoming(
            handshake,
            Established { io, read_buf },
            addr,
            &self.conf,
            &mut self.mgr,
            &self.ctx,
          ),
          None => {
            log::debug!(
              "No session for inbound {} from {}; dropping",
              handshake.info_hash,
              addr
            );
          }
        }
      }
      Event::Frame { key, conn_id, msg } => {
        let digest = self.by_info_hash.get(&key.info_hash).copied();
        if let Some(session) = digest.and_then(|d| self.sessions.get_mut(&d)) {
          session.on_frame(key, conn_id, msg, &self.conf, &mut self.mgr, &self.ctx);
        }
      }
      Event::ConnClosed {
        key,
        conn_id,
        reason,
      } => {
        let digest = self.by_info_hash.get(&key.info_hash).copied();
        if let Some(session) = digest.and_then(|d| self.sessions.get_mut(&d)) {
          session.on_conn_closed(key, conn_id, reason, &mut self.mgr);
        }
      }
      Event::PieceDone {
        digest,
        piece,
        from,
        outcome,
      } => {
        if let Some(session) = self.sessions.get_mut(&digest) {
          session.on_piece_done(piece, from, outcome, &self.conf, &mut self.mgr, &self.ctx);
        }
      }
      Event::Finalized { digest, result } => match self.sessions.get_mut(&digest) {
        Some(session) => session.on_finalized(result, &mut self.mgr, &self.ctx),
        None => {
          if result.is_ok() {
            self.spawn_dec_ref(digest);
          }
        }
      },
    }
  }

  fn handle_accept(&mut self, io: TcpStream, addr: SocketAddr) {
    // overload and cap refusal happen here, before anything is queued
    if self.mgr.global_count() >= self.conf.max_global_conn {
      log::info!("Refusing inbound connection from {}: at global cap", addr);
      return;
    }
    log::debug!("Inbound connection from {}", addr);
    tokio::spawn(conn::read_incoming_handshake(
      io,
      addr,
      self.ctx.event_tx.clone(),
    ));
  }

  fn handle_tick(&mut self) {
    let now = Instant::now();
    for session in self.sessions.values_mut() {
      session.tick(now, &self.conf, &mut self.mgr, &self.ctx);
    }
    self.mgr.gc_blacklist(now);

    if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
      self.last_sweep = now;
      let store = self.ctx.store.clone();
      let capacity = self.conf.cache_capacity_bytes;
      let ttl = self.conf.cache_eviction_ttl;
      tokio::spawn(async move {
        let _ = store.sweep(capacity, ttl).await;
      });
    }
  }

  fn remove_torrent(&mut self, digest: Digest, tx: oneshot::Sender<Result<()>>) {
    if let Some(mut session) = self.sessions.remove(&digest) {
      if let Some(info_hash) = session.info_hash() {
        self.by_info_hash.remove(&info_hash);
      }
      session.cancel(CancelReason::Removed, &mut self.mgr, &self.ctx);
    }

    // deletion runs off the actor; the cache delete may briefly race the
    // cancelled session's reference drop, so it retries on InUse
    let store = self.ctx.store.clone();
    tokio::spawn(async move {
      let _ = store.delete_download(digest).await;
      let mut result = Ok(());
      for _ in 0..10 {
        result = match store.delete_cache(digest).await {
          Ok(()) | Err(StoreError::NotFound) => Ok(()),
          Err(StoreError::InUse) => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(Error::Store(StoreError::InUse))
          }
          Err(e) => Err(Error::Store(e)),
        };
        if result.is_ok() {
          break;
        }
      }
      let _ = tx.send(result);
    });
  }

  fn probe(&self) -> Result<()> {
    let now = Instant::now();
    for session in self.sessions.values() {
      if let Err(reason) = session.probe(now, &self.conf) {
        return Err(Error::Unhealthy(reason));
      }
    }
    Ok(())
  }

  fn shutdown(&mut self) {
    log::info!("Shutting down scheduler");
    for (_, mut session) in self.sessions.drain() {
      session.cancel(CancelReason::Shutdown, &mut self.mgr, &self.ctx);
    }
    self.by_info_hash.clear();
  }

  /// Removes sessions that reached `Done` or `Errored`.
  fn reap(&mut self) {
    let finished: Vec<Digest> = self
      .sessions
      .iter()
      .filter(|(_, s)| s.is_finished())
      .map(|(d, _)| *d)
      .collect();
    for digest in finished {
      if let Some(session) = self.sessions.remove(&digest) {
        if let Some(info_hash) = session.info_hash() {
          self.by_info_hash.remove(&info_hash);
        }
        log::debug!("Reaped session {}", digest);
      }
    }
  }

  fn spawn_dec_ref(&self, digest: Digest) {
    let store = self.ctx.store.clone();
    tokio::spawn(async move {
      let _ = store.dec_ref(digest).await;
    });
  }
}
