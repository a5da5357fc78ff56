//! One peer connection: the socket, its two IO pumps, and the actor-side
//! bookkeeping.
//!
//! A connection's life is `Connecting → Handshaking → Active → Closing →
//! Closed`. The first two stages live in the dial and accept tasks
//! ([`dial`], [`read_incoming_handshake`]); a [`Conn`] value exists only
//! once the handshake is validated and admission has passed, i.e. from
//! `Active` on. Two tasks pump the socket: the read pump decodes frames
//! and forwards them to the scheduler actor over its bounded event
//! channel (which is also the backpressure boundary), the write pump
//! drains the bounded per-connection send queue. Only the actor mutates
//! the `Conn`; pumps touch nothing but their socket half and the shared
//! byte counters.

use std::{
  collections::HashMap,
  net::SocketAddr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
  net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
  },
  sync::mpsc,
  task::JoinHandle,
  time::timeout,
};
use tokio_util::codec::{Framed, FramedRead, FramedWrite};

use super::conn_state::ConnKey;
use super::{CloseReason, Established, Event};
use crate::error::peer::PeerError;
use crate::protocol::{Handshake, HandshakeCodec, Message, MessageCodec};
use crate::{Bitfield, PieceIndex};

/// Bound of the per-connection send queue. A full queue stops the
/// dispatcher from issuing requests through this connection.
pub(crate) const SEND_QUEUE_LEN: usize = 64;

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Actor-visible state of an established connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
  Active,
  Closing,
}

/// Per-connection transfer counters.
pub(crate) struct ConnStats {
  pub created_at: Instant,
  /// Wire bytes, updated by the pumps.
  pub bytes_in: Arc<AtomicU64>,
  pub bytes_out: Arc<AtomicU64>,
  /// Piece-level counters and penalties, updated by the actor.
  pub pieces_in: u64,
  pub pieces_out: u64,
  pub timeouts: u64,
  pub hash_failures: u64,
  /// Decremented on timeouts and hash failures.
  pub reliability: i64,
}

pub(crate) struct Conn {
  /// Distinguishes successive connections for the same key, so a close
  /// event from a replaced connection cannot tear down its successor.
  pub id: u64,
  pub key: ConnKey,
  pub addr: SocketAddr,
  pub state: ConnState,
  pub local_initiated: bool,
  /// The peer's piece possession; `None` until its BITFIELD arrives.
  pub remote_pieces: Option<Bitfield>,
  pub remote_complete: bool,
  /// Our outstanding piece requests and when each was sent.
  pub pending: HashMap<PieceIndex, Instant>,
  pub last_seen: Instant,
  pub last_sent: Instant,
  /// Last time a piece moved in either direction; drives the idle TTL.
  pub last_piece_activity: Instant,
  pub stats: ConnStats,
  out_tx: mpsc::Sender<Message>,
  read_task: JoinHandle<()>,
  write_task: JoinHandle<()>,
}

impl Conn {
  /// Queues a message on the send queue. Returns false if the queue is
  /// full (backpressure) or the write pump is gone.
  pub fn try_send(&mut self, msg: Message) -> bool {
    match self.out_tx.try_send(msg) {
      Ok(()) => {
        self.last_sent = Instant::now();
        true
      }
      Err(e) => {
        log::debug!("Conn {} send queue refused message: {}", self.key, e);
        false
      }
    }
  }

  /// A sender for tasks that produce messages off the actor (e.g. piece
  /// reads serving a request).
  pub fn sender(&self) -> mpsc::Sender<Message> {
    self.out_tx.clone()
  }

  /// Remaining room in the send queue.
  pub fn send_capacity(&self) -> usize {
    self.out_tx.capacity()
  }

  /// Begins `Closing`: stops both pumps. The socket drops with them.
  pub fn close(&mut self) {
    self.state = ConnState::Closing;
    self.read_task.abort();
    self.write_task.abort();
  }
}

impl Drop for Conn {
  fn drop(&mut self) {
    self.read_task.abort();
    self.write_task.abort();
  }
}

/// Spawns the pumps over a handshaken socket and returns the connection
/// in `Active` state.
///
/// On the accepting side `reply` carries our handshake, which the write
/// pump sends before anything else; `read_buf` carries bytes that
/// arrived after the peer's handshake and is replayed into the read
/// pump's buffer.
pub(crate) fn start(
  key: ConnKey,
  addr: SocketAddr,
  local_initiated: bool,
  io: TcpStream,
  read_buf: BytesMut,
  reply: Option<Handshake>,
  event_tx: mpsc::Sender<Event>,
) -> Conn {
  static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);
  let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

  let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_LEN);
  let bytes_in = Arc::new(AtomicU64::new(0));
  let bytes_out = Arc::new(AtomicU64::new(0));

  let (read_half, write_half) = io.into_split();
  let read_task = tokio::spawn(read_pump(
    read_half,
    read_buf,
    key,
    id,
    event_tx.clone(),
    Arc::clone(&bytes_in),
  ));
  let write_task = tokio::spawn(write_pump(
    write_half,
    reply,
    out_rx,
    key,
    id,
    event_tx,
    Arc::clone(&bytes_out),
  ));

  let now = Instant::now();
  Conn {
    id,
    key,
    addr,
    state: ConnState::Active,
    local_initiated,
    remote_pieces: None,
    remote_complete: false,
    pending: HashMap::new(),
    last_seen: now,
    last_sent: now,
    last_piece_activity: now,
    stats: ConnStats {
      created_at: now,
      bytes_in,
      bytes_out,
      pieces_in: 0,
      pieces_out: 0,
      timeouts: 0,
      hash_failures: 0,
      reliability: 0,
    },
    out_tx,
    read_task,
    write_task,
  }
}

async fn read_pump(
  read_half: OwnedReadHalf,
  leftover: BytesMut,
  key: ConnKey,
  conn_id: u64,
  event_tx: mpsc::Sender<Event>,
  bytes_in: Arc<AtomicU64>,
) {
  let mut framed = FramedRead::new(read_half, MessageCodec);
  framed.read_buffer_mut().extend_from_slice(&leftover);

  while let Some(result) = framed.next().await {
    match result {
      Ok(msg) => {
        bytes_in.fetch_add(encoded_len(&msg), Ordering::Relaxed);
        let frame = Event::Frame { key, conn_id, msg };
        if event_tx.send(frame).await.is_err() {
          // scheduler gone; nothing to report to
          return;
        }
      }
      Err(e) => {
        let _ = event_tx
          .send(Event::ConnClosed {
            key,
            conn_id,
            reason: CloseReason::Error(e.to_string()),
          })
          .await;
        return;
      }
    }
  }
  let _ = event_tx
    .send(Event::ConnClosed {
      key,
      conn_id,
      reason: CloseReason::PeerClosed,
    })
    .await;
}

async fn write_pump(
  write_half: OwnedWriteHalf,
  reply: Option<Handshake>,
  mut out_rx: mpsc::Receiver<Message>,
  key: ConnKey,
  conn_id: u64,
  event_tx: mpsc::Sender<Event>,
  bytes_out: Arc<AtomicU64>,
) {
  // the accepting side answers the peer's handshake before switching to
  // the frame codec on the same socket
  let write_half = match reply {
    Some(handshake) => {
      let len = handshake.len() as u64;
      let mut framed = FramedWrite::new(write_half, HandshakeCodec);
      if let Err(e) = framed.send(handshake).await {
        let _ = event_tx
          .send(Event::ConnClosed {
            key,
            conn_id,
            reason: CloseReason::Error(e.to_string()),
          })
          .await;
        return;
      }
      bytes_out.fetch_add(len, Ordering::Relaxed);
      framed.into_inner()
    }
    None => write_half,
  };

  let mut framed = FramedWrite::new(write_half, MessageCodec);
  while let Some(msg) = out_rx.recv().await {
    bytes_out.fetch_add(encoded_len(&msg), Ordering::Relaxed);
    if let Err(e) = framed.send(msg).await {
      let _ = event_tx
        .send(Event::ConnClosed {
          key,
          conn_id,
          reason: CloseReason::Error(e.to_string()),
        })
        .await;
      return;
    }
  }
  // the actor dropped the connection; closing is already under way
}

/// Dials a peer and runs the initiating half of the handshake. The
/// outcome is delivered to the actor as a [`Event::DialDone`].
pub(crate) async fn dial(
  key: ConnKey,
  addr: SocketAddr,
  handshake: Handshake,
  event_tx: mpsc::Sender<Event>,
) {
  let result = establish(&key, addr, handshake).await;
  let _ = event_tx.send(Event::DialDone { key, addr, result }).await;
}

async fn establish(
  key: &ConnKey,
  addr: SocketAddr,
  handshake: Handshake,
) -> Result<Established, PeerError> {
  let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await??;
  let mut framed = Framed::new(stream, HandshakeCodec);

  // the dialing side sends its handshake first
  framed.send(handshake).await?;
  let reply = timeout(HANDSHAKE_TIMEOUT, framed.next())
    .await?
    .ok_or_else(|| {
      PeerError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "peer closed during handshake",
      ))
    })??;

  if reply.info_hash != key.info_hash {
    return Err(PeerError::InfoHashMismatch);
  }
  if reply.peer_id != key.peer_id {
    return Err(PeerError::UnexpectedPeerId);
  }

  let parts = framed.into_parts();
  Ok(Established {
    io: parts.io,
    read_buf: parts.read_buf,
  })
}

/// Accept-side counterpart of [`dial`]: reads the dialer's handshake and
/// hands the socket to the actor for admission. A malformed or timed-out
/// handshake drops the socket without a reply.
pub(crate) async fn read_incoming_handshake(
  io: TcpStream,
  addr: SocketAddr,
  event_tx: mpsc::Sender<Event>,
) {
  let mut framed = Framed::new(io, HandshakeCodec);
  match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
    Ok(Some(Ok(handshake))) => {
      let parts = framed.into_parts();
      let _ = event_tx
        .send(Event::IncomingHandshake {
          io: parts.io,
          read_buf: parts.read_buf,
          handshake,
          addr,
        })
        .await;
    }
    Ok(Some(Err(e))) => {
      log::info!("Dropping inbound connection from {}: {}", addr, e);
    }
    Ok(None) | Err(_) => {
      log::info!("Inbound connection from {} closed before handshake", addr);
    }
  }
}

/// The encoded size of a message, for the transfer counters.
pub(crate) fn encoded_len(msg: &Message) -> u64 {
  match msg {
    Message::KeepAlive => 4,
    Message::Bitfield(bitfield) => 4 + 1 + bitfield.as_raw_slice().len() as u64,
    Message::Piece { data, .. } => 4 + 1 + 4 + data.len() as u64,
    Message::Complete => 4 + 1,
    Message::Have { .. }
    | Message::Request { .. }
    | Message::Cancel { .. }
    | Message::AnnouncePiece { .. } => 4 + 1 + 4,
  }
}
