//! Piece selection for one torrent.
//!
//! The dispatcher tracks which pieces this node has, how common each
//! piece is across connected peers, and which requests are in flight.
//! It picks rarest-first among the pieces a peer can serve, breaks ties
//! with a deterministic per-node hash so a fleet pulling the same blob
//! spreads its first requests instead of stampeding one piece, and
//! switches to endgame multi-requesting when few pieces remain.

use std::collections::{HashMap, HashSet};

use sha1::{Digest as _, Sha1};

use crate::conf::SchedulerConf;
use crate::{Bitfield, InfoHash, PeerId, PieceIndex};

pub(crate) struct Dispatcher {
  info_hash: InfoHash,
  local_peer: PeerId,
  piece_count: usize,
  /// Pieces this node has verified and written.
  own: Bitfield,
  /// How many connected peers have each piece.
  availability: Vec<u32>,
  /// Peers each piece is currently requested from. An entry survives
  /// until the piece is verified or the request is credited back, so a
  /// piece being verified is not re-picked outside endgame.
  inflight: HashMap<PieceIndex, HashSet<PeerId>>,
}

impl Dispatcher {
  pub fn new(info_hash: InfoHash, local_peer: PeerId, own: Bitfield) -> Self {
    let piece_count = own.len();
    Dispatcher {
      info_hash,
      local_peer,
      piece_count,
      own,
      availability: vec![0; piece_count],
      inflight: HashMap::new(),
    }
  }

  pub fn own(&self) -> &Bitfield {
    &self.own
  }

  pub fn piece_count(&self) -> usize {
    self.piece_count
  }

  pub fn missing_count(&self) -> usize {
    self.piece_count - self.own.count_ones()
  }

  pub fn is_complete(&self) -> bool {
    self.missing_count() == 0
  }

  pub fn in_endgame(&self, conf: &SchedulerConf) -> bool {
    !self.is_complete() && self.missing_count() <= conf.endgame_threshold_for(self.piece_count)
  }

  /// Registers a peer's full bitfield with the availability counts.
  pub fn peer_joined(&mut self, pieces: &Bitfield) {
    for index in pieces.iter_ones() {
      if let Some(count) = self.availability.get_mut(index) {
        *count += 1;
      }
    }
  }

  /// Unregisters a departing peer and credits back everything that was
  /// in flight to it.
  pub fn peer_left(&mut self, peer: &PeerId, pieces: &Bitfield) {
    for index in pieces.iter_ones() {
      if let Some(count) = self.availability.get_mut(index) {
        *count = count.saturating_sub(1);
      }
    }
    self.inflight.retain(|_, peers| {
      peers.remove(peer);
      !peers.is_empty()
    });
  }

  /// A peer gained one piece (HAVE or ANNOUNCE_PIECE gossip).
  pub fn peer_has(&mut self, index: PieceIndex) {
    if let Some(count) = self.availability.get_mut(index) {
      *count += 1;
    }
  }

  /// Picks up to `want` pieces to request from `peer`, rarest first,
  /// and registers them as in flight.
  ///
  /// Outside endgame a piece already in flight to
  /// `max_pending_per_piece` peers is skipped; in endgame every missing
  /// piece may be requested from any peer that has it, and the winners
  /// cancel the losers.
  pub fn pick(
    &mut self,
    peer: &PeerId,
    remote: &Bitfield,
    want: usize,
    conf: &SchedulerConf,
  ) -> Vec<PieceIndex> {
    if want == 0 || self.is_complete() {
      return Vec::new();
    }
    let endgame = self.in_endgame(conf);

    let mut candidates: Vec<PieceIndex> = (0..self.piece_count)
      .filter(|&index| {
        if self.own[index] || !remote.get(index).map(|b| *b).unwrap_or(false) {
          return false;
        }
        let pending = self.inflight.get(&index);
        if pending.map(|peers| peers.contains(peer)).unwrap_or(false) {
          return false;
        }
        endgame
          || pending.map(|peers| peers.len()).unwrap_or(0) < conf.max_pending_per_piece
      })
      .collect();

    candidates.sort_by_key(|&index| (self.availability[index], self.order_key(index)));
    candidates.truncate(want);

    for &index in &candidates {
      self.inflight.entry(index).or_default().insert(*peer);
    }
    candidates
  }

  /// Returns a request slot without an outcome: the request timed out,
  /// was cancelled, or its connection died. The piece becomes pickable
  /// again.
  pub fn credit(&mut self, peer: &PeerId, index: PieceIndex) {
    if let Some(peers) = self.inflight.get_mut(&index) {
      peers.remove(peer);
      if peers.is_empty() {
        self.inflight.remove(&index);
      }
    }
  }

  /// Marks a piece verified and owned. Returns the other peers the
  /// piece was in flight to, so duplicate endgame requests can be
  /// cancelled.
  pub fn mark_received(&mut self, index: PieceIndex, from: &PeerId) -> Vec<PeerId> {
    self.own.set(index, true);
    let mut losers: Vec<PeerId> = self
      .inflight
      .remove(&index)
      .map(|peers| peers.into_iter().collect())
      .unwrap_or_default();
    losers.retain(|peer| peer != from);
    losers
  }

  /// A peer served a piece that failed hash verification.
  pub fn mark_failed(&mut self, peer: &PeerId, index: PieceIndex) {
    self.credit(peer, index);
  }

  /// Deterministic tie-break key: distinct nodes order equally-rare
  /// pieces differently, but a single node orders them stably.
  fn order_key(&self, index: PieceIndex) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(self.info_hash.as_bytes());
    hasher.update((index as u32).to_be_bytes());
    hasher.update(self.local_peer.as_bytes());
    let hash = hasher.finalize();
    u64::from_be_bytes(hash[..8].try_into().expect("sha1 output is 20 bytes"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn peer(byte: u8) -> PeerId {
    PeerId::from_bytes([byte; 20])
  }

  fn bitfield(bits: &[bool]) -> Bitfield {
    let mut bf = Bitfield::repeat(false, bits.len());
    for (i, &bit) in bits.iter().enumerate() {
      bf.set(i, bit);
    }
    bf
  }

  fn dispatcher(piece_count: usize) -> Dispatcher {
    Dispatcher::new(
      InfoHash::from_bytes([7; 20]),
      peer(0),
      Bitfield::repeat(false, piece_count),
    )
  }

  #[test]
  fn test_rarest_first() {
    let mut d = dispatcher(4);
    let conf = SchedulerConf::default();

    // piece 2 is on one peer, the rest on two
    let a = bitfield(&[true, true, true, true]);
    let b = bitfield(&[true, true, false, true]);
    d.peer_joined(&a);
    d.peer_joined(&b);

    let picked = d.pick(&peer(1), &a, 1, &conf);
    assert_eq!(picked, vec![2]);
  }

  #[test]
  fn test_pick_skips_owned_and_absent() {
    let mut d = Dispatcher::new(
      InfoHash::from_bytes([7; 20]),
      peer(0),
      bitfield(&[true, false, false]),
    );
    let conf = SchedulerConf::default();

    // the peer only has pieces 0 (owned) and 1
    let remote = bitfield(&[true, true, false]);
    d.peer_joined(&remote);
    let picked = d.pick(&peer(1), &remote, 8, &conf);
    assert_eq!(picked, vec![1]);
  }

  #[test]
  fn test_duplicate_cap_outside_endgame() {
    let mut d = dispatcher(64);
    let conf = SchedulerConf {
      max_pending_per_piece: 1,
      endgame_threshold: Some(0),
      ..SchedulerConf::default()
    };

    let all = Bitfield::repeat(true, 64);
    d.peer_joined(&all);
    d.peer_joined(&all);

    let first = d.pick(&peer(1), &all, 64, &conf);
    assert_eq!(first.len(), 64);
    // every piece is in flight to its cap; a second peer gets nothing
    assert!(d.pick(&peer(2), &all, 64, &conf).is_empty());

    // a credited slot becomes pickable again, by the other peer too
    d.credit(&peer(1), first[0]);
    assert_eq!(d.pick(&peer(2), &all, 64, &conf), vec![first[0]]);
  }

  #[test]
  fn test_endgame_multi_requests_and_cancels_losers() {
    let mut d = dispatcher(4);
    let conf = SchedulerConf {
      max_pending_per_piece: 1,
      endgame_threshold: Some(4),
      ..SchedulerConf::default()
    };

    let all = Bitfield::repeat(true, 4);
    d.peer_joined(&all);
    d.peer_joined(&all);
    assert!(d.in_endgame(&conf));

    let first = d.pick(&peer(1), &all, 4, &conf);
    let second = d.pick(&peer(2), &all, 4, &conf);
    assert_eq!(first.len(), 4);
    // in endgame the same pieces go out to the second peer as well
    assert_eq!(second.len(), 4);

    // the piece arrives from peer 1; peer 2's duplicate is the loser
    let losers = d.mark_received(first[0], &peer(1));
    assert_eq!(losers, vec![peer(2)]);
    assert!(d.own()[first[0]]);
    assert_eq!(d.missing_count(), 3);
  }

  #[test]
  fn test_same_peer_never_doubles_a_piece() {
    let mut d = dispatcher(2);
    let conf = SchedulerConf {
      endgame_threshold: Some(2),
      ..SchedulerConf::default()
    };
    let all = Bitfield::repeat(true, 2);
    d.peer_joined(&all);

    // even in endgame a piece is not re-requested from the peer that
    // already has it in flight
    assert_eq!(d.pick(&peer(1), &all, 4, &conf).len(), 2);
    assert!(d.pick(&peer(1), &all, 4, &conf).is_empty());
  }

  #[test]
  fn test_peer_left_credits_inflight() {
    let mut d = dispatcher(3);
    let conf = SchedulerConf {
      max_pending_per_piece: 1,
      endgame_threshold: Some(0),
      ..SchedulerConf::default()
    };
    let all = Bitfield::repeat(true, 3);
    d.peer_joined(&all);
    d.peer_joined(&all);

    assert_eq!(d.pick(&peer(1), &all, 3, &conf).len(), 3);
    assert!(d.pick(&peer(2), &all, 3, &conf).is_empty());

    // the first peer dies; its slots free up for the second
    d.peer_left(&peer(1), &all);
    assert_eq!(d.pick(&peer(2), &all, 3, &conf).len(), 3);
  }

  #[test]
  fn test_order_key_varies_by_node() {
    // distinct local peers order equally-rare pieces differently often
    // enough that at least one index differs in a 32-piece torrent
    let d1 = dispatcher(32);
    let mut d2 = dispatcher(32);
    d2.local_peer = peer(9);

    let keys1: Vec<u64> = (0..32).map(|i| d1.order_key(i)).collect();
    let keys2: Vec<u64> = (0..32).map(|i| d2.order_key(i)).collect();
    assert_ne!(keys1, keys2);
    // but each node is stable
    assert_eq!(keys1, (0..32).map(|i| d1.order_key(i)).collect::<Vec<_>>());
  }
}
