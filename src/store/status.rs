//! The per-piece download status sidecar.
//!
//! The sidecar is one byte per piece, indexed by piece index, so a
//! single positioned read or write touches exactly one piece's state.

use crate::error::store::{Result, StoreError};
use crate::{Bitfield, PieceIndex};

/// The lifecycle of one piece within a download entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PieceStatus {
  /// Not downloaded and not requested.
  Empty = 0,
  /// Requested from at least one peer.
  Pending = 1,
  /// Verified against its metainfo hash and written at its offset.
  Complete = 2,
  /// Bytes were written but cannot be trusted (e.g. a write failed part
  /// way through). Treated as empty on restart.
  Dirty = 3,
}

impl PieceStatus {
  pub fn from_byte(byte: u8) -> Result<Self> {
    match byte {
      0 => Ok(PieceStatus::Empty),
      1 => Ok(PieceStatus::Pending),
      2 => Ok(PieceStatus::Complete),
      3 => Ok(PieceStatus::Dirty),
      other => Err(StoreError::InvalidStatus(other)),
    }
  }

  pub fn as_byte(self) -> u8 {
    self as u8
  }

  /// The state this piece resumes in after a restart: only verified
  /// pieces survive, in-flight and dirty ones are re-downloaded.
  pub fn recovered(self) -> Self {
    match self {
      PieceStatus::Complete => PieceStatus::Complete,
      _ => PieceStatus::Empty,
    }
  }
}

/// Decodes a whole status file into per-piece states.
///
/// A file whose length does not match the piece count (truncation, or a
/// metainfo change that can only mean corruption) yields `None`; the
/// caller rebuilds the entry as all-empty.
pub fn decode_file(bytes: &[u8], piece_count: usize) -> Option<Vec<PieceStatus>> {
  if bytes.len() != piece_count {
    return None;
  }
  bytes
    .iter()
    .map(|&b| PieceStatus::from_byte(b).ok())
    .collect()
}

/// Derives the possession bitfield from decoded statuses.
pub fn to_bitfield(statuses: &[PieceStatus]) -> Bitfield {
  let mut bitfield = Bitfield::repeat(false, statuses.len());
  for (index, status) in statuses.iter().enumerate() {
    if *status == PieceStatus::Complete {
      bitfield.set(index as PieceIndex, true);
    }
  }
  bitfield
}
