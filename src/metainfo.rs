use std::fmt;

use serde_derive::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

use crate::error::metainfo::{MetainfoError, Result};
use crate::{Digest, InfoHash, PieceIndex, Sha1Hash};

const MIB: u64 = 1024 * 1024;

/// Returns the piece length used for a blob of the given size.
///
/// The schedule is fixed so that distinct nodes derive byte-identical
/// metainfo (and thus the same info hash) for the same digest without
/// coordinating: 4 MiB up to 256 MiB, 8 MiB up to 2 GiB, 16 MiB up to
/// 8 GiB, 32 MiB above that.
pub fn piece_length_for(total_len: u64) -> u64 {
  if total_len <= 256 * MIB {
    4 * MIB
  } else if total_len <= 2048 * MIB {
    8 * MIB
  } else if total_len <= 8192 * MIB {
    16 * MIB
  } else {
    32 * MIB
  }
}

/// The torrent metadata of one blob: its digest, byte length, piece
/// length and the SHA-1 hash of every piece.
///
/// Immutable once created; persisted as a JSON sidecar next to the blob
/// so the digest→metainfo mapping is locally durable.
#[derive(Clone, PartialEq, Eq)]
pub struct Metainfo {
  digest: Digest,
  total_len: u64,
  piece_len: u64,
  /// Concatenation of each piece's SHA-1, so its length is a multiple of
  /// 20 bytes and encodes the piece count.
  pieces: Vec<u8>,
  info_hash: InfoHash,
}

impl fmt::Debug for Metainfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Metainfo")
      .field("digest", &self.digest)
      .field("total_len", &self.total_len)
      .field("piece_len", &self.piece_len)
      .field("piece_count", &self.piece_count())
      .field("info_hash", &self.info_hash)
      .finish()
  }
}

impl Metainfo {
  /// Assembles metainfo from its parts, verifying the piece geometry.
  pub fn new(
    digest: Digest,
    total_len: u64,
    piece_len: u64,
    pieces: Vec<u8>,
  ) -> Result<Self> {
    if total_len == 0 || piece_len == 0 {
      return Err(MetainfoError::InvalidLength);
    }
    // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
    // must be a multiple of 20
    if pieces.len() % 20 != 0 {
      return Err(MetainfoError::InvalidPieces);
    }
    let piece_count = (total_len + piece_len - 1) / piece_len;
    if pieces.len() as u64 / 20 != piece_count {
      return Err(MetainfoError::InvalidPieces);
    }
    let info_hash = compute_info_hash(&digest, total_len, piece_len, &pieces)?;
    Ok(Metainfo {
      digest,
      total_len,
      piece_len,
      pieces,
      info_hash,
    })
  }

  /// Derives the metainfo of a blob held fully in memory, using the fixed
  /// piece length schedule. This is the generation path used by origin
  /// tooling and tests; agents normally receive metainfo ready-made.
  pub fn from_blob(digest: Digest, blob: &[u8]) -> Result<Self> {
    if blob.is_empty() {
      return Err(MetainfoError::InvalidLength);
    }
    let piece_len = piece_length_for(blob.len() as u64);
    let mut pieces = Vec::new();
    for chunk in blob.chunks(piece_len as usize) {
      let hash = Sha1::digest(chunk);
      pieces.extend_from_slice(&hash);
    }
    Self::new(digest, blob.len() as u64, piece_len, pieces)
  }

  pub fn digest(&self) -> Digest {
    self.digest
  }

  pub fn info_hash(&self) -> InfoHash {
    self.info_hash
  }

  pub fn total_len(&self) -> u64 {
    self.total_len
  }

  pub fn piece_len(&self) -> u64 {
    self.piece_len
  }

  pub fn piece_count(&self) -> usize {
    ((self.total_len + self.piece_len - 1) / self.piece_len) as usize
  }

  /// The length of the piece at `index`; only the last piece may be
  /// shorter than the nominal piece length.
  pub fn piece_len_at(&self, index: PieceIndex) -> u64 {
    let offset = self.piece_offset(index);
    debug_assert!(offset < self.total_len);
    (self.total_len - offset).min(self.piece_len)
  }

  /// The byte offset of the piece within the blob.
  pub fn piece_offset(&self, index: PieceIndex) -> u64 {
    index as u64 * self.piece_len
  }

  pub fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
    let start = index.checked_mul(20)?;
    let slice = self.pieces.get(start..start + 20)?;
    let mut hash = [0; 20];
    hash.copy_from_slice(slice);
    Some(hash)
  }

  /// Serializes the sidecar document.
  pub fn to_json(&self) -> Result<Vec<u8>> {
    let doc = sidecar::Doc {
      digest: self.digest,
      total_len: self.total_len,
      piece_len: self.piece_len,
      pieces: hex::encode(&self.pieces),
    };
    Ok(serde_json::to_vec(&doc)?)
  }

  /// Parses a sidecar document, re-verifying geometry and info hash.
  pub fn from_json(bytes: &[u8]) -> Result<Self> {
    let doc: sidecar::Doc = serde_json::from_slice(bytes)?;
    let pieces = hex::decode(&doc.pieces).map_err(|_| MetainfoError::InvalidPieces)?;
    Self::new(doc.digest, doc.total_len, doc.piece_len, pieces)
  }
}

/// The info hash is the SHA-1 of the canonical bencoded info dictionary.
/// Bencode is used for this one encoding because its output is
/// byte-deterministic, which JSON does not guarantee.
fn compute_info_hash(
  digest: &Digest,
  total_len: u64,
  piece_len: u64,
  pieces: &[u8],
) -> Result<InfoHash> {
  let info = raw::Info {
    name: digest.hex(),
    pieces: serde_bytes::Bytes::new(pieces),
    piece_len,
    len: total_len,
  };
  let encoded = serde_bencode::to_bytes(&info)?;
  let hash = Sha1::digest(&encoded);
  let mut buf = [0; 20];
  buf.copy_from_slice(&hash);
  Ok(InfoHash::from_bytes(buf))
}

mod raw {
  //! The canonical info dictionary the info hash is computed over.
  use serde_derive::Serialize;

  #[derive(Serialize)]
  pub(super) struct Info<'a> {
    /// The blob's hex digest doubles as the torrent name.
    pub name: String,
    pub pieces: &'a serde_bytes::Bytes,
    #[serde(rename = "piece length")]
    pub piece_len: u64,
    #[serde(rename = "length")]
    pub len: u64,
  }
}

mod sidecar {
  //! The JSON document persisted next to the blob file.
  use super::*;

  #[derive(Serialize, Deserialize)]
  pub(super) struct Doc {
    pub digest: Digest,
    pub total_len: u64,
    pub piece_len: u64,
    /// Hex-encoded piece hash concatenation.
    pub pieces: String,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
  }

  #[test]
  fn test_piece_length_schedule() {
    assert_eq!(piece_length_for(1), 4 * MIB);
    assert_eq!(piece_length_for(256 * MIB), 4 * MIB);
    assert_eq!(piece_length_for(256 * MIB + 1), 8 * MIB);
    assert_eq!(piece_length_for(2048 * MIB), 8 * MIB);
    assert_eq!(piece_length_for(2048 * MIB + 1), 16 * MIB);
    assert_eq!(piece_length_for(8192 * MIB), 16 * MIB);
    assert_eq!(piece_length_for(8192 * MIB + 1), 32 * MIB);
  }

  #[test]
  fn test_single_piece_blob() {
    // a blob no larger than one piece yields exactly one piece whose
    // length is the blob length
    let bytes = blob(1000);
    let metainfo = Metainfo::from_blob(Digest::of(&bytes), &bytes).unwrap();
    assert_eq!(metainfo.piece_count(), 1);
    assert_eq!(metainfo.piece_len_at(0), 1000);
  }

  #[test]
  fn test_exact_multiple_has_no_short_piece() {
    let bytes = blob(8 * MIB as usize);
    let metainfo = Metainfo::from_blob(Digest::of(&bytes), &bytes).unwrap();
    assert_eq!(metainfo.piece_count(), 2);
    assert_eq!(metainfo.piece_len_at(0), 4 * MIB);
    assert_eq!(metainfo.piece_len_at(1), 4 * MIB);
  }

  #[test]
  fn test_trailing_short_piece() {
    let bytes = blob(4 * MIB as usize + 123);
    let metainfo = Metainfo::from_blob(Digest::of(&bytes), &bytes).unwrap();
    assert_eq!(metainfo.piece_count(), 2);
    assert_eq!(metainfo.piece_len_at(0), 4 * MIB);
    assert_eq!(metainfo.piece_len_at(1), 123);
  }

  #[test]
  fn test_piece_hashes_match_blob() {
    let bytes = blob(4 * MIB as usize + 1);
    let metainfo = Metainfo::from_blob(Digest::of(&bytes), &bytes).unwrap();
    let first = Sha1::digest(&bytes[..4 * MIB as usize]);
    let last = Sha1::digest(&bytes[4 * MIB as usize..]);
    assert_eq!(metainfo.piece_hash(0).unwrap()[..], first[..]);
    assert_eq!(metainfo.piece_hash(1).unwrap()[..], last[..]);
    assert_eq!(metainfo.piece_hash(2), None);
  }

  #[test]
  fn test_geometry_validation() {
    let digest = Digest::of(b"x");
    // zero length
    assert!(Metainfo::new(digest, 0, 4 * MIB, Vec::new()).is_err());
    // hash concatenation not a multiple of 20
    assert!(Metainfo::new(digest, 10, 4 * MIB, vec![0; 19]).is_err());
    // piece count mismatch
    assert!(Metainfo::new(digest, 10, 4 * MIB, vec![0; 40]).is_err());
  }

  #[test]
  fn test_info_hash_is_content_determined() {
    let bytes = blob(1024);
    let digest = Digest::of(&bytes);
    let a = Metainfo::from_blob(digest, &bytes).unwrap();
    let b = Metainfo::from_blob(digest, &bytes).unwrap();
    assert_eq!(a.info_hash(), b.info_hash());

    let other = blob(1025);
    let c = Metainfo::from_blob(Digest::of(&other), &other).unwrap();
    assert_ne!(a.info_hash(), c.info_hash());
  }

  #[test]
  fn test_sidecar_round_trip() {
    let bytes = blob(5000);
    let metainfo = Metainfo::from_blob(Digest::of(&bytes), &bytes).unwrap();
    let encoded = metainfo.to_json().unwrap();
    let decoded = Metainfo::from_json(&encoded).unwrap();
    assert_eq!(decoded, metainfo);
    assert_eq!(decoded.info_hash(), metainfo.info_hash());
  }
}
