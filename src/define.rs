use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// A SHA-1 hash digest, 20 bytes long. Used for per-piece hashes.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the highest bit represents the first
/// piece, the second highest the second piece, and so on. A truthy value
/// of a piece's position in this vector means the peer has the piece,
/// while a falsy value means it doesn't.
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::prelude::Msb0>;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types
/// in Rust.
pub type PieceIndex = usize;

/// The SHA-256 digest of a blob's bytes. Its lowercase hex form is the
/// blob's durable, location-independent name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
  /// Computes the digest of the given bytes.
  pub fn of(bytes: &[u8]) -> Self {
    let hash = Sha256::digest(bytes);
    let mut buf = [0; 32];
    buf.copy_from_slice(&hash);
    Digest(buf)
  }

  pub const fn from_bytes(bytes: [u8; 32]) -> Self {
    Digest(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  /// The canonical name of the blob.
  pub fn hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hex())
  }
}

impl fmt::Debug for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Digest({})", self.hex())
  }
}

impl FromStr for Digest {
  type Err = hex::FromHexError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut buf = [0; 32];
    hex::decode_to_slice(s, &mut buf)?;
    Ok(Digest(buf))
  }
}

impl Serialize for Digest {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.hex())
  }
}

impl<'de> Deserialize<'de> for Digest {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
  }
}

/// The 20-byte identifier derived from a blob's metainfo; the key under
/// which peers discover each other at the tracker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
  pub const fn from_bytes(bytes: [u8; 20]) -> Self {
    InfoHash(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 20] {
    &self.0
  }

  pub fn hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Display for InfoHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hex())
  }
}

impl fmt::Debug for InfoHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "InfoHash({})", self.hex())
  }
}

impl FromStr for InfoHash {
  type Err = hex::FromHexError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut buf = [0; 20];
    hex::decode_to_slice(s, &mut buf)?;
    Ok(InfoHash(buf))
  }
}

impl Serialize for InfoHash {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.hex())
  }
}

impl<'de> Deserialize<'de> for InfoHash {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
  }
}

/// The opaque 20-byte identifier of one agent process, stable for the
/// process lifetime.
///
/// The derived ordering is the byte-lexicographic one; it decides which
/// side of a simultaneous dial keeps its connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
  /// Generates a fresh id for this process.
  pub fn random() -> Self {
    let mut buf = [0; 20];
    rand::Rng::fill(&mut rand::thread_rng(), &mut buf[..]);
    PeerId(buf)
  }

  pub const fn from_bytes(bytes: [u8; 20]) -> Self {
    PeerId(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 20] {
    &self.0
  }

  pub fn hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl fmt::Display for PeerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hex())
  }
}

impl fmt::Debug for PeerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PeerId({})", self.hex())
  }
}

impl FromStr for PeerId {
  type Err = hex::FromHexError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut buf = [0; 20];
    hex::decode_to_slice(s, &mut buf)?;
    Ok(PeerId(buf))
  }
}

impl Serialize for PeerId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.hex())
  }
}

impl<'de> Deserialize<'de> for PeerId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
  }
}
