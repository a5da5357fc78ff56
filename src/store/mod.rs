//! The content-addressable store (CAS).
//!
//! Blobs are kept under the store root in one of two states, each a
//! two-level directory tree sharded by the first two bytes of the hex
//! digest:
//!
//! ```txt
//! download/XX/YY/<digest>            partially written blob
//! download/XX/YY/<digest>_status     one byte per piece
//! download/XX/YY/<digest>_metainfo   JSON metainfo sidecar
//! download/XX/YY/<digest>_startedat  download creation time
//! cache/XX/YY/<digest>               verified, immutable blob
//! cache/XX/YY/<digest>_metainfo      moves here on promotion
//! cache/XX/YY/<digest>_refcount      varint refcount, never moves
//! ```
//!
//! Promotion from download to cache is a rename and happens only once
//! every piece is complete; after it the entry is immutable. All
//! operations on a single entry are serialized by a per-digest latch;
//! distinct entries proceed concurrently.
//!
//! The store itself is synchronous. [`StoreHandle`] is the async facade
//! used by the scheduler: it runs every operation on the blocking pool so
//! piece IO never stalls the event loop, the same split the disk task of
//! a torrent engine makes.

mod status;

pub use status::PieceStatus;

use std::{
  collections::HashMap,
  fs::{self, File, OpenOptions},
  io::{self, Read},
  os::unix::fs::FileExt,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
  time::{Duration, SystemTime},
};

use lru::LruCache;
use sha2::{Digest as _, Sha256};
use tokio::task;

use crate::error::store::{Result, StoreError};
use crate::metainfo::Metainfo;
use crate::{Bitfield, Digest, PieceIndex};

const STATUS_SUFFIX: &str = "_status";
const METAINFO_SUFFIX: &str = "_metainfo";
const REFCOUNT_SUFFIX: &str = "_refcount";
const STARTEDAT_SUFFIX: &str = "_startedat";

/// Which state an entry currently lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
  Download,
  Cache,
}

impl EntryState {
  fn dir(self) -> &'static str {
    match self {
      EntryState::Download => "download",
      EntryState::Cache => "cache",
    }
  }
}

/// Outcome of a promotion request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Promotion {
  /// The download entry was renamed into the cache.
  Promoted,
  /// The digest was already cached and verified; nothing moved.
  AlreadyCached,
}

/// In-memory bookkeeping for one cache entry, used to drive eviction.
#[derive(Clone, Copy, Debug)]
struct CacheMeta {
  len: u64,
  last_access: SystemTime,
}

struct CacheIndex {
  lru: LruCache<Digest, CacheMeta>,
  total_bytes: u64,
}

pub struct CaStore {
  root: PathBuf,
  /// Per-entry latches; operations on one digest are serialized,
  /// operations on distinct digests are not.
  latches: Mutex<HashMap<Digest, Arc<Mutex<()>>>>,
  /// Recency index over cache entries, seeded from file mtimes at open.
  index: Mutex<CacheIndex>,
}

impl CaStore {
  /// Opens the store, creating the state directories if needed and
  /// recovering any state left by a previous process.
  ///
  /// Recovery rules: a download entry without a metainfo sidecar is
  /// discarded; a status sidecar of the wrong length is rebuilt as
  /// all-empty; pending and dirty pieces are downgraded to empty. The
  /// cache recency index is rebuilt from file modification times.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
    let root = root.into();
    for state in [EntryState::Download, EntryState::Cache] {
      fs::create_dir_all(root.join(state.dir()))?;
    }

    let store = CaStore {
      root,
      latches: Mutex::new(HashMap::new()),
      index: Mutex::new(CacheIndex {
        lru: LruCache::unbounded(),
        total_bytes: 0,
      }),
    };
    store.recover_downloads()?;
    store.build_cache_index()?;
    Ok(store)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// The state the entry is in, cache preferred (an entry must not exist
  /// in both; if a crash left both, the cache copy is the verified one).
  pub fn state_of(&self, digest: &Digest) -> Option<EntryState> {
    if self.data_path(EntryState::Cache, digest).exists() {
      Some(EntryState::Cache)
    } else if self.data_path(EntryState::Download, digest).exists() {
      Some(EntryState::Download)
    } else {
      None
    }
  }

  /// Creates a download entry for the blob: a sparse data file of the
  /// final length, an all-empty status sidecar, and the metainfo sidecar.
  pub fn create_download(&self, metainfo: &Metainfo) -> Result<()> {
    let digest = metainfo.digest();
    let latch = self.latch(&digest);
    let _entry = latch.lock().unwrap();

    if self.state_of(&digest).is_some() {
      return Err(StoreError::AlreadyExists);
    }

    let dir = self.shard_dir(EntryState::Download, &digest);
    fs::create_dir_all(&dir)?;

    let data = File::create(self.data_path(EntryState::Download, &digest))?;
    data.set_len(metainfo.total_len())?;

    fs::write(
      self.sidecar_path(EntryState::Download, &digest, STATUS_SUFFIX),
      vec![PieceStatus::Empty.as_byte(); metainfo.piece_count()],
    )?;
    fs::write(
      self.sidecar_path(EntryState::Download, &digest, METAINFO_SUFFIX),
      metainfo.to_json().map_err(|e| StoreError::CorruptSidecar(e.to_string()))?,
    )?;
    let started = SystemTime::now()
      .duration_since(SystemTime::UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs();
    fs::write(
      self.sidecar_path(EntryState::Download, &digest, STARTEDAT_SUFFIX),
      started.to_string(),
    )?;

    log::debug!("Created download entry for {}", digest);
    Ok(())
  }

  /// Reads the metainfo sidecar from whichever state holds the entry.
  pub fn read_metainfo(&self, digest: &Digest) -> Result<Metainfo> {
    let state = self.state_of(digest).ok_or(StoreError::NotFound)?;
    let bytes = fs::read(self.sidecar_path(state, digest, METAINFO_SUFFIX))?;
    Metainfo::from_json(&bytes).map_err(|e| StoreError::CorruptSidecar(e.to_string()))
  }

  /// Writes verified piece bytes at their final offset in the download
  /// file. Returns `NotFound` if the entry no longer exists (e.g. it was
  /// removed while the write was in flight); the caller discards.
  pub fn write_piece_at(&self, digest: &Digest, offset: u64, data: &[u8]) -> Result<()> {
    let latch = self.latch(digest);
    let _entry = latch.lock().unwrap();

    let file = OpenOptions::new()
      .write(true)
      .open(self.data_path(EntryState::Download, digest))?;
    file.write_all_at(data, offset)?;
    Ok(())
  }

  /// Reads bytes at an offset, cache preferred. Cache reads refresh the
  /// entry's recency.
  pub fn read_piece_at(&self, digest: &Digest, offset: u64, len: usize) -> Result<Vec<u8>> {
    let state = self.state_of(digest).ok_or(StoreError::NotFound)?;
    let file = File::open(self.data_path(state, digest))?;
    let mut buf = vec![0; len];
    file.read_exact_at(&mut buf, offset)?;
    if state == EntryState::Cache {
      self.touch(digest);
    }
    Ok(buf)
  }

  /// Reads the whole blob, cache preferred.
  pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
    let state = self.state_of(digest).ok_or(StoreError::NotFound)?;
    let bytes = fs::read(self.data_path(state, digest))?;
    if state == EntryState::Cache {
      self.touch(digest);
    }
    Ok(bytes)
  }

  pub fn get_piece_status(&self, digest: &Digest, index: PieceIndex) -> Result<PieceStatus> {
    let file = File::open(self.sidecar_path(EntryState::Download, digest, STATUS_SUFFIX))?;
    let mut byte = [0u8];
    file
      .read_exact_at(&mut byte, index as u64)
      .map_err(|e| index_error(e, index))?;
    PieceStatus::from_byte(byte[0])
  }

  pub fn set_piece_status(&self, digest: &Digest, index: PieceIndex, status: PieceStatus) -> Result<()> {
    let latch = self.latch(digest);
    let _entry = latch.lock().unwrap();

    let path = self.sidecar_path(EntryState::Download, digest, STATUS_SUFFIX);
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    // positioned writes do not extend the file past its piece count
    let len = file.metadata()?.len();
    if index as u64 >= len {
      return Err(StoreError::InvalidPieceIndex(index));
    }
    file.write_all_at(&[status.as_byte()], index as u64)?;
    Ok(())
  }

  /// The possession bitfield of a download entry. A fully cached entry
  /// reports all pieces complete.
  pub fn download_bitfield(&self, digest: &Digest) -> Result<Bitfield> {
    match self.state_of(digest) {
      Some(EntryState::Cache) => {
        let metainfo = self.read_metainfo(digest)?;
        Ok(Bitfield::repeat(true, metainfo.piece_count()))
      }
      Some(EntryState::Download) => {
        let bytes = fs::read(self.sidecar_path(EntryState::Download, digest, STATUS_SUFFIX))?;
        let statuses = status::decode_file(&bytes, bytes.len())
          .ok_or_else(|| StoreError::CorruptSidecar("status byte out of range".into()))?;
        Ok(status::to_bitfield(&statuses))
      }
      None => Err(StoreError::NotFound),
    }
  }

  /// Atomically promotes a fully downloaded entry into the cache.
  ///
  /// Movable sidecars (metainfo) travel with the data file; the status
  /// and startedat sidecars are download-state bookkeeping and are
  /// removed. The refcount sidecar is created fresh in the cache state.
  pub fn move_to_cache(&self, digest: &Digest) -> Result<Promotion> {
    let latch = self.latch(digest);
    let _entry = latch.lock().unwrap();

    if self.data_path(EntryState::Cache, digest).exists() {
      // already verified; drop any leftover download entry
      self.remove_download_files(digest);
      return Ok(Promotion::AlreadyCached);
    }

    let status_path = self.sidecar_path(EntryState::Download, digest, STATUS_SUFFIX);
    let bytes = fs::read(&status_path)?;
    let complete = bytes
      .iter()
      .all(|&b| b == PieceStatus::Complete.as_byte());
    if !complete {
      return Err(StoreError::NotReady);
    }

    let dir = self.shard_dir(EntryState::Cache, digest);
    fs::create_dir_all(&dir)?;

    let from = self.data_path(EntryState::Download, digest);
    let to = self.data_path(EntryState::Cache, digest);
    let len = fs::metadata(&from)?.len();
    fs::rename(&from, &to)?;
    fs::rename(
      self.sidecar_path(EntryState::Download, digest, METAINFO_SUFFIX),
      self.sidecar_path(EntryState::Cache, digest, METAINFO_SUFFIX),
    )?;
    let _ = fs::remove_file(&status_path);
    let _ = fs::remove_file(self.sidecar_path(EntryState::Download, digest, STARTEDAT_SUFFIX));
    self.write_refcount(digest, 0)?;

    let mut index = self.index.lock().unwrap();
    index.lru.push(
      *digest,
      CacheMeta {
        len,
        last_access: SystemTime::now(),
      },
    );
    index.total_bytes += len;

    log::info!("Promoted {} to cache ({} bytes)", digest, len);
    Ok(Promotion::Promoted)
  }

  /// Removes a download entry and its sidecars. Idempotent.
  pub fn delete_download(&self, digest: &Digest) -> Result<()> {
    let latch = self.latch(digest);
    {
      let _entry = latch.lock().unwrap();
      self.remove_download_files(digest);
    }
    self.gc_latches();
    Ok(())
  }

  /// Removes a cache entry, refusing while its refcount is above zero.
  pub fn delete_cache(&self, digest: &Digest) -> Result<()> {
    let latch = self.latch(digest);
    {
      let _entry = latch.lock().unwrap();

      if !self.data_path(EntryState::Cache, digest).exists() {
        return Err(StoreError::NotFound);
      }
      if self.read_refcount(digest)? > 0 {
        return Err(StoreError::InUse);
      }

      fs::remove_file(self.data_path(EntryState::Cache, digest))?;
      let _ = fs::remove_file(self.sidecar_path(EntryState::Cache, digest, METAINFO_SUFFIX));
      let _ = fs::remove_file(self.sidecar_path(EntryState::Cache, digest, REFCOUNT_SUFFIX));

      let mut index = self.index.lock().unwrap();
      if let Some(meta) = index.lru.pop(digest) {
        index.total_bytes -= meta.len;
      }
    }
    self.gc_latches();
    log::info!("Deleted cache entry {}", digest);
    Ok(())
  }

  /// Increments the persisted refcount of a cache entry.
  pub fn inc_ref(&self, digest: &Digest) -> Result<u64> {
    let latch = self.latch(digest);
    let _entry = latch.lock().unwrap();

    if !self.data_path(EntryState::Cache, digest).exists() {
      return Err(StoreError::NotFound);
    }
    let count = self.read_refcount(digest)? + 1;
    self.write_refcount(digest, count)?;
    Ok(count)
  }

  /// Decrements the persisted refcount of a cache entry, saturating at
  /// zero.
  pub fn dec_ref(&self, digest: &Digest) -> Result<u64> {
    let latch = self.latch(digest);
    let _entry = latch.lock().unwrap();

    if !self.data_path(EntryState::Cache, digest).exists() {
      return Err(StoreError::NotFound);
    }
    let current = self.read_refcount(digest)?;
    if current == 0 {
      log::warn!("Refcount underflow for {}", digest);
      return Ok(0);
    }
    let count = current - 1;
    self.write_refcount(digest, count)?;
    Ok(count)
  }

  pub fn refcount(&self, digest: &Digest) -> Result<u64> {
    self.read_refcount(digest)
  }

  /// Streams the download file through SHA-256, producing the digest the
  /// assembled bytes actually hash to.
  pub fn hash_download(&self, digest: &Digest) -> Result<Digest> {
    let file = File::open(self.data_path(EntryState::Download, digest))?;
    hash_file(file)
  }

  /// One eviction pass: removes unreferenced cache entries idle past
  /// `ttl`, then evicts least-recently-used unreferenced entries while
  /// the cache exceeds `capacity` bytes. Returns the evicted digests.
  pub fn sweep(&self, capacity: u64, ttl: Duration) -> Vec<Digest> {
    let now = SystemTime::now();
    // snapshot under the lock, evict outside it (delete_cache re-locks)
    let (candidates, mut total) = {
      let index = self.index.lock().unwrap();
      let snapshot: Vec<(Digest, CacheMeta)> =
        index.lru.iter().map(|(d, m)| (*d, *m)).collect();
      (snapshot, index.total_bytes)
    };

    let mut evicted = Vec::new();
    // iter() yields most-recently-used first; evict from the tail
    for (digest, meta) in candidates.iter().rev() {
      let expired = meta
        .last_access
        .checked_add(ttl)
        .map(|deadline| deadline <= now)
        .unwrap_or(false);
      let over_capacity = total > capacity;
      if !expired && !over_capacity {
        continue;
      }
      match self.delete_cache(digest) {
        Ok(()) => {
          total = total.saturating_sub(meta.len);
          evicted.push(*digest);
        }
        Err(StoreError::InUse) => {}
        Err(StoreError::NotFound) => {}
        Err(e) => log::warn!("Evicting {} failed: {}", digest, e),
      }
    }
    if !evicted.is_empty() {
      log::info!("Evicted {} cache entries", evicted.len());
    }
    evicted
  }

  /// Total bytes currently held in the cache state.
  pub fn cache_bytes(&self) -> u64 {
    self.index.lock().unwrap().total_bytes
  }

  fn touch(&self, digest: &Digest) {
    let mut index = self.index.lock().unwrap();
    if let Some(meta) = index.lru.get_mut(digest) {
      meta.last_access = SystemTime::now();
    }
  }

  fn latch(&self, digest: &Digest) -> Arc<Mutex<()>> {
    let mut latches = self.latches.lock().unwrap();
    latches
      .entry(*digest)
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone()
  }

  fn gc_latches(&self) {
    let mut latches = self.latches.lock().unwrap();
    latches.retain(|_, latch| Arc::strong_count(latch) > 1);
  }

  fn shard_dir(&self, state: EntryState, digest: &Digest) -> PathBuf {
    let hex = digest.hex();
    self.root.join(state.dir()).join(&hex[0..2]).join(&hex[2..4])
  }

  fn data_path(&self, state: EntryState, digest: &Digest) -> PathBuf {
    self.shard_dir(state, digest).join(digest.hex())
  }

  fn sidecar_path(&self, state: EntryState, digest: &Digest, suffix: &str) -> PathBuf {
    self
      .shard_dir(state, digest)
      .join(format!("{}{}", digest.hex(), suffix))
  }

  fn remove_download_files(&self, digest: &Digest) {
    for suffix in ["", STATUS_SUFFIX, METAINFO_SUFFIX, STARTEDAT_SUFFIX] {
      let path = if suffix.is_empty() {
        self.data_path(EntryState::Download, digest)
      } else {
        self.sidecar_path(EntryState::Download, digest, suffix)
      };
      let _ = fs::remove_file(path);
    }
  }

  fn read_refcount(&self, digest: &Digest) -> Result<u64> {
    match fs::read(self.sidecar_path(EntryState::Cache, digest, REFCOUNT_SUFFIX)) {
      Ok(bytes) => decode_varint(&bytes)
        .ok_or_else(|| StoreError::CorruptSidecar("refcount varint".into())),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
      Err(e) => Err(e.into()),
    }
  }

  fn write_refcount(&self, digest: &Digest, count: u64) -> Result<()> {
    let mut buf = Vec::with_capacity(10);
    encode_varint(count, &mut buf);
    fs::write(self.sidecar_path(EntryState::Cache, digest, REFCOUNT_SUFFIX), buf)?;
    Ok(())
  }

  fn recover_downloads(&self) -> Result<()> {
    for path in walk_data_files(&self.root.join(EntryState::Download.dir()))? {
      let digest = match digest_of_path(&path) {
        Some(d) => d,
        None => continue,
      };

      let metainfo_path = self.sidecar_path(EntryState::Download, &digest, METAINFO_SUFFIX);
      let metainfo = fs::read(&metainfo_path)
        .ok()
        .and_then(|bytes| Metainfo::from_json(&bytes).ok());
      let metainfo = match metainfo {
        Some(m) => m,
        None => {
          log::warn!("Discarding download {} with no usable metainfo", digest);
          self.remove_download_files(&digest);
          continue;
        }
      };

      let status_path = self.sidecar_path(EntryState::Download, &digest, STATUS_SUFFIX);
      let bytes = fs::read(&status_path).unwrap_or_default();
      let recovered = match status::decode_file(&bytes, metainfo.piece_count()) {
        Some(statuses) => statuses
          .into_iter()
          .map(|s| s.recovered().as_byte())
          .collect(),
        None => {
          log::warn!("Rebuilding truncated status file for {}", digest);
          vec![PieceStatus::Empty.as_byte(); metainfo.piece_count()]
        }
      };
      fs::write(&status_path, recovered)?;
    }
    Ok(())
  }

  fn build_cache_index(&self) -> Result<()> {
    let mut entries = Vec::new();
    for path in walk_data_files(&self.root.join(EntryState::Cache.dir()))? {
      let digest = match digest_of_path(&path) {
        Some(d) => d,
        None => continue,
      };
      let meta = fs::metadata(&path)?;
      let last_access = meta.modified().unwrap_or_else(|_| SystemTime::now());
      entries.push((
        digest,
        CacheMeta {
          len: meta.len(),
          last_access,
        },
      ));
    }
    // oldest first, so the most recently touched entries end up most
    // recently used in the index
    entries.sort_by_key(|(_, meta)| meta.last_access);

    let mut index = self.index.lock().unwrap();
    for (digest, meta) in entries {
      index.total_bytes += meta.len;
      index.lru.push(digest, meta);
    }
    Ok(())
  }
}

/// Cheap-clone async facade over the store; every operation runs on the
/// blocking pool.
#[derive(Clone)]
pub struct StoreHandle {
  inner: Arc<CaStore>,
}

impl StoreHandle {
  pub fn new(store: CaStore) -> Self {
    StoreHandle {
      inner: Arc::new(store),
    }
  }

  pub fn store(&self) -> &Arc<CaStore> {
    &self.inner
  }

  async fn run<T, F>(&self, op: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&CaStore) -> Result<T> + Send + 'static,
  {
    let store = Arc::clone(&self.inner);
    task::spawn_blocking(move || op(&store))
      .await
      .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?
  }

  pub async fn state_of(&self, digest: Digest) -> Result<Option<EntryState>> {
    self.run(move |s| Ok(s.state_of(&digest))).await
  }

  pub async fn create_download(&self, metainfo: Arc<Metainfo>) -> Result<()> {
    self.run(move |s| s.create_download(&metainfo)).await
  }

  pub async fn read_metainfo(&self, digest: Digest) -> Result<Metainfo> {
    self.run(move |s| s.read_metainfo(&digest)).await
  }

  pub async fn write_piece_at(&self, digest: Digest, offset: u64, data: bytes::Bytes) -> Result<()> {
    self.run(move |s| s.write_piece_at(&digest, offset, &data)).await
  }

  pub async fn read_piece_at(&self, digest: Digest, offset: u64, len: usize) -> Result<Vec<u8>> {
    self.run(move |s| s.read_piece_at(&digest, offset, len)).await
  }

  pub async fn set_piece_status(
    &self,
    digest: Digest,
    index: PieceIndex,
    status: PieceStatus,
  ) -> Result<()> {
    self.run(move |s| s.set_piece_status(&digest, index, status)).await
  }

  pub async fn download_bitfield(&self, digest: Digest) -> Result<Bitfield> {
    self.run(move |s| s.download_bitfield(&digest)).await
  }

  pub async fn move_to_cache(&self, digest: Digest) -> Result<Promotion> {
    self.run(move |s| s.move_to_cache(&digest)).await
  }

  pub async fn delete_download(&self, digest: Digest) -> Result<()> {
    self.run(move |s| s.delete_download(&digest)).await
  }

  pub async fn delete_cache(&self, digest: Digest) -> Result<()> {
    self.run(move |s| s.delete_cache(&digest)).await
  }

  pub async fn inc_ref(&self, digest: Digest) -> Result<u64> {
    self.run(move |s| s.inc_ref(&digest)).await
  }

  pub async fn dec_ref(&self, digest: Digest) -> Result<u64> {
    self.run(move |s| s.dec_ref(&digest)).await
  }

  pub async fn hash_download(&self, digest: Digest) -> Result<Digest> {
    self.run(move |s| s.hash_download(&digest)).await
  }

  pub async fn sweep(&self, capacity: u64, ttl: Duration) -> Result<Vec<Digest>> {
    self.run(move |s| Ok(s.sweep(capacity, ttl))).await
  }
}

fn hash_file(mut file: File) -> Result<Digest> {
  let mut hasher = Sha256::new();
  let mut buf = vec![0; 1024 * 1024];
  loop {
    let n = file.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  let hash = hasher.finalize();
  let mut out = [0; 32];
  out.copy_from_slice(&hash);
  Ok(Digest::from_bytes(out))
}

fn index_error(e: io::Error, index: PieceIndex) -> StoreError {
  if e.kind() == io::ErrorKind::UnexpectedEof {
    StoreError::InvalidPieceIndex(index)
  } else {
    e.into()
  }
}

/// Yields the data files (no `_` suffix) of a two-level sharded state
/// directory.
fn walk_data_files(state_dir: &Path) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  if !state_dir.exists() {
    return Ok(files);
  }
  for shard1 in fs::read_dir(state_dir)? {
    let shard1 = shard1?.path();
    if !shard1.is_dir() {
      continue;
    }
    for shard2 in fs::read_dir(&shard1)? {
      let shard2 = shard2?.path();
      if !shard2.is_dir() {
        continue;
      }
      for entry in fs::read_dir(&shard2)? {
        let path = entry?.path();
        let is_sidecar = path
          .file_name()
          .and_then(|n| n.to_str())
          .map(|n| n.contains('_'))
          .unwrap_or(true);
        if path.is_file() && !is_sidecar {
          files.push(path);
        }
      }
    }
  }
  Ok(files)
}

fn digest_of_path(path: &Path) -> Option<Digest> {
  path.file_name()?.to_str()?.parse().ok()
}

fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
  loop {
    let byte = (value & 0x7f) as u8;
    value >>= 7;
    if value != 0 {
      buf.push(byte | 0x80);
    } else {
      buf.push(byte);
      break;
    }
  }
}

fn decode_varint(bytes: &[u8]) -> Option<u64> {
  let mut value: u64 = 0;
  let mut shift = 0u32;
  for &byte in bytes {
    value |= u64::from(byte & 0x7f) << shift;
    if byte & 0x80 == 0 {
      return Some(value);
    }
    shift += 7;
    if shift > 63 {
      return None;
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  use sha1::{Digest as _, Sha1};
  use tempfile::TempDir;

  /// A blob split into 4-byte pieces so multi-piece paths are cheap to
  /// exercise.
  fn small_metainfo(blob: &[u8], piece_len: u64) -> (Digest, Metainfo) {
    let digest = Digest::of(blob);
    let mut pieces = Vec::new();
    for chunk in blob.chunks(piece_len as usize) {
      pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    let metainfo = Metainfo::new(digest, blob.len() as u64, piece_len, pieces).unwrap();
    (digest, metainfo)
  }

  fn write_all_pieces(store: &CaStore, digest: &Digest, metainfo: &Metainfo, blob: &[u8]) {
    for index in 0..metainfo.piece_count() {
      let offset = metainfo.piece_offset(index);
      let len = metainfo.piece_len_at(index) as usize;
      let piece = &blob[offset as usize..offset as usize + len];
      store.write_piece_at(digest, offset, piece).unwrap();
      store
        .set_piece_status(digest, index, PieceStatus::Complete)
        .unwrap();
    }
  }

  #[test]
  fn test_download_write_promote_read() {
    let dir = TempDir::new().unwrap();
    let store = CaStore::open(dir.path()).unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);

    store.create_download(&metainfo).unwrap();
    assert_eq!(store.state_of(&digest), Some(EntryState::Download));
    // a second create is refused regardless of state
    assert!(matches!(
      store.create_download(&metainfo),
      Err(StoreError::AlreadyExists)
    ));

    write_all_pieces(&store, &digest, &metainfo, &blob);
    assert_eq!(store.hash_download(&digest).unwrap(), digest);

    assert_eq!(store.move_to_cache(&digest).unwrap(), Promotion::Promoted);
    assert_eq!(store.state_of(&digest), Some(EntryState::Cache));
    assert_eq!(store.read_blob(&digest).unwrap(), blob);
    assert_eq!(store.read_piece_at(&digest, 4, 4).unwrap(), b"4567");
    // metainfo sidecar moved with the entry
    assert_eq!(store.read_metainfo(&digest).unwrap(), metainfo);
    // promotion is idempotent
    assert_eq!(
      store.move_to_cache(&digest).unwrap(),
      Promotion::AlreadyCached
    );
  }

  #[test]
  fn test_promotion_requires_all_pieces() {
    let dir = TempDir::new().unwrap();
    let store = CaStore::open(dir.path()).unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);

    store.create_download(&metainfo).unwrap();
    store.write_piece_at(&digest, 0, &blob[..4]).unwrap();
    store
      .set_piece_status(&digest, 0, PieceStatus::Complete)
      .unwrap();

    assert!(matches!(
      store.move_to_cache(&digest),
      Err(StoreError::NotReady)
    ));
  }

  #[test]
  fn test_piece_status_round_trip_and_bounds() {
    let dir = TempDir::new().unwrap();
    let store = CaStore::open(dir.path()).unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);
    store.create_download(&metainfo).unwrap();

    assert_eq!(
      store.get_piece_status(&digest, 1).unwrap(),
      PieceStatus::Empty
    );
    store
      .set_piece_status(&digest, 1, PieceStatus::Pending)
      .unwrap();
    assert_eq!(
      store.get_piece_status(&digest, 1).unwrap(),
      PieceStatus::Pending
    );
    assert!(matches!(
      store.set_piece_status(&digest, 3, PieceStatus::Complete),
      Err(StoreError::InvalidPieceIndex(3))
    ));
    assert!(matches!(
      store.get_piece_status(&digest, 3),
      Err(StoreError::InvalidPieceIndex(3))
    ));
  }

  #[test]
  fn test_refcount_guards_delete() {
    let dir = TempDir::new().unwrap();
    let store = CaStore::open(dir.path()).unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);
    store.create_download(&metainfo).unwrap();
    write_all_pieces(&store, &digest, &metainfo, &blob);
    store.move_to_cache(&digest).unwrap();

    assert_eq!(store.inc_ref(&digest).unwrap(), 1);
    assert_eq!(store.inc_ref(&digest).unwrap(), 2);
    assert!(matches!(store.delete_cache(&digest), Err(StoreError::InUse)));
    assert_eq!(store.dec_ref(&digest).unwrap(), 1);
    assert_eq!(store.dec_ref(&digest).unwrap(), 0);
    // underflow saturates rather than wrapping
    assert_eq!(store.dec_ref(&digest).unwrap(), 0);

    store.delete_cache(&digest).unwrap();
    assert_eq!(store.state_of(&digest), None);
    assert!(matches!(
      store.delete_cache(&digest),
      Err(StoreError::NotFound)
    ));
  }

  #[test]
  fn test_recovery_downgrades_and_discards() {
    let dir = TempDir::new().unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);

    {
      let store = CaStore::open(dir.path()).unwrap();
      store.create_download(&metainfo).unwrap();
      store.write_piece_at(&digest, 0, &blob[..4]).unwrap();
      store
        .set_piece_status(&digest, 0, PieceStatus::Complete)
        .unwrap();
      store
        .set_piece_status(&digest, 1, PieceStatus::Pending)
        .unwrap();
      store
        .set_piece_status(&digest, 2, PieceStatus::Dirty)
        .unwrap();
    }

    // reopen: pending and dirty downgrade to empty, complete survives
    let store = CaStore::open(dir.path()).unwrap();
    assert_eq!(
      store.get_piece_status(&digest, 0).unwrap(),
      PieceStatus::Complete
    );
    assert_eq!(
      store.get_piece_status(&digest, 1).unwrap(),
      PieceStatus::Empty
    );
    assert_eq!(
      store.get_piece_status(&digest, 2).unwrap(),
      PieceStatus::Empty
    );
  }

  #[test]
  fn test_recovery_rebuilds_truncated_status() {
    let dir = TempDir::new().unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);

    let status_path = {
      let store = CaStore::open(dir.path()).unwrap();
      store.create_download(&metainfo).unwrap();
      write_all_pieces(&store, &digest, &metainfo, &blob);
      store.sidecar_path(EntryState::Download, &digest, STATUS_SUFFIX)
    };
    // truncate the status sidecar behind the store's back
    fs::write(&status_path, [PieceStatus::Complete.as_byte()]).unwrap();

    let store = CaStore::open(dir.path()).unwrap();
    for index in 0..metainfo.piece_count() {
      assert_eq!(
        store.get_piece_status(&digest, index).unwrap(),
        PieceStatus::Empty
      );
    }
  }

  #[test]
  fn test_recovery_discards_entry_without_metainfo() {
    let dir = TempDir::new().unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);

    let metainfo_path = {
      let store = CaStore::open(dir.path()).unwrap();
      store.create_download(&metainfo).unwrap();
      store.sidecar_path(EntryState::Download, &digest, METAINFO_SUFFIX)
    };
    fs::remove_file(metainfo_path).unwrap();

    let store = CaStore::open(dir.path()).unwrap();
    assert_eq!(store.state_of(&digest), None);
  }

  #[test]
  fn test_sweep_respects_ttl_refcount_and_capacity() {
    let dir = TempDir::new().unwrap();
    let store = CaStore::open(dir.path()).unwrap();

    let mut digests = Vec::new();
    for i in 0u8..3 {
      let blob = vec![i; 10];
      let (digest, metainfo) = small_metainfo(&blob, 4);
      store.create_download(&metainfo).unwrap();
      write_all_pieces(&store, &digest, &metainfo, &blob);
      store.move_to_cache(&digest).unwrap();
      digests.push(digest);
    }
    assert_eq!(store.cache_bytes(), 30);

    // everything is fresh and within capacity: nothing to do
    assert!(store.sweep(100, Duration::from_secs(3600)).is_empty());

    // pin one entry, then force eviction by capacity; the pinned entry
    // survives even though it is LRU-eligible
    store.inc_ref(&digests[0]).unwrap();
    let evicted = store.sweep(10, Duration::from_secs(3600));
    assert!(!evicted.contains(&digests[0]));
    assert!(store.cache_bytes() <= 10 + 10);
    assert_eq!(store.state_of(&digests[0]), Some(EntryState::Cache));

    // zero TTL expires everything unreferenced
    let evicted = store.sweep(u64::MAX, Duration::ZERO);
    for digest in &evicted {
      assert_eq!(store.state_of(digest), None);
    }
    assert_eq!(store.state_of(&digests[0]), Some(EntryState::Cache));
  }

  #[test]
  fn test_varint_round_trip() {
    for value in [0u64, 1, 127, 128, 300, u64::MAX] {
      let mut buf = Vec::new();
      encode_varint(value, &mut buf);
      assert_eq!(decode_varint(&buf), Some(value));
    }
    assert_eq!(decode_varint(&[]), None);
    assert_eq!(decode_varint(&[0x80]), None);
  }

  #[test]
  fn test_write_to_removed_entry_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = CaStore::open(dir.path()).unwrap();
    let blob = b"0123456789".to_vec();
    let (digest, metainfo) = small_metainfo(&blob, 4);
    store.create_download(&metainfo).unwrap();
    store.delete_download(&digest).unwrap();

    // a write that raced with removal is discarded, not fatal
    assert!(matches!(
      store.write_piece_at(&digest, 0, b"0123"),
      Err(StoreError::NotFound)
    ));
  }
}
