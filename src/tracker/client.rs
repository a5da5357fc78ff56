use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use reqwest::Client;
use url::Url;

use super::{AnnounceRequest, AnnounceResponse};
use crate::error::tracker::{Result, TrackerError};

/// How many tracker hosts one announce attempt walks through before
/// giving up.
const HOSTS_PER_ANNOUNCE: usize = 3;

/// How long a host stays marked failed after a network error or 5xx.
const HOST_FAILURE_TTL: Duration = Duration::from_secs(30);

/// The HTTP announce client.
///
/// Cheap to clone; clones share the host health list, so a failure
/// observed by one torrent's announce steers every other torrent away
/// from the same host.
#[derive(Clone)]
pub struct AnnounceClient {
  http: Client,
  hosts: Vec<Url>,
  /// Host → time of last failure. Read as a snapshot per announce.
  health: Arc<Mutex<HashMap<String, Instant>>>,
}

impl AnnounceClient {
  pub fn new(hosts: Vec<Url>) -> Self {
    AnnounceClient {
      http: Client::new(),
      hosts,
      health: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Announces to up to [`HOSTS_PER_ANNOUNCE`] sampled healthy hosts in
  /// turn, marking hosts failed on network errors and 5xx responses.
  ///
  /// A 404 means the tracker does not know the infohash; the caller
  /// retries after its announce interval.
  pub async fn announce(&self, req: &AnnounceRequest) -> Result<AnnounceResponse> {
    let candidates = self.sample_hosts();
    if candidates.is_empty() {
      return Err(TrackerError::AllHostsFailed);
    }

    for host in candidates {
      let url = format!(
        "{}/announce/{}",
        host.as_str().trim_end_matches('/'),
        req.info_hash
      );
      log::trace!("Announcing {} to {}", req.info_hash, url);

      let resp = match self.http.post(&url).json(req).send().await {
        Ok(resp) => resp,
        Err(e) => {
          log::warn!("Tracker {} unreachable: {}", host, e);
          self.mark_failed(&host);
          continue;
        }
      };

      let status = resp.status();
      if status.is_success() {
        return Ok(resp.json().await?);
      }
      if status.as_u16() == 404 {
        return Err(TrackerError::NotFound);
      }
      if status.is_server_error() {
        log::warn!("Tracker {} returned {}", host, status);
        self.mark_failed(&host);
        continue;
      }
      return Err(TrackerError::Rejected(status.as_u16()));
    }

    Err(TrackerError::AllHostsFailed)
  }

  /// Samples up to [`HOSTS_PER_ANNOUNCE`] hosts, healthy ones first. If
  /// every host is marked failed, all are sampled anyway: a dead mark
  /// must never wedge announcing entirely.
  fn sample_hosts(&self) -> Vec<Url> {
    let now = Instant::now();
    let failed: HashMap<String, Instant> = self.health.lock().unwrap().clone();

    let mut healthy: Vec<Url> = self
      .hosts
      .iter()
      .filter(|host| {
        failed
          .get(host.as_str())
          .map(|at| now.duration_since(*at) >= HOST_FAILURE_TTL)
          .unwrap_or(true)
      })
      .cloned()
      .collect();

    if healthy.is_empty() {
      healthy = self.hosts.clone();
    }
    healthy.shuffle(&mut rand::thread_rng());
    healthy.truncate(HOSTS_PER_ANNOUNCE);
    healthy
  }

  fn mark_failed(&self, host: &Url) {
    self
      .health
      .lock()
      .unwrap()
      .insert(host.as_str().to_string(), Instant::now());
  }
}
