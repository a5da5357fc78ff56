//! Client for the origin cluster's metainfo endpoint.
//!
//! Only metainfo is fetched over HTTP. Blob bytes always travel over the
//! peer protocol: origin hosts take part in swarms as complete peers and
//! are handed out by the tracker like any other peer.

use reqwest::Client;
use url::Url;

use crate::error::metainfo::{MetainfoError, Result};
use crate::metainfo::Metainfo;
use crate::Digest;

#[derive(Clone)]
pub struct OriginClient {
  http: Client,
  hosts: Vec<Url>,
}

impl OriginClient {
  pub fn new(hosts: Vec<Url>) -> Self {
    OriginClient {
      http: Client::new(),
      hosts,
    }
  }

  /// Fetches the metainfo of a blob, walking the configured hosts in
  /// order. A 404 from any host is authoritative: the namespace does not
  /// hold the digest.
  pub async fn fetch_metainfo(&self, namespace: &str, digest: &Digest) -> Result<Metainfo> {
    let mut last_err = MetainfoError::NotFound;

    for host in &self.hosts {
      let url = format!(
        "{}/namespace/{}/blobs/{}/metainfo",
        host.as_str().trim_end_matches('/'),
        namespace,
        digest
      );
      log::trace!("Fetching metainfo for {} from {}", digest, url);

      let resp = match self.http.get(&url).send().await {
        Ok(resp) => resp,
        Err(e) => {
          log::warn!("Origin {} unreachable: {}", host, e);
          last_err = e.into();
          continue;
        }
      };

      let status = resp.status();
      if status.as_u16() == 404 {
        return Err(MetainfoError::NotFound);
      }
      if !status.is_success() {
        log::warn!("Origin {} returned {} for {}", host, status, digest);
        if let Err(e) = resp.error_for_status() {
          last_err = e.into();
        }
        continue;
      }

      let body = resp.bytes().await?;
      let metainfo = Metainfo::from_json(&body)?;
      if metainfo.digest() != *digest {
        log::warn!("Origin {} served metainfo for the wrong digest", host);
        last_err = MetainfoError::InvalidPieces;
        continue;
      }
      return Ok(metainfo);
    }

    Err(last_err)
  }
}
