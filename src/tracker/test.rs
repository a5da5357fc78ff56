/// test the tracker module contract.
#[cfg(test)]
mod tests {
  use std::net::{IpAddr, Ipv4Addr};
  use std::time::Duration;

  use serde_json::json;
  use url::Url;

  use crate::error::tracker::TrackerError;
  use crate::tracker::{
    AnnounceClient, AnnouncePeer, AnnounceRequest, AnnounceResponse, PeerContext,
  };
  use crate::{Digest, InfoHash, PeerId};

  fn make_request() -> AnnounceRequest {
    AnnounceRequest {
      digest: Digest::of(b"layer bytes"),
      info_hash: InfoHash::from_bytes(*b"abcdefghij1234567890"),
      peer: AnnouncePeer {
        context: PeerContext {
          peer_id: PeerId::from_bytes(*b"bswm-2023-0000000001"),
          ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
          port: 7777,
          zone: "sjc1".into(),
          cluster: "prod".into(),
          origin: false,
        },
        complete: false,
      },
    }
  }

  #[test]
  fn test_request_wire_shape() {
    let req = make_request();
    let value = serde_json::to_value(&req).unwrap();
    assert_eq!(
      value,
      json!({
        "digest": req.digest.hex(),
        "info_hash": req.info_hash.hex(),
        "peer": {
          "peer_id": req.peer.context.peer_id.hex(),
          "ip": "127.0.0.1",
          "port": 7777,
          "zone": "sjc1",
          "cluster": "prod",
          "origin": false,
          "complete": false,
        },
      })
    );
  }

  #[test]
  fn test_response_parse_with_defaults() {
    // complete and priority are optional in the response
    let doc = json!({
      "peers": [
        {"peer_id": "00".repeat(20), "ip": "10.0.0.1", "port": 9000},
        {"peer_id": "11".repeat(20), "ip": "10.0.0.2", "port": 9001,
         "complete": true, "priority": 2},
      ],
      "interval": 15,
    });
    let resp: AnnounceResponse = serde_json::from_value(doc).unwrap();
    assert_eq!(resp.interval, Duration::from_secs(15));
    assert_eq!(resp.peers.len(), 2);
    assert!(!resp.peers[0].complete);
    assert_eq!(resp.peers[0].priority, 0);
    assert!(resp.peers[1].complete);
    assert_eq!(resp.peers[1].priority, 2);
    assert_eq!(resp.peers[1].addr().to_string(), "10.0.0.2:9001");
  }

  #[tokio::test]
  async fn test_announce_returns_peers() {
    let mut server = mockito::Server::new_async().await;
    let req = make_request();

    let body = json!({
      "peers": [
        {"peer_id": "22".repeat(20), "ip": "10.1.2.3", "port": 8888,
         "complete": true, "priority": 0},
      ],
      "interval": 30,
    });
    let mock = server
      .mock("POST", format!("/announce/{}", req.info_hash).as_str())
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(body.to_string())
      .create_async()
      .await;

    let client = AnnounceClient::new(vec![Url::parse(&server.url()).unwrap()]);
    let resp = client.announce(&req).await.unwrap();

    mock.assert_async().await;
    assert_eq!(resp.interval, Duration::from_secs(30));
    assert_eq!(resp.peers.len(), 1);
    assert!(resp.peers[0].complete);
    assert_eq!(resp.peers[0].addr().to_string(), "10.1.2.3:8888");
  }

  #[tokio::test]
  async fn test_announce_not_found() {
    let mut server = mockito::Server::new_async().await;
    let req = make_request();

    let _mock = server
      .mock("POST", format!("/announce/{}", req.info_hash).as_str())
      .with_status(404)
      .create_async()
      .await;

    let client = AnnounceClient::new(vec![Url::parse(&server.url()).unwrap()]);
    assert!(matches!(
      client.announce(&req).await,
      Err(TrackerError::NotFound)
    ));
  }

  #[tokio::test]
  async fn test_announce_fails_over_to_next_host() {
    let mut server = mockito::Server::new_async().await;
    let req = make_request();

    let body = json!({"peers": [], "interval": 10});
    let _mock = server
      .mock("POST", format!("/announce/{}", req.info_hash).as_str())
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(body.to_string())
      .create_async()
      .await;

    // nothing listens on the first host; the network error marks it
    // failed and the announce proceeds to the live one
    let dead = Url::parse("http://127.0.0.1:9").unwrap();
    let live = Url::parse(&server.url()).unwrap();
    let client = AnnounceClient::new(vec![dead, live]);

    let resp = client.announce(&req).await.unwrap();
    assert_eq!(resp.interval, Duration::from_secs(10));
  }

  #[tokio::test]
  async fn test_announce_server_error_exhausts_hosts() {
    let mut server = mockito::Server::new_async().await;
    let req = make_request();

    let _mock = server
      .mock("POST", format!("/announce/{}", req.info_hash).as_str())
      .with_status(503)
      .create_async()
      .await;

    let client = AnnounceClient::new(vec![Url::parse(&server.url()).unwrap()]);
    assert!(matches!(
      client.announce(&req).await,
      Err(TrackerError::AllHostsFailed)
    ));
  }
}
