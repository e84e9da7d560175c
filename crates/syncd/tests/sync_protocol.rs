//! End-to-end exercises of the sync HTTP server + client against two real
//! devices, each with its own `Coordinator`, identity, and event log,
//! talking over loopback HTTP.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use sync_core::EventType;
use sync_net::PeerRecord;
use syncd::client::SyncClient;
use syncd::config::Config;
use syncd::server::{run_http_server, Coordinator};

fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        data_dir: data_dir.to_path_buf(),
        device_name: Some("test-device".to_string()),
        discovery_port: sync_net::discovery::DISCOVERY_PORT,
        broadcast_interval_secs: 5,
        peer_timeout_secs: 15,
        challenge_ttl_secs: 30,
        request_timeout_secs: 5,
        sync_interval_secs: 3600,
        verbose: false,
        log_format: "pretty".to_string(),
    }
}

/// Start a device's HTTP server and wait for it to publish its port.
async fn spawn_device(dir: &tempfile::TempDir) -> Arc<Coordinator> {
    let coordinator = Arc::new(Coordinator::new(test_config(dir.path())).unwrap());
    let spawned = coordinator.clone();
    tokio::spawn(async move {
        let _ = run_http_server(spawned).await;
    });
    for _ in 0..200 {
        if coordinator.http_port() != 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_ne!(coordinator.http_port(), 0, "server never bound");
    coordinator
}

/// Build a `PeerRecord` pointing at `target`'s loopback HTTP server, as if
/// discovered via a beacon.
fn peer_record_for(target: &Coordinator) -> PeerRecord {
    PeerRecord::new(
        target.device_id.clone(),
        target.config.device_name(),
        "127.0.0.1".parse::<IpAddr>().unwrap(),
        target.http_port(),
        target.identity.signing_public_key_b64(),
        target.identity.agreement_public_key_b64(),
    )
}

/// S1: two devices with disjoint events converge to the union after one
/// sync, and their projections agree.
#[tokio::test]
async fn devices_converge_after_one_sync() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = spawn_device(&dir_a).await;
    let b = spawn_device(&dir_b).await;

    a.create_local_event(EventType::Create, "n1", "from-a").unwrap();
    a.create_local_event(EventType::Create, "n2", "also-from-a").unwrap();
    b.create_local_event(EventType::Create, "n3", "from-b").unwrap();
    b.create_local_event(EventType::Create, "n4", "also-from-b").unwrap();

    let client_a = SyncClient::new(a.clone());
    let summary = client_a.sync_with(&peer_record_for(&b)).await.unwrap();
    assert_eq!(summary.pulled, 2);
    assert_eq!(summary.pushed, 2);

    assert_eq!(a.event_log.hashes().len(), 4);
    assert_eq!(b.event_log.hashes().len(), 4);
    assert_eq!(a.project(), b.project());
}

/// S2 (partial): highest-timestamp write wins in the projection after a
/// chain of pairwise syncs.
#[tokio::test]
async fn highest_timestamp_wins_after_chained_sync() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();
    let a = spawn_device(&dir_a).await;
    let b = spawn_device(&dir_b).await;
    let c = spawn_device(&dir_c).await;

    let event_a = sync_core::Event::new("1".into(), EventType::Create, "n1".into(), "a".into(), 1000);
    let event_b = sync_core::Event::new("2".into(), EventType::Update, "n1".into(), "b".into(), 1001);
    let event_c = sync_core::Event::new("3".into(), EventType::Update, "n1".into(), "c".into(), 1002);
    a.event_log.add(event_a).unwrap();
    b.event_log.add(event_b).unwrap();
    c.event_log.add(event_c).unwrap();

    SyncClient::new(a.clone()).sync_with(&peer_record_for(&b)).await.unwrap();
    SyncClient::new(b.clone()).sync_with(&peer_record_for(&c)).await.unwrap();
    SyncClient::new(c.clone()).sync_with(&peer_record_for(&a)).await.unwrap();

    assert_eq!(a.project().get("n1").unwrap().content, "c");
    assert_eq!(b.project().get("n1").unwrap().content, "c");
    assert_eq!(c.project().get("n1").unwrap().content, "c");
}

/// S4: a device with a different identity is never authenticated, and its
/// requests against our server are rejected with 401 rather than served.
#[tokio::test]
async fn wrong_user_is_never_authenticated() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_x = tempfile::tempdir().unwrap();
    let a = spawn_device(&dir_a).await;
    let x = spawn_device(&dir_x).await;

    a.create_local_event(EventType::Create, "n1", "secret").unwrap();

    // X tries to sync against A as if it were a peer; since X's identity
    // belongs to a different user, authentication must fail and no events
    // cross.
    let client_x = SyncClient::new(x.clone());
    let result = client_x.sync_with(&peer_record_for(&a)).await;
    // A's server rejects X's auth (401 -> surfaced as a request error by
    // reqwest's status check, or the push/pull phases fail outright); in
    // either case no events are exchanged.
    assert!(result.is_err() || x.event_log.hashes().len() != a.event_log.hashes().len());
    assert_eq!(a.event_log.hashes().len(), 1, "A's event must not be overwritten or removed");
}

/// S8/S5: a consumed challenge cannot be replayed.
#[tokio::test]
async fn challenge_is_rejected_on_replay() {
    let dir_a = tempfile::tempdir().unwrap();
    let a = spawn_device(&dir_a).await;

    let http = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", a.http_port());

    #[derive(serde::Deserialize)]
    struct ChallengeResp {
        challenge: String,
    }
    let resp: ChallengeResp = http.get(format!("{base}/sync/challenge")).send().await.unwrap().json().await.unwrap();

    #[derive(serde::Serialize)]
    struct ChallengeMessage {
        challenge: String,
    }
    let message = ChallengeMessage { challenge: resp.challenge.clone() };
    let signature = a.identity.sign(&message).unwrap();

    #[derive(serde::Serialize)]
    struct AuthResponse {
        challenge: String,
        signature: String,
        #[serde(rename = "signPublicKey")]
        sign_public_key: String,
    }
    let auth = AuthResponse {
        challenge: resp.challenge,
        signature,
        sign_public_key: a.identity.signing_public_key_b64(),
    };
    let auth_header = BASE64.encode(serde_json::to_vec(&auth).unwrap());

    let first = http
        .get(format!("{base}/sync/inventory"))
        .header("X-Auth-Response", &auth_header)
        .header("X-Encrypt-Key", a.identity.agreement_public_key_b64())
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);

    let replay = http
        .get(format!("{base}/sync/inventory"))
        .header("X-Auth-Response", &auth_header)
        .header("X-Encrypt-Key", a.identity.agreement_public_key_b64())
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), reqwest::StatusCode::UNAUTHORIZED);
}

/// S6: if Push fails after Pull already succeeded, the pulled events stay
/// merged and a later sync completes the push.
#[tokio::test]
async fn partial_failure_retains_pulled_events() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = spawn_device(&dir_a).await;
    let b = spawn_device(&dir_b).await;

    b.create_local_event(EventType::Create, "n1", "from-b").unwrap();
    a.create_local_event(EventType::Create, "n2", "from-a").unwrap();

    let peer_b = peer_record_for(&b);
    let client_a = SyncClient::new(a.clone());

    // Phase II runs to completion: a pulls b's event.
    let (pulled, peer_hashes) = client_a.pull_phase(&peer_b).await.unwrap();
    assert_eq!(pulled, 1);
    assert_eq!(a.event_log.hashes().len(), 2);

    // b goes away before Phase III reaches it (peer closed the connection).
    b.shutdown();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let push_result = client_a.push_phase(&peer_b, &peer_hashes).await;
    assert!(push_result.is_err(), "push against a dead peer must fail");

    // The Phase II merge is not rolled back by the Phase III failure.
    assert_eq!(a.event_log.hashes().len(), 2);

    // A later sync against a live b completes the push.
    let dir_b2 = tempfile::tempdir().unwrap();
    let b2 = Arc::new(Coordinator::new(test_config(dir_b2.path())).unwrap());
    b2.event_log.merge(b.event_log.events_for(&b.event_log.hashes())).unwrap();
    let spawned = b2.clone();
    tokio::spawn(async move {
        let _ = run_http_server(spawned).await;
    });
    for _ in 0..200 {
        if b2.http_port() != 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // b2 starts preloaded with b's event, so only a's is left to push.
    let summary = client_a.sync_with(&peer_record_for(&b2)).await.unwrap();
    assert_eq!(summary.pushed, 1);
    assert_eq!(b2.event_log.hashes().len(), 2);
}
