//! Integration-level tests against the public path manager / data-bus API,
//! independent of the RTMP wire protocol, covering the observable scenarios
//! a publisher/reader pair must satisfy.

use rtmp_conn_engine::auth::{Action, AuthRequest};
use rtmp_conn_engine::data::Data;
use rtmp_conn_engine::path::{PathDefaults, PathManager};
use rtmp_conn_engine::rtmp::framer::{AudioTrack, TrackList, VideoTrack};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn req(path_name: &str, action: Action) -> AuthRequest {
    req_from(path_name, action, Ipv4Addr::new(127, 0, 0, 1))
}

fn req_from(path_name: &str, action: Action, ip: Ipv4Addr) -> AuthRequest {
    AuthRequest {
        path_name: path_name.to_string(),
        action,
        remote_ip: IpAddr::V4(ip),
        query_user: String::new(),
        query_pass: String::new(),
        raw_query: String::new(),
    }
}

fn sample_tracks() -> TrackList {
    TrackList {
        video: Some(VideoTrack { sps: bytes::Bytes::from_static(&[0x67, 0x42]), pps: bytes::Bytes::from_static(&[0x68, 0xce]) }),
        audio: Some(AudioTrack { clock_rate: 44100 }),
    }
}

/// Scenario: a publisher announces, records tracks, and a reader that
/// arrives afterward can subscribe and sees everything the publisher sends.
#[tokio::test]
async fn happy_publish_then_read() {
    let manager = PathManager::new(HashMap::new());

    let path = manager.on_publisher_announce("pub-1", &req("live/cam1", Action::Publish)).await.unwrap();
    manager.on_publisher_record(&path, sample_tracks()).await.unwrap();

    let (read_path, mut rx) = manager.on_reader_setup_play(&req("live/cam1", Action::Read)).await.unwrap();
    assert!(read_path.tracks().await.is_some());

    path.publish(Data::Video { track_id: 0, rtp: bytes::Bytes::from_static(&[1, 2, 3]), last_fragment: true, nalus: Some(vec![]), pts: Some(Duration::from_millis(1000)) });

    let item = rx.recv().await.unwrap();
    assert_eq!(item.track_id(), 0);
}

/// Scenario: a reader arriving before any publisher is rejected and no
/// subscription is created.
#[tokio::test]
async fn reader_before_publisher_fails_cleanly() {
    let manager = PathManager::new(HashMap::new());
    let err = manager.on_reader_setup_play(&req("live/cam2", Action::Read)).await.unwrap_err();
    assert!(matches!(err, rtmp_conn_engine::ConnError::Setup(_)));
}

/// Scenario: publisher disconnect frees the path for a new publisher and
/// clears the stale track list so a late reader doesn't see ghost tracks.
#[tokio::test]
async fn publisher_disconnect_frees_path_and_clears_tracks() {
    let manager = PathManager::new(HashMap::new());
    let path = manager.on_publisher_announce("pub-1", &req("live/cam3", Action::Publish)).await.unwrap();
    manager.on_publisher_record(&path, sample_tracks()).await.unwrap();

    manager.on_publisher_remove(&path, "pub-1").await;
    assert!(path.tracks().await.is_none());

    // A new publisher can now claim the same path.
    let path2 = manager.on_publisher_announce("pub-2", &req("live/cam3", Action::Publish)).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&path, &path2));
}

/// Scenario: a second concurrent publisher on the same path is rejected,
/// and the rejection does not disturb the first publisher's track state.
#[tokio::test]
async fn second_publisher_rejected_first_unaffected() {
    let manager = PathManager::new(HashMap::new());
    let path = manager.on_publisher_announce("pub-1", &req("live/cam4", Action::Publish)).await.unwrap();
    manager.on_publisher_record(&path, sample_tracks()).await.unwrap();

    let err = manager.on_publisher_announce("pub-2", &req("live/cam4", Action::Publish)).await.unwrap_err();
    assert!(matches!(err, rtmp_conn_engine::ConnError::Setup(_)));
    assert!(path.tracks().await.is_some());
}

/// Scenario: per-path allow-list configuration rejects a reader whose
/// remote address falls outside the configured CIDR, before any stream
/// subscription is created.
#[tokio::test]
async fn path_level_ip_allow_list_blocks_reader() {
    let mut defaults = HashMap::new();
    defaults.insert(
        "live/restricted".to_string(),
        PathDefaults {
            auth: rtmp_conn_engine::auth::PathAuthConfig {
                allowed_ips: vec!["10.0.0.0/8".parse().unwrap()],
                ..Default::default()
            },
            run_on_read: None,
        },
    );
    let manager = PathManager::new(defaults);

    let inside = req_from("live/restricted", Action::Publish, Ipv4Addr::new(10, 1, 2, 3));
    let path = manager.on_publisher_announce("pub-1", &inside).await.unwrap();
    manager.on_publisher_record(&path, sample_tracks()).await.unwrap();

    let outside = req_from("live/restricted", Action::Read, Ipv4Addr::new(127, 0, 0, 1));
    let err = manager.on_reader_setup_play(&outside).await.unwrap_err();
    assert!(matches!(err, rtmp_conn_engine::ConnError::AuthCritical(_)));
}

/// The mandatory anti-brute-force delay is a fixed, known constant that
/// every caller sleeping on `AuthCritical` relies on.
#[test]
fn critical_auth_delay_is_at_least_two_seconds() {
    assert!(rtmp_conn_engine::auth::CRITICAL_AUTH_DELAY >= Duration::from_secs(2));
}
