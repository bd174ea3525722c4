use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::*;
use crate::CreateMode;
use crate::Session;
use crate::SessionError;
use crate::SessionFactory;
use crate::SessionState;
use crate::WatchEventKind;

const TIMEOUT: Duration = Duration::from_millis(100);

async fn connected(ensemble: &MemEnsemble) -> Arc<dyn Session> {
    let session = ensemble.factory().create("zk1:2181", None);
    session.connect(TIMEOUT).await.unwrap();
    session
}

#[tokio::test]
async fn test_connect_to_live_server() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = connected(&ensemble).await;

    assert!(session.has_handle());
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(ensemble.live_sessions(), vec![session.id()]);
    assert_eq!(ensemble.connect_attempts(), vec!["zk1:2181".to_string()]);
}

#[tokio::test]
async fn test_connect_with_invalid_server_obtains_no_handle() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = ensemble.factory().create("zk1:2181,unknown:2181", None);

    match session.connect(TIMEOUT).await {
        Err(SessionError::ConnectionError { handle_obtained, .. }) => assert!(!handle_obtained),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!session.has_handle());
    assert_eq!(session.id(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_down_servers_times_out() {
    let ensemble = MemEnsemble::new(["zk1:2181", "zk2:2181"]);
    ensemble.set_server_status("zk1:2181", ServerStatus::Down);
    ensemble.set_server_status("zk2:2181", ServerStatus::Down);

    let session = ensemble.factory().create("zk1:2181,zk2:2181", None);
    assert!(matches!(
        session.connect(TIMEOUT).await,
        Err(SessionError::ConnectTimeout)
    ));
    assert!(ensemble.live_sessions().is_empty());
}

#[tokio::test]
async fn test_refusing_server_leaves_handle_behind() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    ensemble.set_server_status("zk1:2181", ServerStatus::Refusing);

    let session = ensemble.factory().create("zk1:2181", None);
    match session.connect(TIMEOUT).await {
        Err(SessionError::ConnectionError { handle_obtained, .. }) => assert!(handle_obtained),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(session.has_handle());
    assert_eq!(session.state(), SessionState::Connecting);
}

#[tokio::test]
async fn test_unsettled_session_rejects_operations() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    ensemble.set_server_status("zk1:2181", ServerStatus::Unsettled);

    let session = ensemble.factory().create("zk1:2181", None);
    session.connect(TIMEOUT).await.unwrap();
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(matches!(session.exists("/").await, Err(SessionError::NotConnected)));
}

#[tokio::test]
async fn test_sequential_nodes_get_padded_suffix() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = connected(&ensemble).await;

    session.create("/lock", Bytes::new(), CreateMode::Persistent).await.unwrap();
    let first = session
        .create("/lock/n-", Bytes::new(), CreateMode::EphemeralSequential)
        .await
        .unwrap();
    let second = session
        .create("/lock/n-", Bytes::new(), CreateMode::EphemeralSequential)
        .await
        .unwrap();

    assert_eq!(first, "/lock/n-0000000000");
    assert_eq!(second, "/lock/n-0000000001");
    let (children, _) = session.get_children("/lock").await.unwrap();
    assert_eq!(children, vec!["n-0000000000".to_string(), "n-0000000001".to_string()]);
}

#[tokio::test]
async fn test_expiry_removes_ephemerals_and_loses_watches() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let owner = connected(&ensemble).await;
    let observer = connected(&ensemble).await;

    owner.create("/eph", Bytes::new(), CreateMode::Ephemeral).await.unwrap();
    let (_, owner_watch) = owner.exists("/other").await.unwrap();
    let (stat, observer_watch) = observer.exists("/eph").await.unwrap();
    assert_eq!(stat.unwrap().ephemeral_owner, owner.id());

    ensemble.expire_session(owner.id());

    assert!(matches!(owner_watch.await, Err(SessionError::WatchLost(_))));
    assert_eq!(observer_watch.await.unwrap().kind, WatchEventKind::Deleted);
    assert!(matches!(owner.exists("/eph").await, Err(SessionError::SessionExpired)));
    assert!(observer.exists("/eph").await.unwrap().0.is_none());
    assert_eq!(ensemble.session_state(owner.id()), Some(SessionState::Expired));
}

#[tokio::test]
async fn test_watches_fire_once_per_change() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = connected(&ensemble).await;

    let (stat, created) = session.exists("/a").await.unwrap();
    assert!(stat.is_none());
    session.create("/a", Bytes::from("1"), CreateMode::Persistent).await.unwrap();
    assert_eq!(created.await.unwrap().kind, WatchEventKind::Created);

    let (data, _, changed) = session.get("/a").await.unwrap();
    assert_eq!(data, Bytes::from("1"));
    let (_, children_changed) = session.get_children("/a").await.unwrap();

    session.set("/a", Bytes::from("2"), None).await.unwrap();
    assert_eq!(changed.await.unwrap().kind, WatchEventKind::DataChanged);

    session.create("/a/b", Bytes::new(), CreateMode::Persistent).await.unwrap();
    let event = children_changed.await.unwrap();
    assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
    assert_eq!(event.path, "/a");
}

#[tokio::test]
async fn test_disconnect_keeps_watches() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = connected(&ensemble).await;
    let writer = connected(&ensemble).await;
    let mut states = session.subscribe_state();

    let (_, watch) = session.exists("/a").await.unwrap();
    ensemble.disconnect_session(session.id());
    assert_eq!(states.recv().await.unwrap(), SessionState::Connecting);
    assert!(matches!(session.get("/").await, Err(SessionError::NotConnected)));

    ensemble.reconnect_session(session.id());
    assert_eq!(states.recv().await.unwrap(), SessionState::Connected);

    writer.create("/a", Bytes::new(), CreateMode::Persistent).await.unwrap();
    assert_eq!(watch.await.unwrap().kind, WatchEventKind::Created);
}

#[tokio::test]
async fn test_delete_rules() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = connected(&ensemble).await;

    session.create("/a", Bytes::new(), CreateMode::Persistent).await.unwrap();
    session.create("/a/b", Bytes::new(), CreateMode::Persistent).await.unwrap();

    assert!(matches!(session.delete("/", None).await, Err(SessionError::NotEmpty(_))));
    assert!(matches!(session.delete("/a", None).await, Err(SessionError::NotEmpty(_))));
    assert!(matches!(
        session.delete("/a/b", Some(3)).await,
        Err(SessionError::BadVersion(_))
    ));
    assert!(matches!(
        session.delete("/missing", None).await,
        Err(SessionError::NoSuchNode(_))
    ));
    assert!(matches!(
        session.create("/missing/child", Bytes::new(), CreateMode::Persistent).await,
        Err(SessionError::NoSuchNode(_))
    ));

    session.delete("/a/b", Some(0)).await.unwrap();
    session.delete("/a", None).await.unwrap();
    assert!(session.exists("/a").await.unwrap().0.is_none());
}

#[tokio::test]
async fn test_call_counts_track_each_operation() {
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let session = connected(&ensemble).await;

    session.create("/a", Bytes::new(), CreateMode::Persistent).await.unwrap();
    for _ in 0..3 {
        session.get("/a").await.unwrap();
    }
    session.exists("/a").await.unwrap();

    assert_eq!(ensemble.call_count("create", "/a"), 1);
    assert_eq!(ensemble.call_count("get", "/a"), 3);
    assert_eq!(ensemble.call_count("exists", "/a"), 1);
    assert_eq!(ensemble.call_count("delete", "/a"), 0);
}
