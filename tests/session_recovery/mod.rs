//! Client behavior across unreachable servers, expiry and concurrent writers.

use std::time::Duration;

use bytes::Bytes;
use coordkeeper::adaptors::mem::MemEnsemble;
use coordkeeper::adaptors::mem::ServerStatus;
use coordkeeper::ClientEvent;
use coordkeeper::ConnectionManager;
use coordkeeper::CreateMode;
use coordkeeper::DisconnectReason;
use coordkeeper::HandlerRegistry;
use futures::future::join_all;

use crate::common::fast_config;
use crate::common::start_client;
use crate::common::wait_until;
use crate::common::WAIT;
use crate::enable_logger;

#[tokio::test(start_paused = true)]
async fn test_sweep_keeps_going_until_a_server_comes_up() {
    enable_logger();
    let ensemble = MemEnsemble::new(["a:1", "b:1", "c:1"]);
    for server in ["a:1", "b:1", "c:1"] {
        ensemble.set_server_status(server, ServerStatus::Down);
    }
    let client = ConnectionManager::new(
        "sweeper",
        fast_config(&["a:1", "b:1", "c:1"]),
        ensemble.factory(),
        HandlerRegistry::new(),
    )
    .unwrap();
    client.start().await;

    // one full sweep tries every combination, largest first
    wait_until(Duration::from_secs(60), || ensemble.connect_attempts().len() >= 7).await;
    assert_eq!(
        ensemble.connect_attempts()[..7],
        ["a:1,b:1,c:1", "a:1,b:1", "a:1,c:1", "b:1,c:1", "a:1", "b:1", "c:1"]
            .map(String::from)
    );
    assert!(!client.is_connected());

    ensemble.set_server_status("c:1", ServerStatus::Up);
    client.wait_connected(Duration::from_secs(60)).await.unwrap();
    assert!(client.session().unwrap().servers().contains("c:1"));

    client.ensure_path("/ready").await.unwrap();
    assert!(client.exists("/ready").await.unwrap().is_some());
    client.stop().await;
}

#[tokio::test]
async fn test_concurrent_reads_share_one_round_trip() {
    enable_logger();
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let client = start_client(&ensemble, "reader", fast_config(&["zk1:2181"])).await;
    client.create("/cfg", "v1", CreateMode::Persistent).await.unwrap();
    ensemble.set_read_latency(Some(Duration::from_millis(50)));

    let results = join_all((0..10).map(|_| client.get("/cfg"))).await;
    for result in results {
        assert_eq!(result.unwrap().0, Bytes::from("v1"));
    }
    assert_eq!(ensemble.call_count("get", "/cfg"), 1);

    // the fired watch evicts the entry, so the next read sees the new value
    client.set("/cfg", "v2", None).await.unwrap();
    let mut latest = Bytes::new();
    for _ in 0..100 {
        latest = client.get("/cfg").await.unwrap().0;
        if latest == Bytes::from("v2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(latest, Bytes::from("v2"));
    assert_eq!(ensemble.call_count("get", "/cfg"), 2);
    client.stop().await;
}

#[tokio::test]
async fn test_recursive_delete_outlasts_nested_writer() {
    enable_logger();
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let client = start_client(&ensemble, "cleaner", fast_config(&["zk1:2181"])).await;
    client.ensure_path("/busy/seed/leaf").await.unwrap();
    ensemble.set_read_latency(Some(Duration::from_millis(2)));

    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let parent = format!("/busy/w{}", i);
                let nodes = [parent.clone(), format!("{}/leaf", parent)];
                for node in nodes {
                    match client.create(&node, Bytes::new(), CreateMode::Persistent).await {
                        Ok(_) => {}
                        Err(e) if e.is_no_node() => return,
                        Err(e) => panic!("unexpected error: {:?}", e),
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    client.delete_recursive("/busy").await.unwrap();
    writer.await.unwrap();

    let (stat, _watch) = client.exists_and_watch("/busy").await.unwrap();
    assert!(stat.is_none());
    client.stop().await;
}

#[tokio::test]
async fn test_expired_client_recovers_with_fresh_session() {
    enable_logger();
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let client = start_client(&ensemble, "survivor", fast_config(&["zk1:2181"])).await;
    client.create("/owned", "x", CreateMode::Ephemeral).await.unwrap();
    client.create("/kept", "y", CreateMode::Persistent).await.unwrap();
    assert!(client.exists("/owned").await.unwrap().is_some());

    let old_id = client.session_id().unwrap();
    let mut events = client.subscribe();
    ensemble.expire_session(old_id);

    let mut seen = Vec::new();
    while seen.last() != Some(&ClientEvent::Connected) {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        seen.push(event);
    }
    assert_eq!(seen[0], ClientEvent::Disconnected(DisconnectReason::Expired));
    assert_ne!(client.session_id(), Some(old_id));

    // the cache was dropped with the old session
    assert!(client.exists("/owned").await.unwrap().is_none());
    assert_eq!(client.get("/kept").await.unwrap().0, Bytes::from("y"));
    client.stop().await;
}
