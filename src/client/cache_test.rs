use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;

use crate::adaptors::mem::MemEnsemble;
use crate::adaptors::mem::MemSession;
use crate::test_utils::enable_logger;
use crate::test_utils::wait_until;
use crate::test_utils::TEST_SERVER;
use crate::CacheKey;
use crate::CachedValue;
use crate::CreateMode;
use crate::MockSession;
use crate::ReadOp;
use crate::Session;
use crate::SessionError;
use crate::Watch;
use crate::WatchCache;
use crate::WatchEvent;
use crate::WatchEventKind;

async fn mem_session(ensemble: &MemEnsemble) -> Arc<dyn Session> {
    let session = MemSession::new(ensemble.clone(), TEST_SERVER, None);
    session.connect(Duration::from_secs(1)).await.unwrap();
    Arc::new(session)
}

#[tokio::test]
async fn test_concurrent_reads_share_one_call() {
    enable_logger();
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;
    session
        .create("/a", Bytes::from("v1"), CreateMode::Persistent)
        .await
        .unwrap();
    ensemble.set_read_latency(Some(Duration::from_millis(50)));

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Get, "/a");
    let reads = (0..10).map(|_| cache.read(session.clone(), key.clone()));
    let results = join_all(reads).await;

    assert_eq!(ensemble.call_count("get", "/a"), 1);
    for result in results {
        match result.unwrap() {
            CachedValue::Data(data, stat) => {
                assert_eq!(data, Bytes::from("v1"));
                assert_eq!(stat.version, 0);
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }
    assert!(cache.is_cached(&key));
    assert!(!cache.is_pending(&key));
}

#[tokio::test]
async fn test_cached_value_served_without_round_trip() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;
    session
        .create("/a", Bytes::new(), CreateMode::Persistent)
        .await
        .unwrap();

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::GetChildren, "/a");
    for _ in 0..3 {
        assert_eq!(
            cache.read(session.clone(), key.clone()).await.unwrap(),
            CachedValue::Children(vec![])
        );
    }
    assert_eq!(ensemble.call_count("get_children", "/a"), 1);
}

#[tokio::test]
async fn test_fired_watch_evicts_entry() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;
    session
        .create("/a", Bytes::from("v1"), CreateMode::Persistent)
        .await
        .unwrap();

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Get, "/a");
    cache.read(session.clone(), key.clone()).await.unwrap();
    assert!(cache.is_cached(&key));

    session.set("/a", Bytes::from("v2"), None).await.unwrap();
    wait_until(Duration::from_secs(1), || !cache.is_cached(&key)).await;

    match cache.read(session.clone(), key.clone()).await.unwrap() {
        CachedValue::Data(data, _) => assert_eq!(data, Bytes::from("v2")),
        other => panic!("unexpected value: {:?}", other),
    }
    assert_eq!(ensemble.call_count("get", "/a"), 2);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Get, "/missing");
    for _ in 0..2 {
        assert_eq!(
            cache.read(session.clone(), key.clone()).await,
            Err(SessionError::NoSuchNode("/missing".to_string()))
        );
    }
    assert_eq!(ensemble.call_count("get", "/missing"), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_watch_fired_before_result_is_not_cached() {
    let mut session = MockSession::new();
    session.expect_exists().times(2).returning(|path| {
        Ok((
            None,
            Watch::fired(WatchEvent {
                kind: WatchEventKind::Created,
                path: path.to_string(),
            }),
        ))
    });
    let session: Arc<dyn Session> = Arc::new(session);

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Exists, "/a");
    for _ in 0..2 {
        assert_eq!(
            cache.read(session.clone(), key.clone()).await.unwrap(),
            CachedValue::Exists(None)
        );
        assert!(!cache.is_cached(&key));
    }
}

#[tokio::test]
async fn test_clear_drops_entries() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Exists, "/a");
    cache.read(session.clone(), key.clone()).await.unwrap();
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());

    cache.read(session.clone(), key.clone()).await.unwrap();
    assert_eq!(ensemble.call_count("exists", "/a"), 2);
}

#[tokio::test]
async fn test_clear_during_flight_keeps_result_out() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;
    ensemble.set_read_latency(Some(Duration::from_millis(50)));

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Exists, "/a");
    let read = {
        let cache = cache.clone();
        let session = session.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.read(session, key).await })
    };
    wait_until(Duration::from_secs(1), || cache.is_pending(&key)).await;
    cache.clear();

    assert_eq!(read.await.unwrap().unwrap(), CachedValue::Exists(None));
    assert!(!cache.is_cached(&key));
}

#[tokio::test]
async fn test_lost_watch_evicts_entry() {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let session = mem_session(&ensemble).await;

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Exists, "/a");
    cache.read(session.clone(), key.clone()).await.unwrap();
    assert!(cache.is_cached(&key));

    ensemble.expire_session(session.id());
    wait_until(Duration::from_secs(1), || !cache.is_cached(&key)).await;
}

#[tokio::test]
async fn test_reader_after_clear_reaches_new_session() {
    let old_ensemble = MemEnsemble::new([TEST_SERVER]);
    let old_session = mem_session(&old_ensemble).await;
    old_session
        .create("/a", Bytes::from("old"), CreateMode::Persistent)
        .await
        .unwrap();
    old_ensemble.set_read_latency(Some(Duration::from_millis(100)));

    let new_ensemble = MemEnsemble::new([TEST_SERVER]);
    let new_session = mem_session(&new_ensemble).await;
    new_session
        .create("/a", Bytes::from("new"), CreateMode::Persistent)
        .await
        .unwrap();

    let cache = WatchCache::new();
    let key = CacheKey::new(ReadOp::Get, "/a");
    let stale_read = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.read(old_session, key).await })
    };
    wait_until(Duration::from_secs(1), || cache.is_pending(&key)).await;
    cache.clear();
    assert!(!cache.is_pending(&key));

    match cache.read(new_session, key.clone()).await.unwrap() {
        CachedValue::Data(data, _) => assert_eq!(data, Bytes::from("new")),
        other => panic!("unexpected value: {:?}", other),
    }
    assert_eq!(new_ensemble.call_count("get", "/a"), 1);

    // the reader that was already waiting still gets its own answer
    match stale_read.await.unwrap().unwrap() {
        CachedValue::Data(data, _) => assert_eq!(data, Bytes::from("old")),
        other => panic!("unexpected value: {:?}", other),
    }
    match cache.read(mem_session(&new_ensemble).await, key.clone()).await.unwrap() {
        CachedValue::Data(data, _) => assert_eq!(data, Bytes::from("new")),
        other => panic!("unexpected value: {:?}", other),
    }
    assert_eq!(new_ensemble.call_count("get", "/a"), 1);
}
