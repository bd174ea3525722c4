//! Services wired from a TOML settings file through the providers, the way an
//! application assembles them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coordkeeper::adaptors::mem::MemEnsemble;
use coordkeeper::ClientProvider;
use coordkeeper::ConnectionManager;
use coordkeeper::CreateMode;
use coordkeeper::HandlerRegistry;
use coordkeeper::LockProvider;
use coordkeeper::LockService;
use coordkeeper::LockState;
use coordkeeper::ResourceDependency;
use coordkeeper::ResourceManager;
use coordkeeper::Settings;
use coordkeeper::StreamEvent;
use coordkeeper::StreamerProvider;
use coordkeeper::SubtreeStreamer;

use crate::common::drain;
use crate::common::next_event;
use crate::common::wait_until;
use crate::common::WAIT;
use crate::enable_logger;

const SETTINGS: &str = r#"
[clients.main]
servers = "zk1:2181"
connect_timeout_ms = 200
reconnect_timeout_ms = 500

[clients.main.reconnect]
sweep_retry_delay_ms = 100

[locks.leader]
client = "main"
path = "/app/leader"

[streamers.config]
client = "main"
roots = ["/app/config"]
exclude_prefixes = ["/app/config/tmp"]
"#;

fn load_settings() -> (tempfile::TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coord.toml");
    std::fs::write(&path, SETTINGS).unwrap();
    let settings = Settings::load(Some(path.to_str().unwrap())).unwrap();
    (dir, settings)
}

/// One application instance: its own clients and services over a shared
/// ensemble.
struct Process {
    clients: Arc<ClientProvider>,
    locks: Arc<LockProvider>,
    streamers: Arc<StreamerProvider>,
    lock_resources: ResourceManager<LockService>,
    streamer_resources: ResourceManager<SubtreeStreamer>,
}

impl Process {
    async fn start(
        ensemble: &MemEnsemble,
        settings: &Settings,
    ) -> Self {
        let client_resources = Arc::new(ResourceManager::new());
        let clients = Arc::new(ClientProvider::from_settings(
            settings,
            ensemble.factory(),
            HandlerRegistry::new(),
        ));
        clients.register(&client_resources).unwrap();
        clients.start_all().await;

        let locks = Arc::new(LockProvider::new(settings, client_resources.clone()));
        let lock_resources = ResourceManager::new();
        locks.register(&lock_resources).unwrap();

        let streamers = Arc::new(StreamerProvider::new(settings, client_resources));
        let streamer_resources = ResourceManager::new();
        streamers.register(&streamer_resources).unwrap();

        Self {
            clients,
            locks,
            streamers,
            lock_resources,
            streamer_resources,
        }
    }

    async fn leader_lock(&self) -> LockService {
        let dependency = ResourceDependency::new("coordination.lock.leader");
        self.lock_resources.resolve(&dependency).await.unwrap();
        dependency.wait_for_resource().await.unwrap()
    }

    async fn config_streamer(&self) -> SubtreeStreamer {
        let dependency = ResourceDependency::new("coordination.streamer.config");
        self.streamer_resources.resolve(&dependency).await.unwrap();
        dependency.wait_for_resource().await.unwrap()
    }

    fn client(&self) -> ConnectionManager {
        self.clients.client("main").unwrap()
    }

    async fn shutdown(&self) {
        self.streamers.stop_all();
        self.locks.stop_all().await;
        self.clients.stop_all().await;
    }
}

fn paths(events: &[StreamEvent]) -> BTreeSet<String> {
    events.iter().map(|e| e.path().to_string()).collect()
}

#[tokio::test]
async fn test_leadership_moves_to_surviving_process() {
    enable_logger();
    let (_dir, settings) = load_settings();
    let ensemble = MemEnsemble::new(["zk1:2181"]);

    let first = Process::start(&ensemble, &settings).await;
    let first_lock = first.leader_lock().await;
    first_lock.wait_acquired(WAIT).await.unwrap();

    let second = Process::start(&ensemble, &settings).await;
    let second_lock = second.leader_lock().await;
    wait_until(WAIT, || second_lock.state() == LockState::Acquiring).await;
    assert!(!second_lock.is_acquired());

    ensemble.expire_session(first.client().session_id().unwrap());
    second_lock.wait_acquired(WAIT).await.unwrap();

    // the first process comes back with a fresh session and queues up
    first.client().wait_connected(WAIT).await.unwrap();
    wait_until(WAIT, || first_lock.state() == LockState::Acquiring).await;
    assert!(second_lock.is_acquired());

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_config_tree_is_mirrored() {
    enable_logger();
    let (_dir, settings) = load_settings();
    let ensemble = MemEnsemble::new(["zk1:2181"]);
    let process = Process::start(&ensemble, &settings).await;

    let streamer = process.config_streamer().await;
    assert!(streamer.is_running());
    let mut rx = streamer.subscribe();
    let client = process.client();

    // the root does not exist yet
    assert!(drain(&mut rx, Duration::from_millis(100)).await.is_empty());
    client.ensure_path("/app/config").await.unwrap();
    match next_event(&mut rx).await {
        StreamEvent::DataChanged { path, .. } => assert_eq!(path, "/app/config"),
        other => panic!("unexpected event: {:?}", other),
    }

    for child in ["a", "b", "tmp"] {
        client
            .create(&format!("/app/config/{}", child), child.to_string(), CreateMode::Persistent)
            .await
            .unwrap();
    }
    let discovered = drain(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(
        paths(&discovered),
        BTreeSet::from(["/app/config/a".to_string(), "/app/config/b".to_string()])
    );

    client.delete("/app/config/b", None).await.unwrap();
    let deleted = drain(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(
        deleted,
        vec![StreamEvent::Deleted {
            path: "/app/config/b".to_string()
        }]
    );

    client
        .create("/app/config/b", "b2", CreateMode::Persistent)
        .await
        .unwrap();
    match next_event(&mut rx).await {
        StreamEvent::DataChanged { path, data, .. } => {
            assert_eq!(path, "/app/config/b");
            assert_eq!(data, Bytes::from("b2"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    process.shutdown().await;
}
