use std::time::Duration;

use tokio::time::Instant;

use crate::adaptors::mem::MemEnsemble;
use crate::ClientConfig;
use crate::ConnectionManager;
use crate::HandlerRegistry;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    env_logger::init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub const TEST_SERVER: &str = "zk1:2181";

/// Config with short timeouts so failure paths finish quickly in tests.
pub fn test_config(servers: &[&str]) -> ClientConfig {
    let mut config = ClientConfig::with_servers(servers.iter().copied());
    config.connect_timeout_ms = 200;
    config.reconnect_timeout_ms = 500;
    config.reconnect.sweep_retry_delay_ms = 100;
    config
}

pub fn test_client(
    ensemble: &MemEnsemble,
    config: ClientConfig,
) -> ConnectionManager {
    ConnectionManager::new("test", config, ensemble.factory(), HandlerRegistry::new()).unwrap()
}

/// A started client connected to a single-server ensemble.
pub async fn connected_client() -> (MemEnsemble, ConnectionManager) {
    let ensemble = MemEnsemble::new([TEST_SERVER]);
    let client = test_client(&ensemble, test_config(&[TEST_SERVER]));
    client.start().await;
    client.wait_connected(Duration::from_secs(5)).await.unwrap();
    (ensemble, client)
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub async fn wait_until<F>(
    timeout: Duration,
    mut condition: F,
) where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
