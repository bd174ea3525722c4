use std::time::Duration;

use coordkeeper::adaptors::mem::MemEnsemble;
use coordkeeper::ClientConfig;
use coordkeeper::ConnectionManager;
use coordkeeper::HandlerRegistry;
use coordkeeper::StreamEvent;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fast_config(servers: &[&str]) -> ClientConfig {
    let mut config = ClientConfig::with_servers(servers.iter().copied());
    config.connect_timeout_ms = 200;
    config.reconnect_timeout_ms = 500;
    config.reconnect.sweep_retry_delay_ms = 100;
    config
}

pub async fn start_client(
    ensemble: &MemEnsemble,
    name: &str,
    config: ClientConfig,
) -> ConnectionManager {
    let client = ConnectionManager::new(name, config, ensemble.factory(), HandlerRegistry::new()).unwrap();
    client.start().await;
    client.wait_connected(WAIT).await.unwrap();
    client
}

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

pub async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no stream event in time")
        .expect("stream closed")
}

/// Everything emitted within `quiet` of the previous event.
pub async fn drain(
    rx: &mut broadcast::Receiver<StreamEvent>,
    quiet: Duration,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(quiet, rx.recv()).await {
        events.push(event);
    }
    events
}
