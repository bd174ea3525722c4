//! Prometheus collectors for the client layer.
//!
//! Collectors are process wide. Embedders either call [`gather_metrics`] for a
//! text exposition of the default registry, or register the collectors into
//! their own registry with [`register_custom_metrics`].

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::error;


lazy_static! {
    pub static ref CONNECT_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("connect_attempts", "Connect attempts by client and outcome"),
        &["client", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref SESSIONS_ESTABLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("sessions_established", "Sessions that reached the connected state"),
        &["client"]
    )
    .expect("metric can not be created");

    pub static ref CLIENT_CONNECTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("client_connected", "1 while the client has a connected session"),
        &["client"]
    )
    .expect("metric can not be created");

    pub static ref LIFECYCLE_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("lifecycle_events", "Lifecycle events fired"),
        &["client", "event"]
    )
    .expect("metric can not be created");

    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_lookups", "Cached read lookups by operation and result (hit, miss, coalesced)"),
        &["op", "result"]
    )
    .expect("metric can not be created");

    pub static ref CACHE_INVALIDATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_invalidations", "Cache entries dropped by a fired watch"),
        &["op"]
    )
    .expect("metric can not be created");

    pub static ref STREAM_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("stream_events", "Subtree stream events emitted"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref LOCK_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("lock_transitions", "Lock acquisitions and releases"),
        &["path", "transition"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER_DEFAULT: Once = Once::new();

pub fn register_custom_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(CONNECT_ATTEMPTS.clone()))?;
    registry.register(Box::new(SESSIONS_ESTABLISHED.clone()))?;
    registry.register(Box::new(CLIENT_CONNECTED.clone()))?;
    registry.register(Box::new(LIFECYCLE_EVENTS.clone()))?;
    registry.register(Box::new(CACHE_LOOKUPS.clone()))?;
    registry.register(Box::new(CACHE_INVALIDATIONS.clone()))?;
    registry.register(Box::new(STREAM_EVENTS.clone()))?;
    registry.register(Box::new(LOCK_TRANSITIONS.clone()))?;
    Ok(())
}

/// Text exposition of every collector, ready to be served to Prometheus
pub fn gather_metrics() -> String {
    REGISTER_DEFAULT.call_once(|| {
        if let Err(e) = register_custom_metrics(&REGISTRY) {
            error!("could not register custom metrics: {}", e);
        }
    });

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
        return String::default();
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!("custom metrics could not be from_utf8'd: {}", e);
        String::default()
    })
}
