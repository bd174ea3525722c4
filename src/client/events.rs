use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::ConnectionManager;
use crate::Error;
use crate::ResourceError;
use crate::Result;

/// Named lifecycle events a client can dispatch to configured handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Starting,
    Stopping,
    Connected,
    Reconnecting,
    Reconnected,
    Expired,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 6] = [
        LifecycleEvent::Starting,
        LifecycleEvent::Stopping,
        LifecycleEvent::Connected,
        LifecycleEvent::Reconnecting,
        LifecycleEvent::Reconnected,
        LifecycleEvent::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Starting => "starting",
            LifecycleEvent::Stopping => "stopping",
            LifecycleEvent::Connected => "connected",
            LifecycleEvent::Reconnecting => "reconnecting",
            LifecycleEvent::Reconnected => "reconnected",
            LifecycleEvent::Expired => "expired",
        }
    }
}

impl FromStr for LifecycleEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LifecycleEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown lifecycle event: {}", s)))
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a client stopped being connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Contact with the ensemble was lost; the session may still resume
    Reconnecting,
    /// The session expired and will be replaced
    Expired,
    /// The client was stopped (or is being restarted)
    Stopping,
}

/// Connectivity notifications broadcast to services built on a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected(DisconnectReason),
}

/// Argument handed to a lifecycle handler.
#[derive(Clone)]
pub struct EventContext {
    pub event: LifecycleEvent,
    pub client: ConnectionManager,
}

impl fmt::Debug for EventContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("event", &self.event)
            .field("client", &self.client.name())
            .finish()
    }
}

#[async_trait]
pub trait LifecycleHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: EventContext,
    ) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> LifecycleHandler for FnHandler<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: EventContext,
    ) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Wraps an async closure as a [`LifecycleHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn LifecycleHandler>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers addressable by the names used in `ClientConfig::events`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn LifecycleHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("names", &self.names()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Result<()> {
        match self.handlers.entry(name.into()) {
            Entry::Occupied(e) => Err(ResourceError::AlreadyProvided(e.key().clone()).into()),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<Arc<dyn LifecycleHandler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }
}
