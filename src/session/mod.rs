//! The session primitive consumed by the client layer.
//!
//! A [`Session`] is one connection to the coordination ensemble. It exposes
//! read operations that each arm a one-shot [`Watch`], plain writes, and a
//! stream of connection-state transitions. The wire protocol lives behind this
//! trait; [`adaptors::mem`] provides an in-process ensemble.

pub mod adaptors;
mod types;
mod watch;

pub use types::*;
pub use watch::*;


//--------------------------------------
// Trait Definition
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::broadcast;

use crate::SessionError;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Ensemble assigned id, 0 until a handle has been obtained
    fn id(&self) -> i64;

    /// The joined server string this session was created with
    fn servers(&self) -> String;

    /// Whether connecting produced a native handle at all
    fn has_handle(&self) -> bool;

    fn state(&self) -> SessionState;

    /// Connection-state transitions after the initial connect
    fn subscribe_state(&self) -> broadcast::Receiver<SessionState>;

    async fn connect(
        &self,
        timeout: Duration,
    ) -> SessionResult<()>;

    async fn close(&self) -> SessionResult<()>;

    async fn exists(
        &self,
        path: &str,
    ) -> SessionResult<(Option<NodeStat>, Watch)>;

    async fn get(
        &self,
        path: &str,
    ) -> SessionResult<(Bytes, NodeStat, Watch)>;

    async fn get_children(
        &self,
        path: &str,
    ) -> SessionResult<(Vec<String>, Watch)>;

    /// Returns the actual path created (differs from `path` for sequential nodes)
    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> SessionResult<String>;

    async fn set(
        &self,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> SessionResult<NodeStat>;

    async fn delete(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> SessionResult<()>;
}

/// Creates fresh, unconnected sessions for a server string.
#[cfg_attr(test, automock)]
pub trait SessionFactory: Send + Sync + 'static {
    fn create(
        &self,
        servers: &str,
        session_timeout: Option<Duration>,
    ) -> Arc<dyn Session>;
}
