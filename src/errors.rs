//! Coordination Client Error Hierarchy
//!
//! Defines the error types surfaced by the session layer, the connection
//! manager and the services built on top of it (locks, streamers and the
//! resource glue).
//!
//! Transient connection failures are absorbed by the reconnection sweep and
//! only show up to callers as [`SessionError::NotConnected`]. Node-level
//! outcomes such as [`SessionError::NoSuchNode`] are ordinary results that the
//! recursive delete and the subtree streamer convert into "deleted" semantics.

use ::config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures reported by (or about) the underlying coordination session
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration values that loaded but do not make sense
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Resource registration and lookup failures
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Distributed lock failures
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Error raised by a user supplied lifecycle handler
    #[error("Unhandled error in lifecycle handler {handler}: {message}")]
    Handler { handler: String, message: String },

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Errors produced by a session primitive.
///
/// `Clone` so that a single in-flight read can hand the same outcome to every
/// coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No server in the list answered before the connect timeout
    #[error("Connect timeout")]
    ConnectTimeout,

    /// Generic connection failure. `handle_obtained` is false when the
    /// server string could not even produce a handle (bad server in list).
    #[error("Cannot connect to [{servers}]: {reason}")]
    ConnectionError {
        servers: String,
        reason: String,
        handle_obtained: bool,
    },

    /// The connect call returned but the session never reached the connected state
    #[error("Session did not reach the connected state")]
    NotFullyConnected,

    /// The session was expired by the ensemble and cannot be resumed
    #[error("Session expired")]
    SessionExpired,

    /// There is no current session to serve the operation
    #[error("Not connected")]
    NotConnected,

    #[error("No such node: {0}")]
    NoSuchNode(String),

    #[error("Node not empty: {0}")]
    NotEmpty(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Version mismatch on {0}")]
    BadVersion(String),

    /// The watch was dropped without firing, usually because its session went away
    #[error("Watch on {0} was lost before it fired")]
    WatchLost(String),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no resource provider for: {path:?} (provided: [{}])", available.join(", "))]
    Unprovided { path: String, available: Vec<String> },

    #[error("resource already provided: {0}")]
    AlreadyProvided(String),

    #[error("resource {0} is not ready")]
    NotReady(String),

    #[error("resource {path} lost: {reason}")]
    Lost { path: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock acquisition on {0} was cancelled")]
    Cancelled(String),

    #[error("Lock on {0} is not held")]
    NotHeld(String),

    #[error("Invalid lock path: {0}")]
    InvalidPath(String),
}

impl Error {
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::Session(SessionError::NoSuchNode(_)))
    }

    pub fn is_not_empty(&self) -> bool {
        matches!(self, Error::Session(SessionError::NotEmpty(_)))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::Session(SessionError::NodeExists(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Session(SessionError::Cancelled) | Error::Lock(LockError::Cancelled(_))
        )
    }

    /// Errors that mean "the session is unusable right now" rather than
    /// anything about the node being operated on.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Error::Session(
                SessionError::NotConnected
                    | SessionError::SessionExpired
                    | SessionError::ConnectTimeout
                    | SessionError::NotFullyConnected
                    | SessionError::ConnectionError { .. }
                    | SessionError::WatchLost(_)
            )
        )
    }
}

impl SessionError {
    /// Transient failures are retried by the reconnection sweep and never
    /// surfaced beyond a disconnect event.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectTimeout | SessionError::ConnectionError { .. } | SessionError::NotFullyConnected
        )
    }
}
