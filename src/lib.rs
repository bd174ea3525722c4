//! Resilient client layer for ZooKeeper-style coordination ensembles.
//!
//! Built on an abstract [`Session`] primitive, the crate provides:
//! - [`ConnectionManager`]: reconnection sweep, session lifecycle and a
//!   watch-invalidated read cache
//! - [`LockService`]: a distributed lock that follows the client's
//!   connectivity
//! - [`SubtreeStreamer`]: live mirroring of subtrees as a stream of
//!   [`StreamEvent`]s
//! - [`ResourceManager`] and the providers wiring all of the above from
//!   [`Settings`]

mod client;
mod config;
mod errors;
mod lock;
mod provider;
mod session;
mod streamer;
pub mod metrics;
pub mod utils;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use lock::*;
pub use provider::*;
pub use session::*;
pub use streamer::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod errors_test;
