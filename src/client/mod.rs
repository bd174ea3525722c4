//! Resilient client over the session primitive.
//!
//! - [`ConnectionManager`] keeps one live session per named client, rebuilding
//!   it whenever contact is lost for too long or the session expires
//! - [`WatchCache`] serves repeated reads until the watch armed by the read
//!   fires
//! - [`LifecycleEvent`] handlers let embedders react to connection changes
//!
//! # Basic Usage
//! ```no_run
//! use std::time::Duration;
//!
//! use coordkeeper::adaptors::mem::MemEnsemble;
//! use coordkeeper::ClientConfig;
//! use coordkeeper::ConnectionManager;
//! use coordkeeper::CreateMode;
//! use coordkeeper::HandlerRegistry;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let ensemble = MemEnsemble::new(["zk1:2181"]);
//!     let client = ConnectionManager::new(
//!         "main",
//!         ClientConfig::with_servers(["zk1:2181"]),
//!         ensemble.factory(),
//!         HandlerRegistry::new(),
//!     )
//!     .unwrap();
//!
//!     client.start().await;
//!     client.wait_connected(Duration::from_secs(5)).await.unwrap();
//!
//!     client.create("/config", "v1", CreateMode::Persistent).await.unwrap();
//!     let (data, _stat) = client.get("/config").await.unwrap();
//!     println!("config: {:?}", data);
//!
//!     client.stop().await;
//! }
//! ```

mod cache;
mod delete;
mod events;
mod manager;

pub use cache::*;
pub use events::*;
pub use manager::*;

#[cfg(test)]
mod cache_test;
#[cfg(test)]
mod events_test;
