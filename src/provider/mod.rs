//! Resource glue between coordination services and the code consuming them.
//!
//! Providers register the resource paths they serve in a [`ResourceManager`];
//! consumers create a [`ResourceDependency`] for a path and resolve it. The
//! provider then reports the resource as ready or lost as its availability
//! changes:
//!
//! - `coordination.client.<name>`: a [`ConnectionManager`](crate::ConnectionManager),
//!   ready while connected
//! - `coordination.lock.<name>`: a [`LockService`](crate::LockService)
//! - `coordination.streamer.<name>`: a started [`SubtreeStreamer`](crate::SubtreeStreamer)

mod client_provider;
mod resource;
mod services;

pub use client_provider::*;
pub use resource::*;
pub use services::*;
