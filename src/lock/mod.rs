//! Distributed mutual exclusion on top of [`ConnectionManager`](crate::ConnectionManager).
//!
//! [`DistributedLock`] implements the sequential-node recipe for one
//! acquisition. [`LockService`] keeps trying to hold a lock for as long as
//! its client is connected and lets go whenever the client disconnects.

mod recipe;
mod service;

pub use recipe::*;
pub use service::*;
