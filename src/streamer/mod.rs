//! Live mirroring of a subtree as a stream of change events.
//!
//! A [`SubtreeStreamer`] watches one or more root paths and every descendant
//! it discovers through children listings. Each watched path runs its own task
//! that re-arms one watch at a time per operation, racing the data and
//! children watches against a deletion check so a removed node is reported
//! exactly once.
//!
//! ```text
//!   Unwatched ──spawn──> ExistencePending ──exists──> Watching
//!                            ^     │                     │
//!                    (roots) │     └─absent (non-root)─> end
//!                            └────────── Deleted <───────┘
//! ```

mod event;
mod node;
mod subtree;

pub use event::*;
pub use subtree::*;
