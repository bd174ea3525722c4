use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::NodeStat;
use crate::StreamerConfig;

const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Emitted for the first read of a node and for every change after it
    DataChanged {
        path: String,
        data: Bytes,
        stat: NodeStat,
    },
    Deleted {
        path: String,
    },
}

impl StreamEvent {
    pub fn path(&self) -> &str {
        match self {
            StreamEvent::DataChanged { path, .. } => path,
            StreamEvent::Deleted { path } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::DataChanged { .. } => "data_changed",
            StreamEvent::Deleted { .. } => "deleted",
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, StreamEvent::Deleted { .. })
    }
}

/// Where the watch loop of one path currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unwatched,
    /// Waiting for the node to exist
    ExistencePending,
    /// Data and children watches armed
    Watching,
    Deleted,
}

/// Decides whether a discovered child path gets watched.
pub type ChildPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct StreamerOptions {
    /// Called with the full path of every newly listed child
    pub predicate: ChildPredicate,

    /// Capacity of the event channel; slower subscribers lag past it
    pub event_buffer_size: usize,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            predicate: Arc::new(|_| true),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl fmt::Debug for StreamerOptions {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("StreamerOptions")
            .field("event_buffer_size", &self.event_buffer_size)
            .finish_non_exhaustive()
    }
}

impl StreamerOptions {
    pub fn with_predicate<F>(
        mut self,
        predicate: F,
    ) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn with_event_buffer_size(
        mut self,
        size: usize,
    ) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Skips every child whose path starts with one of `prefixes`.
    pub fn excluding(prefixes: Vec<String>) -> Self {
        Self::default().with_predicate(move |path| !prefixes.iter().any(|p| path.starts_with(p.as_str())))
    }
}

impl From<&StreamerConfig> for StreamerOptions {
    fn from(config: &StreamerConfig) -> Self {
        Self::excluding(config.exclude_prefixes.clone()).with_event_buffer_size(config.event_buffer_size)
    }
}
