use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::node::StreamShared;
use super::node::WatchNode;
use super::StreamEvent;
use super::StreamerOptions;
use super::WatchState;
use crate::validate_path;
use crate::ClientEvent;
use crate::ConnectionManager;
use crate::Result;

/// Node tasks spawned for one connection.
struct Generation {
    id: u64,
    token: CancellationToken,
    /// False until paths deleted while disconnected have been reported;
    /// roots are spawned once it flips.
    live: bool,
}

struct StreamerInner {
    shared: Arc<StreamShared>,
    roots: Mutex<BTreeSet<String>>,
    running: AtomicBool,
    /// Lock before `roots` when both are needed.
    generation: Mutex<Option<Generation>>,
    next_generation: AtomicU64,
    listener: Mutex<Option<CancellationToken>>,
}

impl Drop for StreamerInner {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.get_mut().take() {
            generation.token.cancel();
        }
        if let Some(token) = self.listener.get_mut().take() {
            token.cancel();
        }
    }
}

/// Mirrors one or more subtrees as a stream of [`StreamEvent`]s.
///
/// Node tasks run only while the client is connected: every Connected event
/// restarts them from the roots (re-emitting the current data of every node)
/// and every Disconnected event stops them. Before a restart, nodes that
/// were deleted in the meantime are reported as `Deleted`.
#[derive(Clone)]
pub struct SubtreeStreamer {
    inner: Arc<StreamerInner>,
}

impl fmt::Debug for SubtreeStreamer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SubtreeStreamer")
            .field("client", &self.inner.shared.client.name())
            .field("roots", &self.roots())
            .field("running", &self.is_running())
            .finish()
    }
}

impl SubtreeStreamer {
    pub fn new(
        client: ConnectionManager,
        options: StreamerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(StreamerInner {
                shared: Arc::new(StreamShared::new(client, options)),
                roots: Mutex::new(BTreeSet::new()),
                running: AtomicBool::new(false),
                generation: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn client(&self) -> &ConnectionManager {
        &self.inner.shared.client
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn roots(&self) -> Vec<String> {
        self.inner.roots.lock().iter().cloned().collect()
    }

    /// Adds a root path. Roots survive their own deletion: the streamer waits
    /// for them to be created again.
    pub fn watch_root(
        &self,
        path: impl Into<String>,
    ) -> Result<()> {
        let path = path.into();
        validate_path(&path)?;

        let generation = self.inner.generation.lock();
        if !self.inner.roots.lock().insert(path.clone()) {
            return Ok(());
        }
        if let Some(generation) = generation.as_ref().filter(|g| g.live) {
            self.spawn_root(path, &generation.token);
        }
        Ok(())
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = CancellationToken::new();
        *self.inner.listener.lock() = Some(listener.clone());
        self.spawn_listener(listener);

        if self.inner.shared.client.is_connected() {
            self.resume();
        }
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.cancel();
        }
        self.suspend();
        info!(client = %self.inner.shared.client.name(), "streamer stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.shared.events_tx.subscribe()
    }

    /// Events emitted from now on. A subscriber that falls more than the
    /// buffer size behind skips the missed events.
    pub fn events(&self) -> impl Stream<Item = StreamEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "stream subscriber lagged behind");
                None
            }
        })
    }

    /// Paths whose data and children watches are currently armed.
    pub fn watched_paths(&self) -> Vec<String> {
        self.inner.shared.watched_paths()
    }

    pub fn node_state(
        &self,
        path: &str,
    ) -> WatchState {
        self.inner.shared.state(path)
    }

    fn resume(&self) {
        let id = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let previous = self.inner.generation.lock().replace(Generation {
            id,
            token: token.clone(),
            live: false,
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let weak: Weak<StreamerInner> = Arc::downgrade(&self.inner);
        let shared = self.inner.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = shared.reconcile() => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            SubtreeStreamer { inner }.go_live(id);
        });
    }

    /// Spawns every root, unless a newer generation took over.
    fn go_live(
        &self,
        id: u64,
    ) {
        let mut generation = self.inner.generation.lock();
        let Some(current) = generation.as_mut().filter(|g| g.id == id && !g.live) else {
            return;
        };
        current.live = true;
        let roots = self.roots();
        info!(client = %self.inner.shared.client.name(), ?roots, "streaming subtrees");
        for root in roots {
            self.spawn_root(root, &current.token);
        }
    }

    fn suspend(&self) {
        if let Some(generation) = self.inner.generation.lock().take() {
            generation.token.cancel();
        }
        self.inner.shared.clear_states();
    }

    fn spawn_root(
        &self,
        path: String,
        generation: &CancellationToken,
    ) {
        let node = WatchNode::root(self.inner.shared.clone(), path, generation.child_token());
        tokio::spawn(node.run(None));
    }

    fn spawn_listener(
        &self,
        token: CancellationToken,
    ) {
        let weak: Weak<StreamerInner> = Arc::downgrade(&self.inner);
        let mut events = self.inner.shared.client.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    event = events.recv() => event,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let streamer = SubtreeStreamer { inner };
                match event {
                    Ok(ClientEvent::Connected) => streamer.resume(),
                    Ok(ClientEvent::Disconnected(reason)) => {
                        debug!(?reason, "client disconnected, suspending streams");
                        streamer.suspend();
                    }
                    Err(RecvError::Lagged(_)) => {
                        if streamer.client().is_connected() {
                            streamer.resume();
                        } else {
                            streamer.suspend();
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }
}
