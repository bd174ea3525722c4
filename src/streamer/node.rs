use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::StreamEvent;
use super::StreamerOptions;
use super::WatchState;
use crate::join_path;
use crate::metrics::STREAM_EVENTS;
use crate::ConnectionManager;
use crate::Error;
use crate::NodeStat;
use crate::Result;
use crate::Watch;
use crate::WatchEventKind;

/// Result of an exists check, handed to the node that takes over the path.
type Probe = (Option<NodeStat>, Watch);

/// Sent by a child that saw its own deletion: (child name, node id)
type Ended = (String, u64);

/// State shared by every node task of one streamer.
pub(crate) struct StreamShared {
    pub(crate) client: ConnectionManager,
    pub(crate) options: StreamerOptions,
    pub(crate) events_tx: broadcast::Sender<StreamEvent>,
    /// Path -> (owning node id, state). Newer nodes win.
    states: DashMap<String, (u64, WatchState)>,
    /// Paths whose data was emitted and whose deletion was not. Survives
    /// restarts of the node tasks.
    known: Mutex<BTreeSet<String>>,
    next_id: AtomicU64,
}

impl StreamShared {
    pub(crate) fn new(
        client: ConnectionManager,
        options: StreamerOptions,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(options.event_buffer_size.max(1));
        Self {
            client,
            options,
            events_tx,
            states: DashMap::new(),
            known: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_state(
        &self,
        id: u64,
        path: &str,
        state: WatchState,
    ) {
        match self.states.entry(path.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().0 <= id {
                    entry.insert((id, state));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert((id, state));
            }
        }
    }

    fn clear_state(
        &self,
        id: u64,
        path: &str,
    ) {
        self.states.remove_if(path, |_, (owner, _)| *owner == id);
    }

    pub(crate) fn clear_states(&self) {
        self.states.clear();
    }

    pub(crate) fn state(
        &self,
        path: &str,
    ) -> WatchState {
        self.states
            .get(path)
            .map(|entry| entry.value().1)
            .unwrap_or(WatchState::Unwatched)
    }

    pub(crate) fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.value().1 == WatchState::Watching)
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        paths
    }

    pub(crate) fn known_paths(&self) -> Vec<String> {
        self.known.lock().iter().cloned().collect()
    }

    /// Emits `Deleted` for every known path that is gone now. Node tasks only
    /// observe deletions while they run, so this has to happen before they
    /// are started again.
    pub(crate) async fn reconcile(&self) {
        for path in self.known_paths() {
            match self.client.exists_and_watch(&path).await {
                Ok((Some(_), _)) => {}
                Ok((None, _)) => self.emit(StreamEvent::Deleted { path }),
                Err(e) if e.is_no_node() => self.emit(StreamEvent::Deleted { path }),
                Err(e) => {
                    debug!(%path, "reconciliation interrupted: {}", e);
                    return;
                }
            }
        }
    }

    fn emit(
        &self,
        event: StreamEvent,
    ) {
        {
            let mut known = self.known.lock();
            match &event {
                StreamEvent::DataChanged { path, .. } => {
                    known.insert(path.clone());
                }
                StreamEvent::Deleted { path } => {
                    if !known.remove(path) {
                        // already reported
                        return;
                    }
                }
            }
        }
        STREAM_EVENTS.with_label_values(&[event.kind()]).inc();
        trace!(path = %event.path(), kind = event.kind(), "stream event");
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

/// Set when a node is dropped from its parent's listing. Checked through the
/// whole ancestor chain, so retiring a node retires its descendants too.
#[derive(Debug, Default)]
struct Retirement {
    flag: AtomicBool,
    parent: Option<Arc<Retirement>>,
}

impl Retirement {
    fn is_retired(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_retired())
    }
}

struct ChildHandle {
    id: u64,
    token: CancellationToken,
    retirement: Arc<Retirement>,
}

impl ChildHandle {
    fn retire(&self) {
        self.retirement.flag.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

struct ParentLink {
    tx: mpsc::UnboundedSender<Ended>,
    name: String,
}

enum Outcome {
    Cancelled,
    /// Carries the exists watch armed by the check that found the node gone
    Deleted(Option<Watch>),
    /// A watch was dropped by its session
    Lost,
    Failed(Error),
}

/// The watch loop of one path.
pub(crate) struct WatchNode {
    shared: Arc<StreamShared>,
    id: u64,
    path: String,
    root: bool,
    token: CancellationToken,
    retirement: Arc<Retirement>,
    parent: Option<ParentLink>,
}

impl WatchNode {
    pub(crate) fn root(
        shared: Arc<StreamShared>,
        path: String,
        token: CancellationToken,
    ) -> Self {
        Self {
            id: shared.next_id(),
            shared,
            path,
            root: true,
            token,
            retirement: Arc::new(Retirement::default()),
            parent: None,
        }
    }

    pub(crate) fn run(
        self,
        probe: Option<Probe>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut probe = probe;
            loop {
                self.shared
                    .set_state(self.id, &self.path, WatchState::ExistencePending);

                let (stat, exists_watch) = match probe.take() {
                    Some(probe) => probe,
                    None => match self.cancellable(self.shared.client.exists_and_watch(&self.path)).await {
                        Some(Ok(probe)) => probe,
                        Some(Err(e)) => return self.abort(Outcome::Failed(e)),
                        None => return self.abort(Outcome::Cancelled),
                    },
                };

                if stat.is_none() {
                    if !self.root {
                        // the parent picks the path up again if it is recreated
                        trace!(path = %self.path, "node gone before it was watched");
                        return self.abort(Outcome::Cancelled);
                    }
                    match self.cancellable(exists_watch).await {
                        Some(Ok(_)) => continue,
                        Some(Err(_)) => return self.abort(Outcome::Lost),
                        None => return self.abort(Outcome::Cancelled),
                    }
                }

                self.shared.set_state(self.id, &self.path, WatchState::Watching);
                match self.watch_existing(exists_watch).await {
                    Outcome::Deleted(next) => {
                        self.deleted();
                        if !self.root {
                            self.report();
                            return;
                        }
                        probe = next.map(|watch| (None, watch));
                    }
                    Outcome::Cancelled if self.retirement.is_retired() => {
                        self.deleted();
                        return;
                    }
                    outcome => return self.abort(outcome),
                }
            }
        }
        .boxed()
    }

    async fn cancellable<F: Future>(
        &self,
        fut: F,
    ) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Runs the data and children loops against the deletion check until one
    /// of them settles.
    async fn watch_existing(
        &self,
        exists_watch: Watch,
    ) -> Outcome {
        let mut children: HashMap<String, ChildHandle> = HashMap::new();
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Outcome::Cancelled,
            outcome = self.until_deleted(exists_watch) => outcome,
            outcome = self.children_loop(&mut children, &ended_tx, &mut ended_rx) => outcome,
            outcome = self.data_loop() => outcome,
        };

        match outcome {
            Outcome::Deleted(_) => children.values().for_each(ChildHandle::retire),
            // child tokens hang off ours
            Outcome::Cancelled => {}
            _ => children.values().for_each(|child| child.token.cancel()),
        }
        outcome
    }

    async fn until_deleted(
        &self,
        mut watch: Watch,
    ) -> Outcome {
        loop {
            match watch.await {
                Ok(event) if event.kind == WatchEventKind::Deleted => return Outcome::Deleted(None),
                Ok(_) => {}
                Err(_) => return Outcome::Lost,
            }
            match self.shared.client.exists_and_watch(&self.path).await {
                Ok((Some(_), next)) => watch = next,
                Ok((None, next)) => return Outcome::Deleted(Some(next)),
                Err(e) if e.is_no_node() => return Outcome::Deleted(None),
                Err(e) => return Outcome::Failed(e),
            }
        }
    }

    async fn data_loop(&self) -> Outcome {
        loop {
            let (data, stat, watch) = match self.shared.client.get_and_watch(&self.path).await {
                Ok(read) => read,
                Err(e) if e.is_no_node() => return Outcome::Deleted(None),
                Err(e) => return Outcome::Failed(e),
            };
            self.shared.emit(StreamEvent::DataChanged {
                path: self.path.clone(),
                data,
                stat,
            });

            match watch.await {
                Ok(event) if event.kind == WatchEventKind::Deleted => return Outcome::Deleted(None),
                Ok(_) => {}
                Err(_) => return Outcome::Lost,
            }
        }
    }

    async fn children_loop(
        &self,
        children: &mut HashMap<String, ChildHandle>,
        ended_tx: &mpsc::UnboundedSender<Ended>,
        ended_rx: &mut mpsc::UnboundedReceiver<Ended>,
    ) -> Outcome {
        loop {
            let (names, mut watch) = match self.shared.client.get_children_and_watch(&self.path).await {
                Ok(listing) => listing,
                Err(e) if e.is_no_node() => return Outcome::Deleted(None),
                Err(e) => return Outcome::Failed(e),
            };
            self.sync_children(children, names, ended_tx);

            loop {
                tokio::select! {
                    fired = &mut watch => match fired {
                        Ok(event) if event.kind == WatchEventKind::Deleted => return Outcome::Deleted(None),
                        Ok(_) => break,
                        Err(_) => return Outcome::Lost,
                    },
                    Some((name, id)) = ended_rx.recv() => {
                        if let Err(e) = self.reprobe(children, name, id, ended_tx).await {
                            return Outcome::Failed(e);
                        }
                    }
                }
            }
        }
    }

    /// Retires children missing from `names` and spawns loops for new ones.
    fn sync_children(
        &self,
        children: &mut HashMap<String, ChildHandle>,
        names: Vec<String>,
        ended_tx: &mpsc::UnboundedSender<Ended>,
    ) {
        let listed: HashSet<String> = names.into_iter().collect();
        children.retain(|name, child| {
            let keep = listed.contains(name);
            if !keep {
                trace!(path = %self.path, child = %name, "child no longer listed");
                child.retire();
            }
            keep
        });

        for name in listed {
            if children.contains_key(&name) {
                continue;
            }
            let path = join_path(&self.path, &name);
            if !(self.shared.options.predicate)(&path) {
                trace!(%path, "child excluded");
                continue;
            }
            let child = self.spawn_child(name.clone(), None, ended_tx);
            children.insert(name, child);
        }
    }

    /// A child saw its own deletion while our listing still had it. The node
    /// may already be back, and no listing change would tell us, so check.
    async fn reprobe(
        &self,
        children: &mut HashMap<String, ChildHandle>,
        name: String,
        id: u64,
        ended_tx: &mpsc::UnboundedSender<Ended>,
    ) -> Result<()> {
        if children.get(&name).map(|child| child.id) != Some(id) {
            return Ok(());
        }
        children.remove(&name);

        let path = join_path(&self.path, &name);
        match self.shared.client.exists_and_watch(&path).await {
            Ok((Some(stat), watch)) => {
                debug!(%path, "child recreated before the next listing");
                let child = self.spawn_child(name.clone(), Some((Some(stat), watch)), ended_tx);
                children.insert(name, child);
            }
            Ok((None, _)) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn spawn_child(
        &self,
        name: String,
        probe: Option<Probe>,
        ended_tx: &mpsc::UnboundedSender<Ended>,
    ) -> ChildHandle {
        let id = self.shared.next_id();
        let token = self.token.child_token();
        let retirement = Arc::new(Retirement {
            flag: AtomicBool::new(false),
            parent: Some(self.retirement.clone()),
        });

        let node = WatchNode {
            shared: self.shared.clone(),
            id,
            path: join_path(&self.path, &name),
            root: false,
            token: token.clone(),
            retirement: retirement.clone(),
            parent: Some(ParentLink {
                tx: ended_tx.clone(),
                name,
            }),
        };
        tokio::spawn(node.run(probe));

        ChildHandle { id, token, retirement }
    }

    fn deleted(&self) {
        debug!(path = %self.path, "watched node deleted");
        self.shared.set_state(self.id, &self.path, WatchState::Deleted);
        self.shared.emit(StreamEvent::Deleted {
            path: self.path.clone(),
        });
    }

    fn report(&self) {
        if let Some(parent) = &self.parent {
            let _ = parent.tx.send((parent.name.clone(), self.id));
        }
    }

    fn abort(
        &self,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::Failed(e) if !e.is_connection_loss() => {
                debug!(path = %self.path, "watch loop failed: {}", e);
            }
            Outcome::Failed(_) | Outcome::Lost => {
                trace!(path = %self.path, "watch loop stopped by connection loss");
            }
            _ => {}
        }
        self.shared.clear_state(self.id, &self.path);
    }
}
