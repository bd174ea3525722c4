use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::trace;

use super::MemSession;
use crate::join_path;
use crate::node_name;
use crate::parent_path;
use crate::validate_path;
use crate::CreateMode;
use crate::NodeStat;
use crate::Session;
use crate::SessionError;
use crate::SessionFactory;
use crate::SessionResult;
use crate::SessionState;
use crate::Watch;
use crate::WatchEvent;
use crate::WatchEventKind;
use crate::WatchTrigger;

/// How a server in the ensemble answers connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Accepts sessions
    Up,
    /// Never answers: connecting to a list of only `Down` servers times out
    Down,
    /// Unresolvable; any list containing it fails without producing a handle
    Invalid,
    /// Hands out a handle, then refuses the connection
    Refusing,
    /// Hands out a handle but leaves the session stuck in `Connecting`
    Unsettled,
}

#[derive(Debug)]
struct MemNode {
    data: Bytes,
    stat: NodeStat,
    next_sequence: u64,
}

#[derive(Debug, Default)]
struct WatchRegistry {
    exists: HashMap<String, Vec<(i64, WatchTrigger)>>,
    data: HashMap<String, Vec<(i64, WatchTrigger)>>,
    children: HashMap<String, Vec<(i64, WatchTrigger)>>,
}

#[derive(Debug)]
struct TreeState {
    nodes: BTreeMap<String, MemNode>,
    zxid: i64,
    watches: WatchRegistry,
}

/// Per-session bookkeeping shared between the ensemble and the client handle.
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) id: i64,
    pub(crate) servers: String,
    state: Mutex<SessionState>,
    state_tx: broadcast::Sender<SessionState>,
}

impl SessionShared {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(
        &self,
        next: SessionState,
    ) -> bool {
        let mut state = self.state.lock();
        if *state == next || matches!(*state, SessionState::Expired | SessionState::Closed) {
            return false;
        }
        *state = next;
        drop(state);
        let _ = self.state_tx.send(next);
        true
    }
}

#[derive(Debug)]
struct EnsembleInner {
    tree: Mutex<TreeState>,
    servers: DashMap<String, ServerStatus>,
    sessions: DashMap<i64, Arc<SessionShared>>,
    calls: DashMap<(&'static str, String), u64>,
    connect_attempts: Mutex<Vec<String>>,
    read_latency: Mutex<Option<Duration>>,
    next_session_id: AtomicI64,
}

/// In-process coordination ensemble.
///
/// Holds one node tree shared by every [`MemSession`] it hands out, arms and
/// fires one-shot watches the way a real ensemble does, and exposes fault
/// injection hooks (server reachability, disconnects, expiry) for exercising
/// the client's recovery paths.
#[derive(Debug, Clone)]
pub struct MemEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MemEnsemble {
    /// Creates an ensemble where every listed server is [`ServerStatus::Up`].
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            MemNode {
                data: Bytes::new(),
                stat: NodeStat::default(),
                next_sequence: 0,
            },
        );

        let ensemble = Self {
            inner: Arc::new(EnsembleInner {
                tree: Mutex::new(TreeState {
                    nodes,
                    zxid: 0,
                    watches: WatchRegistry::default(),
                }),
                servers: DashMap::new(),
                sessions: DashMap::new(),
                calls: DashMap::new(),
                connect_attempts: Mutex::new(Vec::new()),
                read_latency: Mutex::new(None),
                next_session_id: AtomicI64::new(rand::random::<u16>() as i64 + 1),
            }),
        };
        for server in servers {
            ensemble.inner.servers.insert(server.into(), ServerStatus::Up);
        }
        ensemble
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        Arc::new(MemSessionFactory {
            ensemble: self.clone(),
        })
    }

    pub fn set_server_status(
        &self,
        server: &str,
        status: ServerStatus,
    ) {
        self.inner.servers.insert(server.to_string(), status);
    }

    /// Status of a server; servers the ensemble never heard of are `Invalid`.
    pub fn server_status(
        &self,
        server: &str,
    ) -> ServerStatus {
        self.inner
            .servers
            .get(server)
            .map(|s| *s.value())
            .unwrap_or(ServerStatus::Invalid)
    }

    /// Artificial latency applied to every read, to widen race windows.
    pub fn set_read_latency(
        &self,
        latency: Option<Duration>,
    ) {
        *self.inner.read_latency.lock() = latency;
    }

    /// Number of times `op` ("exists", "get", "get_children", "create",
    /// "set", "delete") reached the ensemble for `path`.
    pub fn call_count(
        &self,
        op: &'static str,
        path: &str,
    ) -> u64 {
        self.inner
            .calls
            .get(&(op, path.to_string()))
            .map(|c| *c.value())
            .unwrap_or(0)
    }

    /// Server strings of every connect attempt, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.inner.connect_attempts.lock().clone()
    }

    /// Ids of sessions that are neither expired nor closed.
    pub fn live_sessions(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .inner
            .sessions
            .iter()
            .filter(|s| !matches!(s.state(), SessionState::Expired | SessionState::Closed))
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn session_state(
        &self,
        session_id: i64,
    ) -> Option<SessionState> {
        self.inner.sessions.get(&session_id).map(|s| s.state())
    }

    /// Simulates lost contact: the session drops to `Connecting`, keeping its
    /// watches and ephemeral nodes.
    pub fn disconnect_session(
        &self,
        session_id: i64,
    ) {
        if let Some(shared) = self.shared(session_id) {
            shared.transition(SessionState::Connecting);
        }
    }

    /// Restores contact for a session previously disconnected.
    pub fn reconnect_session(
        &self,
        session_id: i64,
    ) {
        if let Some(shared) = self.shared(session_id) {
            shared.transition(SessionState::Connected);
        }
    }

    /// Expires a session: its ephemeral nodes vanish and its watches are lost.
    pub fn expire_session(
        &self,
        session_id: i64,
    ) {
        if let Some(shared) = self.shared(session_id) {
            debug!(session_id, "expiring session");
            self.end_session(&shared);
            shared.transition(SessionState::Expired);
        }
    }

    fn shared(
        &self,
        session_id: i64,
    ) -> Option<Arc<SessionShared>> {
        self.inner.sessions.get(&session_id).map(|s| s.value().clone())
    }

    //---------------------------------------------------------------
    // Session side

    pub(crate) fn record_connect_attempt(
        &self,
        servers: &str,
    ) {
        self.inner.connect_attempts.lock().push(servers.to_string());
    }

    pub(crate) fn open_session(
        &self,
        servers: &str,
        state_tx: broadcast::Sender<SessionState>,
        initial: SessionState,
    ) -> Arc<SessionShared> {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(SessionShared {
            id,
            servers: servers.to_string(),
            state: Mutex::new(initial),
            state_tx,
        });
        self.inner.sessions.insert(id, shared.clone());
        shared
    }

    pub(crate) fn close_session(
        &self,
        shared: &Arc<SessionShared>,
    ) {
        self.end_session(shared);
        shared.transition(SessionState::Closed);
    }

    /// Removes the session's ephemeral nodes and drops its pending watches.
    fn end_session(
        &self,
        shared: &Arc<SessionShared>,
    ) {
        let mut tree = self.inner.tree.lock();
        let ephemerals: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == shared.id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            trace!(%path, session_id = shared.id, "removing ephemeral node");
            Self::remove_node(&mut tree, &path);
        }

        let watches = &mut tree.watches;
        for registry in [&mut watches.exists, &mut watches.data, &mut watches.children] {
            for triggers in registry.values_mut() {
                triggers.retain(|(owner, _)| *owner != shared.id);
            }
        }
    }

    fn count_call(
        &self,
        op: &'static str,
        path: &str,
    ) {
        *self.inner.calls.entry((op, path.to_string())).or_insert(0) += 1;
    }

    async fn read_delay(&self) {
        let latency = *self.inner.read_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub(crate) async fn exists(
        &self,
        session_id: i64,
        path: &str,
    ) -> SessionResult<(Option<NodeStat>, Watch)> {
        validate_path(path)?;
        self.count_call("exists", path);
        self.read_delay().await;

        let mut tree = self.inner.tree.lock();
        let stat = tree.nodes.get(path).map(|n| n.stat);
        let (trigger, watch) = Watch::channel(path);
        tree.watches
            .exists
            .entry(path.to_string())
            .or_default()
            .push((session_id, trigger));
        Ok((stat, watch))
    }

    pub(crate) async fn get(
        &self,
        session_id: i64,
        path: &str,
    ) -> SessionResult<(Bytes, NodeStat, Watch)> {
        validate_path(path)?;
        self.count_call("get", path);
        self.read_delay().await;

        let mut tree = self.inner.tree.lock();
        let (data, stat) = match tree.nodes.get(path) {
            Some(node) => (node.data.clone(), node.stat),
            None => return Err(SessionError::NoSuchNode(path.to_string())),
        };
        let (trigger, watch) = Watch::channel(path);
        tree.watches
            .data
            .entry(path.to_string())
            .or_default()
            .push((session_id, trigger));
        Ok((data, stat, watch))
    }

    pub(crate) async fn get_children(
        &self,
        session_id: i64,
        path: &str,
    ) -> SessionResult<(Vec<String>, Watch)> {
        validate_path(path)?;
        self.count_call("get_children", path);
        self.read_delay().await;

        let mut tree = self.inner.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(SessionError::NoSuchNode(path.to_string()));
        }
        let children = Self::children_of(&tree, path);
        let (trigger, watch) = Watch::channel(path);
        tree.watches
            .children
            .entry(path.to_string())
            .or_default()
            .push((session_id, trigger));
        Ok((children, watch))
    }

    pub(crate) fn create(
        &self,
        session_id: i64,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> SessionResult<String> {
        validate_path(path)?;
        self.count_call("create", path);

        let parent = parent_path(path).ok_or_else(|| SessionError::NodeExists(path.to_string()))?;
        let mut tree = self.inner.tree.lock();

        let actual = {
            let parent_node = tree
                .nodes
                .get_mut(parent)
                .ok_or_else(|| SessionError::NoSuchNode(parent.to_string()))?;
            if mode.is_sequential() {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{}{:010}", path, seq)
            } else {
                path.to_string()
            }
        };
        if tree.nodes.contains_key(&actual) {
            return Err(SessionError::NodeExists(actual));
        }

        tree.zxid += 1;
        let zxid = tree.zxid;
        let stat = NodeStat {
            czxid: zxid,
            mzxid: zxid,
            version: 0,
            cversion: 0,
            ephemeral_owner: if mode.is_ephemeral() { session_id } else { 0 },
            data_length: data.len() as i32,
            num_children: 0,
        };
        tree.nodes.insert(
            actual.clone(),
            MemNode {
                data,
                stat,
                next_sequence: 0,
            },
        );
        if let Some(parent_node) = tree.nodes.get_mut(parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children += 1;
        }

        trace!(path = %actual, ?mode, "node created");
        Self::fire(&mut tree.watches.exists, &actual, WatchEventKind::Created);
        Self::fire(&mut tree.watches.children, parent, WatchEventKind::ChildrenChanged);
        Ok(actual)
    }

    pub(crate) fn set(
        &self,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> SessionResult<NodeStat> {
        validate_path(path)?;
        self.count_call("set", path);

        let mut tree = self.inner.tree.lock();
        tree.zxid += 1;
        let zxid = tree.zxid;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| SessionError::NoSuchNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(SessionError::BadVersion(path.to_string()));
            }
        }
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.data_length = data.len() as i32;
        node.data = data;
        let stat = node.stat;

        Self::fire(&mut tree.watches.exists, path, WatchEventKind::DataChanged);
        Self::fire(&mut tree.watches.data, path, WatchEventKind::DataChanged);
        Ok(stat)
    }

    pub(crate) fn delete(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> SessionResult<()> {
        validate_path(path)?;
        self.count_call("delete", path);

        let mut tree = self.inner.tree.lock();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| SessionError::NoSuchNode(path.to_string()))?;
        if path == "/" || node.stat.num_children > 0 {
            return Err(SessionError::NotEmpty(path.to_string()));
        }
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(SessionError::BadVersion(path.to_string()));
            }
        }
        Self::remove_node(&mut tree, path);
        Ok(())
    }

    fn remove_node(
        tree: &mut TreeState,
        path: &str,
    ) {
        if tree.nodes.remove(path).is_none() {
            return;
        }
        tree.zxid += 1;
        let parent = parent_path(path).unwrap_or("/");
        if let Some(parent_node) = tree.nodes.get_mut(parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children -= 1;
        }

        trace!(%path, "node deleted");
        Self::fire(&mut tree.watches.exists, path, WatchEventKind::Deleted);
        Self::fire(&mut tree.watches.data, path, WatchEventKind::Deleted);
        Self::fire(&mut tree.watches.children, path, WatchEventKind::Deleted);
        Self::fire(&mut tree.watches.children, parent, WatchEventKind::ChildrenChanged);
    }

    fn children_of(
        tree: &TreeState,
        path: &str,
    ) -> Vec<String> {
        let prefix = join_path(path, "");
        tree.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
            .map(|(p, _)| node_name(p).to_string())
            .collect()
    }

    fn fire(
        registry: &mut HashMap<String, Vec<(i64, WatchTrigger)>>,
        path: &str,
        kind: WatchEventKind,
    ) {
        if let Some(triggers) = registry.remove(path) {
            for (_, trigger) in triggers {
                trigger.fire(WatchEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
    }
}

/// [`SessionFactory`] producing sessions against a [`MemEnsemble`].
#[derive(Debug, Clone)]
pub struct MemSessionFactory {
    ensemble: MemEnsemble,
}

impl MemSessionFactory {
    pub fn new(ensemble: MemEnsemble) -> Self {
        Self { ensemble }
    }
}

impl SessionFactory for MemSessionFactory {
    fn create(
        &self,
        servers: &str,
        session_timeout: Option<Duration>,
    ) -> Arc<dyn Session> {
        Arc::new(MemSession::new(self.ensemble.clone(), servers, session_timeout))
    }
}
