use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::CacheKey;
use super::CachedValue;
use super::ClientEvent;
use super::DisconnectReason;
use super::EventContext;
use super::HandlerRegistry;
use super::LifecycleEvent;
use super::ReadOp;
use super::WatchCache;
use crate::async_task::cancellable_sleep;
use crate::async_task::spawn_task;
use crate::metrics::CLIENT_CONNECTED;
use crate::metrics::CONNECT_ATTEMPTS;
use crate::metrics::LIFECYCLE_EVENTS;
use crate::metrics::SESSIONS_ESTABLISHED;
use crate::sweep_order;
use crate::validate_path;
use crate::ClientConfig;
use crate::CreateMode;
use crate::Error;
use crate::NodeStat;
use crate::ResourceError;
use crate::Result;
use crate::Session;
use crate::SessionError;
use crate::SessionFactory;
use crate::SessionState;
use crate::Watch;

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct SessionSlot {
    session: Arc<dyn Session>,
    /// Bumped on every successful connect; stale notifications and timers
    /// compare against it before acting.
    generation: u64,
}

#[derive(Default)]
struct Tasks {
    /// Parent of every background task belonging to one start/stop cycle
    run: Option<CancellationToken>,
    watchdog: Option<CancellationToken>,
}

struct ManagerInner {
    name: String,
    config: ClientConfig,
    bindings: HashMap<LifecycleEvent, String>,
    factory: Arc<dyn SessionFactory>,
    handlers: HandlerRegistry,

    current: ArcSwapOption<SessionSlot>,
    cache: WatchCache,
    events_tx: broadcast::Sender<ClientEvent>,

    running: AtomicBool,
    connected: AtomicBool,
    generation: AtomicU64,

    /// Serializes start, stop, restart and session installation
    lifecycle: tokio::sync::Mutex<()>,
    tasks: Mutex<Tasks>,
}

enum Attempt {
    Connected(Arc<dyn Session>, broadcast::Receiver<SessionState>),
    Failed,
    Cancelled,
}

/// Owns the one live session of a named client.
///
/// Connecting sweeps every combination of the configured servers, largest
/// first, until one yields a fully connected session. Later state changes of
/// that session drive reconnect/expiry handling, broadcast [`ClientEvent`]s to
/// dependent services and fire configured [`LifecycleEvent`] handlers.
///
/// Cheap to clone; clones share the same session. Call [`stop`](Self::stop)
/// to release the background tasks.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.name)
            .field("servers", &self.inner.config.servers)
            .field("running", &self.is_running())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ConnectionManager {
    /// Fails when the config is invalid or an event is bound to a handler
    /// that is not registered.
    pub fn new(
        name: impl Into<String>,
        config: ClientConfig,
        factory: Arc<dyn SessionFactory>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let bindings = config.event_bindings()?;
        for handler in bindings.values() {
            if handlers.get(handler).is_none() {
                return Err(ResourceError::Unprovided {
                    path: handler.clone(),
                    available: handlers.names(),
                }
                .into());
            }
        }

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                name: name.into(),
                config,
                bindings,
                factory,
                handlers,
                current: ArcSwapOption::empty(),
                cache: WatchCache::new(),
                events_tx,
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Tasks::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn cache(&self) -> &WatchCache {
        &self.inner.cache
    }

    /// The current session, or `NotConnected` when there is none.
    pub fn session(&self) -> Result<Arc<dyn Session>> {
        self.inner
            .current
            .load_full()
            .map(|slot| slot.session.clone())
            .ok_or(Error::Session(SessionError::NotConnected))
    }

    pub fn session_id(&self) -> Option<i64> {
        self.inner.current.load_full().map(|slot| slot.session.id())
    }

    //---------------------------------------------------------------
    // Lifecycle

    /// Begins connecting in the background and returns immediately.
    pub async fn start(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.start_locked();
    }

    /// Cancels any connect attempt, closes the current session and clears
    /// the cache. Subscribers see `Disconnected(Stopping)` even when no
    /// session was ever connected.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_locked().await;
    }

    /// Drops the current session and reconnects from a fresh sweep.
    pub async fn restart(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_locked().await;
        self.start_locked();
    }

    pub async fn wait_connected(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        let mut rx = self.subscribe();
        if self.is_connected() {
            return Ok(());
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(ClientEvent::Connected) => return Ok(()),
                    Ok(ClientEvent::Disconnected(_)) | Err(RecvError::Lagged(_)) => {
                        if self.is_connected() {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => return Err(Error::Session(SessionError::NotConnected)),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Session(SessionError::ConnectTimeout))?
    }

    fn start_locked(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client = %self.inner.name, "starting");
        self.dispatch(LifecycleEvent::Starting);

        let run = CancellationToken::new();
        let connecting = run.child_token();
        self.inner.tasks.lock().run = Some(run);

        let manager = self.clone();
        tokio::spawn(async move { manager.connect_loop(connecting).await });
    }

    async fn stop_locked(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(client = %self.inner.name, "stopping");
        self.dispatch(LifecycleEvent::Stopping);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        if let Some(run) = tasks.run {
            run.cancel();
        }

        if let Some(slot) = self.inner.current.swap(None) {
            close_quietly(slot.session.as_ref()).await;
        }
        self.set_connected(false);
        self.inner.cache.clear();
        self.notify(ClientEvent::Disconnected(DisconnectReason::Stopping));
    }

    //---------------------------------------------------------------
    // Reconnection sweep

    async fn connect_loop(
        self,
        token: CancellationToken,
    ) {
        let policy = self.inner.config.reconnect;
        loop {
            for servers in sweep_order(&self.inner.config.servers) {
                if token.is_cancelled() {
                    return;
                }
                info!(client = %self.inner.name, %servers, "trying to connect");
                match self.try_connect(&servers, &token).await {
                    Attempt::Connected(session, state_rx) => {
                        self.established(session, state_rx, token).await;
                        return;
                    }
                    Attempt::Cancelled => return,
                    Attempt::Failed => continue,
                }
            }

            info!(
                client = %self.inner.name,
                "exhausted server list combinations, retrying after {:?}",
                policy.sweep_retry_delay()
            );
            if !cancellable_sleep(policy.sweep_retry_delay(), &token).await {
                return;
            }
        }
    }

    async fn try_connect(
        &self,
        servers: &str,
        token: &CancellationToken,
    ) -> Attempt {
        let policy = self.inner.config.reconnect;
        let session = self
            .inner
            .factory
            .create(servers, self.inner.config.session_timeout());
        let state_rx = session.subscribe_state();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                close_quietly(session.as_ref()).await;
                return Attempt::Cancelled;
            }
            result = session.connect(self.inner.config.connect_timeout()) => result,
        };

        match result {
            Ok(()) if session.state() == SessionState::Connected => {
                self.count_attempt("connected");
                Attempt::Connected(session, state_rx)
            }
            Ok(()) => {
                self.count_attempt("unsettled");
                info!(
                    client = %self.inner.name,
                    %servers,
                    "session was unable to reach the connected state, was in {}",
                    session.state()
                );
                close_quietly(session.as_ref()).await;
                if cancellable_sleep(policy.unsettled_backoff(), token).await {
                    Attempt::Failed
                } else {
                    Attempt::Cancelled
                }
            }
            Err(SessionError::ConnectTimeout) => {
                self.count_attempt("timeout");
                warn!(client = %self.inner.name, %servers, "connection timeout reached");
                close_quietly(session.as_ref()).await;
                Attempt::Failed
            }
            Err(e) if !session.has_handle() => {
                self.count_attempt("invalid");
                warn!(
                    client = %self.inner.name,
                    %servers,
                    "one of the servers in the list might be invalid: {}",
                    e
                );
                Attempt::Failed
            }
            Err(e) => {
                self.count_attempt("error");
                warn!(client = %self.inner.name, %servers, "cannot connect: {}", e);
                close_quietly(session.as_ref()).await;
                if policy.failure_yield().is_zero() {
                    tokio::task::yield_now().await;
                } else if !cancellable_sleep(policy.failure_yield(), token).await {
                    return Attempt::Cancelled;
                }
                Attempt::Failed
            }
        }
    }

    /// Installs a freshly connected session as current.
    async fn established(
        &self,
        session: Arc<dyn Session>,
        state_rx: broadcast::Receiver<SessionState>,
        token: CancellationToken,
    ) {
        let _guard = self.inner.lifecycle.lock().await;
        if token.is_cancelled() {
            close_quietly(session.as_ref()).await;
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.cache.clear();
        self.inner.current.store(Some(Arc::new(SessionSlot {
            session: session.clone(),
            generation,
        })));
        self.set_connected(true);
        SESSIONS_ESTABLISHED.with_label_values(&[&self.inner.name]).inc();
        info!(
            client = %self.inner.name,
            servers = %session.servers(),
            session_id = session.id(),
            "connected to coordination ensemble"
        );

        self.spawn_state_listener(session, state_rx, generation, token);
        self.notify(ClientEvent::Connected);
        self.dispatch(LifecycleEvent::Connected);
    }

    //---------------------------------------------------------------
    // Session state handling

    fn spawn_state_listener(
        &self,
        session: Arc<dyn Session>,
        mut state_rx: broadcast::Receiver<SessionState>,
        generation: u64,
        token: CancellationToken,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let state = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    state = state_rx.recv() => state,
                };
                let state = match state {
                    Ok(state) => state,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(client = %manager.inner.name, skipped, "missed session state notifications");
                        session.state()
                    }
                    Err(RecvError::Closed) => return,
                };

                manager.on_session_state(&session, generation, state).await;
                if matches!(state, SessionState::Expired | SessionState::Closed) {
                    return;
                }
            }
        });
    }

    async fn on_session_state(
        &self,
        session: &Arc<dyn Session>,
        generation: u64,
        state: SessionState,
    ) {
        if !self.is_current(generation) {
            if state == SessionState::Connected {
                close_quietly(session.as_ref()).await;
            }
            return;
        }
        debug!(client = %self.inner.name, %state, "session state changed");

        match state {
            SessionState::Connected => {
                if self.inner.connected.load(Ordering::SeqCst) {
                    return;
                }
                self.cancel_watchdog();
                self.inner.cache.clear();
                self.set_connected(true);
                self.notify(ClientEvent::Connected);
                self.dispatch(LifecycleEvent::Reconnected);
            }
            SessionState::Connecting => {
                if !self.inner.connected.load(Ordering::SeqCst) {
                    return;
                }
                self.set_connected(false);
                self.inner.cache.clear();
                self.spawn_watchdog(generation);
                self.notify(ClientEvent::Disconnected(DisconnectReason::Reconnecting));
                self.dispatch(LifecycleEvent::Reconnecting);

                if !self.inner.config.reuse_session {
                    info!(
                        client = %self.inner.name,
                        "reconnecting with a new session in order to avoid reusing sessions"
                    );
                    self.spawn_restart(generation, "session reuse disabled");
                }
            }
            SessionState::Expired => {
                self.set_connected(false);
                self.inner.cache.clear();
                self.notify(ClientEvent::Disconnected(DisconnectReason::Expired));
                self.dispatch(LifecycleEvent::Expired);
                self.spawn_restart(generation, "session expired");
            }
            SessionState::Closed => {
                warn!(client = %self.inner.name, "current session was closed underneath us");
                self.spawn_restart(generation, "session closed");
            }
        }
    }

    /// Forces a restart if the session is still stuck connecting once the
    /// reconnect timeout has passed.
    fn spawn_watchdog(
        &self,
        generation: u64,
    ) {
        let token = {
            let mut tasks = self.inner.tasks.lock();
            let Some(run) = tasks.run.as_ref() else {
                return;
            };
            let token = run.child_token();
            if let Some(previous) = tasks.watchdog.replace(token.clone()) {
                previous.cancel();
            }
            token
        };

        let manager = self.clone();
        let timeout = self.inner.config.reconnect_timeout();
        tokio::spawn(async move {
            if !cancellable_sleep(timeout, &token).await {
                return;
            }
            let still_connecting = manager
                .inner
                .current
                .load_full()
                .map(|slot| slot.generation == generation && slot.session.state() != SessionState::Connected)
                .unwrap_or(false);
            if still_connecting {
                info!(
                    client = %manager.inner.name,
                    "stuck in the connecting state for too long, restarting"
                );
                manager.restart_if_current(generation, "reconnect timeout").await;
            }
        });
    }

    fn cancel_watchdog(&self) {
        if let Some(token) = self.inner.tasks.lock().watchdog.take() {
            token.cancel();
        }
    }

    fn spawn_restart(
        &self,
        generation: u64,
        reason: &'static str,
    ) {
        let manager = self.clone();
        tokio::spawn(async move { manager.restart_if_current(generation, reason).await });
    }

    async fn restart_if_current(
        &self,
        generation: u64,
        reason: &str,
    ) {
        let _guard = self.inner.lifecycle.lock().await;
        if !self.is_running() || !self.is_current(generation) {
            trace!(client = %self.inner.name, reason, "skipping restart of superseded session");
            return;
        }
        info!(client = %self.inner.name, reason, "restarting");
        self.stop_locked().await;
        self.start_locked();
    }

    fn is_current(
        &self,
        generation: u64,
    ) -> bool {
        self.inner
            .current
            .load_full()
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    //---------------------------------------------------------------
    // Notifications

    fn set_connected(
        &self,
        connected: bool,
    ) {
        self.inner.connected.store(connected, Ordering::SeqCst);
        CLIENT_CONNECTED
            .with_label_values(&[&self.inner.name])
            .set(connected as i64);
    }

    fn count_attempt(
        &self,
        outcome: &str,
    ) {
        CONNECT_ATTEMPTS
            .with_label_values(&[&self.inner.name, outcome])
            .inc();
    }

    fn notify(
        &self,
        event: ClientEvent,
    ) {
        // no subscribers is fine
        let _ = self.inner.events_tx.send(event);
    }

    /// Runs the handler bound to `event`, if any, in the background.
    fn dispatch(
        &self,
        event: LifecycleEvent,
    ) {
        LIFECYCLE_EVENTS
            .with_label_values(&[&self.inner.name, event.as_str()])
            .inc();

        let Some(handler_name) = self.inner.bindings.get(&event).cloned() else {
            return;
        };
        let Some(handler) = self.inner.handlers.get(&handler_name) else {
            debug!(client = %self.inner.name, %event, handler = %handler_name, "no handler registered");
            return;
        };

        let ctx = EventContext {
            event,
            client: self.clone(),
        };
        spawn_task("lifecycle-handler", async move {
            handler.handle(ctx).await.map_err(|e| Error::Handler {
                handler: handler_name,
                message: e.to_string(),
            })
        });
    }

    //---------------------------------------------------------------
    // Cached reads

    async fn cached(
        &self,
        op: ReadOp,
        path: &str,
    ) -> Result<CachedValue> {
        validate_path(path)?;
        let session = self.session()?;
        Ok(self.inner.cache.read(session, CacheKey::new(op, path)).await?)
    }

    pub async fn exists(
        &self,
        path: &str,
    ) -> Result<Option<NodeStat>> {
        match self.cached(ReadOp::Exists, path).await? {
            CachedValue::Exists(stat) => Ok(stat),
            other => Err(unexpected(ReadOp::Exists, other)),
        }
    }

    pub async fn get(
        &self,
        path: &str,
    ) -> Result<(Bytes, NodeStat)> {
        match self.cached(ReadOp::Get, path).await? {
            CachedValue::Data(data, stat) => Ok((data, stat)),
            other => Err(unexpected(ReadOp::Get, other)),
        }
    }

    pub async fn get_children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        match self.cached(ReadOp::GetChildren, path).await? {
            CachedValue::Children(children) => Ok(children),
            other => Err(unexpected(ReadOp::GetChildren, other)),
        }
    }

    //---------------------------------------------------------------
    // Raw watched reads, bypassing the cache

    pub async fn exists_and_watch(
        &self,
        path: &str,
    ) -> Result<(Option<NodeStat>, Watch)> {
        Ok(self.session()?.exists(path).await?)
    }

    pub async fn get_and_watch(
        &self,
        path: &str,
    ) -> Result<(Bytes, NodeStat, Watch)> {
        Ok(self.session()?.get(path).await?)
    }

    pub async fn get_children_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch)> {
        Ok(self.session()?.get_children(path).await?)
    }

    //---------------------------------------------------------------
    // Writes

    pub async fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> Result<String> {
        Ok(self.session()?.create(path, data.into(), mode).await?)
    }

    pub async fn set(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        version: Option<i32>,
    ) -> Result<NodeStat> {
        Ok(self.session()?.set(path, data.into(), version).await?)
    }

    pub async fn delete(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> Result<()> {
        Ok(self.session()?.delete(path, version).await?)
    }

    /// Creates `path` and any missing ancestors as empty persistent nodes.
    pub async fn ensure_path(
        &self,
        path: &str,
    ) -> Result<()> {
        validate_path(path)?;
        let mut current = String::with_capacity(path.len());
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.create(&current, Bytes::new(), CreateMode::Persistent).await {
                Ok(_) => {}
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

async fn close_quietly(session: &dyn Session) {
    if let Err(e) = session.close().await {
        trace!("ignoring error while closing session: {}", e);
    }
}

fn unexpected(
    op: ReadOp,
    value: CachedValue,
) -> Error {
    Error::Fatal(format!("cached {} read produced {:?}", op.as_str(), value))
}
