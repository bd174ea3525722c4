use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DistributedLock;
use crate::async_task::cancellable_sleep;
use crate::metrics::LOCK_TRANSITIONS;
use crate::ClientEvent;
use crate::ConnectionManager;
use crate::Error;
use crate::LockError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unacquired,
    Acquiring,
    Acquired,
    Released,
}

struct Attempt {
    lock: Arc<DistributedLock>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct LockInner {
    client: ConnectionManager,
    path: String,
    state_tx: watch::Sender<LockState>,
    stopped: AtomicBool,
    attempt: Mutex<Option<Attempt>>,
    /// Nodes that could not be deleted while disconnected
    stale: Mutex<Vec<String>>,
    listener: CancellationToken,
}

/// Holds the lock at `path` whenever the client is connected.
///
/// Acquisition starts right away if the client is already connected and again
/// on every reconnect; any disconnect releases the lock.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockInner>,
}

impl fmt::Debug for LockService {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("LockService")
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}

impl LockService {
    pub fn new(
        client: ConnectionManager,
        path: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        // validates the path up front
        DistributedLock::new(client.clone(), path.clone())?;

        let (state_tx, _) = watch::channel(LockState::Unacquired);
        let service = Self {
            inner: Arc::new(LockInner {
                client,
                path,
                state_tx,
                stopped: AtomicBool::new(false),
                attempt: Mutex::new(None),
                stale: Mutex::new(Vec::new()),
                listener: CancellationToken::new(),
            }),
        };

        service.spawn_listener();
        if service.inner.client.is_connected() {
            service.begin_acquire();
        }
        Ok(service)
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn state(&self) -> LockState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_acquired(&self) -> bool {
        self.state() == LockState::Acquired
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.inner.state_tx.subscribe()
    }

    pub async fn wait_acquired(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        let mut rx = self.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|state| *state == LockState::Acquired)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(LockError::NotHeld(self.inner.path.clone()).into()),
        };
        result
    }

    /// Stops contending for good and releases the lock if held.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.listener.cancel();
        self.abandon().await;
        self.inner.state_tx.send_replace(LockState::Released);
    }

    fn spawn_listener(&self) {
        let weak: Weak<LockInner> = Arc::downgrade(&self.inner);
        let token = self.inner.listener.clone();
        let mut events = self.inner.client.subscribe();
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
                let service = LockService { inner };
                match event {
                    Ok(ClientEvent::Connected) => service.begin_acquire(),
                    Ok(ClientEvent::Disconnected(_)) => service.abandon().await,
                    Err(RecvError::Lagged(_)) => {
                        if service.inner.client.is_connected() {
                            service.begin_acquire();
                        } else {
                            service.abandon().await;
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    fn begin_acquire(&self) {
        let mut attempt = self.inner.attempt.lock();
        if self.inner.stopped.load(Ordering::SeqCst) || attempt.is_some() {
            return;
        }
        let lock = match DistributedLock::new(self.inner.client.clone(), self.inner.path.clone()) {
            Ok(lock) => Arc::new(lock),
            Err(e) => {
                warn!(path = %self.inner.path, "cannot create lock: {}", e);
                return;
            }
        };
        let cancel = CancellationToken::new();

        self.inner.state_tx.send_replace(LockState::Acquiring);
        info!(path = %self.inner.path, "trying to acquire lock");

        let service = self.clone();
        let task = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                service.clear_stale().await;
                match lock.acquire(&cancel).await {
                    Ok(()) => service.acquired(&lock).await,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => service.failed(&lock, e),
                }
            })
        };
        *attempt = Some(Attempt { lock, cancel, task });
    }

    fn failed(
        &self,
        lock: &Arc<DistributedLock>,
        error: Error,
    ) {
        warn!(path = %self.inner.path, "lock acquisition failed: {}", error);
        if let Some(node) = lock.node() {
            self.inner.stale.lock().push(node);
        }
        let mut attempt = self.inner.attempt.lock();
        if attempt.as_ref().is_some_and(|a| Arc::ptr_eq(&a.lock, lock)) {
            *attempt = None;
            self.inner.state_tx.send_replace(LockState::Unacquired);
            drop(attempt);
            self.retry_later();
        }
    }

    /// Contends again after the client's retry delay if it is still
    /// connected by then. A disconnect in between leaves it to the next
    /// Connected event.
    fn retry_later(&self) {
        let delay = self.inner.client.config().reconnect.sweep_retry_delay();
        let weak: Weak<LockInner> = Arc::downgrade(&self.inner);
        let token = self.inner.listener.clone();
        tokio::spawn(async move {
            if !cancellable_sleep(delay, &token).await {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = LockService { inner };
            if service.inner.client.is_connected() {
                debug!(path = %service.inner.path, "retrying lock acquisition");
                service.begin_acquire();
            }
        });
    }

    async fn acquired(
        &self,
        lock: &Arc<DistributedLock>,
    ) {
        let current = self
            .inner
            .attempt
            .lock()
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.lock, lock));
        if !current {
            // abandoned while the final check was in flight
            lock.release_quietly().await;
            return;
        }
        info!(path = %self.inner.path, node = ?lock.node(), "lock acquired");
        LOCK_TRANSITIONS
            .with_label_values(&[&self.inner.path, "acquired"])
            .inc();
        self.inner.state_tx.send_replace(LockState::Acquired);
    }

    /// Cancels the current attempt and releases whatever it holds.
    async fn abandon(&self) {
        let Some(attempt) = self.inner.attempt.lock().take() else {
            return;
        };
        attempt.cancel.cancel();
        // the attempt cleans up after itself first
        let _ = attempt.task.await;

        let held = self.state() == LockState::Acquired;
        if let Some(node) = attempt.lock.release_quietly().await {
            debug!(path = %self.inner.path, %node, "lock node left behind, removing after reconnect");
            self.inner.stale.lock().push(node);
        }

        if held {
            info!(path = %self.inner.path, "lock released");
            LOCK_TRANSITIONS
                .with_label_values(&[&self.inner.path, "released"])
                .inc();
            self.inner.state_tx.send_replace(LockState::Released);
        } else {
            self.inner.state_tx.send_replace(LockState::Unacquired);
        }
    }

    async fn clear_stale(&self) {
        let stale = std::mem::take(&mut *self.inner.stale.lock());
        for node in stale {
            match self.inner.client.delete(&node, None).await {
                Ok(()) => debug!(%node, "removed stale lock node"),
                Err(e) if e.is_no_node() => {}
                Err(e) => {
                    debug!(%node, "could not remove stale lock node: {}", e);
                    self.inner.stale.lock().push(node);
                }
            }
        }
    }
}
