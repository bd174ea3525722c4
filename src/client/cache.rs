use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::metrics::CACHE_INVALIDATIONS;
use crate::metrics::CACHE_LOOKUPS;
use crate::NodeStat;
use crate::Session;
use crate::SessionError;
use crate::SessionResult;
use crate::Watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadOp {
    Exists,
    Get,
    GetChildren,
}

impl ReadOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadOp::Exists => "exists",
            ReadOp::Get => "get",
            ReadOp::GetChildren => "get_children",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub op: ReadOp,
    pub path: String,
}

impl CacheKey {
    pub fn new(
        op: ReadOp,
        path: impl Into<String>,
    ) -> Self {
        Self { op, path: path.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Exists(Option<NodeStat>),
    Data(Bytes, NodeStat),
    Children(Vec<String>),
}

type Waiter = oneshot::Sender<SessionResult<CachedValue>>;

#[derive(Debug)]
enum Slot {
    Ready {
        call_id: u64,
        value: CachedValue,
    },
    Pending {
        call_id: u64,
        waiters: Vec<Waiter>,
        /// Set when the call's watch was observed before the result arrived;
        /// the result is then handed out but not kept, and later readers
        /// start a call of their own.
        invalidated: bool,
    },
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    /// Waiters of calls whose slot was dropped or replaced while in flight,
    /// by call id. Lock after `slots` when both are needed.
    detached: Mutex<HashMap<u64, Vec<Waiter>>>,
    next_call_id: AtomicU64,
}

/// Read-through cache over the current session's watched reads.
///
/// A key holds either a ready value or one in-flight call, never both, so
/// concurrent readers of a key share a single round trip. Every cached value
/// is dropped as soon as the watch armed by the read that produced it fires.
#[derive(Debug, Clone, Default)]
pub struct WatchCache {
    inner: Arc<CacheInner>,
}

impl WatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(
        &self,
        session: Arc<dyn Session>,
        key: CacheKey,
    ) -> SessionResult<CachedValue> {
        let rx = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&key) {
                Some(Slot::Ready { value, .. }) => {
                    CACHE_LOOKUPS.with_label_values(&[key.op.as_str(), "hit"]).inc();
                    return Ok(value.clone());
                }
                Some(Slot::Pending {
                    waiters,
                    invalidated: false,
                    ..
                }) => {
                    CACHE_LOOKUPS.with_label_values(&[key.op.as_str(), "coalesced"]).inc();
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                // absent, or an in-flight call already known to be stale
                _ => {
                    CACHE_LOOKUPS.with_label_values(&[key.op.as_str(), "miss"]).inc();
                    let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    let replaced = slots.insert(
                        key.clone(),
                        Slot::Pending {
                            call_id,
                            waiters: vec![tx],
                            invalidated: false,
                        },
                    );
                    if let Some(Slot::Pending {
                        call_id: stale,
                        waiters,
                        ..
                    }) = replaced
                    {
                        self.inner.detached.lock().insert(stale, waiters);
                    }
                    self.spawn_fetch(session, key, call_id);
                    rx
                }
            }
        };

        rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Drops every entry. In-flight calls still answer the readers already
    /// waiting on them, but their results are not kept and nobody new joins
    /// them.
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock();
        let mut detached = self.inner.detached.lock();
        for (_, slot) in slots.drain() {
            if let Slot::Pending { call_id, waiters, .. } = slot {
                detached.insert(call_id, waiters);
            }
        }
    }

    pub fn is_cached(
        &self,
        key: &CacheKey,
    ) -> bool {
        matches!(self.inner.slots.lock().get(key), Some(Slot::Ready { .. }))
    }

    pub fn is_pending(
        &self,
        key: &CacheKey,
    ) -> bool {
        matches!(self.inner.slots.lock().get(key), Some(Slot::Pending { .. }))
    }

    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_fetch(
        &self,
        session: Arc<dyn Session>,
        key: CacheKey,
        call_id: u64,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            match fetch(session.as_ref(), &key).await {
                Ok((value, mut watch)) => {
                    if (&mut watch).now_or_never().is_some() {
                        // fired (or lost) before the result landed: hand it
                        // out, never keep it
                        cache.invalidate(&key, call_id);
                    } else {
                        cache.spawn_invalidation(key.clone(), call_id, watch);
                    }
                    cache.complete(&key, call_id, Ok(value));
                }
                Err(e) => cache.complete(&key, call_id, Err(e)),
            }
        });
    }

    fn spawn_invalidation(
        &self,
        key: CacheKey,
        call_id: u64,
        watch: Watch,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            // a lost watch means the session is gone; the value is just as stale
            let _ = watch.await;
            cache.invalidate(&key, call_id);
        });
    }

    fn invalidate(
        &self,
        key: &CacheKey,
        call_id: u64,
    ) {
        let mut slots = self.inner.slots.lock();
        let remove = match slots.get_mut(key) {
            Some(Slot::Ready { call_id: id, .. }) if *id == call_id => true,
            Some(Slot::Pending {
                call_id: id,
                invalidated,
                ..
            }) if *id == call_id => {
                *invalidated = true;
                false
            }
            _ => return,
        };
        if remove {
            slots.remove(key);
        }
        drop(slots);
        trace!(op = key.op.as_str(), path = %key.path, "cache entry invalidated");
        CACHE_INVALIDATIONS.with_label_values(&[key.op.as_str()]).inc();
    }

    fn complete(
        &self,
        key: &CacheKey,
        call_id: u64,
        result: SessionResult<CachedValue>,
    ) {
        let waiters = {
            let mut slots = self.inner.slots.lock();
            match slots.remove(key) {
                Some(Slot::Pending {
                    call_id: id,
                    waiters,
                    invalidated,
                }) if id == call_id => {
                    if let (Ok(value), false) = (&result, invalidated) {
                        slots.insert(
                            key.clone(),
                            Slot::Ready {
                                call_id,
                                value: value.clone(),
                            },
                        );
                    }
                    waiters
                }
                Some(other) => {
                    slots.insert(key.clone(), other);
                    self.take_detached(call_id)
                }
                None => self.take_detached(call_id),
            }
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn take_detached(
        &self,
        call_id: u64,
    ) -> Vec<Waiter> {
        self.inner.detached.lock().remove(&call_id).unwrap_or_default()
    }
}

async fn fetch(
    session: &dyn Session,
    key: &CacheKey,
) -> SessionResult<(CachedValue, Watch)> {
    match key.op {
        ReadOp::Exists => {
            let (stat, watch) = session.exists(&key.path).await?;
            Ok((CachedValue::Exists(stat), watch))
        }
        ReadOp::Get => {
            let (data, stat, watch) = session.get(&key.path).await?;
            Ok((CachedValue::Data(data, stat), watch))
        }
        ReadOp::GetChildren => {
            let (children, watch) = session.get_children(&key.path).await?;
            Ok((CachedValue::Children(children), watch))
        }
    }
}
