use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::join_path;
use crate::node_name;
use crate::sequence_suffix;
use crate::validate_path;
use crate::ConnectionManager;
use crate::CreateMode;
use crate::LockError;
use crate::Result;
use crate::SessionError;

const LOCK_MARKER: &str = "-lock-";

/// One contender for the lock at `path`.
///
/// Contenders create an ephemeral sequential child of `path`; the lowest
/// sequence number holds the lock and every other contender waits for the
/// node just before its own to disappear.
#[derive(Debug)]
pub struct DistributedLock {
    client: ConnectionManager,
    path: String,
    prefix: String,
    node: Mutex<Option<String>>,
    acquired: AtomicBool,
}

impl DistributedLock {
    pub fn new(
        client: ConnectionManager,
        path: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        if validate_path(&path).is_err() || path == "/" {
            return Err(LockError::InvalidPath(path).into());
        }
        Ok(Self {
            client,
            path,
            prefix: format!("_c_{}{}", nanoid::nanoid!(), LOCK_MARKER),
            node: Mutex::new(None),
            acquired: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full path of this contender's node, once created.
    pub fn node(&self) -> Option<String> {
        self.node.lock().clone()
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Waits until the lock is held or `cancel` fires.
    ///
    /// On cancellation or failure the contender's node is removed again, so
    /// an abandoned attempt never ends up holding the lock.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_acquired() {
            return Ok(());
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled(self.path.clone()).into()),
            result = self.contend() => result,
        };
        if result.is_err() {
            self.release_quietly().await;
        }
        result
    }

    /// Deletes the contender's node. The node is kept (and the release can
    /// be retried) when the delete fails for any reason other than the node
    /// already being gone.
    pub async fn release(&self) -> Result<()> {
        let Some(node) = self.node() else {
            return Err(LockError::NotHeld(self.path.clone()).into());
        };
        self.acquired.store(false, Ordering::SeqCst);
        match self.client.delete(&node, None).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }

        let mut current = self.node.lock();
        if current.as_deref() == Some(node.as_str()) {
            *current = None;
        }
        Ok(())
    }

    /// Like [`release`](Self::release) but never fails. Returns the node left
    /// behind because the session was unavailable, if any.
    pub async fn release_quietly(&self) -> Option<String> {
        match self.release().await {
            Ok(()) => None,
            Err(e) if e.is_connection_loss() => self.node(),
            Err(e) => {
                trace!(path = %self.path, "ignoring error while releasing lock: {}", e);
                None
            }
        }
    }

    async fn contend(&self) -> Result<()> {
        self.client.ensure_path(&self.path).await?;

        let node = match self.node() {
            Some(node) => node,
            None => {
                let node = self
                    .client
                    .create(
                        &join_path(&self.path, &self.prefix),
                        Bytes::new(),
                        CreateMode::EphemeralSequential,
                    )
                    .await?;
                *self.node.lock() = Some(node.clone());
                node
            }
        };
        let own = node_name(&node).to_string();

        loop {
            let (children, _watch) = self.client.get_children_and_watch(&self.path).await?;
            let mut contenders: Vec<(u64, String)> = children
                .into_iter()
                .filter(|name| name.contains(LOCK_MARKER))
                .filter_map(|name| sequence_suffix(&name).map(|seq| (seq, name)))
                .collect();
            contenders.sort();

            let position = contenders
                .iter()
                .position(|(_, name)| *name == own)
                .ok_or_else(|| SessionError::NoSuchNode(node.clone()))?;

            if position == 0 {
                self.acquired.store(true, Ordering::SeqCst);
                debug!(path = %self.path, %node, "lock acquired");
                return Ok(());
            }

            let predecessor = join_path(&self.path, &contenders[position - 1].1);
            trace!(path = %self.path, %predecessor, "waiting for predecessor");
            let (stat, watch) = self.client.exists_and_watch(&predecessor).await?;
            if stat.is_some() {
                watch.await?;
            }
        }
    }
}
