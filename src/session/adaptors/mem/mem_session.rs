use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::mem_ensemble::SessionShared;
use super::MemEnsemble;
use super::ServerStatus;
use crate::CreateMode;
use crate::NodeStat;
use crate::Session;
use crate::SessionError;
use crate::SessionResult;
use crate::SessionState;
use crate::Watch;

const STATE_CHANNEL_CAPACITY: usize = 32;

/// A session against a [`MemEnsemble`].
///
/// Connecting resolves the server string against the ensemble's server
/// statuses; see [`ServerStatus`] for how each status answers.
#[derive(Debug)]
pub struct MemSession {
    ensemble: MemEnsemble,
    servers: String,
    session_timeout: Option<Duration>,
    shared: Mutex<Option<Arc<SessionShared>>>,
    state_tx: broadcast::Sender<SessionState>,
}

impl MemSession {
    pub fn new(
        ensemble: MemEnsemble,
        servers: &str,
        session_timeout: Option<Duration>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            ensemble,
            servers: servers.to_string(),
            session_timeout,
            shared: Mutex::new(None),
            state_tx,
        }
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout
    }

    fn connected(&self) -> SessionResult<Arc<SessionShared>> {
        let shared = self.shared.lock().clone().ok_or(SessionError::NotConnected)?;
        match shared.state() {
            SessionState::Connected => Ok(shared),
            SessionState::Expired => Err(SessionError::SessionExpired),
            SessionState::Connecting | SessionState::Closed => Err(SessionError::NotConnected),
        }
    }

    fn open(
        &self,
        initial: SessionState,
    ) -> Arc<SessionShared> {
        let shared = self
            .ensemble
            .open_session(&self.servers, self.state_tx.clone(), initial);
        *self.shared.lock() = Some(shared.clone());
        shared
    }
}

#[async_trait]
impl Session for MemSession {
    fn id(&self) -> i64 {
        self.shared.lock().as_ref().map(|s| s.id).unwrap_or(0)
    }

    fn servers(&self) -> String {
        self.servers.clone()
    }

    fn has_handle(&self) -> bool {
        self.shared.lock().is_some()
    }

    fn state(&self) -> SessionState {
        self.shared
            .lock()
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::Connecting)
    }

    fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn connect(
        &self,
        timeout: Duration,
    ) -> SessionResult<()> {
        self.ensemble.record_connect_attempt(&self.servers);
        let statuses: Vec<ServerStatus> = self
            .servers
            .split(',')
            .map(|s| self.ensemble.server_status(s.trim()))
            .collect();

        if statuses.is_empty() || statuses.contains(&ServerStatus::Invalid) {
            return Err(SessionError::ConnectionError {
                servers: self.servers.clone(),
                reason: "invalid server in list".to_string(),
                handle_obtained: false,
            });
        }

        if statuses.contains(&ServerStatus::Up) {
            let shared = self.open(SessionState::Connected);
            debug!(session_id = shared.id, servers = %self.servers, "session connected");
            return Ok(());
        }

        if statuses.contains(&ServerStatus::Unsettled) {
            self.open(SessionState::Connecting);
            return Ok(());
        }

        if statuses.contains(&ServerStatus::Refusing) {
            self.open(SessionState::Connecting);
            return Err(SessionError::ConnectionError {
                servers: self.servers.clone(),
                reason: "connection refused".to_string(),
                handle_obtained: true,
            });
        }

        tokio::time::sleep(timeout).await;
        Err(SessionError::ConnectTimeout)
    }

    async fn close(&self) -> SessionResult<()> {
        let shared = self.shared.lock().clone();
        match shared {
            Some(shared) => {
                self.ensemble.close_session(&shared);
                Ok(())
            }
            None => Err(SessionError::NotConnected),
        }
    }

    async fn exists(
        &self,
        path: &str,
    ) -> SessionResult<(Option<NodeStat>, Watch)> {
        let shared = self.connected()?;
        self.ensemble.exists(shared.id, path).await
    }

    async fn get(
        &self,
        path: &str,
    ) -> SessionResult<(Bytes, NodeStat, Watch)> {
        let shared = self.connected()?;
        self.ensemble.get(shared.id, path).await
    }

    async fn get_children(
        &self,
        path: &str,
    ) -> SessionResult<(Vec<String>, Watch)> {
        let shared = self.connected()?;
        self.ensemble.get_children(shared.id, path).await
    }

    async fn create(
        &self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> SessionResult<String> {
        let shared = self.connected()?;
        self.ensemble.create(shared.id, path, data, mode)
    }

    async fn set(
        &self,
        path: &str,
        data: Bytes,
        version: Option<i32>,
    ) -> SessionResult<NodeStat> {
        self.connected()?;
        self.ensemble.set(path, data, version)
    }

    async fn delete(
        &self,
        path: &str,
        version: Option<i32>,
    ) -> SessionResult<()> {
        self.connected()?;
        self.ensemble.delete(path, version)
    }
}
