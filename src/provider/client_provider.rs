use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::ResourceDependency;
use super::ResourceManager;
use super::ResourceProvider;
use crate::ClientConfig;
use crate::ClientEvent;
use crate::ConnectionManager;
use crate::HandlerRegistry;
use crate::ResourceError;
use crate::Result;
use crate::SessionFactory;
use crate::Settings;

pub const CLIENT_RESOURCE_PREFIX: &str = "coordination.client.";

pub fn client_resource_path(name: &str) -> String {
    format!("{}{}", CLIENT_RESOURCE_PREFIX, name)
}

/// Provides one [`ConnectionManager`] per configured client.
///
/// Clients bound to lifecycle handlers are created right away so their events
/// fire even without consumers; the others are created by their first
/// consumer. Consumers see the client as ready while it is connected and as
/// lost while it is not.
pub struct ClientProvider {
    configs: HashMap<String, ClientConfig>,
    factory: Arc<dyn SessionFactory>,
    handlers: HandlerRegistry,
    clients: Mutex<HashMap<String, ConnectionManager>>,
    running: AtomicBool,
    /// Stops the event forwarders when the provider goes away
    forwarders: CancellationToken,
}

impl Drop for ClientProvider {
    fn drop(&mut self) {
        self.forwarders.cancel();
    }
}

impl ClientProvider {
    pub fn new(
        configs: HashMap<String, ClientConfig>,
        factory: Arc<dyn SessionFactory>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            configs,
            factory,
            handlers,
            clients: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            forwarders: CancellationToken::new(),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        factory: Arc<dyn SessionFactory>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self::new(settings.clients.clone(), factory, handlers)
    }

    /// Registers `coordination.client.<name>` for every configured client.
    pub fn register(
        self: &Arc<Self>,
        resources: &ResourceManager<ConnectionManager>,
    ) -> Result<()> {
        let mut names: Vec<&String> = self.configs.keys().collect();
        names.sort();
        for name in names {
            resources.register(client_resource_path(name), self.clone())?;
            if !self.configs[name].events.is_empty() {
                self.get_or_create(name)?;
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The client named `name`, if it has been created.
    pub fn client(
        &self,
        name: &str,
    ) -> Option<ConnectionManager> {
        self.clients.lock().get(name).cloned()
    }

    pub fn clients(&self) -> Vec<ConnectionManager> {
        self.clients.lock().values().cloned().collect()
    }

    /// Starts every client created so far; clients created later start
    /// immediately.
    pub async fn start_all(&self) {
        self.running.store(true, Ordering::SeqCst);
        for client in self.clients() {
            client.start().await;
        }
    }

    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        for client in self.clients() {
            client.stop().await;
        }
    }

    fn get_or_create(
        &self,
        name: &str,
    ) -> Result<(ConnectionManager, bool)> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(name) {
            return Ok((client.clone(), false));
        }
        let config = self.configs.get(name).ok_or_else(|| ResourceError::Unprovided {
            path: client_resource_path(name),
            available: self.configs.keys().map(|n| client_resource_path(n)).collect(),
        })?;

        let client = ConnectionManager::new(name, config.clone(), self.factory.clone(), self.handlers.clone())?;
        info!(client = %name, servers = ?config.servers, "created coordination client");
        clients.insert(name.to_string(), client.clone());
        Ok((client, true))
    }

    fn spawn_forwarder(
        &self,
        client: ConnectionManager,
        dependency: ResourceDependency<ConnectionManager>,
    ) {
        let token = self.forwarders.clone();
        let mut events = client.subscribe();
        if client.is_connected() {
            dependency.on_resource_ready(client.clone());
        }

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ClientEvent::Connected) => dependency.on_resource_ready(client.clone()),
                    Ok(ClientEvent::Disconnected(reason)) => {
                        dependency.on_resource_lost(format!("client {} disconnected: {:?}", client.name(), reason))
                    }
                    Err(RecvError::Lagged(_)) => {
                        if client.is_connected() {
                            dependency.on_resource_ready(client.clone());
                        } else {
                            dependency.on_resource_lost(format!("client {} is not connected", client.name()));
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }
}

#[async_trait]
impl ResourceProvider<ConnectionManager> for ClientProvider {
    async fn add_consumer(
        &self,
        dependency: ResourceDependency<ConnectionManager>,
    ) -> Result<()> {
        let name = dependency
            .path()
            .strip_prefix(CLIENT_RESOURCE_PREFIX)
            .ok_or_else(|| ResourceError::Unprovided {
                path: dependency.path().to_string(),
                available: self.configs.keys().map(|n| client_resource_path(n)).collect(),
            })?;

        let (client, created) = self.get_or_create(name)?;
        debug!(client = %name, "adding client consumer");
        self.spawn_forwarder(client.clone(), dependency);
        if created && self.is_running() {
            client.start().await;
        }
        Ok(())
    }
}
