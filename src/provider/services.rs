//! Lock services and subtree streamers built from [`Settings`], each waiting
//! on its client dependency before it is handed out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;
use tracing::warn;

use super::client_resource_path;
use super::ResourceDependency;
use super::ResourceManager;
use super::ResourceProvider;
use crate::ConnectionManager;
use crate::Error;
use crate::LockConfig;
use crate::LockService;
use crate::ResourceError;
use crate::Result;
use crate::Settings;
use crate::StreamerConfig;
use crate::StreamerOptions;
use crate::SubtreeStreamer;

pub const LOCK_RESOURCE_PREFIX: &str = "coordination.lock.";
pub const STREAMER_RESOURCE_PREFIX: &str = "coordination.streamer.";

fn unprovided<'a>(
    path: &str,
    prefix: &str,
    configured: impl Iterator<Item = &'a String>,
) -> Error {
    let mut available: Vec<String> = configured.map(|name| format!("{}{}", prefix, name)).collect();
    available.sort();
    ResourceError::Unprovided {
        path: path.to_string(),
        available,
    }
    .into()
}

/// Provides `coordination.lock.<name>` for every configured lock.
pub struct LockProvider {
    configs: HashMap<String, LockConfig>,
    clients: Arc<ResourceManager<ConnectionManager>>,
    locks: Mutex<HashMap<String, LockService>>,
}

impl LockProvider {
    pub fn new(
        settings: &Settings,
        clients: Arc<ResourceManager<ConnectionManager>>,
    ) -> Self {
        Self {
            configs: settings.locks.clone(),
            clients,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        self: &Arc<Self>,
        resources: &ResourceManager<LockService>,
    ) -> Result<()> {
        for name in self.configs.keys() {
            resources.register(format!("{}{}", LOCK_RESOURCE_PREFIX, name), self.clone())?;
        }
        Ok(())
    }

    pub fn locks(&self) -> Vec<LockService> {
        self.locks.lock().values().cloned().collect()
    }

    pub async fn stop_all(&self) {
        for lock in self.locks() {
            lock.stop().await;
        }
    }

    fn get_or_create(
        &self,
        name: &str,
        client: ConnectionManager,
    ) -> Result<LockService> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(name) {
            return Ok(lock.clone());
        }
        let config = &self.configs[name];
        let lock = LockService::new(client, config.path.clone())?;
        info!(lock = %name, path = %config.path, "created lock service");
        locks.insert(name.to_string(), lock.clone());
        Ok(lock)
    }
}

#[async_trait]
impl ResourceProvider<LockService> for LockProvider {
    async fn add_consumer(
        &self,
        dependency: ResourceDependency<LockService>,
    ) -> Result<()> {
        let found = dependency
            .path()
            .strip_prefix(LOCK_RESOURCE_PREFIX)
            .and_then(|name| self.configs.get_key_value(name));
        let Some((name, config)) = found else {
            return Err(unprovided(dependency.path(), LOCK_RESOURCE_PREFIX, self.configs.keys()));
        };

        let client_dependency = ResourceDependency::new(client_resource_path(&config.client));
        self.clients.resolve(&client_dependency).await?;
        let client = client_dependency.wait_for_resource().await?;

        let lock = self.get_or_create(name, client)?;
        dependency.on_resource_ready(lock);
        Ok(())
    }
}

/// Provides `coordination.streamer.<name>` for every configured streamer.
/// Streamers are started as soon as they are built.
pub struct StreamerProvider {
    configs: HashMap<String, StreamerConfig>,
    clients: Arc<ResourceManager<ConnectionManager>>,
    streamers: Mutex<HashMap<String, SubtreeStreamer>>,
}

impl StreamerProvider {
    pub fn new(
        settings: &Settings,
        clients: Arc<ResourceManager<ConnectionManager>>,
    ) -> Self {
        Self {
            configs: settings.streamers.clone(),
            clients,
            streamers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        self: &Arc<Self>,
        resources: &ResourceManager<SubtreeStreamer>,
    ) -> Result<()> {
        for name in self.configs.keys() {
            resources.register(format!("{}{}", STREAMER_RESOURCE_PREFIX, name), self.clone())?;
        }
        Ok(())
    }

    pub fn streamers(&self) -> Vec<SubtreeStreamer> {
        self.streamers.lock().values().cloned().collect()
    }

    pub fn stop_all(&self) {
        for streamer in self.streamers() {
            streamer.stop();
        }
    }

    fn get_or_create(
        &self,
        name: &str,
        client: ConnectionManager,
    ) -> Result<SubtreeStreamer> {
        let mut streamers = self.streamers.lock();
        if let Some(streamer) = streamers.get(name) {
            return Ok(streamer.clone());
        }
        let config = &self.configs[name];
        let streamer = SubtreeStreamer::new(client, StreamerOptions::from(config));
        for root in &config.roots {
            streamer.watch_root(root.clone())?;
        }
        if config.roots.is_empty() {
            warn!(streamer = %name, "streamer has no roots configured");
        }
        streamer.start();
        info!(streamer = %name, roots = ?config.roots, "created subtree streamer");
        streamers.insert(name.to_string(), streamer.clone());
        Ok(streamer)
    }
}

#[async_trait]
impl ResourceProvider<SubtreeStreamer> for StreamerProvider {
    async fn add_consumer(
        &self,
        dependency: ResourceDependency<SubtreeStreamer>,
    ) -> Result<()> {
        let found = dependency
            .path()
            .strip_prefix(STREAMER_RESOURCE_PREFIX)
            .and_then(|name| self.configs.get_key_value(name));
        let Some((name, config)) = found else {
            return Err(unprovided(dependency.path(), STREAMER_RESOURCE_PREFIX, self.configs.keys()));
        };

        let client_dependency = ResourceDependency::new(client_resource_path(&config.client));
        self.clients.resolve(&client_dependency).await?;
        let client = client_dependency.wait_for_resource().await?;

        let streamer = self.get_or_create(name, client)?;
        dependency.on_resource_ready(streamer);
        Ok(())
    }
}
