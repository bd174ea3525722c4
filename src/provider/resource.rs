use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;
use tracing::debug;

use crate::ResourceError;
use crate::Result;

/// Hands out resources of type `R` to dependencies registered under the
/// resource paths it provides.
///
/// Providers decide when a resource becomes available (and when it is lost)
/// and report it through the dependency's callbacks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceProvider<R>: Send + Sync + 'static
where
    R: Clone + Send + Sync + 'static,
{
    async fn add_consumer(
        &self,
        dependency: ResourceDependency<R>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus<R> {
    Pending,
    Ready(R),
    Lost(String),
}

/// A consumer's handle on one resource path.
///
/// Clones observe the same status.
#[derive(Clone)]
pub struct ResourceDependency<R> {
    path: String,
    status: Arc<watch::Sender<ResourceStatus<R>>>,
}

impl<R> fmt::Debug for ResourceDependency<R> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let status = match &*self.status.borrow() {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Ready(_) => "ready",
            ResourceStatus::Lost(_) => "lost",
        };
        f.debug_struct("ResourceDependency")
            .field("path", &self.path)
            .field("status", &status)
            .finish()
    }
}

impl<R> ResourceDependency<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(path: impl Into<String>) -> Self {
        let (status, _) = watch::channel(ResourceStatus::Pending);
        Self {
            path: path.into(),
            status: Arc::new(status),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.status.borrow(), ResourceStatus::Ready(_))
    }

    pub fn status(&self) -> ResourceStatus<R> {
        self.status.borrow().clone()
    }

    /// The resource, if currently ready.
    pub fn resource(&self) -> Option<R> {
        match &*self.status.borrow() {
            ResourceStatus::Ready(resource) => Some(resource.clone()),
            _ => None,
        }
    }

    pub fn on_resource_ready(
        &self,
        resource: R,
    ) {
        debug!(path = %self.path, "resource ready");
        self.status.send_replace(ResourceStatus::Ready(resource));
    }

    pub fn on_resource_lost(
        &self,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        debug!(path = %self.path, %reason, "resource lost");
        self.status.send_replace(ResourceStatus::Lost(reason));
    }

    /// Waits until the resource is ready and returns it.
    pub async fn wait_for_resource(&self) -> Result<R> {
        let mut rx = self.subscribe();
        let status = rx
            .wait_for(|status| matches!(status, ResourceStatus::Ready(_)))
            .await
            .map_err(|_| ResourceError::NotReady(self.path.clone()))?;
        match &*status {
            ResourceStatus::Ready(resource) => Ok(resource.clone()),
            _ => Err(ResourceError::NotReady(self.path.clone()).into()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceStatus<R>> {
        self.status.subscribe()
    }
}

/// Registry of who provides which resource path.
pub struct ResourceManager<R> {
    providers: DashMap<String, Arc<dyn ResourceProvider<R>>>,
}

impl<R> Default for ResourceManager<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for ResourceManager<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("paths", &self.registered_paths())
            .finish()
    }
}

impl<R> ResourceManager<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        path: impl Into<String>,
        provider: Arc<dyn ResourceProvider<R>>,
    ) -> Result<()> {
        match self.providers.entry(path.into()) {
            Entry::Occupied(entry) => Err(ResourceError::AlreadyProvided(entry.key().clone()).into()),
            Entry::Vacant(entry) => {
                debug!(path = %entry.key(), "resource provider registered");
                entry.insert(provider);
                Ok(())
            }
        }
    }

    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.providers.iter().map(|p| p.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn get_provider_or_fail(
        &self,
        path: &str,
    ) -> Result<Arc<dyn ResourceProvider<R>>> {
        match self.providers.get(path) {
            Some(provider) => Ok(provider.value().clone()),
            None => Err(ResourceError::Unprovided {
                path: path.to_string(),
                available: self.registered_paths(),
            }
            .into()),
        }
    }

    /// Hands `dependency` to the provider registered for its path.
    pub async fn resolve(
        &self,
        dependency: &ResourceDependency<R>,
    ) -> Result<()> {
        let provider = self.get_provider_or_fail(dependency.path())?;
        provider.add_consumer(dependency.clone()).await
    }
}
