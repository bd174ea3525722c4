//! Configuration management for coordination clients and the services built
//! on them.
//!
//! Provides hierarchical configuration loading from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Explicit config file
//! 3. File named by the `CONFIG_PATH` environment variable
//! 4. Environment variables prefixed with `COORD__` (highest priority)
//!
//! ```toml
//! [clients.main]
//! servers = "zk1:2181,zk2:2181,zk3:2181"
//! reuse_session = true
//! events = { connected = "announce" }
//!
//! [locks.leader]
//! client = "main"
//! path = "/service/leader"
//!
//! [streamers.config]
//! client = "main"
//! roots = ["/service/config"]
//! ```

mod client;
mod retry;
mod services;
pub use client::*;
pub use retry::*;
pub use services::*;


//---
use std::collections::HashMap;
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Named coordination clients
    #[serde(default)]
    pub clients: HashMap<String, ClientConfig>,

    /// Named lock services
    #[serde(default)]
    pub locks: HashMap<String, LockConfig>,

    /// Named subtree streamers
    #[serde(default)]
    pub streamers: HashMap<String, StreamerConfig>,
}

impl Settings {
    /// Load configuration from multiple sources with priority:
    /// 1. `config_path`, when given
    /// 2. `CONFIG_PATH` environment file
    /// 3. `COORD__` environment variables
    ///
    /// The merged result is validated before it is returned.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Config::builder();

        if let Some(path) = config_path {
            config = config.add_source(File::with_name(path).required(true));
        }

        if let Ok(path) = env::var("CONFIG_PATH") {
            config = config.add_source(File::with_name(&path).required(true));
        }

        config = config.add_source(
            Environment::with_prefix("COORD")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = config.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, client) in &self.clients {
            client
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("client {}: {}", name, e)))?;
        }

        for (name, lock) in &self.locks {
            self.require_client(&lock.client, "lock", name)?;
            lock.validate()?;
        }

        for (name, streamer) in &self.streamers {
            self.require_client(&streamer.client, "streamer", name)?;
            streamer.validate()?;
        }

        Ok(())
    }

    fn require_client(
        &self,
        client: &str,
        kind: &str,
        name: &str,
    ) -> Result<()> {
        if !self.clients.contains_key(client) {
            return Err(Error::InvalidConfig(format!(
                "{} {} refers to unknown client {}",
                kind, name, client
            )));
        }
        Ok(())
    }
}
