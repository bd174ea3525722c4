use serde::Deserialize;
use serde::Serialize;

use crate::validate_path;
use crate::Error;
use crate::Result;

/// A lock service bound to one client
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    /// Name of the client (key under `clients`) to lock through
    pub client: String,

    /// Parent node under which contenders create their sequential nodes
    pub path: String,
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path)
            .map_err(|_| Error::InvalidConfig(format!("lock path {:?} is not a valid node path", self.path)))?;
        if self.path == "/" {
            return Err(Error::InvalidConfig("lock path cannot be the root".into()));
        }
        Ok(())
    }
}

/// A subtree streamer bound to one client
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamerConfig {
    /// Name of the client (key under `clients`) to stream through
    pub client: String,

    /// Root paths to mirror
    #[serde(default)]
    pub roots: Vec<String>,

    /// Discovered children under any of these prefixes are not watched
    #[serde(default)]
    pub exclude_prefixes: Vec<String>,

    /// Capacity of the event channel; slow subscribers beyond it lag
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl StreamerConfig {
    pub fn validate(&self) -> Result<()> {
        for root in &self.roots {
            validate_path(root)
                .map_err(|_| Error::InvalidConfig(format!("streamer root {:?} is not a valid node path", root)))?;
        }
        if self.event_buffer_size == 0 {
            return Err(Error::InvalidConfig("event_buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

fn default_event_buffer_size() -> usize {
    1024
}
