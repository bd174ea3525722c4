use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

use super::ReconnectPolicy;
use crate::Error;
use crate::LifecycleEvent;
use crate::Result;

/// Configuration of one named coordination client
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// Ensemble members, either `"host:port,host:port"` or a list
    #[serde(default, deserialize_with = "deserialize_servers")]
    pub servers: Vec<String>,

    /// Timeout for a single connect attempt against one server combination
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a session may stay in `connecting` before the client gives up
    /// on it and starts a fresh connection sweep
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Session timeout requested from the ensemble (ensemble default when unset)
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,

    /// When false, a session that loses contact is replaced instead of resumed
    #[serde(default = "default_reuse_session")]
    pub reuse_session: bool,

    /// Lifecycle event name -> registered handler name
    #[serde(default)]
    pub events: HashMap<String, String>,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![],
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            session_timeout_ms: None,
            reuse_session: default_reuse_session(),
            events: HashMap::new(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    /// Event bindings keyed by their parsed lifecycle event
    pub fn event_bindings(&self) -> Result<HashMap<LifecycleEvent, String>> {
        self.events
            .iter()
            .map(|(event, handler)| {
                let event = LifecycleEvent::from_str(event).map_err(|_| {
                    Error::Config(ConfigError::Message(format!(
                        "Invalid event: {}. Use one of the possible events: {}",
                        event,
                        LifecycleEvent::ALL
                            .iter()
                            .map(|e| e.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )))
                })?;
                Ok((event, handler.clone()))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfig("servers must contain at least one server".into()));
        }

        if self.servers.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::InvalidConfig("servers cannot contain empty entries".into()));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "connect_timeout_ms must be > 0".into(),
            )));
        }

        if self.reconnect_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "reconnect_timeout_ms must be > 0".into(),
            )));
        }

        self.event_bindings()?;
        self.reconnect.validate()?;

        Ok(())
    }
}

fn default_connect_timeout_ms() -> u64 {
    // one day: keep trying the same combination for as long as it takes
    86_400_000
}
fn default_reconnect_timeout_ms() -> u64 {
    30_000
}
fn default_reuse_session() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServerSpec {
    Joined(String),
    List(Vec<String>),
}

pub(crate) fn parse_servers(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_servers<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ServerSpec::deserialize(deserializer)? {
        ServerSpec::Joined(joined) => parse_servers(&joined),
        ServerSpec::List(list) => list.into_iter().map(|s| s.trim().to_string()).collect(),
    })
}
