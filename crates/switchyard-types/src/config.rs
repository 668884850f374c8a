//! Node configuration types.
//!
//! A [`NodeConfig`] mirrors the `settings` map a hosting orchestrator hands to
//! the driver. Unknown keys are preserved in [`Settings::extra`] so hosts can
//! carry their own data alongside the broker's.

use crate::error::SwitchyardError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Environment variable that overrides [`Settings::port`].
pub const ENV_PORT: &str = "PORT";
/// Environment variable that overrides [`Settings::remote_hub`].
pub const ENV_REMOTE_HUB: &str = "REMOTE_HUB";

/// Wire carrier used by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Raw TCP stream.
    Tcp,
    /// Unix domain socket stream.
    Unix,
    /// Plain WebSocket, one codec chunk per message.
    WebSocket,
    /// socket.io-style multiplexed event channel with reconnection.
    #[default]
    Channel,
}

impl TransportKind {
    /// Canonical configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
            Self::WebSocket => "websocket",
            Self::Channel => "socket.io",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "unix" | "ipc" => Ok(Self::Unix),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "socket.io" | "socketio" | "channel" | "multiplexed" => Ok(Self::Channel),
            other => Err(SwitchyardError::UnknownTransport(other.to_string())),
        }
    }
}

impl Serialize for TransportKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TransportKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-node settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Run this node as the hub.
    #[serde(default)]
    pub hub: bool,
    /// Wire carrier; defaults to the multiplexed channel.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    /// Listen port (hub) for port-based transports.
    #[serde(default)]
    pub port: Option<u16>,
    /// Listen host (tcp) or socket path (unix).
    #[serde(default)]
    pub address: Option<String>,
    /// Hub address a worker connects to.
    #[serde(default)]
    pub remote_hub: Option<String>,
    /// Extra environment variables for deployment descriptors.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Seconds a hub-side `invoke` may wait for a capable peer.
    #[serde(default)]
    pub invoke_timeout_secs: Option<u64>,
    /// Seconds a worker call may wait for a hub session.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Re-issue a method-not-found call through the hub's `invoke`.
    #[serde(default = "default_true")]
    pub invoke_fallback: bool,
    /// Keys this crate does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hub: false,
            transport: None,
            port: None,
            address: None,
            remote_hub: None,
            environment: BTreeMap::new(),
            invoke_timeout_secs: None,
            connect_timeout_secs: None,
            invoke_fallback: true,
            extra: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Effective transport, falling back to the multiplexed channel.
    pub fn transport(&self) -> TransportKind {
        self.transport.unwrap_or_default()
    }
}

/// Configuration handed to the driver when constructing a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node settings.
    #[serde(default)]
    pub settings: Settings,
}

impl NodeConfig {
    /// Apply `PORT` / `REMOTE_HUB` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), SwitchyardError> {
        self.apply_overrides(
            std::env::var(ENV_PORT).ok().as_deref(),
            std::env::var(ENV_REMOTE_HUB).ok().as_deref(),
        )
    }

    /// Apply overrides from already-resolved values. Empty strings are ignored.
    pub fn apply_overrides(
        &mut self,
        port: Option<&str>,
        remote_hub: Option<&str>,
    ) -> Result<(), SwitchyardError> {
        if let Some(port) = port.filter(|p| !p.trim().is_empty()) {
            let parsed = port
                .trim()
                .parse::<u16>()
                .map_err(|e| SwitchyardError::Config(format!("invalid {ENV_PORT} '{port}': {e}")))?;
            self.settings.port = Some(parsed);
        }
        if let Some(hub) = remote_hub.filter(|h| !h.trim().is_empty()) {
            self.settings.remote_hub = Some(hub.trim().to_string());
        }
        Ok(())
    }
}
