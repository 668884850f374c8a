//! Transport abstraction.
//!
//! A [`Transport`] turns an address into an outbound [`PeerSocket`] and a bind
//! configuration into a [`Listener`] yielding one [`PeerSocket`] per inbound
//! connection. Every back-end produces the same socket events, so the session
//! layer never knows which carrier it runs on.

pub mod channel;
pub mod stream;
pub mod websocket;

use crate::socket::{PeerSocket, SocketHandle, SocketLink, ViolationPolicy, WireError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_types::TransportKind;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub use channel::ChannelTransport;
pub use stream::TcpTransport;
#[cfg(unix)]
pub use stream::UnixTransport;
pub use websocket::WebSocketTransport;

/// Read buffer size for byte-stream carriers.
pub(crate) const READ_BUF_SIZE: usize = 16 * 1024;

/// Per-transport tuning.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// What to do with a frame that fails to decode.
    pub violation_policy: ViolationPolicy,
    /// Channel transport: interval between server pings.
    pub heartbeat_interval: Duration,
    /// Channel transport: how long a peer may stay silent after a ping.
    pub heartbeat_timeout: Duration,
    /// Channel transport: first reconnect delay.
    pub initial_backoff: Duration,
    /// Channel transport: reconnect delay ceiling.
    pub max_backoff: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            violation_policy: ViolationPolicy::Close,
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(20),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Where a hub listens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindConfig {
    pub port: Option<u16>,
    /// Host (tcp), socket path (unix) or bind host (websocket / channel).
    pub address: Option<String>,
}

impl BindConfig {
    pub fn port(port: u16) -> Self {
        Self {
            port: Some(port),
            address: None,
        }
    }

    pub fn address(address: impl Into<String>) -> Self {
        Self {
            port: None,
            address: Some(address.into()),
        }
    }

    /// `host:port` for port-based carriers; the host defaults to `0.0.0.0`.
    pub(crate) fn socket_addr(&self, scheme: &str) -> Result<String, WireError> {
        let host = self
            .address
            .as_deref()
            .map(|a| strip_scheme(a, scheme))
            .filter(|a| !a.is_empty());
        match (host, self.port) {
            (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
            (None, Some(port)) => Ok(format!("0.0.0.0:{port}")),
            (Some(host), None) if split_host_port(host).is_some() => Ok(host.to_string()),
            (Some(host), None) => Err(WireError::InvalidAddress {
                address: host.to_string(),
                reason: "no port given".to_string(),
            }),
            (None, None) => Err(WireError::InvalidAddress {
                address: String::new(),
                reason: "a port is required".to_string(),
            }),
        }
    }
}

/// Strip `scheme://` from `address` if present.
pub(crate) fn strip_scheme<'a>(address: &'a str, scheme: &str) -> &'a str {
    address
        .strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix("://"))
        .unwrap_or(address)
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Uniform connect/listen interface over one carrier.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open an outbound socket.
    ///
    /// The address is validated here; the dial itself runs in the
    /// background and a failure shows up as a `Disconnect` event. Must be
    /// called from within a Tokio runtime.
    fn connect(&self, address: &str) -> Result<PeerSocket, WireError>;

    /// Bind a listening endpoint.
    async fn listen(&self, bind: &BindConfig) -> Result<Listener, WireError>;
}

/// Build the back-end for `kind`.
pub fn transport_for(
    kind: TransportKind,
    options: TransportOptions,
) -> Result<Arc<dyn Transport>, WireError> {
    match kind {
        TransportKind::Tcp => Ok(Arc::new(TcpTransport::new(options))),
        #[cfg(unix)]
        TransportKind::Unix => Ok(Arc::new(UnixTransport::new(options))),
        #[cfg(not(unix))]
        TransportKind::Unix => Err(WireError::Unsupported(
            "unix sockets are not available on this platform".to_string(),
        )),
        TransportKind::WebSocket => Ok(Arc::new(WebSocketTransport::new(options))),
        TransportKind::Channel => Ok(Arc::new(ChannelTransport::new(options))),
    }
}

type LiveSockets = Arc<Mutex<HashMap<u64, SocketHandle>>>;

/// Accept-loop side of a [`Listener`].
#[derive(Clone)]
pub(crate) struct Acceptor {
    incoming: mpsc::UnboundedSender<PeerSocket>,
    live: LiveSockets,
    stop: watch::Receiver<bool>,
}

impl Acceptor {
    /// Register a new inbound connection and hand its socket to the listener.
    /// Returns `None` once the listener has stopped.
    pub(crate) fn admit(&self, peer: String) -> Option<SocketLink> {
        if *self.stop.borrow() {
            return None;
        }
        let (socket, link) = PeerSocket::pair(peer);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(socket.handle().id(), socket.handle().clone());
        self.incoming.send(socket).ok()?;
        Some(link)
    }

    /// Forget a connection whose driver has finished.
    pub(crate) fn release(&self, id: u64) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Resolves once the listener is stopped.
    pub(crate) async fn stopped(&mut self) {
        while !*self.stop.borrow_and_update() {
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A bound endpoint producing one [`PeerSocket`] per inbound connection.
pub struct Listener {
    local_addr: String,
    incoming: mpsc::UnboundedReceiver<PeerSocket>,
    live: LiveSockets,
    stop_tx: watch::Sender<bool>,
    /// Unix socket file removed on stop.
    cleanup: Option<PathBuf>,
}

impl Listener {
    pub(crate) fn new(local_addr: String, cleanup: Option<PathBuf>) -> (Listener, Acceptor) {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let live: LiveSockets = Arc::new(Mutex::new(HashMap::new()));
        (
            Listener {
                local_addr,
                incoming,
                live: Arc::clone(&live),
                stop_tx,
                cleanup,
            },
            Acceptor {
                incoming: incoming_tx,
                live,
                stop: stop_rx,
            },
        )
    }

    /// Bound address (resolved port for port 0, or the socket path).
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Next inbound connection; `None` after [`Listener::stop`].
    pub async fn accept(&mut self) -> Option<PeerSocket> {
        self.incoming.recv().await
    }

    /// Number of inbound connections still open.
    pub fn live_connections(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Release the endpoint and close every live connection. Idempotent.
    pub fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!("Listener on {} stopping", self.local_addr);
        let live: Vec<SocketHandle> = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in live {
            handle.close();
        }
        if let Some(path) = &self.cleanup {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove socket file {}: {e}", path.display());
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_socket_addr() {
        assert_eq!(
            BindConfig::port(7000).socket_addr("tcp").unwrap(),
            "0.0.0.0:7000"
        );
        let bind = BindConfig {
            port: Some(7000),
            address: Some("127.0.0.1".into()),
        };
        assert_eq!(bind.socket_addr("tcp").unwrap(), "127.0.0.1:7000");
        assert_eq!(
            BindConfig::address("tcp://localhost:81")
                .socket_addr("tcp")
                .unwrap(),
            "localhost:81"
        );
        assert!(BindConfig::address("localhost").socket_addr("tcp").is_err());
        assert!(BindConfig::default().socket_addr("tcp").is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("hub:9000"), Some(("hub", 9000)));
        assert_eq!(split_host_port("[::1]:80"), Some(("::1", 80)));
        assert_eq!(split_host_port("hub"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("hub:http"), None);
    }

    #[test]
    fn test_transport_for_kinds() {
        for kind in [
            TransportKind::Tcp,
            TransportKind::WebSocket,
            TransportKind::Channel,
        ] {
            let transport = transport_for(kind, TransportOptions::default()).unwrap();
            assert_eq!(transport.kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_listener_stop_closes_live() {
        let (mut listener, acceptor) = Listener::new("test".into(), None);
        let link = acceptor.admit("peer".into()).unwrap();
        let socket = listener.accept().await.unwrap();
        assert_eq!(listener.live_connections(), 1);

        listener.stop();
        listener.stop();
        assert!(socket.handle().is_closed());
        assert!(acceptor.admit("late".into()).is_none());
        drop(link);
    }
}
