//! Uniform peer socket produced by every transport.
//!
//! A [`PeerSocket`] is the receiving half (an ordered stream of
//! [`SocketEvent`]s) plus a cloneable [`SocketHandle`] for writing frames and
//! closing. Transport drivers own the matching [`SocketLink`] and feed it with
//! whatever the carrier delivers.
//!
//! A socket may carry several consecutive links when its transport reconnects;
//! each link is bracketed by exactly one `Connect` and one `Disconnect`. Frames
//! queued on a link that goes down are discarded with it, never replayed onto
//! the next one.

use crate::frame::{Frame, FrameError, Interface};
use crate::rpc::RpcError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("{0}")]
    Rpc(#[from] RpcError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Transport unsupported: {0}")]
    Unsupported(String),
}

/// What a driver does with a frame that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Log and close the link.
    #[default]
    Close,
    /// Log and drop the frame.
    Ignore,
}

/// Event delivered by a [`PeerSocket`], in carrier order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A link is up; frames may be sent.
    Connect,
    /// `I` frame.
    Interface(Interface),
    /// `Q` frame.
    Request(String),
    /// `S` frame.
    Response(String),
    /// The current link is gone.
    Disconnect,
}

impl From<Frame> for SocketEvent {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Interface(iface) => SocketEvent::Interface(iface),
            Frame::Request(s) => SocketEvent::Request(s),
            Frame::Response(s) => SocketEvent::Response(s),
        }
    }
}

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Writer side of the live link.
#[derive(Default)]
struct Outbound {
    /// Incremented on every attach; the first link is epoch 1.
    epoch: u64,
    /// `None` between links.
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

struct SocketShared {
    id: u64,
    peer: String,
    outbound: Mutex<Outbound>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

/// Cloneable write/close side of a peer socket.
#[derive(Clone)]
pub struct SocketHandle {
    inner: Arc<SocketShared>,
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SocketHandle {
    /// Process-unique socket id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Human-readable remote description (address or path).
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Queue a frame on the live link.
    ///
    /// Fails with [`WireError::ConnectionClosed`] when no link is up, and
    /// with a frame error when the payload could not be framed. Frames are
    /// written in the order they are queued.
    pub fn send(&self, frame: Frame) -> Result<(), WireError> {
        self.send_inner(None, frame)
    }

    /// Like [`SocketHandle::send`], but only onto the link identified by
    /// `epoch`. Sessions bound to an earlier link can never write onto a
    /// reconnected one.
    pub fn send_on(&self, epoch: u64, frame: Frame) -> Result<(), WireError> {
        self.send_inner(Some(epoch), frame)
    }

    fn send_inner(&self, epoch: Option<u64>, frame: Frame) -> Result<(), WireError> {
        if let Frame::Request(payload) | Frame::Response(payload) = &frame {
            if payload.contains('\n') {
                return Err(FrameError::EmbeddedNewline.into());
            }
        }
        let guard = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if epoch.is_some_and(|e| e != guard.epoch) {
            return Err(WireError::ConnectionClosed);
        }
        match guard.tx.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| WireError::ConnectionClosed),
            None => Err(WireError::ConnectionClosed),
        }
    }

    /// Announce a name and method list.
    pub fn send_interface(&self, iface: Interface) -> Result<(), WireError> {
        self.send(Frame::Interface(iface))
    }

    pub fn send_request(&self, payload: String) -> Result<(), WireError> {
        self.send(Frame::Request(payload))
    }

    pub fn send_response(&self, payload: String) -> Result<(), WireError> {
        self.send(Frame::Response(payload))
    }

    /// Epoch of the live link, if one is up.
    pub fn link_epoch(&self) -> Option<u64> {
        let guard = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.tx.as_ref().map(|_| guard.epoch)
    }

    /// Whether a link is currently up.
    pub fn is_linked(&self) -> bool {
        self.link_epoch().is_some()
    }

    /// Tear the socket down for good. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(socket = self.inner.id, peer = %self.inner.peer, "closing socket");
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tx
            .take();
        self.inner.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`SocketHandle::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.inner.close_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Receiving side of a peer connection.
pub struct PeerSocket {
    handle: SocketHandle,
    events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl std::fmt::Debug for PeerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSocket")
            .field("handle", &self.handle)
            .finish()
    }
}

impl PeerSocket {
    /// Create a socket and the driver-side link that feeds it.
    pub fn pair(peer: impl Into<String>) -> (PeerSocket, SocketLink) {
        let (close_tx, _) = watch::channel(false);
        let handle = SocketHandle {
            inner: Arc::new(SocketShared {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                peer: peer.into(),
                outbound: Mutex::new(Outbound::default()),
                closed: AtomicBool::new(false),
                close_tx,
            }),
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        (
            PeerSocket {
                handle: handle.clone(),
                events,
            },
            SocketLink {
                handle,
                events: events_tx,
                linked: AtomicBool::new(false),
            },
        )
    }

    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    /// Next event; `None` once the driver has finished for good.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (SocketHandle, mpsc::UnboundedReceiver<SocketEvent>) {
        (self.handle, self.events)
    }
}

/// Driver side of a [`PeerSocket`].
pub struct SocketLink {
    handle: SocketHandle,
    events: mpsc::UnboundedSender<SocketEvent>,
    linked: AtomicBool,
}

impl SocketLink {
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    /// Bring a link up: install a fresh writer queue and emit `Connect`.
    ///
    /// Returns `None` if the socket was closed in the meantime.
    pub fn attach(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        let mut guard = self
            .handle
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if self.handle.is_closed() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        guard.epoch += 1;
        guard.tx = Some(tx);
        drop(guard);
        self.linked.store(true, Ordering::SeqCst);
        let _ = self.events.send(SocketEvent::Connect);
        Some(rx)
    }

    /// Take the current link down, emitting `Disconnect` if one was up.
    pub fn detach(&self) {
        self.handle
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tx
            .take();
        if self.linked.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(SocketEvent::Disconnect);
        }
    }

    /// Forward a decoded frame. Returns `false` when the link must close.
    pub fn deliver(&self, decoded: Result<Frame, FrameError>, policy: ViolationPolicy) -> bool {
        match decoded {
            Ok(frame) => {
                let _ = self.events.send(frame.into());
                true
            }
            Err(e) => {
                warn!(
                    socket = self.handle.id(),
                    peer = %self.handle.peer(),
                    "protocol violation: {e}"
                );
                policy == ViolationPolicy::Ignore
            }
        }
    }

    /// Report a link that never came up (failed dial) and stop for good.
    pub fn abort(self) {
        let _ = self.events.send(SocketEvent::Disconnect);
        self.finish();
    }

    /// Mark the socket closed after the driver has stopped for good.
    pub fn finish(self) {
        self.handle
            .inner
            .closed
            .store(true, Ordering::SeqCst);
        self.handle.inner.close_tx.send_replace(true);
    }
}
