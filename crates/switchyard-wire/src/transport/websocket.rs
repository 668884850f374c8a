//! Plain WebSocket back-end. Every text or binary message carries codec
//! bytes; outbound frames go out as one text message each.

use super::{Acceptor, BindConfig, Listener, Transport, TransportOptions};
use crate::frame::{FrameDecoder, FrameError};
use crate::socket::{PeerSocket, SocketLink, ViolationPolicy, WireError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use switchyard_types::TransportKind;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use url::Url;

/// Normalise a hub address into a WebSocket URL.
///
/// `http`/`https` map to `ws`/`wss`; a bare or root path is replaced by
/// `default_path` when one is given.
pub(crate) fn ws_url(address: &str, default_path: Option<&str>) -> Result<Url, WireError> {
    let invalid = |reason: &str| WireError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid("expected a ws://, wss://, http:// or https:// URL")),
    };
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot convert to a WebSocket URL"))?;
    if let Some(path) = default_path {
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(path);
        }
    }
    Ok(url)
}

/// Run one WebSocket link until it ends.
async fn run_ws<S>(
    ws: WebSocketStream<S>,
    link: &SocketLink,
    policy: ViolationPolicy,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(mut outbound) = link.attach() else {
        return Ok(());
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut decoder = FrameDecoder::new();
    let handle = link.handle().clone();

    loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = ws_rx.next() => {
                let bytes = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => return Err(WireError::ConnectionClosed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                for decoded in decoder.decode_chunk(&bytes) {
                    if !link.deliver(decoded, policy) {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Err(WireError::Protocol("undecodable frame".to_string()));
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let text = String::from_utf8(frame.encode()?).map_err(|_| FrameError::InvalidUtf8)?;
                ws_tx.send(Message::Text(text)).await?;
            }
        }
    }
}

async fn drive_ws<S>(
    ws: WebSocketStream<S>,
    link: SocketLink,
    policy: ViolationPolicy,
    acceptor: Option<Acceptor>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = link.handle().id();
    if let Err(e) = run_ws(ws, &link, policy).await {
        debug!(socket = id, peer = %link.handle().peer(), "WebSocket ended: {e}");
    }
    link.detach();
    if let Some(acceptor) = acceptor {
        acceptor.release(id);
    }
    link.finish();
}

/// WebSocket carrier. Addresses are `ws://host:port[/path]`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    options: TransportOptions,
}

impl WebSocketTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn connect(&self, address: &str) -> Result<PeerSocket, WireError> {
        let url = ws_url(address, None)?;
        let (socket, link) = PeerSocket::pair(url.to_string());
        let policy = self.options.violation_policy;

        tokio::spawn(async move {
            info!("WebSocket: connecting to {}", url);
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => drive_ws(ws, link, policy, None).await,
                Err(e) => {
                    warn!("WebSocket: connection to {} failed: {}", url, e);
                    link.abort();
                }
            }
        });
        Ok(socket)
    }

    async fn listen(&self, bind: &BindConfig) -> Result<Listener, WireError> {
        let addr = bind.socket_addr("ws")?;
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket: hub listening on {}", local_addr);

        let (handle, mut acceptor) = Listener::new(local_addr.to_string(), None);
        let policy = self.options.violation_policy;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = acceptor.stopped() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("WebSocket: accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            debug!("WebSocket: handshake with {} failed: {}", peer, e);
                            return;
                        }
                    };
                    debug!("WebSocket: accepted connection from {}", peer);
                    if let Some(link) = acceptor.admit(peer.to_string()) {
                        drive_ws(ws, link, policy, Some(acceptor)).await;
                    }
                });
            }
            debug!("WebSocket: accept loop on {} stopped", local_addr);
        });
        Ok(handle)
    }
}
