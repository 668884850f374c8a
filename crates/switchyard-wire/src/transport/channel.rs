//! Multiplexed event channel over WebSocket (socket.io style).
//!
//! Each WebSocket text message is one packet:
//!
//! | packet                     | meaning                                  |
//! |----------------------------|------------------------------------------|
//! | `0{"sid":..,"pingInterval":..,"pingTimeout":..}` | server open handshake |
//! | `1`                        | close                                    |
//! | `2` / `3`                  | ping / pong                              |
//! | `4["<event>",<payload>]`   | event: `interface`, `request`, `response` |
//!
//! The server pings every `heartbeat_interval` and drops peers silent for
//! longer than interval plus timeout. The client watches the same window,
//! and on any link loss reconnects with exponential backoff, emitting a
//! fresh `Connect` once the server has opened the new link.

use super::websocket::ws_url;
use super::{Acceptor, BindConfig, Listener, Transport, TransportOptions};
use crate::frame::{Frame, FrameError};
use crate::socket::{PeerSocket, SocketLink, WireError};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use switchyard_types::TransportKind;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Path a client dials when the address carries none.
pub const DEFAULT_PATH: &str = "/socket.io/";

const EVENT_INTERFACE: &str = "interface";
const EVENT_REQUEST: &str = "request";
const EVENT_RESPONSE: &str = "response";

/// Server handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits past an interval before dropping a peer.
    pub ping_timeout: u64,
}

impl OpenInfo {
    /// How long either side tolerates silence.
    fn silence_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// One channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Event(Frame),
}

impl Packet {
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(match self {
            Packet::Open(info) => format!("0{}", serde_json::to_string(info)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Event(frame) => {
                let event = match frame {
                    Frame::Interface(iface) => {
                        serde_json::json!([EVENT_INTERFACE, iface])
                    }
                    Frame::Request(payload) => serde_json::json!([EVENT_REQUEST, payload]),
                    Frame::Response(payload) => serde_json::json!([EVENT_RESPONSE, payload]),
                };
                format!("4{}", serde_json::to_string(&event)?)
            }
        })
    }

    pub fn decode(text: &str) -> Result<Packet, FrameError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(FrameError::Empty)?;
        let body = chars.as_str();
        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(body)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_event(body).map(Packet::Event),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

fn decode_event(body: &str) -> Result<Frame, FrameError> {
    let (name, payload): (String, Value) = serde_json::from_str(body)?;
    match (name.as_str(), payload) {
        (EVENT_INTERFACE, payload) => Ok(Frame::Interface(serde_json::from_value(payload)?)),
        (EVENT_REQUEST, Value::String(s)) => Ok(Frame::Request(s)),
        (EVENT_RESPONSE, Value::String(s)) => Ok(Frame::Response(s)),
        (EVENT_REQUEST | EVENT_RESPONSE, other) => Err(FrameError::Malformed(format!(
            "'{name}' payload must be a string, got {other}"
        ))),
        (other, _) => Err(FrameError::Malformed(format!("unknown event '{other}'"))),
    }
}

async fn send_packet<S>(sink: &mut S, packet: &Packet) -> Result<(), WireError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(packet.encode()?)).await?;
    Ok(())
}

/// Pull the next packet text; `None` when the link is gone.
fn packet_text(
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<Option<String>, WireError> {
    match msg {
        Some(Ok(Message::Text(text))) => Ok(Some(text)),
        Some(Ok(Message::Binary(data))) => String::from_utf8(data)
            .map(Some)
            .map_err(|_| FrameError::InvalidUtf8.into()),
        Some(Ok(Message::Close(_))) | None => Err(WireError::ConnectionClosed),
        Some(Ok(_)) => Ok(None),
        Some(Err(e)) => Err(e.into()),
    }
}

/// Server half of one channel connection.
async fn serve_link<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    link: &SocketLink,
    options: &TransportOptions,
) -> Result<(), WireError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let open = OpenInfo {
        sid: uuid::Uuid::new_v4().to_string(),
        ping_interval: options.heartbeat_interval.as_millis() as u64,
        ping_timeout: options.heartbeat_timeout.as_millis() as u64,
    };
    send_packet(&mut ws_tx, &Packet::Open(open.clone())).await?;
    debug!(sid = %open.sid, "Channel: session opened");

    let Some(mut outbound) = link.attach() else {
        let _ = send_packet(&mut ws_tx, &Packet::Close).await;
        return Ok(());
    };
    let handle = link.handle().clone();
    let window = open.silence_window();
    let mut ping = tokio::time::interval_at(
        Instant::now() + options.heartbeat_interval,
        options.heartbeat_interval,
    );
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = send_packet(&mut ws_tx, &Packet::Close).await;
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > window {
                    warn!(sid = %open.sid, "Channel: peer missed heartbeat, dropping");
                    return Err(WireError::Protocol("heartbeat timeout".to_string()));
                }
                send_packet(&mut ws_tx, &Packet::Ping).await?;
            }
            msg = ws_rx.next() => {
                let Some(text) = packet_text(msg)? else { continue };
                last_seen = Instant::now();
                match Packet::decode(&text) {
                    Ok(Packet::Ping) => send_packet(&mut ws_tx, &Packet::Pong).await?,
                    Ok(Packet::Pong) => {}
                    Ok(Packet::Close) => return Ok(()),
                    Ok(Packet::Event(frame)) => {
                        link.deliver(Ok(frame), options.violation_policy);
                    }
                    Ok(Packet::Open(_)) => {
                        if !link.deliver(
                            Err(FrameError::Malformed("open packet from client".to_string())),
                            options.violation_policy,
                        ) {
                            return Err(WireError::Protocol("unexpected open packet".to_string()));
                        }
                    }
                    Err(e) => {
                        if !link.deliver(Err(e), options.violation_policy) {
                            let _ = send_packet(&mut ws_tx, &Packet::Close).await;
                            return Err(WireError::Protocol("undecodable packet".to_string()));
                        }
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                send_packet(&mut ws_tx, &Packet::Event(frame)).await?;
            }
        }
    }
}

/// How a client link ended.
enum LinkEnd {
    /// `close()` was called; stop for good.
    Closed,
    /// The link was open and then dropped.
    Dropped(WireError),
    /// The server never opened the link.
    Refused(WireError),
}

/// Wait for the server's open packet.
async fn read_open<R>(ws_rx: &mut R) -> Result<OpenInfo, WireError>
where
    R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let Some(text) = packet_text(ws_rx.next().await)? else {
            continue;
        };
        return match Packet::decode(&text)? {
            Packet::Open(info) => Ok(info),
            other => Err(WireError::Protocol(format!(
                "expected open packet, got {other:?}"
            ))),
        };
    }
}

/// Client half of one channel connection.
async fn client_link<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    link: &SocketLink,
    options: &TransportOptions,
) -> LinkEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let handle = link.handle().clone();

    let handshake = tokio::time::timeout(options.heartbeat_timeout, read_open(&mut ws_rx));
    let open = tokio::select! {
        _ = handle.closed() => return LinkEnd::Closed,
        res = handshake => match res {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return LinkEnd::Refused(e),
            Err(_) => return LinkEnd::Refused(WireError::Protocol("open handshake timed out".to_string())),
        },
    };

    let Some(mut outbound) = link.attach() else {
        return LinkEnd::Closed;
    };
    info!(sid = %open.sid, "Channel: connected to {}", handle.peer());
    let window = open.silence_window();
    let mut last_seen = Instant::now();

    let error = loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = send_packet(&mut ws_tx, &Packet::Close).await;
                let _ = ws_tx.send(Message::Close(None)).await;
                return LinkEnd::Closed;
            }
            _ = tokio::time::sleep_until(last_seen + window) => {
                break WireError::Protocol("server heartbeat lost".to_string());
            }
            msg = ws_rx.next() => {
                let text = match packet_text(msg) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => break e,
                };
                last_seen = Instant::now();
                match Packet::decode(&text) {
                    Ok(Packet::Ping) => {
                        if let Err(e) = send_packet(&mut ws_tx, &Packet::Pong).await {
                            break e;
                        }
                    }
                    Ok(Packet::Pong) => {}
                    Ok(Packet::Close) => break WireError::ConnectionClosed,
                    Ok(Packet::Event(frame)) => {
                        link.deliver(Ok(frame), options.violation_policy);
                    }
                    Ok(Packet::Open(_)) => {
                        if !link.deliver(
                            Err(FrameError::Malformed("repeated open packet".to_string())),
                            options.violation_policy,
                        ) {
                            break WireError::Protocol("repeated open packet".to_string());
                        }
                    }
                    Err(e) => {
                        if !link.deliver(Err(e), options.violation_policy) {
                            break WireError::Protocol("undecodable packet".to_string());
                        }
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return LinkEnd::Closed };
                if let Err(e) = send_packet(&mut ws_tx, &Packet::Event(frame)).await {
                    break e;
                }
            }
        }
    };
    LinkEnd::Dropped(error)
}

/// Dial, run, and redial until the socket is closed.
async fn run_client(url: String, link: SocketLink, options: TransportOptions) {
    let handle = link.handle().clone();
    let mut backoff = options.initial_backoff;

    loop {
        info!("Channel: connecting to {}", url);
        let dial = tokio::select! {
            _ = handle.closed() => break,
            dial = tokio_tungstenite::connect_async(url.as_str()) => dial,
        };
        match dial {
            Ok((ws, _)) => match client_link(ws, &link, &options).await {
                LinkEnd::Closed => break,
                LinkEnd::Dropped(e) => {
                    backoff = options.initial_backoff;
                    warn!("Channel: link to {} lost: {}", url, e);
                }
                LinkEnd::Refused(e) => warn!("Channel: {} refused the session: {}", url, e),
            },
            Err(e) => warn!("Channel: connection to {} failed: {}", url, e),
        }
        link.detach();

        warn!("Channel: reconnecting in {backoff:?}");
        tokio::select! {
            _ = handle.closed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(options.max_backoff);
    }

    link.detach();
    link.finish();
    info!("Channel: client loop for {} stopped", url);
}

/// socket.io-style multiplexed channel. Addresses are `http://` or `ws://`
/// URLs; the client side reconnects on its own.
#[derive(Debug, Clone, Default)]
pub struct ChannelTransport {
    options: TransportOptions,
}

impl ChannelTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn connect(&self, address: &str) -> Result<PeerSocket, WireError> {
        let mut url = ws_url(address, Some(DEFAULT_PATH))?;
        url.set_query(Some("EIO=4&transport=websocket"));
        let (socket, link) = PeerSocket::pair(address.to_string());
        tokio::spawn(run_client(url.to_string(), link, self.options.clone()));
        Ok(socket)
    }

    async fn listen(&self, bind: &BindConfig) -> Result<Listener, WireError> {
        let addr = bind.socket_addr("http")?;
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Channel: hub server is running on {}", local_addr);

        let (handle, mut acceptor) = Listener::new(local_addr.to_string(), None);
        let options = self.options.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = acceptor.stopped() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Channel: accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            debug!("Channel: handshake with {} failed: {}", peer, e);
                            return;
                        }
                    };
                    let Some(link) = acceptor.admit(peer.to_string()) else {
                        return;
                    };
                    let id = link.handle().id();
                    if let Err(e) = serve_link(ws, &link, &options).await {
                        debug!(socket = id, "Channel: connection from {} ended: {}", peer, e);
                    }
                    link.detach();
                    acceptor.release(id);
                    link.finish();
                });
            }
            debug!("Channel: accept loop on {} stopped", local_addr);
        });
        Ok(handle)
    }
}
