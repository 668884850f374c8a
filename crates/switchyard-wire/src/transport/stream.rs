//! Byte-stream back-ends: TCP and Unix domain sockets.
//!
//! Both move raw codec bytes; one driver task per connection reads chunks
//! into a [`FrameDecoder`] and writes queued frames with a single
//! `write_all` each.

use super::{split_host_port, strip_scheme, Acceptor, BindConfig, Listener, Transport};
use super::{TransportOptions, READ_BUF_SIZE};
use crate::frame::FrameDecoder;
use crate::socket::{PeerSocket, SocketLink, ViolationPolicy, WireError};

use async_trait::async_trait;
use std::time::Duration;
use switchyard_types::TransportKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Run one connection until it ends, then report it closed.
pub(crate) async fn drive_stream<S>(
    stream: S,
    link: SocketLink,
    policy: ViolationPolicy,
    acceptor: Option<Acceptor>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = link.handle().id();
    match run_stream(stream, &link, policy).await {
        Ok(()) => debug!(socket = id, peer = %link.handle().peer(), "stream closed"),
        Err(e) => debug!(socket = id, peer = %link.handle().peer(), "stream ended: {e}"),
    }
    link.detach();
    if let Some(acceptor) = acceptor {
        acceptor.release(id);
    }
    link.finish();
}

async fn run_stream<S>(stream: S, link: &SocketLink, policy: ViolationPolicy) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Some(mut outbound) = link.attach() else {
        return Ok(());
    };
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let handle = link.handle().clone();

    loop {
        tokio::select! {
            _ = handle.closed() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(WireError::ConnectionClosed);
                }
                for decoded in decoder.decode_chunk(&buf[..n]) {
                    if !link.deliver(decoded, policy) {
                        let _ = writer.shutdown().await;
                        return Err(WireError::Protocol("undecodable frame".to_string()));
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let bytes = frame.encode()?;
                writer.write_all(&bytes).await?;
            }
        }
    }
}

/// Raw TCP carrier. Addresses are `tcp://host:port` or `host:port`.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    options: TransportOptions,
}

impl TcpTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn connect(&self, address: &str) -> Result<PeerSocket, WireError> {
        let target = strip_scheme(address, "tcp");
        if split_host_port(target).is_none() {
            return Err(WireError::InvalidAddress {
                address: address.to_string(),
                reason: "expected tcp://host:port".to_string(),
            });
        }
        let target = target.to_string();
        let (socket, link) = PeerSocket::pair(target.clone());
        let policy = self.options.violation_policy;

        tokio::spawn(async move {
            info!("TCP: connecting to {}", target);
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    drive_stream(stream, link, policy, None).await;
                }
                Err(e) => {
                    warn!("TCP: connection to {} failed: {}", target, e);
                    link.abort();
                }
            }
        });
        Ok(socket)
    }

    async fn listen(&self, bind: &BindConfig) -> Result<Listener, WireError> {
        let addr = bind.socket_addr("tcp")?;
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP: hub listening on {}", local_addr);

        let (handle, mut acceptor) = Listener::new(local_addr.to_string(), None);
        let policy = self.options.violation_policy;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = acceptor.stopped() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("TCP: accepted connection from {}", addr);
                        let _ = stream.set_nodelay(true);
                        let Some(link) = acceptor.admit(addr.to_string()) else {
                            break;
                        };
                        tokio::spawn(drive_stream(stream, link, policy, Some(acceptor.clone())));
                    }
                    Err(e) => {
                        error!("TCP: accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("TCP: accept loop on {} stopped", local_addr);
        });
        Ok(handle)
    }
}

/// Unix domain socket carrier. Addresses are paths, optionally `unix://path`.
#[cfg(unix)]
#[derive(Debug, Clone, Default)]
pub struct UnixTransport {
    options: TransportOptions,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[cfg(unix)]
#[async_trait]
impl Transport for UnixTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn connect(&self, address: &str) -> Result<PeerSocket, WireError> {
        let path = strip_scheme(address, "unix");
        if path.is_empty() {
            return Err(WireError::InvalidAddress {
                address: address.to_string(),
                reason: "empty socket path".to_string(),
            });
        }
        let path = path.to_string();
        let (socket, link) = PeerSocket::pair(path.clone());
        let policy = self.options.violation_policy;

        tokio::spawn(async move {
            info!("Unix: connecting to {}", path);
            match tokio::net::UnixStream::connect(&path).await {
                Ok(stream) => drive_stream(stream, link, policy, None).await,
                Err(e) => {
                    warn!("Unix: connection to {} failed: {}", path, e);
                    link.abort();
                }
            }
        });
        Ok(socket)
    }

    async fn listen(&self, bind: &BindConfig) -> Result<Listener, WireError> {
        let path = bind
            .address
            .as_deref()
            .map(|a| strip_scheme(a, "unix"))
            .filter(|a| !a.is_empty())
            .ok_or_else(|| WireError::InvalidAddress {
                address: String::new(),
                reason: "unix transport needs a socket path in `address`".to_string(),
            })?
            .to_string();

        let listener = tokio::net::UnixListener::bind(&path)?;
        info!("Unix: hub listening on {}", path);

        let (handle, mut acceptor) = Listener::new(path.clone(), Some(path.clone().into()));
        let policy = self.options.violation_policy;
        tokio::spawn(async move {
            let mut next_peer = 0u64;
            loop {
                let accepted = tokio::select! {
                    _ = acceptor.stopped() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        next_peer += 1;
                        let peer = format!("{path}#{next_peer}");
                        debug!("Unix: accepted connection {}", peer);
                        let Some(link) = acceptor.admit(peer) else {
                            break;
                        };
                        tokio::spawn(drive_stream(stream, link, policy, Some(acceptor.clone())));
                    }
                    Err(e) => {
                        error!("Unix: accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("Unix: accept loop on {} stopped", path);
        });
        Ok(handle)
    }
}
