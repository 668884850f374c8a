//! Hub node.
//!
//! The hub accepts peer connections, records each peer's announced interface
//! in a [`Balancer`], and serves the synthetic `invoke(method, ...args)` call:
//! pick a capable peer and forward, or park the caller in a FIFO of wait
//! handles until a capable peer announces itself.
//!
//! Per-connection states are `connected-unannounced`, `announced` and
//! `disconnected`; a second announcement on one connection closes it.

use crate::context::{raised, NodeContext, NodeCore};
use crate::method::{MethodTable, INVOKE};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use switchyard_types::TransportKind;
use switchyard_wire::{
    Balancer, BindConfig, Dispatcher, Listener, PeerSession, PeerSocket, RpcClient, RpcError,
    SocketEvent, Transport, WireError,
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Hub tuning.
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    /// How long `invoke` waits for a capable peer. `None` waits forever.
    pub invoke_timeout: Option<Duration>,
}

/// Snapshot of one announced peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Socket id of the connection the peer announced on.
    pub session_id: u64,
    pub name: String,
    pub supported_methods: Vec<String>,
    /// Remote address as reported by the transport.
    pub remote: String,
    pub connected_at: DateTime<Utc>,
}

/// A routable peer: its announcement plus the calling side of its session.
#[derive(Clone)]
struct PeerRef {
    info: Arc<PeerInfo>,
    client: Arc<RpcClient>,
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.info.session_id == other.info.session_id
    }
}

impl PeerRef {
    fn supports(&self, method: &str) -> bool {
        self.info.supported_methods.iter().any(|m| m == method)
    }
}

/// A parked `invoke` waiting for a peer that supports `method`.
struct WaitHandle {
    method: String,
    tx: oneshot::Sender<PeerRef>,
}

#[derive(Default)]
struct Routing {
    balancer: Balancer<PeerRef>,
    waiters: VecDeque<WaitHandle>,
    terminated: bool,
}

struct HubInner {
    name: String,
    methods: MethodTable,
    context: NodeContext,
    options: HubOptions,
    routing: Mutex<Routing>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl HubInner {
    fn routing(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route `method` to a capable peer, waiting for one if necessary.
    async fn route(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let peer = self.resolve(method).await?;
        debug!(
            method,
            peer = %peer.info.name,
            session = peer.info.session_id,
            "Forwarding call"
        );
        peer.client.call(method, params).await
    }

    async fn resolve(&self, method: &str) -> Result<PeerRef, RpcError> {
        let rx = {
            let mut routing = self.routing();
            if routing.terminated {
                return Err(RpcError::node_terminated());
            }
            if let Some(peer) = routing.balancer.balance(|p| p.supports(method)) {
                return Ok(peer);
            }
            routing.waiters.retain(|w| !w.tx.is_closed());
            let (tx, rx) = oneshot::channel();
            routing.waiters.push_back(WaitHandle {
                method: method.to_string(),
                tx,
            });
            rx
        };
        debug!(method, "No peer supports method yet, waiting");

        let resolved = match self.options.invoke_timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                warn!(method, "No capable peer within {:?}", limit);
                RpcError::route_timeout(method)
            })?,
            None => rx.await,
        };
        resolved.map_err(|_| RpcError::node_terminated())
    }

    /// Register an announced peer and release every waiter it can serve.
    fn announce(&self, peer: PeerRef) -> usize {
        let mut routing = self.routing();
        routing.balancer.connect(&peer.info.name, peer.clone());

        let mut resolved = 0;
        for waiter in std::mem::take(&mut routing.waiters) {
            if !peer.supports(&waiter.method) {
                routing.waiters.push_back(waiter);
            } else if waiter.tx.send(peer.clone()).is_ok() {
                resolved += 1;
            }
        }
        resolved
    }

    fn withdraw(&self, peer: &PeerRef) {
        self.routing().balancer.disconnect(&peer.info.name, peer);
    }

    fn peers(&self) -> Vec<PeerInfo> {
        let routing = self.routing();
        routing
            .balancer
            .keys()
            .iter()
            .flat_map(|key| routing.balancer.items(key))
            .map(|peer| (*peer.info).clone())
            .collect()
    }

    fn pending_invocations(&self) -> usize {
        self.routing()
            .waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl NodeCore for HubInner {
    async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.route(method, params).await
    }

    fn terminate(&self) {
        let waiters = {
            let mut routing = self.routing();
            if routing.terminated {
                return;
            }
            routing.terminated = true;
            std::mem::take(&mut routing.waiters)
        };
        info!(hub = %self.name, pending = waiters.len(), "Hub terminating");
        // Dropping the senders fails every parked invoke with node-terminated.
        drop(waiters);
        self.shutdown.send_replace(true);
        self.context.mark_exited();
    }
}

/// Serves `invoke` plus the hub's own method table to one peer.
struct HubDispatcher {
    hub: Arc<HubInner>,
}

#[async_trait]
impl Dispatcher for HubDispatcher {
    async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        if method != INVOKE {
            return self
                .hub
                .methods
                .dispatch(&self.hub.context, method, params)
                .await;
        }
        let mut params = params.into_iter();
        let target = match params.next() {
            Some(Value::String(target)) if target != INVOKE => target,
            _ => {
                return Err(RpcError::invalid_params(
                    "invoke expects a method name as its first argument",
                ))
            }
        };
        self.hub.route(&target, params.collect()).await
    }
}

/// Drive one inbound connection until it is gone.
async fn serve_peer(hub: Arc<HubInner>, socket: PeerSocket) {
    let (handle, mut events) = socket.into_parts();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(HubDispatcher {
        hub: Arc::clone(&hub),
    });
    let mut session: Option<PeerSession> = None;
    let mut announced: Option<PeerRef> = None;

    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Connect => {
                debug!(socket = handle.id(), remote = %handle.peer(), "Peer connected");
                session = Some(PeerSession::open(handle.clone(), Arc::clone(&dispatcher)));
            }
            SocketEvent::Disconnect => {
                if let Some(peer) = announced.take() {
                    hub.withdraw(&peer);
                    info!(name = %peer.info.name, socket = handle.id(), "Peer disconnected");
                }
                session = None;
            }
            event => {
                let Some(active) = session.as_ref() else {
                    continue;
                };
                let Some(SocketEvent::Interface(iface)) = active.handle_event(event) else {
                    continue;
                };
                if let Some(existing) = &announced {
                    warn!(
                        socket = handle.id(),
                        name = %existing.info.name,
                        "Cannot redefine interface, closing connection"
                    );
                    handle.close();
                    continue;
                }
                let peer = PeerRef {
                    info: Arc::new(PeerInfo {
                        session_id: handle.id(),
                        name: iface.name,
                        supported_methods: iface.supported_methods,
                        remote: handle.peer().to_string(),
                        connected_at: Utc::now(),
                    }),
                    client: Arc::clone(active.client()),
                };
                let resolved = hub.announce(peer.clone());
                info!(
                    name = %peer.info.name,
                    methods = ?peer.info.supported_methods,
                    resolved,
                    "Peer announced interface"
                );
                announced = Some(peer);
            }
        }
    }

    if let Some(peer) = announced {
        hub.withdraw(&peer);
    }
}

async fn accept_loop(hub: Arc<HubInner>, mut listener: Listener) {
    let mut shutdown = hub.shutdown.subscribe();
    loop {
        let socket = tokio::select! {
            _ = raised(&mut shutdown) => break,
            socket = listener.accept() => socket,
        };
        let Some(socket) = socket else {
            break;
        };
        tokio::spawn(serve_peer(Arc::clone(&hub), socket));
    }
    listener.stop();
    info!(hub = %hub.name, "Hub stopped");
    hub.stopped.send_replace(true);
}

/// A running hub.
pub struct HubNode {
    inner: Arc<HubInner>,
    kind: TransportKind,
    local_addr: String,
}

impl std::fmt::Debug for HubNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubNode")
            .field("name", &self.inner.name)
            .field("transport", &self.kind)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl HubNode {
    /// Bind the listener and start accepting peers.
    pub async fn start(
        name: &str,
        methods: MethodTable,
        transport: Arc<dyn Transport>,
        bind: &BindConfig,
        options: HubOptions,
    ) -> Result<HubNode, WireError> {
        let listener = transport.listen(bind).await?;
        let local_addr = listener.local_addr().to_string();
        let (shutdown, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);

        let inner = Arc::new(HubInner {
            name: name.to_string(),
            methods,
            context: NodeContext::detached(name),
            options,
            routing: Mutex::new(Routing::default()),
            shutdown,
            stopped,
        });
        let core: Weak<dyn NodeCore> = Arc::downgrade(&inner) as Weak<dyn NodeCore>;
        inner.context.bind(core);

        info!(
            hub = %name,
            transport = %transport.kind(),
            addr = %local_addr,
            methods = ?inner.methods.names(),
            "Hub started"
        );
        tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        Ok(HubNode {
            inner,
            kind: transport.kind(),
            local_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn transport(&self) -> TransportKind {
        self.kind
    }

    /// Bound address: resolved `host:port`, or the socket path.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn context(&self) -> NodeContext {
        self.inner.context.clone()
    }

    /// Announced peers, grouped by name in first-announcement order.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers()
    }

    /// `invoke` calls parked waiting for a capable peer.
    pub fn pending_invocations(&self) -> usize {
        self.inner.pending_invocations()
    }

    /// Route a call exactly like a peer's `invoke` would.
    pub async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.inner.route(method, params).await
    }

    /// Stop listening, drop every peer and fail parked invocations.
    pub fn terminate(&self) {
        NodeCore::terminate(&*self.inner);
    }

    /// Resolves once the listener has been released.
    pub async fn stopped(&self) {
        raised(&mut self.inner.stopped.subscribe()).await;
    }
}
