//! Worker node.
//!
//! A worker dials the hub, announces its method table on every connect and
//! then serves the hub's requests. Calls it makes itself go through whatever
//! hub session is current; with no session they queue until the next one.

use crate::context::{raised, NodeContext, NodeCore};
use crate::method::{MethodTable, INVOKE};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use switchyard_wire::rpc::codes;
use switchyard_wire::{
    Dispatcher, Interface, PeerSession, PeerSocket, RpcError, SocketEvent, SocketHandle,
    Transport, WireError,
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Connection phase of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Re-issue a method-not-found call once through the hub's `invoke`.
    pub invoke_fallback: bool,
    /// How long a call waits for a hub session. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// First delay before redialing a hub whose socket ended.
    pub initial_backoff: Duration,
    /// Redial delay ceiling.
    pub max_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            invoke_fallback: true,
            connect_timeout: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }
}

struct Link {
    phase: WorkerPhase,
    session: Option<Arc<PeerSession>>,
    /// Calls waiting for a session, released in registration order.
    waiters: VecDeque<oneshot::Sender<Arc<PeerSession>>>,
    socket: Option<SocketHandle>,
    terminated: bool,
}

struct WorkerInner {
    name: String,
    remote_hub: String,
    methods: MethodTable,
    context: NodeContext,
    transport: Arc<dyn Transport>,
    options: WorkerOptions,
    link: Mutex<Link>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl WorkerInner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_terminated(&self) -> bool {
        self.link().terminated
    }

    fn dialing(&self, socket: SocketHandle) {
        let mut link = self.link();
        if link.terminated {
            socket.close();
            return;
        }
        link.phase = WorkerPhase::Connecting;
        link.socket = Some(socket);
    }

    /// Make `session` current and release every queued call onto it.
    fn install(&self, session: Arc<PeerSession>) {
        let waiters = {
            let mut link = self.link();
            if link.terminated {
                return;
            }
            link.phase = WorkerPhase::Connected;
            link.session = Some(Arc::clone(&session));
            std::mem::take(&mut link.waiters)
        };
        if !waiters.is_empty() {
            debug!(queued = waiters.len(), "Releasing calls onto new hub session");
        }
        for waiter in waiters {
            let _ = waiter.send(Arc::clone(&session));
        }
    }

    fn clear_session(&self) {
        let session = {
            let mut link = self.link();
            link.phase = WorkerPhase::Disconnected;
            link.session.take()
        };
        if let Some(session) = session {
            session.shutdown();
        }
    }

    /// Drop `stale` if it is still current; a newer session is left alone.
    fn forget(&self, stale: &Arc<PeerSession>) {
        let mut link = self.link();
        if link
            .session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, stale))
        {
            link.session = None;
        }
    }

    /// Current hub session, waiting for the next connect if there is none.
    async fn session(&self) -> Result<Arc<PeerSession>, RpcError> {
        let rx = {
            let mut link = self.link();
            if link.terminated {
                return Err(RpcError::node_terminated());
            }
            if let Some(session) = &link.session {
                return Ok(Arc::clone(session));
            }
            link.waiters.retain(|w| !w.is_closed());
            let (tx, rx) = oneshot::channel();
            link.waiters.push_back(tx);
            rx
        };
        debug!(hub = %self.remote_hub, "No hub session, call queued");

        let resolved = match self.options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                RpcError::new(
                    codes::PEER_DISCONNECTED,
                    format!("No hub session within {limit:?}"),
                )
            })?,
            None => rx.await,
        };
        resolved.map_err(|_| RpcError::node_terminated())
    }

    /// Send one call to the hub. Calls that never reached the wire wait for
    /// the next session and are written there.
    async fn call_hub(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        loop {
            let session = self.session().await?;
            match session.client().begin_call(method, params.clone()) {
                Ok(pending) => return pending.wait().await,
                Err(e) if e.code == codes::PEER_DISCONNECTED => self.forget(&session),
                Err(e) => return Err(e),
            }
        }
    }

    async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        if self.methods.contains(method) {
            return self.methods.dispatch(&self.context, method, params).await;
        }
        let fallback_params = self.options.invoke_fallback.then(|| params.clone());
        match self.call_hub(method, params).await {
            Err(e) if e.is_method_not_found() => match fallback_params {
                Some(params) => {
                    debug!(method, "Hub has no such method, retrying through invoke");
                    let mut args = Vec::with_capacity(params.len() + 1);
                    args.push(Value::String(method.to_string()));
                    args.extend(params);
                    self.call_hub(INVOKE, args).await
                }
                None => Err(e),
            },
            outcome => outcome,
        }
    }
}

#[async_trait]
impl NodeCore for WorkerInner {
    async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        WorkerInner::remote_call(self, method, params).await
    }

    fn terminate(&self) {
        let (session, waiters, socket) = {
            let mut link = self.link();
            if link.terminated {
                return;
            }
            link.terminated = true;
            link.phase = WorkerPhase::Disconnected;
            (
                link.session.take(),
                std::mem::take(&mut link.waiters),
                link.socket.take(),
            )
        };
        info!(worker = %self.name, queued = waiters.len(), "Worker terminating");
        drop(waiters);
        if let Some(session) = session {
            session.shutdown();
        }
        if let Some(socket) = socket {
            socket.close();
        }
        self.shutdown.send_replace(true);
        self.context.mark_exited();
    }
}

/// Serves the worker's own method table to the hub.
struct WorkerDispatcher {
    worker: Arc<WorkerInner>,
}

#[async_trait]
impl Dispatcher for WorkerDispatcher {
    async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.worker
            .methods
            .dispatch(&self.worker.context, method, params)
            .await
    }
}

/// Pump one socket until it ends. Returns whether a link ever came up.
async fn drive_socket(
    worker: &Arc<WorkerInner>,
    dispatcher: &Arc<dyn Dispatcher>,
    socket: PeerSocket,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (handle, mut events) = socket.into_parts();
    let mut active: Option<Arc<PeerSession>> = None;
    let mut linked = false;

    loop {
        let event = tokio::select! {
            _ = raised(shutdown) => {
                handle.close();
                return linked;
            }
            event = events.recv() => event,
        };
        match event {
            None => return linked,
            Some(SocketEvent::Connect) => {
                linked = true;
                let session = Arc::new(PeerSession::open(handle.clone(), Arc::clone(dispatcher)));
                let iface = Interface::new(worker.name.clone(), worker.methods.names());
                if let Err(e) = handle.send_interface(iface) {
                    warn!(hub = %handle.peer(), "Could not announce interface: {e}");
                    continue;
                }
                info!(hub = %handle.peer(), "Connected to remote hub");
                active = Some(Arc::clone(&session));
                worker.install(session);
            }
            Some(SocketEvent::Disconnect) => {
                active = None;
                worker.clear_session();
                info!(hub = %handle.peer(), "Disconnected from remote hub");
            }
            Some(event) => {
                let Some(session) = active.as_ref() else {
                    continue;
                };
                if let Some(SocketEvent::Interface(iface)) = session.handle_event(event) {
                    warn!(name = %iface.name, "Ignoring interface announcement from hub");
                }
            }
        }
    }
}

async fn run(worker: Arc<WorkerInner>, mut socket: PeerSocket) {
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(WorkerDispatcher {
        worker: Arc::clone(&worker),
    });
    let mut shutdown = worker.shutdown.subscribe();
    let mut backoff = worker.options.initial_backoff;

    loop {
        let linked = drive_socket(&worker, &dispatcher, socket, &mut shutdown).await;
        worker.clear_session();
        if worker.is_terminated() {
            break;
        }
        if linked {
            backoff = worker.options.initial_backoff;
        }
        info!(hub = %worker.remote_hub, "Redialing remote hub in {:?}", backoff);
        tokio::select! {
            _ = raised(&mut shutdown) => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(worker.options.max_backoff);

        socket = match worker.transport.connect(&worker.remote_hub) {
            Ok(socket) => socket,
            Err(e) => {
                error!(hub = %worker.remote_hub, "Redial failed: {e}");
                break;
            }
        };
        worker.dialing(socket.handle().clone());
    }

    debug!(worker = %worker.name, "Worker loop finished");
    worker.stopped.send_replace(true);
}

/// A running worker.
pub struct WorkerNode {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerNode")
            .field("name", &self.inner.name)
            .field("remote_hub", &self.inner.remote_hub)
            .field("phase", &self.phase())
            .finish()
    }
}

impl WorkerNode {
    /// Validate the hub address and start dialing it.
    pub fn start(
        name: &str,
        methods: MethodTable,
        transport: Arc<dyn Transport>,
        remote_hub: &str,
        options: WorkerOptions,
    ) -> Result<WorkerNode, WireError> {
        let socket = transport.connect(remote_hub)?;
        let (shutdown, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);

        let inner = Arc::new(WorkerInner {
            name: name.to_string(),
            remote_hub: remote_hub.to_string(),
            methods,
            context: NodeContext::detached(name),
            transport,
            options,
            link: Mutex::new(Link {
                phase: WorkerPhase::Connecting,
                session: None,
                waiters: VecDeque::new(),
                socket: Some(socket.handle().clone()),
                terminated: false,
            }),
            shutdown,
            stopped,
        });
        let core: Weak<dyn NodeCore> = Arc::downgrade(&inner) as Weak<dyn NodeCore>;
        inner.context.bind(core);

        info!(
            worker = %name,
            hub = %remote_hub,
            transport = %inner.transport.kind(),
            methods = ?inner.methods.names(),
            "Worker started"
        );
        tokio::spawn(run(Arc::clone(&inner), socket));
        Ok(WorkerNode { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn remote_hub(&self) -> &str {
        &self.inner.remote_hub
    }

    pub fn phase(&self) -> WorkerPhase {
        self.inner.link().phase
    }

    pub fn context(&self) -> NodeContext {
        self.inner.context.clone()
    }

    /// Calls waiting for a hub session.
    pub fn queued_calls(&self) -> usize {
        self.inner
            .link()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    /// Call `method` locally if bound here, otherwise through the hub.
    pub async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.inner.remote_call(method, params).await
    }

    /// Close the hub connection for good and fail queued calls.
    pub fn terminate(&self) {
        NodeCore::terminate(&*self.inner);
    }

    /// Resolves once the connection loop has exited.
    pub async fn stopped(&self) {
        raised(&mut self.inner.stopped.subscribe()).await;
    }
}
