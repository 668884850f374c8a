//! End-to-end mesh behaviour over real loopback sockets.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_node::{create_node_with, MethodTable, Node, NodeContext, WorkerPhase};
use switchyard_types::{NodeConfig, Settings, TransportKind};
use switchyard_wire::rpc::codes;
use switchyard_wire::{
    transport_for, BindConfig, Dispatcher, PeerSession, RpcError, SocketEvent, TransportOptions,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_options() -> TransportOptions {
    TransportOptions {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        ..TransportOptions::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn echo_methods() -> MethodTable {
    MethodTable::new().with("echo", |_ctx, params| async move {
        Ok(params.into_iter().next().unwrap_or(Value::Null))
    })
}

fn add_methods() -> MethodTable {
    MethodTable::new().with("add", |_ctx, params| async move {
        Ok(json!(params.iter().filter_map(Value::as_i64).sum::<i64>()))
    })
}

fn tagged(tag: &'static str) -> MethodTable {
    MethodTable::new().with("whoami", move |_ctx, _params| async move { Ok(json!(tag)) })
}

async fn start_hub(kind: TransportKind, port: u16, methods: MethodTable) -> Node {
    let config = NodeConfig {
        settings: Settings {
            hub: true,
            transport: Some(kind),
            port: Some(port),
            address: Some("127.0.0.1".into()),
            ..Settings::default()
        },
    };
    tokio_test::assert_ok!(create_node_with("hub", &config, methods, fast_options()).await)
}

fn hub_address(kind: TransportKind, local: &str) -> String {
    match kind {
        TransportKind::Channel => format!("http://{local}"),
        TransportKind::WebSocket => format!("ws://{local}"),
        TransportKind::Tcp => format!("tcp://{local}"),
        TransportKind::Unix => local.to_string(),
    }
}

async fn start_worker(
    name: &str,
    kind: TransportKind,
    remote_hub: &str,
    methods: MethodTable,
    invoke_fallback: bool,
) -> Node {
    let config = NodeConfig {
        settings: Settings {
            transport: Some(kind),
            remote_hub: Some(remote_hub.to_string()),
            invoke_fallback,
            ..Settings::default()
        },
    };
    tokio_test::assert_ok!(create_node_with(name, &config, methods, fast_options()).await)
}

fn local_addr(hub: &Node) -> String {
    hub.as_hub().expect("hub node").local_addr().to_string()
}

async fn call(ctx: &NodeContext, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
    tokio::time::timeout(WAIT, ctx.remote_call(method, params))
        .await
        .expect("call did not finish in time")
}

#[tokio::test]
async fn test_pending_invoke_resolves_on_announce() {
    let hub = start_hub(TransportKind::Tcp, 0, MethodTable::new()).await;
    let hub_node = hub.as_hub().unwrap();

    let pending = {
        let ctx = hub.context();
        tokio::spawn(async move { ctx.remote_call("echo", vec![json!("x")]).await })
    };
    eventually(|| hub_node.pending_invocations() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    let address = hub_address(TransportKind::Tcp, &local_addr(&hub));
    let worker = start_worker("w1", TransportKind::Tcp, &address, echo_methods(), true).await;

    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(tokio_test::assert_ok!(result), json!("x"));
    assert_eq!(hub_node.pending_invocations(), 0);

    let peers = hub_node.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "w1");
    assert_eq!(peers[0].supported_methods, vec!["echo".to_string()]);

    worker.terminate();
    hub.terminate();
}

#[tokio::test]
async fn test_worker_to_worker_on_every_network_transport() {
    for kind in [
        TransportKind::Tcp,
        TransportKind::WebSocket,
        TransportKind::Channel,
    ] {
        let hub = start_hub(kind, 0, MethodTable::new()).await;
        let address = hub_address(kind, &local_addr(&hub));
        let adder = start_worker("adder", kind, &address, add_methods(), true).await;
        let caller = start_worker("caller", kind, &address, MethodTable::new(), true).await;

        // The hub has no `add` of its own, so the caller falls back to invoke.
        let sum = call(&caller.context(), "add", vec![json!(2), json!(3)]).await;
        assert_eq!(sum, Ok(json!(5)), "transport {kind}");

        caller.terminate();
        adder.terminate();
        hub.terminate();
        tokio::time::timeout(WAIT, hub.stopped()).await.unwrap();
    }
}

#[tokio::test]
async fn test_fallback_disabled_propagates_method_not_found() {
    let hub = start_hub(TransportKind::Tcp, 0, MethodTable::new()).await;
    let address = hub_address(TransportKind::Tcp, &local_addr(&hub));
    let adder = start_worker("adder", TransportKind::Tcp, &address, add_methods(), true).await;
    let caller =
        start_worker("caller", TransportKind::Tcp, &address, MethodTable::new(), false).await;

    let err = tokio_test::assert_err!(call(&caller.context(), "add", vec![json!(1)]).await);
    assert_eq!(err.code, codes::METHOD_NOT_FOUND);

    caller.terminate();
    adder.terminate();
    hub.terminate();
}

/// Answers every request with method-not-found and records what was asked.
struct NothingHere {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Dispatcher for NothingHere {
    async fn dispatch(&self, method: &str, _params: Vec<Value>) -> Result<Value, RpcError> {
        self.seen.lock().unwrap().push(method.to_string());
        Err(RpcError::method_not_found(method))
    }
}

async fn stub_hub() -> (String, Arc<Mutex<Vec<String>>>) {
    let transport = transport_for(TransportKind::Tcp, TransportOptions::default()).unwrap();
    let bind = BindConfig {
        port: Some(0),
        address: Some("127.0.0.1".into()),
    };
    let mut listener = transport.listen(&bind).await.unwrap();
    let address = listener.local_addr().to_string();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(NothingHere {
        seen: Arc::clone(&seen),
    });

    tokio::spawn(async move {
        let Some(socket) = listener.accept().await else {
            return;
        };
        let (handle, mut events) = socket.into_parts();
        let mut session = None;
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Connect => {
                    session = Some(PeerSession::open(handle.clone(), Arc::clone(&dispatcher)));
                }
                other => {
                    if let Some(session) = &session {
                        session.handle_event(other);
                    }
                }
            }
        }
        drop(listener);
    });
    (address, seen)
}

#[tokio::test]
async fn test_worker_fallback_fails_instead_of_hanging() {
    let (address, seen) = stub_hub().await;
    let worker = start_worker("w", TransportKind::Tcp, &address, MethodTable::new(), true).await;

    let err = tokio_test::assert_err!(call(&worker.context(), "add", vec![json!(1)]).await);
    assert_eq!(err.code, codes::METHOD_NOT_FOUND);
    assert_eq!(*seen.lock().unwrap(), vec!["add".to_string(), "invoke".to_string()]);
    worker.terminate();
}

#[tokio::test]
async fn test_disconnected_worker_is_not_routed_to() {
    let hub = start_hub(TransportKind::Tcp, 0, MethodTable::new()).await;
    let hub_node = hub.as_hub().unwrap();
    let address = hub_address(TransportKind::Tcp, &local_addr(&hub));
    let worker = start_worker("w1", TransportKind::Tcp, &address, echo_methods(), true).await;

    assert_eq!(
        call(&hub.context(), "echo", vec![json!(1)]).await,
        Ok(json!(1))
    );

    // Exit through the context, the way a hosting program would.
    worker.context().set("exit", json!(true));
    tokio::time::timeout(WAIT, worker.stopped()).await.unwrap();
    eventually(|| hub_node.peers().is_empty()).await;

    let ctx = hub.context();
    let queued = tokio::spawn(async move { ctx.remote_call("echo", vec![json!(2)]).await });
    eventually(|| hub_node.pending_invocations() == 1).await;
    assert!(!queued.is_finished());

    hub.terminate();
    let err = queued.await.unwrap().unwrap_err();
    assert_eq!(err.code, codes::NODE_TERMINATED);
}

#[tokio::test]
async fn test_same_name_peers_take_turns() {
    let hub = start_hub(TransportKind::Tcp, 0, MethodTable::new()).await;
    let hub_node = hub.as_hub().unwrap();
    let address = hub_address(TransportKind::Tcp, &local_addr(&hub));
    let a = start_worker("pool", TransportKind::Tcp, &address, tagged("a"), true).await;
    let b = start_worker("pool", TransportKind::Tcp, &address, tagged("b"), true).await;
    eventually(|| hub_node.peers().len() == 2).await;

    let mut answers = Vec::new();
    for _ in 0..4 {
        answers.push(call(&hub.context(), "whoami", vec![]).await.unwrap());
    }
    assert_ne!(answers[0], answers[1]);
    assert_eq!(answers[0], answers[2]);
    assert_eq!(answers[1], answers[3]);

    a.terminate();
    b.terminate();
    hub.terminate();
}

#[tokio::test]
async fn test_queued_call_released_when_hub_appears() {
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let address = format!("127.0.0.1:{port}");
    let worker = start_worker("w", TransportKind::Tcp, &address, MethodTable::new(), true).await;

    let ctx = worker.context();
    let queued = tokio::spawn(async move { ctx.remote_call("ping", vec![]).await });
    eventually(|| worker.as_worker().unwrap().queued_calls() == 1).await;

    let hub_methods = MethodTable::new().with("ping", |_ctx, _params| async { Ok(json!("pong")) });
    let hub = start_hub(TransportKind::Tcp, port, hub_methods).await;

    let result = tokio::time::timeout(WAIT, queued).await.unwrap().unwrap();
    assert_eq!(result, Ok(json!("pong")));

    worker.terminate();
    hub.terminate();
}

/// Bind a hub on a port a previous hub just released. The old accept task
/// drops its listener asynchronously, so the first attempts may still collide.
async fn restart_hub(port: u16, methods: impl Fn() -> MethodTable) -> Node {
    let config = NodeConfig {
        settings: Settings {
            hub: true,
            transport: Some(TransportKind::Tcp),
            port: Some(port),
            address: Some("127.0.0.1".into()),
            ..Settings::default()
        },
    };
    tokio::time::timeout(WAIT, async {
        loop {
            match create_node_with("hub", &config, methods(), fast_options()).await {
                Ok(node) => return node,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("port was not released")
}

#[tokio::test]
async fn test_worker_reconnects_after_hub_restart() {
    let hub_methods =
        || MethodTable::new().with("ping", |_ctx, _params| async { Ok(json!("pong")) });
    let first = start_hub(TransportKind::Tcp, 0, hub_methods()).await;
    let local = local_addr(&first);
    let port: u16 = local.rsplit(':').next().unwrap().parse().unwrap();

    let worker = start_worker("w", TransportKind::Tcp, &local, tagged("w"), true).await;
    let worker_node = worker.as_worker().unwrap();
    assert_eq!(call(&first.context(), "whoami", vec![]).await, Ok(json!("w")));
    assert_eq!(worker_node.phase(), WorkerPhase::Connected);

    first.terminate();
    tokio::time::timeout(WAIT, first.stopped()).await.unwrap();
    eventually(|| worker_node.phase() != WorkerPhase::Connected).await;

    // Issued with no hub around: must wait, not fail.
    let ctx = worker.context();
    let queued = tokio::spawn(async move { ctx.remote_call("ping", vec![]).await });
    eventually(|| worker_node.queued_calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!queued.is_finished());

    let second = restart_hub(port, hub_methods).await;
    let result = tokio::time::timeout(WAIT, queued).await.unwrap().unwrap();
    assert_eq!(result, Ok(json!("pong")));
    assert_eq!(worker_node.phase(), WorkerPhase::Connected);

    // The worker announced itself again, so the new hub routes to it.
    let second_hub = second.as_hub().unwrap();
    eventually(|| second_hub.peers().iter().any(|p| p.name == "w")).await;
    assert_eq!(call(&second.context(), "whoami", vec![]).await, Ok(json!("w")));

    worker.terminate();
    second.terminate();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.sock");
    let path_str = path.to_str().unwrap().to_string();

    let config = NodeConfig {
        settings: Settings {
            hub: true,
            transport: Some(TransportKind::Unix),
            address: Some(path_str.clone()),
            ..Settings::default()
        },
    };
    let hub = create_node_with("hub", &config, MethodTable::new(), fast_options())
        .await
        .unwrap();
    assert!(path.exists());

    let worker = start_worker("w", TransportKind::Unix, &path_str, echo_methods(), true).await;
    assert_eq!(
        call(&hub.context(), "echo", vec![json!("over unix")]).await,
        Ok(json!("over unix"))
    );

    worker.terminate();
    hub.context().set_exit(true);
    tokio::time::timeout(WAIT, hub.stopped()).await.unwrap();
    assert!(!path.exists());
}
