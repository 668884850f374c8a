//! JSON-RPC session over one peer socket link.
//!
//! Outbound calls are matched to replies purely by order: every `Q` frame
//! written pushes a reply slot, every `S` frame received pops the oldest one.
//! Both happen under the client lock, so queue order is wire order.
//!
//! Inbound requests are executed concurrently (up to [`SERVE_WINDOW`] at a
//! time) but answered strictly in arrival order, which is what the calling
//! side's positional matching relies on.

use crate::frame::Frame;
use crate::rpc::{RpcError, RpcRequest, RpcResponse};
use crate::socket::{SocketEvent, SocketHandle};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Maximum number of inbound requests executing at once per session.
pub const SERVE_WINDOW: usize = 64;

const SERIALIZATION_FAILED: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Response serialization failed"}}"#;

/// Executes inbound calls for a session.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Run `method` with positional `params`.
    async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;
}

struct PendingSlot {
    id: u64,
    method: String,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct ClientState {
    next_id: u64,
    pending: VecDeque<PendingSlot>,
    closed: bool,
}

/// Reply to a call that has already been written to the wire.
#[must_use = "a written call must be awaited to observe its reply"]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingCall {
    /// Request id written on the wire.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply. A session that closes first yields
    /// peer-disconnected.
    pub async fn wait(self) -> Result<Value, RpcError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RpcError::peer_disconnected()))
    }
}

/// Calling side of a session.
pub struct RpcClient {
    socket: SocketHandle,
    epoch: u64,
    state: Mutex<ClientState>,
}

impl RpcClient {
    fn new(socket: SocketHandle, epoch: u64) -> Self {
        Self {
            socket,
            epoch,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Write a call and return its reply slot.
    ///
    /// An `Err` means nothing reached the wire (the session is closed or its
    /// link is gone), so the call is safe to retry elsewhere.
    pub fn begin_call(&self, method: &str, params: Vec<Value>) -> Result<PendingCall, RpcError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(RpcError::peer_disconnected());
        }
        state.next_id += 1;
        let id = state.next_id;
        let request = RpcRequest::call(id, method, params);
        let text = serde_json::to_string(&request).map_err(RpcError::internal)?;
        debug!(socket = self.socket.id(), "RPC [OUT] request: {text}");
        self.socket
            .send_on(self.epoch, Frame::Request(text))
            .map_err(|_| RpcError::peer_disconnected())?;

        let (tx, rx) = oneshot::channel();
        state.pending.push_back(PendingSlot {
            id,
            method: method.to_string(),
            tx,
        });
        Ok(PendingCall { id, rx })
    }

    /// Write a call and wait for its reply.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.begin_call(method, params)?.wait().await
    }

    /// Hand an `S` payload to the oldest waiting call.
    pub fn resolve_next(&self, payload: &str) {
        let slot = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .pop_front();
        let Some(slot) = slot else {
            warn!(
                socket = self.socket.id(),
                "RPC: response with no outstanding call dropped"
            );
            return;
        };
        debug!(
            socket = self.socket.id(),
            id = slot.id,
            method = %slot.method,
            "RPC [IN] response: {payload}"
        );
        let outcome = RpcResponse::parse(payload).and_then(RpcResponse::into_result);
        // The caller may have given up on the call; the slot is consumed either way.
        let _ = slot.tx.send(outcome);
    }

    /// Reject every outstanding call and refuse new ones.
    pub fn close(&self) {
        let drained: Vec<PendingSlot> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            state.pending.drain(..).collect()
        };
        for slot in drained {
            let _ = slot.tx.send(Err(RpcError::peer_disconnected()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Calls written but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

/// Execute one `Q` payload. Returns the `S` payload, or `None` for a
/// notification.
pub async fn serve_request(dispatcher: &dyn Dispatcher, text: &str) -> Option<String> {
    let response = match RpcRequest::parse(text) {
        Ok(request) => {
            let params = request.positional_params();
            let outcome = dispatcher.dispatch(&request.method, params).await;
            if let Err(e) = &outcome {
                debug!(method = %request.method, "RPC: method failed: {e}");
            }
            RpcResponse::from_outcome(request.id?, outcome)
        }
        Err(e) => {
            warn!("RPC: rejected request: {e}");
            RpcResponse::failure(Value::Null, e)
        }
    };
    match serde_json::to_string(&response) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("RPC: response serialization failed: {e}");
            Some(SERIALIZATION_FAILED.to_string())
        }
    }
}

/// One link's worth of RPC in both directions.
///
/// The owner pumps socket events through [`PeerSession::handle_event`];
/// dropping the session rejects its outstanding calls and stops serving.
pub struct PeerSession {
    socket: SocketHandle,
    client: Arc<RpcClient>,
    requests: mpsc::UnboundedSender<String>,
    server: JoinHandle<()>,
}

impl PeerSession {
    /// Bind a session to the socket's current link.
    pub fn open(socket: SocketHandle, dispatcher: Arc<dyn Dispatcher>) -> Self {
        // Epoch 0 never matches a link, so a session opened while unlinked is inert.
        let epoch = socket.link_epoch().unwrap_or(0);
        let client = Arc::new(RpcClient::new(socket.clone(), epoch));
        let (requests, inbound) = mpsc::unbounded_channel::<String>();
        let server = tokio::spawn(serve_loop(socket.clone(), epoch, dispatcher, inbound));
        Self {
            socket,
            client,
            requests,
            server,
        }
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    /// Consume RPC traffic; lifecycle and interface events are handed back.
    pub fn handle_event(&self, event: SocketEvent) -> Option<SocketEvent> {
        match event {
            SocketEvent::Request(text) => {
                debug!(socket = self.socket.id(), "RPC [IN] request: {text}");
                let _ = self.requests.send(text);
                None
            }
            SocketEvent::Response(text) => {
                self.client.resolve_next(&text);
                None
            }
            other => Some(other),
        }
    }

    /// Reject outstanding calls and stop serving. Does not close the socket.
    pub fn shutdown(&self) {
        self.client.close();
        self.server.abort();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_loop(
    socket: SocketHandle,
    epoch: u64,
    dispatcher: Arc<dyn Dispatcher>,
    inbound: mpsc::UnboundedReceiver<String>,
) {
    let mut responses = UnboundedReceiverStream::new(inbound)
        .map(|text| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { serve_request(&*dispatcher, &text).await }
        })
        .buffered(SERVE_WINDOW);

    while let Some(response) = responses.next().await {
        let Some(text) = response else { continue };
        debug!(socket = socket.id(), "RPC [OUT] response: {text}");
        if let Err(e) = socket.send_on(epoch, Frame::Response(text)) {
            debug!(socket = socket.id(), "RPC: link gone, stop serving: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codes;
    use crate::socket::PeerSocket;
    use serde_json::json;
    use std::time::Duration;

    struct Calculator;

    #[async_trait]
    impl Dispatcher for Calculator {
        async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
            match method {
                "add" => {
                    let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
                    Ok(json!(sum))
                }
                "sleep" => {
                    let ms = params.first().and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!(ms))
                }
                other => Err(RpcError::method_not_found(other)),
            }
        }
    }

    fn request_id(frame: &Frame) -> Value {
        let Frame::Request(text) = frame else {
            panic!("expected request, got {frame:?}")
        };
        RpcRequest::parse(text).unwrap().id.unwrap()
    }

    #[tokio::test]
    async fn test_calls_matched_in_order() {
        let (socket, link) = PeerSocket::pair("test");
        let mut wire = link.attach().unwrap();
        let session = PeerSession::open(socket.handle().clone(), Arc::new(Calculator));

        let first = session.client().begin_call("a", vec![]).unwrap();
        let second = session.client().begin_call("b", vec![]).unwrap();
        assert_eq!(request_id(&wire.recv().await.unwrap()), json!(first.id()));
        assert_eq!(request_id(&wire.recv().await.unwrap()), json!(second.id()));
        assert_eq!(session.client().outstanding(), 2);

        // Ids are ignored: the first reply always belongs to the first call.
        session.handle_event(SocketEvent::Response(
            r#"{"jsonrpc":"2.0","id":99,"result":"one"}"#.into(),
        ));
        session.handle_event(SocketEvent::Response(
            r#"{"jsonrpc":"2.0","id":98,"error":{"code":-32601,"message":"nope"}}"#.into(),
        ));
        assert_eq!(first.wait().await.unwrap(), json!("one"));
        assert!(second.wait().await.unwrap_err().is_method_not_found());
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding() {
        let (socket, link) = PeerSocket::pair("test");
        let _wire = link.attach().unwrap();
        let session = PeerSession::open(socket.handle().clone(), Arc::new(Calculator));
        let pending = session.client().begin_call("add", vec![]).unwrap();
        session.shutdown();
        assert_eq!(
            pending.wait().await.unwrap_err().code,
            codes::PEER_DISCONNECTED
        );
        assert!(session.client().begin_call("add", vec![]).is_err());
    }

    #[tokio::test]
    async fn test_unlinked_call_is_not_sent() {
        let (socket, _link) = PeerSocket::pair("test");
        let session = PeerSession::open(socket.handle().clone(), Arc::new(Calculator));
        let err = session.client().begin_call("add", vec![]).err().unwrap();
        assert_eq!(err.code, codes::PEER_DISCONNECTED);
        assert_eq!(session.client().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_responses_follow_arrival_order() {
        let (socket, link) = PeerSocket::pair("test");
        let mut wire = link.attach().unwrap();
        let session = PeerSession::open(socket.handle().clone(), Arc::new(Calculator));

        let slow = RpcRequest::call(1, "sleep", vec![json!(80)]);
        let fast = RpcRequest::call(2, "add", vec![json!(2), json!(3)]);
        for req in [&slow, &fast] {
            session.handle_event(SocketEvent::Request(serde_json::to_string(req).unwrap()));
        }

        let mut ids = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), wire.recv())
                .await
                .unwrap()
                .unwrap();
            let Frame::Response(text) = frame else {
                panic!("expected response")
            };
            ids.push(RpcResponse::parse(&text).unwrap().id);
        }
        assert_eq!(ids, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_notification_not_answered() {
        let calc = Calculator;
        let reply = serve_request(&calc, r#"{"jsonrpc":"2.0","method":"add","params":[1]}"#).await;
        assert!(reply.is_none());

        let reply = serve_request(&calc, "garbage").await.unwrap();
        let err = RpcResponse::parse(&reply).unwrap().into_result().unwrap_err();
        assert_eq!(err.code, codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_null_id_request_is_answered() {
        let reply = serve_request(
            &Calculator,
            r#"{"jsonrpc":"2.0","id":null,"method":"add","params":[2,3]}"#,
        )
        .await
        .expect("a null id still expects a reply");
        let response = RpcResponse::parse(&reply).unwrap();
        assert_eq!(response.id, Value::Null);
        assert_eq!(response.into_result().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_dropped() {
        let (socket, link) = PeerSocket::pair("test");
        let _wire = link.attach().unwrap();
        let session = PeerSession::open(socket.handle().clone(), Arc::new(Calculator));
        assert!(session
            .handle_event(SocketEvent::Response("{}".into()))
            .is_none());
        assert_eq!(
            session.handle_event(SocketEvent::Connect),
            Some(SocketEvent::Connect)
        );
    }
}
