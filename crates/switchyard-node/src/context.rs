//! Node context: the control surface the hosting program reads and writes.
//!
//! Setting `exit` to `true` terminates the owning node. Everything else is
//! plain key/value storage that methods can share.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use switchyard_wire::RpcError;
use tokio::sync::watch;
use tracing::info;

/// Context key that terminates the node when set to `true`.
pub const EXIT_KEY: &str = "exit";

/// Resolves once `rx` reads `true`, or its sender is gone.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// What a context needs from the node that owns it.
#[async_trait]
pub(crate) trait NodeCore: Send + Sync + 'static {
    /// Call a method somewhere in the mesh.
    async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;

    /// Tear the node down. Idempotent.
    fn terminate(&self);
}

struct ContextInner {
    service: String,
    exit_tx: watch::Sender<bool>,
    values: RwLock<BTreeMap<String, Value>>,
    core: OnceLock<Weak<dyn NodeCore>>,
}

/// Shared, cloneable handle to a node's context.
#[derive(Clone)]
pub struct NodeContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("service", &self.inner.service)
            .field("exit", &self.exit())
            .finish()
    }
}

impl NodeContext {
    /// A context not attached to any node: `remote_call` fails and `exit`
    /// only flips the signal.
    pub fn detached(service: impl Into<String>) -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                service: service.into(),
                exit_tx,
                values: RwLock::new(BTreeMap::new()),
                core: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn bind(&self, core: Weak<dyn NodeCore>) {
        let _ = self.inner.core.set(core);
    }

    fn core(&self) -> Option<Arc<dyn NodeCore>> {
        self.inner.core.get().and_then(Weak::upgrade)
    }

    /// Name of the service this node runs as.
    pub fn current_service(&self) -> &str {
        &self.inner.service
    }

    pub fn exit(&self) -> bool {
        *self.inner.exit_tx.borrow()
    }

    /// Write the exit flag. Writing `true` terminates the owning node.
    pub fn set_exit(&self, exit: bool) {
        self.inner.exit_tx.send_replace(exit);
        if exit {
            info!(service = %self.inner.service, "Exit requested through context");
            if let Some(core) = self.core() {
                core.terminate();
            }
        }
    }

    /// Raise the exit flag without calling back into the node.
    pub(crate) fn mark_exited(&self) {
        self.inner.exit_tx.send_replace(true);
    }

    /// Receiver observing the exit flag.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.inner.exit_tx.subscribe()
    }

    /// Resolves once the exit flag is `true`.
    pub async fn exited(&self) {
        raised(&mut self.exit_signal()).await;
    }

    /// Read a context value. `exit` reads the exit flag.
    pub fn get(&self, key: &str) -> Option<Value> {
        if key == EXIT_KEY {
            return Some(Value::Bool(self.exit()));
        }
        self.inner
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Write a context value. A boolean written to `exit` goes through
    /// [`NodeContext::set_exit`].
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == EXIT_KEY {
            if let Value::Bool(exit) = value {
                self.set_exit(exit);
                return;
            }
        }
        self.inner
            .values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value);
    }

    /// Call `method` anywhere in the mesh through the owning node.
    pub async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        match self.core() {
            Some(core) => core.remote_call(method, params).await,
            None => Err(RpcError::node_terminated()),
        }
    }
}
