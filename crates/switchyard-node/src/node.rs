//! Node driver: picks the role and transport from configuration and starts it.

use crate::context::NodeContext;
use crate::hub::{HubNode, HubOptions};
use crate::method::{MethodTable, INVOKE};
use crate::worker::{WorkerNode, WorkerOptions};

use serde_json::Value;
use std::time::Duration;
use switchyard_types::{NodeConfig, SwitchyardError, SwitchyardResult, TransportKind};
use switchyard_wire::{transport_for, BindConfig, RpcError, TransportOptions, WireError};
use tracing::debug;

/// Which side of the mesh a node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hub,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Hub => f.write_str("hub"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

/// A running node of either role.
#[derive(Debug)]
pub enum Node {
    Hub(HubNode),
    Worker(WorkerNode),
}

impl Node {
    pub fn role(&self) -> Role {
        match self {
            Node::Hub(_) => Role::Hub,
            Node::Worker(_) => Role::Worker,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Hub(hub) => hub.name(),
            Node::Worker(worker) => worker.name(),
        }
    }

    /// The node's control surface. Setting `exit` terminates the node.
    pub fn context(&self) -> NodeContext {
        match self {
            Node::Hub(hub) => hub.context(),
            Node::Worker(worker) => worker.context(),
        }
    }

    pub async fn remote_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        match self {
            Node::Hub(hub) => hub.remote_call(method, params).await,
            Node::Worker(worker) => worker.remote_call(method, params).await,
        }
    }

    pub fn terminate(&self) {
        match self {
            Node::Hub(hub) => hub.terminate(),
            Node::Worker(worker) => worker.terminate(),
        }
    }

    /// Resolves once the node has released its listener or connection.
    pub async fn stopped(&self) {
        match self {
            Node::Hub(hub) => hub.stopped().await,
            Node::Worker(worker) => worker.stopped().await,
        }
    }

    pub fn as_hub(&self) -> Option<&HubNode> {
        match self {
            Node::Hub(hub) => Some(hub),
            Node::Worker(_) => None,
        }
    }

    pub fn as_worker(&self) -> Option<&WorkerNode> {
        match self {
            Node::Worker(worker) => Some(worker),
            Node::Hub(_) => None,
        }
    }
}

/// Translate a wire-level failure at construction time.
fn startup_error(kind: TransportKind, err: WireError) -> SwitchyardError {
    match err {
        WireError::InvalidAddress { address, reason } => {
            SwitchyardError::InvalidAddress { address, reason }
        }
        WireError::Unsupported(reason) => SwitchyardError::UnsupportedTransport {
            transport: kind.to_string(),
            reason,
        },
        WireError::Io(e) => SwitchyardError::Io(e),
        other => SwitchyardError::Network(other.to_string()),
    }
}

/// Start a node with default transport tuning.
pub async fn create_node(
    name: &str,
    config: &NodeConfig,
    methods: MethodTable,
) -> SwitchyardResult<Node> {
    create_node_with(name, config, methods, TransportOptions::default()).await
}

/// Start a node.
///
/// Fails before touching the network if the method table defines `invoke`,
/// a hub has nothing to listen on, or a worker has no hub to dial.
pub async fn create_node_with(
    name: &str,
    config: &NodeConfig,
    methods: MethodTable,
    options: TransportOptions,
) -> SwitchyardResult<Node> {
    if methods.contains(INVOKE) {
        return Err(SwitchyardError::ReservedMethod(INVOKE.to_string()));
    }
    let settings = &config.settings;
    let kind = settings.transport();
    debug!(node = %name, hub = settings.hub, transport = %kind, "Creating node");

    if settings.hub {
        if settings.port.is_none() && settings.address.is_none() {
            return Err(SwitchyardError::MissingListenTarget);
        }
        let transport = transport_for(kind, options).map_err(|e| startup_error(kind, e))?;
        let bind = BindConfig {
            port: settings.port,
            address: settings.address.clone(),
        };
        let hub_options = HubOptions {
            invoke_timeout: settings.invoke_timeout_secs.map(Duration::from_secs),
        };
        let hub = HubNode::start(name, methods, transport, &bind, hub_options)
            .await
            .map_err(|e| startup_error(kind, e))?;
        Ok(Node::Hub(hub))
    } else {
        let remote_hub = settings
            .remote_hub
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or(SwitchyardError::MissingRemoteHub)?;
        let worker_options = WorkerOptions {
            invoke_fallback: settings.invoke_fallback,
            connect_timeout: settings.connect_timeout_secs.map(Duration::from_secs),
            initial_backoff: options.initial_backoff,
            max_backoff: options.max_backoff,
        };
        let transport = transport_for(kind, options).map_err(|e| startup_error(kind, e))?;
        let worker = WorkerNode::start(name, methods, transport, remote_hub, worker_options)
            .map_err(|e| startup_error(kind, e))?;
        Ok(Node::Worker(worker))
    }
}
