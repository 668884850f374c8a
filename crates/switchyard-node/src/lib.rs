//! Switchyard node runtime.
//!
//! Hosts a named method table as either the mesh hub or a worker:
//!
//! - [`create_node`] reads the role and transport from a [`NodeConfig`]
//! - [`HubNode`] routes `invoke(method, ...args)` to announced workers
//! - [`WorkerNode`] dials the hub, announces itself and serves its methods
//! - [`NodeContext`] is the host-facing control surface (`exit` and friends)
//! - [`deploy`] renders compose and Dockerfile fragments from settings
//!
//! [`NodeConfig`]: switchyard_types::NodeConfig

pub mod config;
pub mod context;
pub mod deploy;
pub mod hub;
pub mod method;
pub mod node;
pub mod worker;

pub use config::{default_config_path, load_config, load_mesh, MeshConfig};
pub use context::NodeContext;
pub use hub::{HubNode, HubOptions, PeerInfo};
pub use method::{method_fn, Method, MethodTable, INVOKE};
pub use node::{create_node, create_node_with, Node, Role};
pub use worker::{WorkerNode, WorkerOptions, WorkerPhase};
