//! Core types for the Switchyard RPC mesh.
//!
//! This crate defines the configuration and error types shared by the wire
//! layer, the node runtime and the CLI. It contains no business logic.

pub mod config;
pub mod error;

pub use config::{NodeConfig, Settings, TransportKind};
pub use error::{SwitchyardError, SwitchyardResult};
