//! Shared error types for the Switchyard mesh.

use thiserror::Error;

/// Top-level error type raised while constructing or configuring a node.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// A worker was configured without a hub address to connect to.
    #[error("Remote hub address not specified")]
    MissingRemoteHub,

    /// A hub was configured without a port or address to listen on.
    #[error("Hub listen target not specified: set `port` or `address`")]
    MissingListenTarget,

    /// The method table defines a name reserved by the broker.
    #[error("RPC method name '{0}' is not allowed")]
    ReservedMethod(String),

    /// The configured transport name is not recognised.
    #[error("Invalid transport specified: {0}")]
    UnknownTransport(String),

    /// The transport exists but cannot run on this platform or with these settings.
    #[error("Transport '{transport}' unavailable: {reason}")]
    UnsupportedTransport {
        /// Transport name.
        transport: String,
        /// Why it cannot be used.
        reason: String,
    },

    /// An address could not be parsed for the selected transport.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address.
        address: String,
        /// Parse failure detail.
        reason: String,
    },

    /// More than one service in a mesh declares itself as the hub.
    #[error("More than one hub was defined")]
    MultipleHubs,

    /// Generic configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A network error occurred while binding or connecting.
    #[error("Network error: {0}")]
    Network(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with SwitchyardError.
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;
