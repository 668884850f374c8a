//! Switchyard wire layer.
//!
//! Moves JSON-RPC between mesh nodes over any supported carrier.
//!
//! ## Architecture
//!
//! - **Frame / FrameDecoder**: `I`/`Q`/`S` tagged, newline-delimited lines
//! - **PeerSocket**: uniform event stream + handle every transport produces
//! - **Transport**: connect/listen over TCP, Unix sockets, WebSocket or the
//!   socket.io-style multiplexed channel
//! - **PeerSession**: positional call/response pairing plus ordered serving
//! - **Balancer**: round-robin capability registry used by the hub

pub mod balancer;
pub mod frame;
pub mod rpc;
pub mod session;
pub mod socket;
pub mod transport;

pub use balancer::Balancer;
pub use frame::{Frame, FrameDecoder, FrameError, Interface};
pub use rpc::{RpcError, RpcRequest, RpcResponse};
pub use session::{Dispatcher, PeerSession, PendingCall, RpcClient};
pub use socket::{PeerSocket, SocketEvent, SocketHandle, ViolationPolicy, WireError};
pub use transport::{transport_for, BindConfig, Listener, Transport, TransportOptions};
