//! Request/response correlation over per-device serial channels (§4.4).

pub mod inflight;
pub mod multiplexer;
pub mod transport;

pub use multiplexer::{PendingCommand, RpcError, RpcMultiplexer};
pub use transport::{BoxedTransport, DialFn, SerialTransport};
