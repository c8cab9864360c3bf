//! Transport abstraction standing in for the out-of-scope line discipline
//! (termios baud/parity/flow-control configuration, §4.4).

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the multiplexer can read framed lines from and write framed
/// commands to. Real channels are `tokio-serial` ports configured by the
/// daemon binary; tests use `tokio::io::duplex` pairs.
pub trait SerialTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> SerialTransport for T {}

pub type BoxedTransport = Box<dyn SerialTransport>;

/// Opens a transport for a given device. Boxed so the multiplexer is
/// generic over how channels are dialed (real serial port, simulated
/// peripheral, or a test double) without being generic over a type
/// parameter that would otherwise have to be threaded through every public
/// API.
pub type DialFn = std::sync::Arc<
    dyn Fn(shared::Device) -> futures::future::BoxFuture<'static, std::io::Result<BoxedTransport>>
        + Send
        + Sync,
>;
