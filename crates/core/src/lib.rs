//! Core control-plane logic for the instrument daemon: everything except
//! process wiring (signals, argument parsing), which lives in `daemon`.

pub mod config;
pub mod coordinator;
pub mod display;
pub mod error_monitor;
pub mod heartbeat;
pub mod input;
pub mod logger;
pub mod parameter_store;
pub mod protocol;
pub mod ring_buffer;
pub mod rpc;

pub use config::{ConfigError, DeviceConfig};
pub use coordinator::{CoordinatorError, ShutdownReason, SystemCoordinator};
pub use display::{DisplayDriver, DisplayFrame, DisplayIoError, NullDisplay};
pub use error_monitor::ErrorMonitor;
pub use heartbeat::{HeartbeatRegistry, STALL_THRESHOLD};
pub use input::{ChannelInput, InputEvent, InputSource};
pub use logger::{Logger, LoggerError, LoggerHandle, DEFAULT_QUOTA_BYTES};
pub use parameter_store::{OutOfRange, ParameterStore, Snapshot};
pub use protocol::{lysis_reference, AbortStep, EngineError, Next, Protocol, ProtocolEngine, StepDef};
pub use protocol::engine::CancelToken;
pub use ring_buffer::{OverflowPolicy, RingBuffer};
pub use rpc::{BoxedTransport, DialFn, PendingCommand, RpcError, RpcMultiplexer, SerialTransport};
