pub mod command;
pub mod device;
pub mod fault;
pub mod inline;
pub mod log_event;
pub mod parameter;
pub mod response;
pub mod run;
pub mod state;
pub mod wire;

pub use command::{Command, Token};
pub use device::Device;
pub use fault::{Fault, FaultKind};
pub use inline::{ArgPayload, Message};
pub use log_event::{LogEvent, LogEventKind};
pub use parameter::Parameter;
pub use response::{Outcome, Response, Status};
pub use run::{RunId, RunOutcome};
pub use state::SystemState;
