use std::fmt;
use std::time::SystemTime;

use crate::inline::Message;

/// Fault taxonomy (§7 Error Handling Design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FaultKind {
    SerialIo,
    SerialTimeout,
    SerialCrc,
    StorageMissing,
    StorageFull,
    ConfigInvalid,
    ProtocolAbort,
    ThreadStall,
    DisplayIo,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::SerialIo => "serial_io",
            FaultKind::SerialTimeout => "serial_timeout",
            FaultKind::SerialCrc => "serial_crc",
            FaultKind::StorageMissing => "storage_missing",
            FaultKind::StorageFull => "storage_full",
            FaultKind::ConfigInvalid => "config_invalid",
            FaultKind::ProtocolAbort => "protocol_abort",
            FaultKind::ThreadStall => "thread_stall",
            FaultKind::DisplayIo => "display_io",
        };
        f.write_str(s)
    }
}

/// A structured fault notification: `(kind, message, origin_thread,
/// timestamp)` (§3 Data Model).
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: Message,
    pub origin: &'static str,
    pub at: SystemTime,
}

impl Fault {
    pub fn new(kind: FaultKind, origin: &'static str, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: Message::from_str(message.as_ref()),
            origin,
            at: SystemTime::now(),
        }
    }

    /// Identity used by the ErrorMonitor's deduplication window: two faults
    /// are "the same" if they share `(kind, message)` (§4.3).
    pub fn dedup_key(&self) -> (FaultKind, &str) {
        (self.kind, self.message.as_str())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.kind, self.message, self.origin)
    }
}
