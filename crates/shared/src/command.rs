use std::time::SystemTime;

use crate::device::Device;
use crate::inline::ArgPayload;

/// Correlation token: monotonic per sender, unique across in-flight
/// commands for a given [`Device`] at any instant (§3 Invariants).
pub type Token = u32;

/// A request addressed to exactly one [`Device`].
///
/// Commands are value objects: once dispatched they are immutable. The
/// argument payload lives inline (capped at 256 bytes serialized) so
/// dispatch never allocates.
#[derive(Debug, Clone)]
pub struct Command {
    pub device: Device,
    pub token: Token,
    pub opcode: &'static str,
    pub args: ArgPayload,
    pub issued_at: SystemTime,
}

impl Command {
    pub fn new(device: Device, token: Token, opcode: &'static str, args: &str) -> Self {
        debug_assert!(
            device.is_valid_opcode(opcode),
            "opcode {opcode} is not valid for {device}"
        );
        Self {
            device,
            token,
            opcode,
            args: ArgPayload::from_str(args),
            issued_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_device_and_token() {
        let cmd = Command::new(Device::PowerSupply, 1, "enable", "");
        assert_eq!(cmd.device, Device::PowerSupply);
        assert_eq!(cmd.token, 1);
    }
}
