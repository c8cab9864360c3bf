use std::fmt;

/// Closed set of peripherals this instrument drives over USB-serial.
///
/// Cardinality is fixed at build time: adding a fourth peripheral is a
/// deliberate edit here and everywhere this type is matched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Device {
    PowerSupply,
    PulseGen,
    Pump,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::PowerSupply, Device::PulseGen, Device::Pump];

    /// The per-device closed opcode set this command may carry.
    pub fn is_valid_opcode(self, opcode: &str) -> bool {
        match self {
            Device::PowerSupply => matches!(opcode, "enable" | "disable" | "set_voltage"),
            Device::PulseGen => matches!(opcode, "fire" | "set_frequency" | "stop"),
            Device::Pump => matches!(opcode, "run" | "stop" | "set_flow_rate"),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Device::PowerSupply => "power_supply",
            Device::PulseGen => "pulse_gen",
            Device::Pump => "pump",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power_supply" => Ok(Device::PowerSupply),
            "pulse_gen" => Ok(Device::PulseGen),
            "pump" => Ok(Device::Pump),
            other => Err(ParseDeviceError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown device: \"{0}\"")]
pub struct ParseDeviceError(pub String);
