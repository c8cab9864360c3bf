//! Typed, validated configuration (§6 Configuration loading). The raw byte
//! parse is an out-of-scope external concern; this module defines what the
//! daemon receives after it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::{Device, Parameter};

use crate::protocol::{AbortStep, Next, Protocol, StepDef};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub device: Device,
    pub opcode: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub args_param: Option<Parameter>,
    pub deadline_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_retry_count() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortStepConfig {
    pub device: Device,
    pub opcode: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefault {
    pub key: Parameter,
    pub value: f64,
}

/// The typed, validated document the daemon receives (§6). Declares the
/// protocol name, per-step definitions, and parameter defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub protocol_name: String,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub abort_sequence: Vec<AbortStepConfig>,
    #[serde(default)]
    pub parameter_defaults: Vec<ParameterDefault>,
}

impl DeviceConfig {
    /// Parses and validates a config document from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: DeviceConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforces the same bounds invariants as the ParameterStore and
    /// rejects unknown devices/opcodes, so a typed, validated config
    /// object is concretely satisfiable (§6 Configuration loading).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::Invalid { reason: "protocol must declare at least one step".into() });
        }

        for step in &self.steps {
            let device: Device = step.device;
            if !device.is_valid_opcode(&step.opcode) {
                return Err(ConfigError::Invalid {
                    reason: format!("opcode \"{}\" is not valid for {device}", step.opcode),
                });
            }
            if step.deadline_ms == 0 {
                return Err(ConfigError::Invalid {
                    reason: format!("step \"{}\" has a zero deadline", step.name),
                });
            }
        }

        for abort in &self.abort_sequence {
            if !abort.device.is_valid_opcode(&abort.opcode) {
                return Err(ConfigError::Invalid {
                    reason: format!("abort opcode \"{}\" is not valid for {}", abort.opcode, abort.device),
                });
            }
        }

        for default in &self.parameter_defaults {
            if !default.key.in_bounds(default.value) {
                let (min, max) = default.key.bounds();
                return Err(ConfigError::Invalid {
                    reason: format!(
                        "default for {} = {} is outside bounds {min}..={max}",
                        default.key, default.value
                    ),
                });
            }
        }

        Ok(())
    }

    /// Builds the runtime [`Protocol`] value from this config. Step
    /// `opcode`/`arguments` strings are leaked to `&'static str` once at
    /// load time, matching `StepDef`'s zero-allocation hot path (§9
    /// Hot-path allocations): the config is loaded once per boot or
    /// `SIGHUP` reload, never on the protocol→rpc→log path itself.
    pub fn to_protocol(&self) -> Protocol {
        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepDef {
                name: Box::leak(s.name.clone().into_boxed_str()),
                device: s.device,
                opcode: Box::leak(s.opcode.clone().into_boxed_str()),
                args: Box::leak(s.arguments.clone().into_boxed_str()),
                args_param: s.args_param,
                deadline: Duration::from_millis(s.deadline_ms),
                retry_count: s.retry_count,
                next: Next::Unconditional(i + 1),
            })
            .collect();

        let abort_sequence = self
            .abort_sequence
            .iter()
            .map(|a| AbortStep {
                device: a.device,
                opcode: Box::leak(a.opcode.clone().into_boxed_str()),
                args: Box::leak(a.arguments.clone().into_boxed_str()),
            })
            .collect();

        Protocol {
            name: Box::leak(self.protocol_name.clone().into_boxed_str()),
            steps,
            abort_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceConfig {
        DeviceConfig {
            protocol_name: "lysis_reference".into(),
            steps: vec![StepConfig {
                name: "prepare".into(),
                device: Device::PowerSupply,
                opcode: "enable".into(),
                arguments: String::new(),
                args_param: Some(Parameter::Voltage),
                deadline_ms: 5000,
                retry_count: 2,
            }],
            abort_sequence: vec![],
            parameter_defaults: vec![ParameterDefault { key: Parameter::Voltage, value: 12.0 }],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_opcode_for_device() {
        let mut config = sample();
        config.steps[0].opcode = "not_a_real_opcode".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_bounds_default() {
        let mut config = sample();
        config.parameter_defaults[0].value = 9999.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_step_list() {
        let mut config = sample();
        config.steps.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn to_protocol_builds_sequential_steps() {
        let protocol = sample().to_protocol();
        assert_eq!(protocol.steps.len(), 1);
        assert_eq!(protocol.steps[0].name, "prepare");
    }
}
