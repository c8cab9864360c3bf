//! The reference `LysisProtocol` used by §8 scenarios S1/S2: `prepare`
//! (PowerSupply enable), `pulse` (PulseGen fire), `flush` (Pump run).

use std::time::Duration;

use shared::{Device, Parameter};

use super::{AbortStep, Next, Protocol, StepDef};

const STEP_DEADLINE: Duration = Duration::from_secs(5);

/// Builds the three-step lysis protocol.
pub fn lysis_reference() -> Protocol {
    Protocol {
        name: "lysis_reference",
        steps: vec![
            StepDef {
                name: "prepare",
                device: Device::PowerSupply,
                opcode: "enable",
                args: "",
                args_param: Some(Parameter::Voltage),
                deadline: STEP_DEADLINE,
                retry_count: 2,
                next: Next::Unconditional(1),
            },
            StepDef {
                name: "pulse",
                device: Device::PulseGen,
                opcode: "fire",
                args: "",
                args_param: Some(Parameter::Frequency),
                deadline: STEP_DEADLINE,
                retry_count: 2,
                next: Next::Unconditional(2),
            },
            StepDef {
                name: "flush",
                device: Device::Pump,
                opcode: "run",
                args: "",
                args_param: Some(Parameter::FlowRate),
                deadline: STEP_DEADLINE,
                retry_count: 2,
                next: Next::Unconditional(3), // one past the last step: completion
            },
        ],
        abort_sequence: vec![
            AbortStep { device: Device::PulseGen, opcode: "stop", args: "" },
            AbortStep { device: Device::Pump, opcode: "stop", args: "" },
            AbortStep { device: Device::PowerSupply, opcode: "disable", args: "" },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_three_steps_in_order() {
        let p = lysis_reference();
        assert_eq!(p.steps.len(), 3);
        assert_eq!(p.steps[0].name, "prepare");
        assert_eq!(p.steps[1].name, "pulse");
        assert_eq!(p.steps[2].name, "flush");
    }

    #[test]
    fn abort_sequence_powers_down_last() {
        let p = lysis_reference();
        assert_eq!(p.abort_sequence.last().unwrap().device, Device::PowerSupply);
    }
}
