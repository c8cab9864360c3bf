use std::fmt;

/// Closed set of tunable keys. Each key has a fixed value type
/// (floating-point) and validation bounds enforced by the ParameterStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Parameter {
    Temperature,
    FlowRate,
    Voltage,
    Frequency,
    SyringeDiameter,
}

impl Parameter {
    pub const ALL: [Parameter; 5] = [
        Parameter::Temperature,
        Parameter::FlowRate,
        Parameter::Voltage,
        Parameter::Frequency,
        Parameter::SyringeDiameter,
    ];

    /// Declared `(min, max)` bounds, inclusive, and the factory default.
    pub const fn bounds(self) -> (f64, f64) {
        match self {
            Parameter::Temperature => (4.0, 95.0),
            Parameter::FlowRate => (0.0, 50.0),
            Parameter::Voltage => (0.0, 30.0),
            Parameter::Frequency => (0.1, 1_000.0),
            Parameter::SyringeDiameter => (1.0, 50.0),
        }
    }

    pub const fn default_value(self) -> f64 {
        match self {
            Parameter::Temperature => 37.0,
            Parameter::FlowRate => 1.0,
            Parameter::Voltage => 12.0,
            Parameter::Frequency => 1.0,
            Parameter::SyringeDiameter => 10.0,
        }
    }

    pub fn in_bounds(self, value: f64) -> bool {
        let (min, max) = self.bounds();
        value.is_finite() && value >= min && value <= max
    }

    /// Amount one encoder detent adjusts this parameter by (§4.7 "adjust
    /// the currently selected parameter").
    pub const fn step(self) -> f64 {
        match self {
            Parameter::Temperature => 0.5,
            Parameter::FlowRate => 0.1,
            Parameter::Voltage => 0.5,
            Parameter::Frequency => 1.0,
            Parameter::SyringeDiameter => 0.5,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parameter::Temperature => "temperature",
            Parameter::FlowRate => "flow_rate",
            Parameter::Voltage => "voltage",
            Parameter::Frequency => "frequency",
            Parameter::SyringeDiameter => "syringe_diameter",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Parameter {
    type Err = ParseParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Parameter::Temperature),
            "flow_rate" => Ok(Parameter::FlowRate),
            "voltage" => Ok(Parameter::Voltage),
            "frequency" => Ok(Parameter::Frequency),
            "syringe_diameter" => Ok(Parameter::SyringeDiameter),
            other => Err(ParseParameterError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown parameter: \"{0}\"")]
pub struct ParseParameterError(pub String);
