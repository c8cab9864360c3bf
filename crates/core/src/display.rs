//! Display abstraction (§4.7 Driver traits). The pixel protocol itself is
//! an out-of-scope external collaborator; the coordinator depends only on
//! this trait.

use shared::{Parameter, SystemState};

#[derive(Debug, thiserror::Error)]
#[error("display io error: {0}")]
pub struct DisplayIoError(pub String);

/// What the coordinator wants rendered on a given tick.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub state: SystemState,
    pub selected_parameter: Option<Parameter>,
    pub selected_value: Option<f64>,
    pub message: Option<String>,
}

pub trait DisplayDriver: Send {
    fn render(&mut self, frame: &DisplayFrame) -> Result<(), DisplayIoError>;
}

/// No-op display for headless operation and tests.
#[derive(Default)]
pub struct NullDisplay {
    pub last_frame: Option<DisplayFrame>,
}

impl DisplayDriver for NullDisplay {
    fn render(&mut self, frame: &DisplayFrame) -> Result<(), DisplayIoError> {
        self.last_frame = Some(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_display_records_last_frame() {
        let mut display = NullDisplay::default();
        let frame = DisplayFrame {
            state: SystemState::Idle,
            selected_parameter: None,
            selected_value: None,
            message: None,
        };
        display.render(&frame).unwrap();
        assert!(display.last_frame.is_some());
    }
}
