//! Control laws run once per sample during the active phase,
//! plus the signal conditioning that surrounds them.
//!
//! `ControlLaw` objects are selected when the experiment is configured and
//! serialized with it, so a run description on disk names its controller by type.

use core::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::experiment::context::ExperimentCtx;

// Specific control law implementations

mod internal_model;
mod passthrough;
mod pid;

pub use internal_model::InternalModel;
pub use passthrough::PassThrough;
pub use pid::Pid;

// Signal conditioning around the control law

mod affine;
mod sin;

pub use affine::Calibration;
pub use sin::SineDisturbance;

/// A control strategy that maps the latest measured control error to the next command.
///
/// Called exactly once per sample during the active phase, on the control loop's thread,
/// so implementations must finish well within one sample period.
#[typetag::serde(tag = "type")]
pub trait ControlLaw: Send + Sync + Debug {
    /// Reset internal state and check the law against the run configuration
    fn init(&mut self, _ctx: &ExperimentCtx) -> Result<(), String> {
        Ok(())
    }

    /// Consume one measurement and produce the command for the next tick
    fn tick(&mut self, y: f64) -> f64;

    /// Clear state to reset for another run
    fn terminate(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_type_tag() {
        let laws: Vec<Box<dyn ControlLaw>> = vec![
            Box::new(InternalModel::matched(35.0 * 2.0 * core::f64::consts::PI, -30.0, 0.0)),
            Box::new(Pid::new(1.0, 0.5, 0.0, 10.0)),
            Box::new(PassThrough::new(0.0)),
        ];

        let serialized = serde_json::to_string(&laws).unwrap();
        assert!(serialized.contains(r#""type":"InternalModel""#));
        assert!(serialized.contains(r#""type":"Pid""#));
        assert!(serialized.contains(r#""type":"PassThrough""#));

        let deserialized: Vec<Box<dyn ControlLaw>> = serde_json::from_str(&serialized).unwrap();
        assert_eq!(serialized, serde_json::to_string(&deserialized).unwrap());
    }
}
