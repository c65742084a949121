//! Proportional pass-through of the measurement, including open loop at zero gain

use super::*;

/// `u = gain * y`.
///
/// With a gain of zero the active phase runs open loop, which gives a baseline
/// recording of the plant under the same disturbance.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct PassThrough {
    gain: f64,
}

impl PassThrough {
    pub fn new(gain: f64) -> Self {
        Self { gain }
    }
}

#[typetag::serde]
impl ControlLaw for PassThrough {
    fn init(&mut self, _ctx: &ExperimentCtx) -> Result<(), String> {
        if !self.gain.is_finite() {
            return Err(format!("Pass-through gain must be finite, got {}", self.gain));
        }
        Ok(())
    }

    fn tick(&mut self, y: f64) -> f64 {
        self.gain * y
    }
}
