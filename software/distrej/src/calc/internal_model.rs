//! Adaptive internal-model controller for a single known disturbance frequency

use super::*;
use crate::math::oscillator::norm;
use crate::math::{Dopri5, OscillatorModel, OscillatorState};

/// Default radius of the saturation disc applied to the oscillator state
pub const DEFAULT_BOUND: f64 = 3.95;

/// Adaptive internal-model controller.
///
/// Carries a marginally stable oscillator tuned to the disturbance frequency `omega_star`,
/// driven by the measured control error through the gain `G = (g1, g2)`:
///
/// ```text
/// dw/dt = S(omega_star) * sat(w) + G * y
/// u     = w[0]
/// ```
///
/// The oscillator is advanced by exactly one sample period per tick with a
/// fixed-step Dormand-Prince integrator. Saturation only shapes the dynamics;
/// the stored state, and therefore the command, is the raw integrated value.
///
/// Every step evaluates its first stage with the current input rather than
/// reusing the last stage of the previous step, so trajectories will not match
/// an FSAL stepper such as boost's `runge_kutta_dopri5` bit for bit.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InternalModel {
    // User inputs
    model: OscillatorModel,

    /// Integration step. `None` adopts the loop's sample period at init.
    dt_s: Option<f64>,

    // Internal state
    #[serde(skip)]
    w: OscillatorState,

    #[serde(skip)]
    tw: f64,

    #[serde(skip)]
    out: f64,

    /// Step adopted from the loop by a matched controller
    #[serde(skip)]
    step_s: f64,

    #[serde(skip)]
    stepper: Dopri5<2>,
}

impl InternalModel {
    /// Controller with a fixed integration step, usable without `init`.
    ///
    /// The step must still match the loop's sample period when run inside an experiment.
    pub fn new(omega_star: f64, g1: f64, g2: f64, dt_s: f64) -> Self {
        Self::build(omega_star, [g1, g2], Some(dt_s), DEFAULT_BOUND)
    }

    /// Controller whose integration step is taken from the loop at init.
    pub fn matched(omega_star: f64, g1: f64, g2: f64) -> Self {
        Self::build(omega_star, [g1, g2], None, DEFAULT_BOUND)
    }

    /// Replace the saturation bound.
    ///
    /// # Panics
    /// * If `bound` is not a finite positive number
    pub fn with_bound(self, bound: f64) -> Self {
        let model = self.model;
        Self::build(model.rotation().omega(), model.gain(), self.dt_s, bound)
    }

    fn build(omega_star: f64, gain: [f64; 2], dt_s: Option<f64>, bound: f64) -> Self {
        Self {
            model: OscillatorModel::new(omega_star, gain, bound),
            dt_s,
            w: [0.0; 2],
            tw: 0.0,
            out: 0.0,
            step_s: 0.0,
            stepper: Dopri5::new(),
        }
    }

    /// Start the oscillator from a given state instead of rest
    pub fn with_state(mut self, w: OscillatorState) -> Self {
        self.w = w;
        self
    }

    /// Store the most recent control-error sample.
    /// It is held for every subsequent `compute_output` until replaced.
    pub fn set_input(&mut self, y: f64) {
        self.out = y;
    }

    /// Advance the oscillator one step using the stored input
    /// and return its in-phase component as the next command.
    pub fn compute_output(&mut self) -> f64 {
        let model = &self.model;
        let out = self.out;
        let dt = self.step_s();
        self.stepper.step(
            |w, _t| model.derivative(w, out),
            &mut self.w,
            &mut self.tw,
            dt,
        );
        self.w[0]
    }

    /// Raw (unsaturated) oscillator state
    pub fn state(&self) -> OscillatorState {
        self.w
    }

    /// Magnitude of the raw oscillator state
    pub fn state_norm(&self) -> f64 {
        norm(&self.w)
    }

    /// Internal time cursor, advanced by one step per `compute_output`
    pub fn time(&self) -> f64 {
        self.tw
    }

    pub fn model(&self) -> &OscillatorModel {
        &self.model
    }

    /// Integration step currently in use.
    /// A fixed step always wins, so it survives deserialization without `init`.
    pub fn step_s(&self) -> f64 {
        self.dt_s.unwrap_or(self.step_s)
    }
}

#[typetag::serde]
impl ControlLaw for InternalModel {
    fn init(&mut self, ctx: &ExperimentCtx) -> Result<(), String> {
        let omega = self.model.rotation().omega();
        if !omega.is_finite() {
            return Err(format!("Internal model frequency must be finite, got {omega}"));
        }
        let bound = self.model.bound();
        if !(bound.is_finite() && bound > 0.0) {
            return Err(format!("Saturation bound must be finite and > 0, got {bound}"));
        }

        // The model is only valid if it is integrated at the rate it is sampled
        let period = ctx.dt_s();
        self.step_s = match self.dt_s {
            None => period,
            Some(dt) if (dt - period).abs() <= 1e-9 * period => dt,
            Some(dt) => {
                return Err(format!(
                    "Integration step {dt} s does not match the sample period {period} s"
                ));
            }
        };

        self.w = [0.0; 2];
        self.tw = 0.0;
        self.out = 0.0;
        Ok(())
    }

    fn tick(&mut self, y: f64) -> f64 {
        self.set_input(y);
        self.compute_output()
    }

    fn terminate(&mut self) {
        self.w = [0.0; 2];
        self.tw = 0.0;
        self.out = 0.0;
        self.step_s = 0.0;
    }
}
