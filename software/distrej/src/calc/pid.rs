//! A PID controller on the measured control error with simple saturation for anti-windup

use super::*;

/// A PID controller with simple saturation for anti-windup.
///
/// The measured signal is already a control error (the loop regulates toward zero),
/// so the command is `-(kp * e + ki * ∫e + kd * de/dt)`.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct Pid {
    // User inputs
    kp: f64,
    ki: f64,
    kd: f64,
    max_integral: f64,

    // Internal state
    #[serde(skip)]
    err: f64,

    #[serde(skip)]
    integral: f64,

    // Values provided by the loop during init
    #[serde(skip)]
    dt_s: f64,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, max_integral: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            max_integral,

            err: 0.0,
            integral: 0.0,

            // Set during init
            dt_s: 0.0,
        }
    }
}

#[typetag::serde]
impl ControlLaw for Pid {
    fn init(&mut self, ctx: &ExperimentCtx) -> Result<(), String> {
        if !(self.max_integral >= 0.0) {
            return Err(format!(
                "PID integral limit must be >= 0, got {}",
                self.max_integral
            ));
        }

        self.dt_s = ctx.dt_s();
        self.err = 0.0;
        self.integral = 0.0;
        Ok(())
    }

    fn tick(&mut self, y: f64) -> f64 {
        let derivative = (y - self.err) / self.dt_s;
        self.err = y;
        self.integral += self.err * self.dt_s;

        // Anti-windup saturation
        self.integral = self.integral.clamp(-self.max_integral, self.max_integral);

        -(self.kp * self.err + self.ki * self.integral + self.kd * derivative)
    }

    fn terminate(&mut self) {
        self.err = 0.0;
        self.integral = 0.0;
        self.dt_s = 0.0;
    }
}
