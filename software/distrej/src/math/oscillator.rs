//! Internal model of a sinusoidal disturbance as a marginally stable oscillator

use serde::{Deserialize, Serialize};

/// In-phase / quadrature estimate of the disturbance
pub type OscillatorState = [f64; 2];

/// Skew-symmetric generator of free rotation at `omega` rad/s,
/// `S = [[0, omega], [-omega, 0]]`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct RotationMatrix {
    omega: f64,
}

impl RotationMatrix {
    pub fn new(omega: f64) -> Self {
        Self { omega }
    }

    pub fn omega(&self) -> f64 {
        self.omega
    }

    /// `S * v`
    pub fn apply(&self, v: &OscillatorState) -> OscillatorState {
        [self.omega * v[1], -self.omega * v[0]]
    }
}

/// Euclidean norm of the oscillator state
pub fn norm(w: &OscillatorState) -> f64 {
    w[0].hypot(w[1])
}

/// Oscillator dynamics with radial saturation of the state seen by the derivative.
///
/// Built once at controller construction and never mutated afterward.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct OscillatorModel {
    rotation: RotationMatrix,
    gain: [f64; 2],
    bound: f64,
}

impl OscillatorModel {
    /// # Panics
    /// * If `bound` is not a finite positive number
    pub fn new(omega: f64, gain: [f64; 2], bound: f64) -> Self {
        assert!(
            bound.is_finite() && bound > 0.0,
            "Saturation bound must be finite and > 0, got {bound}"
        );

        Self {
            rotation: RotationMatrix::new(omega),
            gain,
            bound,
        }
    }

    pub fn rotation(&self) -> RotationMatrix {
        self.rotation
    }

    pub fn gain(&self) -> [f64; 2] {
        self.gain
    }

    pub fn bound(&self) -> f64 {
        self.bound
    }

    /// Project the state back onto the disc of radius `bound` if it sits on or outside it.
    /// The stored state is left alone; only the dynamics see the clamped copy.
    pub fn saturate(&self, w: &OscillatorState) -> OscillatorState {
        let n = norm(w);
        if n >= self.bound {
            let k = self.bound / n;
            [w[0] * k, w[1] * k]
        } else {
            *w
        }
    }

    /// `dw/dt = S * sat(w) + G * out`
    pub fn derivative(&self, w: &OscillatorState, out: f64) -> OscillatorState {
        let w_hat = self.saturate(w);
        let rot = self.rotation.apply(&w_hat);
        [rot[0] + self.gain[0] * out, rot[1] + self.gain[1] * out]
    }
}
