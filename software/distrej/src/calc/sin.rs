//! Sinusoidal disturbance injected into the plant

use core::f64;

use super::*;

/// `d(t) = amplitude * sin(2π * freq_hz * t + phase_rad)`
///
/// Evaluated directly from the sample time rather than by accumulating a phase
/// increment, so a long run does not drift.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SineDisturbance {
    pub amplitude: f64,
    pub freq_hz: f64,
    pub phase_rad: f64,
}

impl SineDisturbance {
    pub fn new(amplitude: f64, freq_hz: f64, phase_rad: f64) -> Self {
        Self {
            amplitude,
            freq_hz,
            phase_rad,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.amplitude.is_finite() && self.freq_hz.is_finite() && self.phase_rad.is_finite())
        {
            return Err(format!("Disturbance parameters must be finite, got {self:?}"));
        }
        Ok(())
    }

    /// Angular frequency in rad/s, which is also the natural choice of
    /// internal-model frequency for rejecting this disturbance
    pub fn omega(&self) -> f64 {
        2.0 * f64::consts::PI * self.freq_hz
    }

    #[inline]
    pub fn value_at(&self, t: f64) -> f64 {
        self.amplitude * (self.omega() * t + self.phase_rad).sin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_value() {
        let d = SineDisturbance::new(1.5, 35.0, 0.0);
        assert_eq!(d.value_at(0.0), 0.0);
        // Quarter period
        assert_relative_eq!(d.value_at(1.0 / (4.0 * 35.0)), 1.5, epsilon = 1e-12);
        assert_relative_eq!(d.value_at(3.0 / (4.0 * 35.0)), -1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_phase() {
        let d = SineDisturbance::new(2.0, 10.0, f64::consts::FRAC_PI_2);
        assert_relative_eq!(d.value_at(0.0), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_validate() {
        assert!(SineDisturbance::new(1.0, f64::NAN, 0.0).validate().is_err());
        assert!(SineDisturbance::new(1.0, 35.0, 0.0).validate().is_ok());
    }
}
