//! A slope and offset, y = ax + b, converting raw input readings into the control error

use super::*;

/// Per-rig calibration of the measured channel, `y = slope * raw + offset`.
///
/// Rigs differ in sensor sensitivity and bias, so this is configured per run
/// rather than fixed in the loop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub slope: f64,
    pub offset: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::identity()
    }
}

impl Calibration {
    pub fn new(slope: f64, offset: f64) -> Self {
        Self { slope, offset }
    }

    /// Use raw readings as-is
    pub fn identity() -> Self {
        Self::new(1.0, 0.0)
    }

    /// Calibration expressed as a bias removed before scaling, `y = slope * (raw - bias)`
    pub fn from_bias(slope: f64, bias: f64) -> Self {
        Self::new(slope, -slope * bias)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.slope.is_finite() && self.offset.is_finite()) {
            return Err(format!(
                "Calibration must be finite, got slope {} offset {}",
                self.slope, self.offset
            ));
        }
        if self.slope == 0.0 {
            return Err("Calibration slope must be nonzero".to_owned());
        }
        Ok(())
    }

    #[inline]
    pub fn apply(&self, raw: f64) -> f64 {
        self.slope * raw + self.offset
    }

    /// Raw reading that calibrates to `y`
    ///
    /// # Panics
    /// * If the slope is zero
    pub fn invert(&self, y: f64) -> f64 {
        assert!(self.slope != 0.0, "Cannot invert a calibration with zero slope");
        (y - self.offset) / self.slope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_apply() {
        let c = Calibration::new(8000.0, -1.7);
        assert_relative_eq!(c.apply(0.0), -1.7);
        assert_relative_eq!(c.apply(0.001), 6.3, epsilon = 1e-12);
    }

    #[test]
    fn test_from_bias() {
        let c = Calibration::from_bias(8000.0, 0.00025);
        assert_relative_eq!(c.apply(0.00025), 0.0, epsilon = 1e-12);
        assert_relative_eq!(c.offset, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invert() {
        let c = Calibration::new(8000.0, -1.7);
        assert_relative_eq!(c.apply(c.invert(0.42)), 0.42, epsilon = 1e-12);
    }

    #[test]
    fn test_validate() {
        assert!(Calibration::new(f64::NAN, 0.0).validate().is_err());
        assert!(Calibration::identity().validate().is_ok());
    }
}
