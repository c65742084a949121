//! Fixed-step Dormand-Prince 5(4) integration

/// Butcher tableau nodes for the six stages that feed the 5th-order update
const C: [f64; 6] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0];

/// Stage coupling coefficients (a_ij), lower-triangular
#[rustfmt::skip]
const A: [&[f64]; 6] = [
    &[],
    &[1.0 / 5.0],
    &[3.0 / 40.0, 9.0 / 40.0],
    &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
    &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
    &[9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0],
];

/// 5th-order solution weights
const B: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];

/// Dormand-Prince 5(4) stepper run at a single fixed step size.
///
/// Only the propagating 5th-order solution is formed. The seventh stage of the
/// tableau exists only to build the embedded 4th-order error estimate, which a
/// fixed-step loop has no use for, so each step costs six derivative evaluations.
///
/// The stepper owns its stage scratch space so that a control tick does not
/// allocate. Every step evaluates its first stage fresh rather than reusing the
/// last stage of the previous step, because the derivative function is rebound
/// with a new input on each tick.
#[derive(Debug, Clone)]
pub struct Dopri5<const N: usize> {
    slopes: [[f64; N]; 6],
}

impl<const N: usize> Default for Dopri5<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Dopri5<N> {
    pub fn new() -> Self {
        Self {
            slopes: [[0.0; N]; 6],
        }
    }

    /// Advance `x` from `t` to `t + dt` in place and move the time cursor.
    ///
    /// `f(x, t)` returns the time derivative of the state.
    pub fn step<F>(&mut self, mut f: F, x: &mut [f64; N], t: &mut f64, dt: f64)
    where
        F: FnMut(&[f64; N], f64) -> [f64; N],
    {
        let x0 = *x;

        for stage in 0..6 {
            let mut xs = x0;
            for (j, &a) in A[stage].iter().enumerate() {
                for (xi, kj) in xs.iter_mut().zip(self.slopes[j].iter()) {
                    *xi += dt * a * kj;
                }
            }
            self.slopes[stage] = f(&xs, *t + C[stage] * dt);
        }

        let mut next = x0;
        for (stage, &b) in B.iter().enumerate() {
            if b == 0.0 {
                continue;
            }
            for (xi, ki) in next.iter_mut().zip(self.slopes[stage].iter()) {
                *xi += dt * b * ki;
            }
        }

        *x = next;
        *t += dt;
    }
}
