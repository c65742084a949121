//! Numerical building blocks for the controllers and the simulated rig

mod dopri5;
pub use dopri5::Dopri5;

pub mod oscillator;
pub use oscillator::{OscillatorModel, OscillatorState, RotationMatrix};
