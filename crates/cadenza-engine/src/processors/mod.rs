//! Graph nodes built from the project: track processors, faders, sends,
//! modulator macros, and the device input and master output endpoints.

pub mod fader;
pub mod io;
pub mod macro_node;
pub mod send;
pub mod track;

pub use fader::FaderNode;
pub use io::{DeviceInputNode, MasterOutNode};
pub use macro_node::MacroNode;
pub use send::SendNode;
pub use track::TrackProcessor;

/// Gain smoothing time of faders and sends.
pub(crate) const SMOOTHING_MS: f32 = 2.5;

/// One-pole smoother for parameter transitions.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OnePole {
    coeff: f32,
    state: f32,
}

impl OnePole {
    pub fn new(sample_rate: u32, time_ms: f32) -> Self {
        let mut smoother = Self {
            coeff: 1.0,
            state: 0.0,
        };
        smoother.set_time_ms(sample_rate, time_ms);
        smoother
    }

    pub fn set_time_ms(&mut self, sample_rate: u32, time_ms: f32) {
        let tau = time_ms.max(0.01) * 0.001 * sample_rate.max(1) as f32;
        let coeff = if tau <= 1.0 { 1.0 } else { 1.0 - (-1.0 / tau).exp() };
        self.coeff = coeff.clamp(0.0, 1.0);
    }

    pub fn reset(&mut self, value: f32) {
        self.state = value;
    }

    #[inline]
    pub fn next(&mut self, target: f32) -> f32 {
        self.state += self.coeff * (target - self.state);
        self.state
    }

    pub fn state(&self) -> f32 {
        self.state
    }
}

/// Constant-power balance gains, normalised to unity at the centre.
#[inline]
pub(crate) fn balance_gains(balance: f32) -> (f32, f32) {
    let angle = (balance.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
    let (left, right) = (angle.cos(), angle.sin());
    (left * std::f32::consts::SQRT_2, right * std::f32::consts::SQRT_2)
}
