//! Automatic gain control.
//!
//! ## Algorithm
//!
//! 1. `target = target_level / (input_rms + ε)`, clamped to `[0, max_gain]`.
//! 2. Move the current gain toward `target`: by 10 % of the gap when the
//!    target is above the current gain, by 50 % of the gap otherwise.

use serde::Serialize;

const EPSILON: f32 = 1e-6;
const RISE_RATE: f32 = 0.1;
const FALL_RATE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgcMetrics {
    pub current_gain: f32,
    pub target_gain: f32,
    pub target_level: f32,
    pub max_gain: f32,
    pub last_input_rms: f32,
}

#[derive(Debug, Clone)]
pub struct AutomaticGainControl {
    target_level: f32,
    max_gain: f32,
    current_gain: f32,
    target_gain: f32,
    last_input_rms: f32,
}

impl AutomaticGainControl {
    pub fn new(target_level: f32, max_gain: f32) -> Self {
        Self {
            target_level: target_level.max(0.0),
            max_gain: max_gain.max(0.0),
            current_gain: 1.0,
            target_gain: 1.0,
            last_input_rms: 0.0,
        }
    }

    /// Feed one frame's RMS and return the smoothed gain.
    pub fn update_gain(&mut self, input_rms: f32) -> f32 {
        let input_rms = if input_rms.is_finite() { input_rms.max(0.0) } else { 0.0 };
        self.last_input_rms = input_rms;

        let target = (self.target_level / (input_rms + EPSILON)).clamp(0.0, self.max_gain);
        self.target_gain = target;

        let rate = if target > self.current_gain {
            RISE_RATE
        } else {
            FALL_RATE
        };
        self.current_gain += (target - self.current_gain) * rate;
        self.current_gain
    }

    /// Multiply `frame` by the current gain, clamping to [-1, 1].
    pub fn apply(&self, frame: &mut [f32]) {
        let gain = self.current_gain;
        for s in frame.iter_mut() {
            *s = (*s * gain).clamp(-1.0, 1.0);
        }
    }

    pub fn gain(&self) -> f32 {
        self.current_gain
    }

    pub fn set_target_level(&mut self, level: f32) {
        if level.is_finite() {
            self.target_level = level.max(0.0);
        }
    }

    pub fn reset(&mut self) {
        self.current_gain = 1.0;
        self.target_gain = 1.0;
        self.last_input_rms = 0.0;
    }

    pub fn metrics(&self) -> AgcMetrics {
        AgcMetrics {
            current_gain: self.current_gain,
            target_gain: self.target_gain,
            target_level: self.target_level,
            max_gain: self.max_gain,
            last_input_rms: self.last_input_rms,
        }
    }
}

impl Default for AutomaticGainControl {
    fn default() -> Self {
        Self::new(0.1, 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rises_monotonically_toward_target() {
        let mut agc = AutomaticGainControl::new(0.1, 10.0);
        let target = 0.1 / (0.05 + EPSILON);
        let mut prev = agc.gain();
        for _ in 0..200 {
            let g = agc.update_gain(0.05);
            assert!(g >= prev, "gain went down: {prev} -> {g}");
            assert!(g <= target + 1e-4);
            prev = g;
        }
        assert_relative_eq!(prev, target, epsilon = 1e-3);
    }

    #[test]
    fn falls_monotonically_toward_target() {
        let mut agc = AutomaticGainControl::new(0.1, 10.0);
        let target = 0.1 / (0.5 + EPSILON);
        let mut prev = agc.gain();
        for _ in 0..60 {
            let g = agc.update_gain(0.5);
            assert!(g <= prev, "gain went up: {prev} -> {g}");
            assert!(g >= target - 1e-4);
            prev = g;
        }
        assert_relative_eq!(prev, target, epsilon = 1e-3);
    }

    #[test]
    fn target_is_bounded_by_max_gain() {
        let mut agc = AutomaticGainControl::new(0.1, 4.0);
        for _ in 0..500 {
            agc.update_gain(0.0);
        }
        assert!(agc.gain() <= 4.0);
        assert_relative_eq!(agc.gain(), 4.0, epsilon = 1e-3);
        assert_eq!(agc.metrics().target_gain, 4.0);
    }

    #[test]
    fn rise_is_slower_than_fall() {
        let mut up = AutomaticGainControl::new(0.1, 10.0);
        let mut down = AutomaticGainControl::new(0.1, 10.0);
        let rise = up.update_gain(0.05) - 1.0;
        let fall = 1.0 - down.update_gain(0.5);
        assert_relative_eq!(rise, 0.1 * (0.1 / (0.05 + EPSILON) - 1.0), epsilon = 1e-5);
        assert_relative_eq!(fall, 0.5 * (1.0 - 0.1 / (0.5 + EPSILON)), epsilon = 1e-5);
    }

    #[test]
    fn apply_clamps_and_reset_restores_unity() {
        let mut agc = AutomaticGainControl::new(0.5, 10.0);
        for _ in 0..100 {
            agc.update_gain(0.01);
        }
        let mut frame = [0.5f32, -0.5, 0.01];
        agc.apply(&mut frame);
        assert_eq!(frame[0], 1.0);
        assert_eq!(frame[1], -1.0);
        agc.reset();
        assert_eq!(agc.gain(), 1.0);
    }

    #[test]
    fn non_finite_rms_is_treated_as_silence() {
        let mut agc = AutomaticGainControl::new(0.1, 2.0);
        let g = agc.update_gain(f32::NAN);
        assert!(g.is_finite());
    }
}
