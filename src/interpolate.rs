//! Per-frame smoothing of applied weights toward target weights.

use crate::config::InterpolatorConfig;
use crate::viseme::{ShapeKey, ShapeWeights};

/// Quintic smoothstep: `6t^5 - 15t^4 + 10t^3`, with `t` clamped to `[0, 1]`.
pub fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

/// Clamp into `[0, 1]` and snap values within `epsilon` of either end.
///
/// Non-finite input becomes 0.
pub fn clamp_influence(value: f32, epsilon: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    let c = value.clamp(0.0, 1.0);
    if c < epsilon {
        0.0
    } else if c > 1.0 - epsilon {
        1.0
    } else {
        c
    }
}

/// Smooths the applied pose toward a target, one call per rendered frame.
#[derive(Debug, Clone)]
pub struct FrameInterpolator {
    speed: f64,
    epsilon: f32,
    applied: ShapeWeights,
}

impl FrameInterpolator {
    /// Start from the resting pose.
    pub fn new(config: &InterpolatorConfig) -> Self {
        Self {
            speed: config.speed,
            epsilon: config.snap_epsilon,
            applied: ShapeWeights::zero(),
        }
    }

    /// The current applied pose.
    pub fn applied(&self) -> ShapeWeights {
        self.applied
    }

    /// Snap the applied pose to rest immediately.
    pub fn reset(&mut self) {
        self.applied = ShapeWeights::zero();
    }

    /// Advance by `delta` seconds toward `target` and return the new applied pose.
    pub fn step(&mut self, target: &ShapeWeights, delta: f64) -> ShapeWeights {
        let raw = if delta.is_finite() {
            (delta * self.speed).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let eased = smoothstep(raw) as f32;
        if eased == 0.0 {
            return self.applied;
        }

        for key in ShapeKey::ALL {
            let current = self.applied.get(key);
            let next = current + (target.get(key) - current) * eased;
            self.applied.set(key, clamp_influence(next, self.epsilon));
        }
        self.applied
    }
}
