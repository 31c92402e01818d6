//! Single-pole low-pass smoothing of the reported pose.
//!
//! Raw fused poses carry a little high-frequency jitter from the visual
//! corrections. The output filter smooths what consumers see without
//! adding meaningful latency at IMU rates.

use crate::pose::Pose;

/// Time constants for the single-pole output filter, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct ExpFilterConfig {
    pub position_tau: f64,
    pub orientation_tau: f64,
}

impl Default for ExpFilterConfig {
    fn default() -> Self {
        Self {
            position_tau: 0.05,
            orientation_tau: 0.02,
        }
    }
}

/// Single-pole pose smoother. Position and orientation are filtered
/// independently; orientation blends along the shortest arc.
#[derive(Debug, Clone)]
pub struct ExpPoseFilter {
    config: ExpFilterConfig,
    last_ts_ns: Option<u64>,
    state: Pose,
}

impl ExpPoseFilter {
    pub fn new(config: ExpFilterConfig) -> Self {
        Self {
            config,
            last_ts_ns: None,
            state: Pose::identity(),
        }
    }

    /// Forget the filter history. The next sample passes through unchanged.
    pub fn reset(&mut self) {
        self.last_ts_ns = None;
    }

    /// Feed one sample at `ts_ns` and return the smoothed pose.
    pub fn run(&mut self, ts_ns: u64, sample: &Pose) -> Pose {
        let dt_ns = match self.last_ts_ns {
            Some(last) if ts_ns > last => ts_ns - last,
            Some(_) => {
                // Same tick or time went backwards. Keep the current state.
                return self.state;
            }
            None => {
                self.last_ts_ns = Some(ts_ns);
                self.state = *sample;
                return self.state;
            }
        };
        self.last_ts_ns = Some(ts_ns);

        let dt = dt_ns as f64 / 1_000_000_000.0;
        let pos_alpha = 1.0 - (-dt / self.config.position_tau).exp();
        let orient_alpha = 1.0 - (-dt / self.config.orientation_tau).exp();

        self.state.pos += pos_alpha * (sample.pos - self.state.pos);
        // Antipodal orientations have no unique interpolation path; jump
        // straight to the sample.
        self.state.orient = self
            .state
            .orient
            .try_slerp(&sample.orient, orient_alpha, 1.0e-9)
            .unwrap_or(sample.orient);

        self.state
    }
}

impl Default for ExpPoseFilter {
    fn default() -> Self {
        Self::new(ExpFilterConfig::default())
    }
}
