//! Downward interface to camera sensor backends and the types they
//! exchange with the tracker: LED constellation models and pose-solver
//! verdicts.
//!
//! Sensors are one-way capability handles. The tracker owns both the
//! device and sensor rosters; sensors receive exposure notifications
//! and hold non-owning references back into the roster, so there are no
//! reference cycles.

use crate::device::TrackedDevice;
use crate::pose::Pose;
use crate::tracker::ExposureInfo;
use nalgebra::{Point3, Vector3};
use std::sync::Arc;

bitflags::bitflags! {
    /// Pose-solver verdict on a candidate pose.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoseScore: u32 {
        /// The solved position agrees with the projected blobs.
        const MATCH_POSITION = 1 << 0;
        /// The solved orientation agrees with the projected blobs.
        const MATCH_ORIENT   = 1 << 1;
        /// The match is strong enough to act on unconditionally.
        const MATCH_GOOD     = 1 << 2;
        /// The solve started from a predicted prior pose.
        const HAD_PRIOR      = 1 << 3;
    }
}

/// Match quality attached to each candidate pose by the solver.
#[derive(Debug, Clone, Copy)]
pub struct PoseMetrics {
    pub score: PoseScore,
    pub matched_blobs: u32,
    pub unmatched_blobs: u32,
    pub visible_leds: u32,
    pub reprojection_error: f64,
}

impl Default for PoseMetrics {
    fn default() -> Self {
        Self {
            score: PoseScore::empty(),
            matched_blobs: 0,
            unmatched_blobs: 0,
            visible_leds: 0,
            reprojection_error: 0.0,
        }
    }
}

/// One IR LED on a device exterior, in the model frame.
#[derive(Debug, Clone, Copy)]
pub struct Led {
    pub pos: Point3<f64>,
    /// Outward emission direction, unit length.
    pub dir: Vector3<f64>,
    /// Blink pattern index used for identification.
    pub pattern: u16,
}

/// The rigid LED constellation of one tracked device.
#[derive(Debug, Clone, Default)]
pub struct LedModel {
    leds: Vec<Led>,
}

impl LedModel {
    pub fn new(leds: Vec<Led>) -> Self {
        Self { leds }
    }

    pub fn leds(&self) -> &[Led] {
        &self.leds
    }
}

/// A camera sensor backend driven by the tracker.
///
/// Implementations run their own capture and vision threads and call
/// back into the tracker's frame lifecycle and pose update entry
/// points. Construction and teardown are the implementation's business.
pub trait Sensor: Send + Sync {
    /// Camera serial, for logs and pose configuration.
    fn serial(&self) -> &str;

    /// Assign the camera's world-from-camera pose.
    fn set_pose(&self, pose: &Pose);

    /// Start tracking a device's constellation. Returns false if the
    /// sensor cannot take another device.
    fn add_device(&self, device: &Arc<TrackedDevice>) -> bool;

    /// A new exposure snapshot is available; the sensor tags the next
    /// frame it begins receiving with it.
    fn update_exposure(&self, info: &ExposureInfo);
}
