//! Rigid-body pose type and the frame conversions used throughout the
//! tracker.
//!
//! A [`Pose`] is a rigid transform between two named coordinate frames
//! (device, fusion/IMU, LED model, world). Which pair of frames a pose
//! relates is part of its meaning; the composition helpers here keep the
//! bookkeeping in one place.

use nalgebra::{UnitQuaternion, Vector3};
use std::ops::Mul;

/// Position plus orientation: a rigid transform from one frame to another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Translation in meters.
    pub pos: Vector3<f64>,
    /// Unit orientation quaternion.
    pub orient: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(pos: Vector3<f64>, orient: UnitQuaternion<f64>) -> Self {
        Self { pos, orient }
    }

    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            pos: Vector3::zeros(),
            orient: UnitQuaternion::identity(),
        }
    }

    /// Inverse transform: if `self` maps frame A to frame B, the result
    /// maps B back to A.
    pub fn inverse(&self) -> Pose {
        let inv_orient = self.orient.inverse();
        Pose {
            pos: -(inv_orient * self.pos),
            orient: inv_orient,
        }
    }

    /// Rotation vector (axis scaled by angle, radians) taking `other`'s
    /// orientation to `self`'s.
    pub fn orientation_diff(&self, other: &Pose) -> Vector3<f64> {
        (self.orient * other.orient.inverse()).scaled_axis()
    }
}

/// Composition: `a * b` applies `b` first, then `a`. If `b` maps frame X
/// to Y and `a` maps Y to Z, the product maps X to Z.
impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            pos: self.pos + self.orient * rhs.pos,
            orient: self.orient * rhs.orient,
        }
    }
}

/// Rotate a per-axis magnitude vector (a 1-sigma error estimate) into
/// another frame. Magnitudes stay positive, so the components are
/// absolute-valued after rotation.
pub fn rotate_error(orient: &UnitQuaternion<f64>, error: &Vector3<f64>) -> Vector3<f64> {
    (orient * error).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn sample_pose() -> Pose {
        Pose::new(
            Vector3::new(0.1, -0.2, 0.35),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.3, -0.1, 0.8)),
        )
    }

    #[test]
    fn test_identity_composition() {
        let p = sample_pose();
        let q = Pose::identity() * p;
        assert_relative_eq!(q.pos, p.pos, epsilon = 1e-12);
        assert_relative_eq!(q.orient.angle_to(&p.orient), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let p = sample_pose();
        let roundtrip = p * p.inverse();
        assert_relative_eq!(roundtrip.pos.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(roundtrip.orient.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_model_fusion_roundtrip() {
        // Mapping a model pose into the IMU frame and back must recover it.
        let fusion_from_model = sample_pose();
        let model_from_fusion = fusion_from_model.inverse();
        let model_pose = Pose::new(
            Vector3::new(1.0, 2.0, -0.5),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, FRAC_PI_2, 0.1)),
        );

        let imu_pose = model_pose * fusion_from_model;
        let recovered = imu_pose * model_from_fusion;

        assert_relative_eq!(recovered.pos, model_pose.pos, epsilon = 1e-9);
        assert_relative_eq!(recovered.orient.angle_to(&model_pose.orient), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_orientation_diff() {
        let a = Pose::new(
            Vector3::zeros(),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.5, 0.0)),
        );
        let b = Pose::identity();
        let diff = a.orientation_diff(&b);
        assert_relative_eq!(diff, Vector3::new(0.0, 0.5, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rotate_error_is_positive() {
        let q = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, FRAC_PI_2));
        let err = rotate_error(&q, &Vector3::new(0.01, 0.02, 0.03));
        assert!(err.iter().all(|c| *c >= 0.0));
        assert_relative_eq!(err, Vector3::new(0.02, 0.01, 0.03), epsilon = 1e-12);
    }
}
