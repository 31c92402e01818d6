//! Interface to the 6DoF fusion filter.
//!
//! The tracker treats the filter as a black box behind [`FusionFilter`]:
//! it feeds IMU samples forward in time and applies visual observations
//! against retained historical states (delay slots) that the filter
//! snapshots on request. A production deployment plugs an unscented
//! Kalman filter in here; [`DeadReckonFusion`] is a minimal backend used
//! for bring-up and for exercising the tracker in tests.

use crate::pose::Pose;
use nalgebra::{UnitQuaternion, Vector3};

/// Filter output at a queried time: pose plus first derivatives and
/// 1-sigma uncertainty estimates, all in the fusion (IMU-world) frame.
#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    pub pose: Pose,
    pub lin_vel: Vector3<f64>,
    pub lin_accel: Vector3<f64>,
    pub ang_vel: Vector3<f64>,
    pub pos_error: Vector3<f64>,
    pub rot_error: Vector3<f64>,
}

/// Operations the tracker needs from a fusion backend.
///
/// All calls for one device arrive serialized under that device's lock.
/// Delay-slot indices are dense and small; the backend is told the slot
/// count at construction time by the implementing type.
pub trait FusionFilter: Send {
    /// Advance the filter to `time_ns` with one IMU sample.
    fn imu_update(
        &mut self,
        time_ns: u64,
        ang_vel: &Vector3<f64>,
        accel: &Vector3<f64>,
        mag: &Vector3<f64>,
    );

    /// Apply a full pose observation against the state retained in `slot`.
    fn pose_update(&mut self, time_ns: u64, pose: &Pose, slot: usize);

    /// Apply a position-only observation against the state retained in `slot`.
    fn position_update(&mut self, time_ns: u64, pos: &Vector3<f64>, slot: usize);

    /// Predict the current state at `time_ns`.
    fn get_pose_at(&mut self, time_ns: u64) -> FilterState;

    /// Snapshot the filter state at `time_ns` into `slot` so later
    /// observations can be applied against it.
    fn prepare_delay_slot(&mut self, time_ns: u64, slot: usize);

    /// Discard the state retained in `slot`.
    fn release_delay_slot(&mut self, slot: usize);

    /// Predict the state the retained `slot` describes, refined by any
    /// updates applied since it was prepared. `None` if the slot holds
    /// no live state.
    fn get_delay_slot_pose_at(&mut self, time_ns: u64, slot: usize) -> Option<FilterState>;
}

/// Uncertainty growth for the dead-reckoning backend, per second without
/// a visual observation.
const POS_DRIFT_PER_SEC: f64 = 0.10;
const ROT_DRIFT_PER_SEC: f64 = 0.20;
const POS_ERROR_FLOOR: f64 = 0.002;
const ROT_ERROR_FLOOR: f64 = 0.01;

/// Gyro-integrating fallback backend.
///
/// Orientation is integrated from angular velocity; position is held at
/// the last visual observation (no acceleration integration, so it never
/// runs away). Delay slots are plain pose snapshots.
pub struct DeadReckonFusion {
    time_ns: u64,
    pose: Pose,
    ang_vel: Vector3<f64>,
    last_accel: Vector3<f64>,
    last_observation_ns: u64,
    slots: Vec<Option<SlotSnapshot>>,
}

#[derive(Debug, Clone, Copy)]
struct SlotSnapshot {
    time_ns: u64,
    pose: Pose,
}

impl DeadReckonFusion {
    pub fn new(initial_pose: &Pose, num_slots: usize) -> Self {
        Self {
            time_ns: 0,
            pose: *initial_pose,
            ang_vel: Vector3::zeros(),
            last_accel: Vector3::zeros(),
            last_observation_ns: 0,
            slots: vec![None; num_slots],
        }
    }

    fn errors_at(&self, time_ns: u64) -> (Vector3<f64>, Vector3<f64>) {
        let dt = time_ns.saturating_sub(self.last_observation_ns) as f64 / 1e9;
        let pos = Vector3::repeat(POS_ERROR_FLOOR + POS_DRIFT_PER_SEC * dt);
        let rot = Vector3::repeat(ROT_ERROR_FLOOR + ROT_DRIFT_PER_SEC * dt);
        (pos, rot)
    }

    fn state_for(&self, pose: Pose, time_ns: u64) -> FilterState {
        let (pos_error, rot_error) = self.errors_at(time_ns);
        FilterState {
            pose,
            lin_vel: Vector3::zeros(),
            lin_accel: self.last_accel,
            ang_vel: self.ang_vel,
            pos_error,
            rot_error,
        }
    }
}

impl FusionFilter for DeadReckonFusion {
    fn imu_update(
        &mut self,
        time_ns: u64,
        ang_vel: &Vector3<f64>,
        accel: &Vector3<f64>,
        _mag: &Vector3<f64>,
    ) {
        if self.time_ns != 0 && time_ns > self.time_ns {
            let dt = (time_ns - self.time_ns) as f64 / 1e9;
            // Body-frame gyro integration.
            self.pose.orient *= UnitQuaternion::from_scaled_axis(ang_vel * dt);
        }
        self.time_ns = time_ns;
        self.ang_vel = *ang_vel;
        self.last_accel = *accel;
    }

    fn pose_update(&mut self, time_ns: u64, pose: &Pose, _slot: usize) {
        self.pose = *pose;
        self.last_observation_ns = time_ns;
    }

    fn position_update(&mut self, time_ns: u64, pos: &Vector3<f64>, _slot: usize) {
        self.pose.pos = *pos;
        self.last_observation_ns = time_ns;
    }

    fn get_pose_at(&mut self, time_ns: u64) -> FilterState {
        self.state_for(self.pose, time_ns)
    }

    fn prepare_delay_slot(&mut self, time_ns: u64, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(SlotSnapshot {
                time_ns,
                pose: self.pose,
            });
        }
    }

    fn release_delay_slot(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    fn get_delay_slot_pose_at(&mut self, _time_ns: u64, slot: usize) -> Option<FilterState> {
        let snapshot = (*self.slots.get(slot)?)?;
        Some(self.state_for(snapshot.pose, snapshot.time_ns))
    }
}
