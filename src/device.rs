//! Per-device tracking state: IMU time reconstruction, the fusion
//! filter and its delay slots, the visual-update acceptance policy and
//! the smoothed output poses handed to consumers.

use crate::exp_filter::ExpPoseFilter;
use crate::fusion::FusionFilter;
use crate::pose::{rotate_error, Pose};
use crate::sensor::{LedModel, PoseMetrics, PoseScore};
use crate::slots::{DelaySlotRing, PoseReport};
use crate::trace::{slot_field, TraceRecord, TraceWriter};
use crate::tracker::{DeviceExposureInfo, ExposureInfo};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use std::f64::consts::PI;
use std::sync::Arc;

/// Time without an accepted position observation before the reported
/// position freezes, in nanoseconds.
pub const POSE_LOST_THRESHOLD_NS: u64 = 500_000_000;

/// Time without an accepted visual pose before a non-matching
/// orientation observation is applied anyway, in nanoseconds.
pub const POSE_LOST_ORIENT_THRESHOLD_NS: u64 = 100_000_000;

/// IMU samples buffered for trace export before a forced flush.
pub const MAX_PENDING_IMU_OBSERVATIONS: usize = 1000;

/// IMU intrinsic calibration supplied by the device firmware.
#[derive(Debug, Clone)]
pub struct ImuCalibration {
    pub accel_offset: Vector3<f64>,
    pub accel_matrix: [f64; 9],
    pub gyro_offset: Vector3<f64>,
    pub gyro_matrix: [f64; 9],
}

impl Default for ImuCalibration {
    fn default() -> Self {
        const IDENTITY: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        Self {
            accel_offset: Vector3::zeros(),
            accel_matrix: IDENTITY,
            gyro_offset: Vector3::zeros(),
            gyro_matrix: IDENTITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ImuObservation {
    local_ts: u64,
    device_ts: u64,
    dt: f64,
    ang_vel: Vector3<f64>,
    accel: Vector3<f64>,
    mag: Vector3<f64>,
}

/// Consumer-facing pose with derivatives, in the device frame.
#[derive(Debug, Clone, Copy)]
pub struct ViewPose {
    pub pose: Pose,
    pub lin_vel: Vector3<f64>,
    pub lin_accel: Vector3<f64>,
    pub ang_vel: Vector3<f64>,
}

/// Model-frame pose with 1-sigma error estimates, for the pose solver.
#[derive(Debug, Clone, Copy)]
pub struct ModelPoseEstimate {
    pub pose: Pose,
    pub pos_error: Vector3<f64>,
    pub rot_error: Vector3<f64>,
}

/// The starting pose for a freshly added device: at the origin, rotated
/// to face along -Z.
pub(crate) fn initial_pose() -> Pose {
    Pose::new(
        Vector3::zeros(),
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), PI),
    )
}

struct DeviceState {
    fusion: Box<dyn FusionFilter>,
    slots: DelaySlotRing,

    /// Fixed transform taking the fused IMU world pose to the
    /// user-visible device pose.
    device_from_fusion: Pose,
    /// Fixed transform from the LED model frame to the IMU frame, and
    /// its inverse.
    fusion_from_model: Pose,
    model_from_fusion: Pose,

    last_device_ts: u32,
    device_time_ns: u64,

    last_observed_orient_ts: u64,
    last_observed_pose_ts: u64,
    last_observed_pose: Pose,

    last_reported_ts: u64,
    reported_pose: Pose,
    model_pose: Pose,

    output_filter: ExpPoseFilter,

    pending_imu: Vec<ImuObservation>,
    trace: Option<TraceWriter>,
}

/// One tracked device (HMD or controller).
///
/// All mutable state sits behind one lock; in the tracker's two-level
/// hierarchy this lock is always taken after the tracker lock and never
/// while holding another device's.
pub struct TrackedDevice {
    id: u32,
    index: usize,
    leds: Arc<LedModel>,
    state: Mutex<DeviceState>,
}

impl TrackedDevice {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        index: usize,
        imu_pose: &Pose,
        model_pose: &Pose,
        leds: LedModel,
        calibration: &ImuCalibration,
        fusion: Box<dyn FusionFilter>,
        mut trace: Option<TraceWriter>,
    ) -> TrackedDevice {
        // imu_pose maps IMU to device, model_pose maps device to model.
        let device_from_fusion = imu_pose.inverse();
        let fusion_from_model = *model_pose * *imu_pose;
        let model_from_fusion = fusion_from_model.inverse();

        if let Some(writer) = trace.as_mut() {
            writer.write(&TraceRecord::Device {
                device_id: id,
                accel_offset: calibration.accel_offset.into(),
                accel_matrix: calibration.accel_matrix,
                gyro_offset: calibration.gyro_offset.into(),
                gyro_matrix: calibration.gyro_matrix,
            });
        }

        TrackedDevice {
            id,
            index,
            leds: Arc::new(leds),
            state: Mutex::new(DeviceState {
                fusion,
                slots: DelaySlotRing::new(id),
                device_from_fusion,
                fusion_from_model,
                model_from_fusion,
                last_device_ts: 0,
                device_time_ns: 0,
                last_observed_orient_ts: 0,
                last_observed_pose_ts: 0,
                last_observed_pose: Pose::identity(),
                last_reported_ts: 0,
                reported_pose: Pose::identity(),
                model_pose: Pose::identity(),
                output_filter: ExpPoseFilter::default(),
                pending_imu: Vec::with_capacity(MAX_PENDING_IMU_OBSERVATIONS),
                trace,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The device's LED constellation, for sensors matching blobs.
    pub fn leds(&self) -> &Arc<LedModel> {
        &self.leds
    }

    /// Device times of the last applied position observation and the
    /// last true orientation match, for diagnostics.
    pub fn last_observation_times(&self) -> (u64, u64) {
        let guard = self.state.lock();
        (guard.last_observed_pose_ts, guard.last_observed_orient_ts)
    }

    /// Feed one IMU sample.
    ///
    /// The 32-bit microsecond device timestamp is unwrapped onto the
    /// 64-bit nanosecond device timeline, assuming less than one wrap
    /// between consecutive samples.
    pub fn imu_update(
        &self,
        local_ts: u64,
        device_ts: u32,
        dt: f64,
        ang_vel: &Vector3<f64>,
        accel: &Vector3<f64>,
        mag: &Vector3<f64>,
    ) {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st.device_time_ns == 0 {
            st.device_time_ns = device_ts as u64 * 1000;
        } else {
            let dt_ns = device_ts.wrapping_sub(st.last_device_ts) as u64 * 1000;
            st.device_time_ns += dt_ns;
        }
        st.last_device_ts = device_ts;

        st.fusion
            .imu_update(st.device_time_ns, ang_vel, accel, mag);

        if st.trace.is_some() {
            st.pending_imu.push(ImuObservation {
                local_ts,
                device_ts: st.device_time_ns,
                dt,
                ang_vel: *ang_vel,
                accel: *accel,
                mag: *mag,
            });
            if st.pending_imu.len() >= MAX_PENDING_IMU_OBSERVATIONS {
                // No camera activity flushed these for a while.
                st.flush_imu_trace();
            }
        }
    }

    /// Current device pose for rendering, with velocities in the device
    /// frame.
    pub fn get_view_pose(&self) -> ViewPose {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let state = st.fusion.get_pose_at(st.device_time_ns);
        let mut imu_vel = state.lin_vel;
        let mut imu_accel = state.lin_accel;

        if st.device_time_ns > st.last_reported_ts {
            let mut device_pose = state.pose * st.device_from_fusion;

            if st.device_time_ns - st.last_observed_pose_ts >= POSE_LOST_THRESHOLD_NS {
                // No recent observation of actual position. Hold the
                // device where it was rather than let IMU drift walk it.
                device_pose.pos = st.reported_pose.pos;
                imu_vel = Vector3::zeros();
                imu_accel = Vector3::zeros();
            }

            st.reported_pose = st.output_filter.run(st.device_time_ns, &device_pose);
            st.last_reported_ts = st.device_time_ns;
        }

        // Derivatives rotate into the device frame. Linear velocity also
        // picks up the angular velocity acting on the IMU offset.
        let device_ang_vel = st.device_from_fusion.orient * state.ang_vel;
        let rotated_imu_pos = st.device_from_fusion.orient * st.device_from_fusion.pos;
        let lin_vel =
            st.device_from_fusion.orient * imu_vel + device_ang_vel.cross(&rotated_imu_pos);
        let lin_accel = st.device_from_fusion.orient * imu_accel;

        ViewPose {
            pose: st.reported_pose,
            lin_vel,
            lin_accel,
            ang_vel: device_ang_vel,
        }
    }

    /// Current model-frame pose estimate for the pose solver.
    pub fn get_model_pose(&self, _ts: u64) -> ModelPoseEstimate {
        let mut guard = self.state.lock();
        guard.model_pose_estimate()
    }

    /// Apply one camera's solved pose for this device against the
    /// exposure the frame belongs to. Returns whether any part of the
    /// observation was applied.
    pub fn model_pose_update(
        &self,
        local_ts: u64,
        frame_start_local_ts: u64,
        exposure: &ExposureInfo,
        metrics: &PoseMetrics,
        model_pose: &Pose,
        source: &str,
    ) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        // The observed model pose, mapped into the fused IMU frame.
        let imu_pose = *model_pose * st.fusion_from_model;

        st.flush_imu_trace();

        let mut update_position = false;
        let mut update_orientation = false;
        let mut frame_device_ts = 0;
        let mut frame_fusion_slot = None;

        if let Some(dev_info) = exposure.devices.get(self.index) {
            frame_device_ts = dev_info.device_time_ns;

            let matching = dev_info.fusion_slot.and_then(|slot_id| {
                st.slots
                    .get_matching(slot_id, dev_info.device_time_ns)
                    .map(|_| slot_id)
            });

            match matching {
                None => {
                    log::info!(
                        "dev {}: pose observation from {} arrived after its delay slot was dropped",
                        self.id,
                        source
                    );
                }
                Some(slot_id) => {
                    let pos_error = model_pose.pos - dev_info.capture_pose.pos;
                    let rot_error = model_pose.orientation_diff(&dev_info.capture_pose);

                    log::debug!(
                        "dev {}: pose update for slot {} ts {} (delay {:.3}s) pos err {:?} rot err {:?} from {}",
                        self.id,
                        slot_id,
                        frame_device_ts,
                        (st.device_time_ns.saturating_sub(frame_device_ts)) as f64 / 1e9,
                        pos_error,
                        rot_error,
                        source
                    );

                    // An observation solved against a prior that failed to
                    // confirm the position is worthless once a newer
                    // observation has already been folded in.
                    if dev_info.had_pose_lock
                        && !metrics.score.contains(PoseScore::MATCH_POSITION)
                        && st.last_observed_pose_ts > frame_device_ts
                    {
                        log::info!(
                            "dev {}: ignoring stale position observation with error {:?} (prior stddev {:?})",
                            self.id,
                            pos_error,
                            dev_info.pos_error
                        );
                    } else {
                        update_position = true;
                    }

                    if metrics.score.contains(PoseScore::MATCH_ORIENT) {
                        update_orientation = true;
                        if st.device_time_ns - st.last_observed_pose_ts
                            > POSE_LOST_ORIENT_THRESHOLD_NS
                        {
                            log::info!(
                                "dev {}: matched orientation after {:.3}s",
                                self.id,
                                (st.device_time_ns - st.last_observed_pose_ts) as f64 / 1e9
                            );
                        }
                        // The match time only advances when this matched
                        // orientation is actually applied below.
                        if update_position {
                            st.last_observed_orient_ts = st.device_time_ns;
                        }
                    } else if st.device_time_ns - st.last_observed_pose_ts
                        > POSE_LOST_ORIENT_THRESHOLD_NS
                    {
                        log::info!("dev {}: forcing orientation observation", self.id);
                        update_orientation = true;
                    }

                    if update_position {
                        if update_orientation {
                            st.fusion.pose_update(st.device_time_ns, &imu_pose, slot_id);
                        } else {
                            st.fusion
                                .position_update(st.device_time_ns, &imu_pose.pos, slot_id);
                        }
                        log::trace!(
                            "dev {}: moved {:.4}m since previous observation",
                            self.id,
                            (imu_pose.pos - st.last_observed_pose.pos).norm()
                        );
                        st.last_observed_pose_ts = st.device_time_ns;
                        st.last_observed_pose = imu_pose;
                    }

                    frame_fusion_slot = Some(slot_id);

                    if let Some(slot) =
                        st.slots.get_matching_mut(slot_id, dev_info.device_time_ns)
                    {
                        slot.push_report(PoseReport {
                            used: update_position,
                            pose: imu_pose,
                            metrics: *metrics,
                        });
                    }
                }
            }
        }

        if let Some(writer) = st.trace.as_mut() {
            writer.write(&TraceRecord::Pose {
                local_ts,
                device_ts: st.device_time_ns,
                frame_start_local_ts,
                frame_local_ts: exposure.local_ts,
                frame_hmd_ts: exposure.hmd_ts,
                frame_exposure_count: exposure.count,
                frame_device_ts,
                frame_fusion_slot: slot_field(frame_fusion_slot),
                source,
                pos: model_pose.pos.into(),
                orient: quat_fields(model_pose),
            });
        }

        update_position || update_orientation
    }

    /// Re-query the retained exposure state: IMU updates that arrived
    /// after the frame can refine the capture-time prediction without
    /// moving its reference timestamp. On failure the slot reference in
    /// `dev_info` is cleared.
    pub fn get_latest_exposure_pose(&self, dev_info: &mut DeviceExposureInfo) -> bool {
        let Some(slot_id) = dev_info.fusion_slot else {
            return false;
        };

        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st
            .slots
            .get_matching(slot_id, dev_info.device_time_ns)
            .is_some()
        {
            if let Some(state) = st
                .fusion
                .get_delay_slot_pose_at(dev_info.device_time_ns, slot_id)
            {
                dev_info.capture_pose = state.pose * st.model_from_fusion;
                dev_info.pos_error = rotate_error(&st.model_from_fusion.orient, &state.pos_error);
                dev_info.rot_error = rotate_error(&st.model_from_fusion.orient, &state.rot_error);
                return true;
            }
        }

        // The slot was reassigned to a later exposure in the meantime.
        dev_info.fusion_slot = None;
        false
    }

    /// Allocate a delay slot for a new exposure and predict the capture
    /// pose. Called by the coordinator under the tracker lock.
    pub(crate) fn on_new_exposure(
        &self,
        dev_info: &mut DeviceExposureInfo,
        local_ts: u64,
        hmd_ts: u32,
        exposure_hmd_ts: u32,
        exposure_count: u16,
    ) {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        dev_info.device_time_ns = st.device_time_ns;

        match st
            .slots
            .prepare_new(st.device_time_ns, st.fusion.as_mut())
        {
            Some(slot_id) => {
                dev_info.fusion_slot = Some(slot_id);
                dev_info.had_pose_lock =
                    st.device_time_ns - st.last_observed_pose_ts < POSE_LOST_THRESHOLD_NS;

                let estimate = st.model_pose_estimate();
                dev_info.capture_pose = estimate.pose;
                dev_info.pos_error = estimate.pos_error;
                dev_info.rot_error = estimate.rot_error;
            }
            None => {
                dev_info.fusion_slot = None;
            }
        }

        st.flush_imu_trace();
        if let Some(writer) = st.trace.as_mut() {
            writer.write(&TraceRecord::Exposure {
                local_ts,
                hmd_ts,
                exposure_ts: exposure_hmd_ts,
                count: exposure_count,
                device_ts: dev_info.device_time_ns,
                delay_slot: slot_field(dev_info.fusion_slot),
            });
        }
    }

    /// Take a frame's reference on its exposure's slot.
    pub(crate) fn exposure_claim(&self, dev_info: &mut DeviceExposureInfo) {
        let Some(slot_id) = dev_info.fusion_slot else {
            return;
        };

        let mut guard = self.state.lock();
        if !guard.slots.claim(slot_id, dev_info.device_time_ns) {
            // The exposure was missed or its slot was reassigned.
            log::debug!(
                "dev {}: lost delay slot {} for ts {}",
                self.id,
                slot_id,
                dev_info.device_time_ns
            );
            dev_info.fusion_slot = None;
        }
    }

    /// Drop a frame's reference on its exposure's slot. Clearing the
    /// handle makes a second release for the same frame a no-op.
    pub(crate) fn exposure_release(&self, dev_info: &mut DeviceExposureInfo) {
        let Some(slot_id) = dev_info.fusion_slot else {
            return;
        };

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st
            .slots
            .release(slot_id, dev_info.device_time_ns, st.fusion.as_mut())
        {
            dev_info.fusion_slot = None;
        }
    }

    pub(crate) fn trace_frame_start(&self, local_ts: u64, source: &str) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.flush_imu_trace();
        if let Some(writer) = st.trace.as_mut() {
            writer.write(&TraceRecord::FrameStart { local_ts, source });
        }
    }

    pub(crate) fn trace_frame_captured(
        &self,
        local_ts: u64,
        frame_start_local_ts: u64,
        source: &str,
        slot: Option<usize>,
    ) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.flush_imu_trace();
        if let Some(writer) = st.trace.as_mut() {
            writer.write(&TraceRecord::FrameCaptured {
                local_ts,
                frame_start_local_ts,
                source,
                delay_slot: slot_field(slot),
            });
        }
    }

    pub(crate) fn trace_frame_release(
        &self,
        local_ts: u64,
        frame_local_ts: u64,
        source: &str,
        slot: Option<usize>,
    ) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.flush_imu_trace();
        if let Some(writer) = st.trace.as_mut() {
            writer.write(&TraceRecord::FrameRelease {
                local_ts,
                frame_local_ts,
                source,
                delay_slot: slot_field(slot),
            });
        }
    }

    /// Snapshot of (valid, use_count, device_time_ns) per delay slot.
    pub(crate) fn slots_snapshot(&self) -> Vec<(bool, u32, u64)> {
        let guard = self.state.lock();
        guard
            .slots
            .slots()
            .iter()
            .map(|s| (s.is_valid(), s.use_count(), s.device_time_ns()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn device_time_ns(&self) -> u64 {
        self.state.lock().device_time_ns
    }
}

fn quat_fields(pose: &Pose) -> [f64; 4] {
    // Trace order is [x, y, z, w].
    let coords = pose.orient.coords;
    [coords.x, coords.y, coords.z, coords.w]
}

impl DeviceState {
    /// Model-frame pose with the position hold applied: orientation is
    /// always fresh, position only moves while a visual observation is
    /// recent.
    fn model_pose_estimate(&mut self) -> ModelPoseEstimate {
        let state = self.fusion.get_pose_at(self.device_time_ns);
        let model_pose = state.pose * self.model_from_fusion;

        self.model_pose.orient = model_pose.orient;
        if self.device_time_ns - self.last_observed_pose_ts < POSE_LOST_THRESHOLD_NS {
            self.model_pose.pos = model_pose.pos;
        }

        ModelPoseEstimate {
            pose: self.model_pose,
            pos_error: rotate_error(&self.model_from_fusion.orient, &state.pos_error),
            rot_error: rotate_error(&self.model_from_fusion.orient, &state.rot_error),
        }
    }

    fn flush_imu_trace(&mut self) {
        if self.pending_imu.is_empty() {
            return;
        }
        if let Some(writer) = self.trace.as_mut() {
            for obs in &self.pending_imu {
                writer.write(&TraceRecord::Imu {
                    local_ts: obs.local_ts,
                    device_ts: obs.device_ts,
                    dt: obs.dt,
                    ang_vel: obs.ang_vel.into(),
                    accel: obs.accel.into(),
                    mag: obs.mag.into(),
                });
            }
        }
        self.pending_imu.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::DeadReckonFusion;
    use crate::slots::NUM_POSE_DELAY_SLOTS;
    use approx::assert_relative_eq;

    fn test_device() -> TrackedDevice {
        TrackedDevice::new(
            0,
            0,
            &Pose::identity(),
            &Pose::identity(),
            LedModel::default(),
            &ImuCalibration::default(),
            Box::new(DeadReckonFusion::new(
                &Pose::identity(),
                NUM_POSE_DELAY_SLOTS,
            )),
            None,
        )
    }

    fn run_imu(device: &TrackedDevice, from_us: u32, to_us: u32, ang_vel: &Vector3<f64>) {
        let zero = Vector3::zeros();
        let mut ts = from_us;
        while ts <= to_us {
            device.imu_update(0, ts, 0.001, ang_vel, &zero, &zero);
            ts += 1000;
        }
    }

    fn make_exposure(device: &TrackedDevice, count: u16) -> ExposureInfo {
        let mut dev_info = DeviceExposureInfo::default();
        device.on_new_exposure(&mut dev_info, 0, 0, 0, count);
        ExposureInfo {
            local_ts: 0,
            count,
            hmd_ts: 0,
            led_pattern_phase: 0,
            devices: vec![dev_info],
        }
    }

    fn full_score() -> PoseMetrics {
        PoseMetrics {
            score: PoseScore::MATCH_POSITION | PoseScore::MATCH_ORIENT,
            matched_blobs: 5,
            unmatched_blobs: 1,
            visible_leds: 8,
            reprojection_error: 0.4,
        }
    }

    #[test]
    fn test_device_time_unwraps_32bit_counter() {
        let device = test_device();
        let zero = Vector3::zeros();

        let start = u32::MAX - 1000;
        device.imu_update(0, start, 0.001, &zero, &zero, &zero);
        assert_eq!(device.device_time_ns(), start as u64 * 1000);

        device.imu_update(0, u32::MAX, 0.001, &zero, &zero, &zero);
        let before_wrap = device.device_time_ns();
        assert_eq!(before_wrap, start as u64 * 1000 + 1_000_000);

        // The 32-bit counter wraps; the 64-bit timeline keeps running.
        device.imu_update(0, 500, 0.001, &zero, &zero, &zero);
        assert_eq!(device.device_time_ns(), before_wrap + 501_000);
    }

    #[test]
    fn test_position_freezes_after_pose_lost_threshold() {
        let device = test_device();
        let spin = Vector3::new(0.0, 2.0, 0.0);

        // 600 ms of pure rotation with no visual updates.
        run_imu(&device, 1000, 600_000, &spin);

        let view = device.get_view_pose();
        assert_relative_eq!(view.pose.pos, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(view.lin_vel, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(view.lin_accel, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(view.ang_vel, spin, epsilon = 1e-9);
        // Orientation keeps tracking while position holds.
        assert!(view.pose.orient.angle() > 0.3);

        run_imu(&device, 601_000, 700_000, &spin);
        let later = device.get_view_pose();
        assert_relative_eq!(later.pose.pos, view.pose.pos, epsilon = 1e-12);
        assert!(later.pose.orient.angle_to(&view.pose.orient) > 1e-3);
    }

    #[test]
    fn test_stale_position_observation_rejected() {
        let device = test_device();
        let zero = Vector3::zeros();

        run_imu(&device, 1000, 200_000, &zero);
        let exposure_old = make_exposure(&device, 1);
        assert!(exposure_old.devices[0].had_pose_lock);

        run_imu(&device, 201_000, 250_000, &zero);
        let exposure_new = make_exposure(&device, 2);

        // A newer observation is accepted first.
        let newer = Pose::new(Vector3::new(0.25, 0.0, 0.1), UnitQuaternion::identity());
        assert!(device.model_pose_update(0, 0, &exposure_new, &full_score(), &newer, "camera-A"));
        let (t_newer, orient_ts) = device.last_observation_times();
        assert_eq!(t_newer, 250_000_000);
        assert_relative_eq!(device.get_model_pose(0).pose.pos, newer.pos, epsilon = 1e-9);

        // The older frame resolves late, without a position match.
        let older = Pose::new(Vector3::new(0.9, 0.9, 0.9), UnitQuaternion::identity());
        let metrics = PoseMetrics {
            score: PoseScore::MATCH_ORIENT,
            ..Default::default()
        };
        device.model_pose_update(0, 0, &exposure_old, &metrics, &older, "camera-B");

        // Its position must not displace the newer one.
        assert_relative_eq!(device.get_model_pose(0).pose.pos, newer.pos, epsilon = 1e-9);
        assert_eq!(device.last_observation_times(), (t_newer, orient_ts));
    }

    #[test]
    fn test_forced_orientation_without_match() {
        let device = test_device();
        let zero = Vector3::zeros();

        // Long past both thresholds, with no lock at exposure time.
        run_imu(&device, 1000, 600_000, &zero);
        let exposure = make_exposure(&device, 1);
        assert!(!exposure.devices[0].had_pose_lock);

        let observation = Pose::new(Vector3::new(0.1, 0.2, 0.3), UnitQuaternion::identity());
        let metrics = PoseMetrics {
            score: PoseScore::MATCH_POSITION,
            ..Default::default()
        };
        assert!(device.model_pose_update(0, 0, &exposure, &metrics, &observation, "camera-A"));

        // The forced orientation path never advances the match time.
        assert_eq!(device.last_observation_times(), (600_000_000, 0));
        assert_relative_eq!(device.get_model_pose(0).pose.pos, observation.pos, epsilon = 1e-9);
    }

    #[test]
    fn test_orient_ts_advances_only_on_applied_match() {
        let device = test_device();
        let zero = Vector3::zeros();

        run_imu(&device, 1000, 50_000, &zero);
        let exposure = make_exposure(&device, 1);
        let observation = Pose::identity();
        assert!(device.model_pose_update(0, 0, &exposure, &full_score(), &observation, "camera-A"));
        assert_eq!(device.last_observation_times(), (50_000_000, 50_000_000));
    }

    #[test]
    fn test_view_orientation_follows_prediction() {
        let device = test_device();
        let spin = Vector3::new(0.0, 1.0, 0.0);

        // Rotate, then hold still while the output smoothing settles.
        let zero = Vector3::zeros();
        let mut ts = 1000u32;
        while ts <= 300_000 {
            device.imu_update(0, ts, 0.001, &spin, &zero, &zero);
            device.get_view_pose();
            ts += 1000;
        }
        while ts <= 600_000 {
            device.imu_update(0, ts, 0.001, &zero, &zero, &zero);
            device.get_view_pose();
            ts += 1000;
        }

        let view = device.get_view_pose();
        let predicted = device.get_model_pose(0).pose;
        assert!(view.pose.orient.angle_to(&predicted.orient) < 1e-2);
    }

    #[test]
    fn test_use_count_tracks_outstanding_claims() {
        let device = test_device();
        run_imu(&device, 1000, 20_000, &Vector3::zeros());

        let exposure = make_exposure(&device, 1);
        let mut cam_a = exposure.devices[0];
        let mut cam_b = exposure.devices[0];

        device.exposure_claim(&mut cam_a);
        device.exposure_claim(&mut cam_b);
        let total: u32 = device.slots_snapshot().iter().map(|(_, c, _)| c).sum();
        assert_eq!(total, 2);

        device.exposure_release(&mut cam_a);
        assert_eq!(cam_a.fusion_slot, None);
        // A second release of the same frame is a no-op.
        device.exposure_release(&mut cam_a);
        let total: u32 = device.slots_snapshot().iter().map(|(_, c, _)| c).sum();
        assert_eq!(total, 1);

        device.exposure_release(&mut cam_b);
        let slots = device.slots_snapshot();
        assert!(slots.iter().all(|(valid, count, _)| !valid && *count == 0));

        // The freed ring accepts the next exposure.
        let next = make_exposure(&device, 2);
        assert!(next.devices[0].fusion_slot.is_some());
    }
}
