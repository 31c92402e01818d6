//! Top-level tracking coordinator.
//!
//! Owns the device and sensor rosters, the current exposure snapshot
//! and the USB event thread. Locking is a strict two-level hierarchy:
//! the tracker lock is always taken before any device lock, at most one
//! device lock is held at a time, and sensor notifications are issued
//! with no lock held at all.

use crate::clock::MonotonicClock;
use crate::device::{initial_pose, ImuCalibration, TrackedDevice};
use crate::error::Error;
use crate::fusion::{DeadReckonFusion, FusionFilter};
use crate::pose::Pose;
use crate::sensor::{LedModel, Sensor};
use crate::slots::NUM_POSE_DELAY_SLOTS;
use crate::trace::{trace_dir, TraceWriter};
use crate::{Result, MAX_SENSORS, MAX_TRACKED_DEVICES};
use nalgebra::Vector3;
use parking_lot::Mutex;
use rusb::UsbContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Per-device slice of an exposure snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DeviceExposureInfo {
    /// Device timeline position when the exposure fired.
    pub device_time_ns: u64,
    /// Delay slot retaining the filter state for this exposure, if one
    /// could be allocated.
    pub fusion_slot: Option<usize>,
    /// Predicted pose at exposure time, in the model frame.
    pub capture_pose: Pose,
    /// 1-sigma error estimates for the prediction.
    pub pos_error: Vector3<f64>,
    pub rot_error: Vector3<f64>,
    /// Whether the prediction derives from a recent visual lock.
    pub had_pose_lock: bool,
}

impl Default for DeviceExposureInfo {
    fn default() -> Self {
        Self {
            device_time_ns: 0,
            fusion_slot: None,
            capture_pose: Pose::identity(),
            pos_error: Vector3::zeros(),
            rot_error: Vector3::zeros(),
            had_pose_lock: false,
        }
    }
}

/// Snapshot of one coordinated camera exposure, broadcast to sensors.
/// Sensors keep their own copy per frame; the slot references inside it
/// are claimed and released through the tracker's frame lifecycle.
#[derive(Debug, Clone, Default)]
pub struct ExposureInfo {
    /// Host monotonic nanoseconds when the exposure was announced.
    pub local_ts: u64,
    /// Monotonic 16-bit exposure counter from the HMD.
    pub count: u16,
    /// Exposure timestamp on the HMD's 32-bit microsecond clock.
    pub hmd_ts: u32,
    /// Which LED blink-pattern phase the constellation was in.
    pub led_pattern_phase: u8,
    pub devices: Vec<DeviceExposureInfo>,
}

struct TrackerState {
    have_exposure: bool,
    exposure: ExposureInfo,
    devices: Vec<Arc<TrackedDevice>>,
    sensors: Vec<Arc<dyn Sensor>>,
}

/// The tracking coordinator. One per HMD rig.
pub struct Tracker {
    clock: MonotonicClock,
    radio_id: [u8; 5],
    state: Mutex<TrackerState>,
    usb_ctx: Option<rusb::Context>,
    usb_thread: Option<JoinHandle<()>>,
    usb_done: Arc<AtomicBool>,
}

impl Tracker {
    /// Create a tracker with a USB context and event thread for camera
    /// capture. `radio_id` is the HMD radio pairing id handed to sensor
    /// backends for exposure sync.
    pub fn new(radio_id: [u8; 5]) -> Result<Tracker> {
        let usb_ctx = rusb::Context::new()?;
        let usb_done = Arc::new(AtomicBool::new(false));

        let thread_ctx = usb_ctx.clone();
        let thread_done = Arc::clone(&usb_done);
        let usb_thread = std::thread::Builder::new()
            .name("constellation-usb".into())
            .spawn(move || {
                usb_event_loop(thread_ctx, thread_done);
            })
            .map_err(Error::Io)?;

        Ok(Tracker {
            clock: MonotonicClock::new(),
            radio_id,
            state: Mutex::new(TrackerState {
                have_exposure: false,
                exposure: ExposureInfo::default(),
                devices: Vec::new(),
                sensors: Vec::new(),
            }),
            usb_ctx: Some(usb_ctx),
            usb_thread: Some(usb_thread),
            usb_done,
        })
    }

    /// Create a tracker without a USB context, for replaying recorded
    /// data or simulation where no cameras are attached.
    pub fn new_offline(radio_id: [u8; 5]) -> Tracker {
        Tracker {
            clock: MonotonicClock::new(),
            radio_id,
            state: Mutex::new(TrackerState {
                have_exposure: false,
                exposure: ExposureInfo::default(),
                devices: Vec::new(),
                sensors: Vec::new(),
            }),
            usb_ctx: None,
            usb_thread: None,
            usb_done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared USB context, for opening camera devices against.
    pub fn usb_context(&self) -> Option<&rusb::Context> {
        self.usb_ctx.as_ref()
    }

    pub fn radio_id(&self) -> &[u8; 5] {
        &self.radio_id
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    /// Start tracking a device with the default fusion backend.
    ///
    /// `imu_pose` maps the IMU frame to the device frame; `model_pose`
    /// maps the device frame to the LED model frame.
    pub fn add_device(
        &self,
        id: u32,
        imu_pose: &Pose,
        model_pose: &Pose,
        leds: LedModel,
        calibration: &ImuCalibration,
    ) -> Result<Arc<TrackedDevice>> {
        let fusion = Box::new(DeadReckonFusion::new(&initial_pose(), NUM_POSE_DELAY_SLOTS));
        self.add_device_with_fusion(id, imu_pose, model_pose, leds, calibration, fusion)
    }

    /// Start tracking a device with a caller-supplied fusion backend.
    pub fn add_device_with_fusion(
        &self,
        id: u32,
        imu_pose: &Pose,
        model_pose: &Pose,
        leds: LedModel,
        calibration: &ImuCalibration,
        fusion: Box<dyn FusionFilter>,
    ) -> Result<Arc<TrackedDevice>> {
        let trace = trace_dir().and_then(|dir| {
            match TraceWriter::create(&dir, &format!("constellation-device-{}", id)) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    log::warn!("failed to open trace file for device {}: {}", id, e);
                    None
                }
            }
        });

        let (device, sensors) = {
            let mut state = self.state.lock();
            if state.devices.len() >= MAX_TRACKED_DEVICES {
                return Err(Error::TooManyDevices);
            }
            let device = Arc::new(TrackedDevice::new(
                id,
                state.devices.len(),
                imu_pose,
                model_pose,
                leds,
                calibration,
                fusion,
                trace,
            ));
            state.devices.push(Arc::clone(&device));
            (device, state.sensors.clone())
        };

        // Sensor callbacks run outside the tracker lock.
        for sensor in &sensors {
            if !sensor.add_device(&device) {
                log::error!(
                    "failed to configure tracking for device {} on sensor {}",
                    id,
                    sensor.serial()
                );
            }
        }

        log::info!("device {} online, now tracking", id);
        Ok(device)
    }

    /// Register a camera sensor backend. Devices added earlier are
    /// handed to it immediately.
    pub fn add_sensor(&self, sensor: Arc<dyn Sensor>) -> Result<()> {
        let devices = {
            let mut state = self.state.lock();
            if state.sensors.len() >= MAX_SENSORS {
                return Err(Error::TooManySensors);
            }
            state.sensors.push(Arc::clone(&sensor));
            state.devices.clone()
        };

        for device in &devices {
            if !sensor.add_device(device) {
                log::error!(
                    "failed to configure tracking for device {} on sensor {}",
                    device.id(),
                    sensor.serial()
                );
            }
        }
        Ok(())
    }

    /// The most recent exposure snapshot, if any exposure has been seen.
    pub fn get_exposure_info(&self) -> Option<ExposureInfo> {
        let state = self.state.lock();
        state.have_exposure.then(|| state.exposure.clone())
    }

    /// Handle HMD telemetry announcing a camera exposure.
    ///
    /// A repeated exposure count only refreshes the LED pattern phase.
    /// A new count snapshots every device's predicted state into a
    /// fresh delay slot and then notifies the sensors, outside the
    /// tracker lock, so they can tag the next frame they receive.
    pub fn on_new_exposure(
        &self,
        hmd_ts: u32,
        exposure_count: u16,
        exposure_hmd_ts: u32,
        led_pattern_phase: u8,
    ) {
        let mut notify = None;

        {
            let mut state = self.state.lock();

            if state.exposure.led_pattern_phase != led_pattern_phase {
                log::debug!("LED pattern phase changed to {}", led_pattern_phase);
                state.exposure.led_pattern_phase = led_pattern_phase;
            }

            if state.exposure.count != exposure_count {
                let now = self.clock.now_ns();

                if (exposure_hmd_ts.wrapping_sub(hmd_ts) as i32) < -1500 {
                    log::warn!(
                        "exposure timestamp {} was more than 1.5 IMU samples earlier than IMU ts {} by {} us",
                        exposure_hmd_ts,
                        hmd_ts,
                        hmd_ts.wrapping_sub(exposure_hmd_ts)
                    );
                }

                state.exposure.local_ts = now;
                state.exposure.count = exposure_count;
                state.exposure.hmd_ts = exposure_hmd_ts;
                state.exposure.led_pattern_phase = led_pattern_phase;
                state.have_exposure = true;

                log::debug!(
                    "new exposure ts {} count {} LED pattern phase {}",
                    exposure_hmd_ts,
                    exposure_count,
                    led_pattern_phase
                );

                let mut device_infos = Vec::with_capacity(state.devices.len());
                for device in &state.devices {
                    let mut dev_info = DeviceExposureInfo::default();
                    device.on_new_exposure(
                        &mut dev_info,
                        now,
                        hmd_ts,
                        exposure_hmd_ts,
                        exposure_count,
                    );
                    device_infos.push(dev_info);
                }
                state.exposure.devices = device_infos;

                notify = Some((state.exposure.clone(), state.sensors.clone()));
            }
        }

        if let Some((info, sensors)) = notify {
            for sensor in &sensors {
                sensor.update_exposure(&info);
            }
        }
    }

    /// A camera started receiving a frame: take per-device references on
    /// the exposure's delay slots.
    pub fn frame_start(&self, local_ts: u64, source: &str, info: &mut ExposureInfo) {
        let state = self.state.lock();
        for (i, device) in state.devices.iter().enumerate() {
            // A device that came online after the exposure has no slice
            // in this snapshot.
            if let Some(dev_info) = info.devices.get_mut(i) {
                device.exposure_claim(dev_info);
            }
            device.trace_frame_start(local_ts, source);
        }
    }

    /// A frame's exposure association shifted mid-arrival: move the slot
    /// references from the old exposure to the new one.
    pub fn frame_changed_exposure(
        &self,
        old_info: Option<&mut ExposureInfo>,
        new_info: Option<&mut ExposureInfo>,
    ) {
        let state = self.state.lock();
        let old_devices = old_info.map(|info| &mut info.devices);
        let new_devices = new_info.map(|info| &mut info.devices);

        let mut old_iter = old_devices.into_iter().flatten();
        let mut new_iter = new_devices.into_iter().flatten();

        for device in state.devices.iter() {
            if let Some(dev_info) = old_iter.next() {
                device.exposure_release(dev_info);
            }
            if let Some(dev_info) = new_iter.next() {
                device.exposure_claim(dev_info);
            }
        }
    }

    /// A camera finished receiving a frame. Purely diagnostic; the slot
    /// references are untouched.
    pub fn frame_captured(
        &self,
        local_ts: u64,
        frame_start_local_ts: u64,
        info: &ExposureInfo,
        source: &str,
    ) {
        let state = self.state.lock();
        for (i, device) in state.devices.iter().enumerate() {
            let slot = info.devices.get(i).and_then(|d| d.fusion_slot);
            device.trace_frame_captured(local_ts, frame_start_local_ts, source, slot);
        }
    }

    /// A camera is done with a frame: drop the per-device references.
    /// The last release of a slot returns it to the filter.
    pub fn frame_release(
        &self,
        local_ts: u64,
        frame_local_ts: u64,
        info: &mut ExposureInfo,
        source: &str,
    ) {
        let state = self.state.lock();
        for (i, device) in state.devices.iter().enumerate() {
            let mut slot = None;
            if let Some(dev_info) = info.devices.get_mut(i) {
                slot = dev_info.fusion_slot;
                device.exposure_release(dev_info);
            }
            device.trace_frame_release(local_ts, frame_local_ts, source, slot);
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.usb_done.store(true, Ordering::Release);
        if let Some(thread) = self.usb_thread.take() {
            let _ = thread.join();
        }
    }
}

fn usb_event_loop(ctx: rusb::Context, done: Arc<AtomicBool>) {
    log::info!("USB event thread running");
    while !done.load(Ordering::Acquire) {
        if let Err(e) = ctx.handle_events(Some(Duration::from_millis(100))) {
            log::warn!("USB event handling error: {}", e);
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    log::info!("USB event thread stopped");
}
