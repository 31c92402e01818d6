//! Per-device JSON trace export.
//!
//! Setting `OHMD_TRACE_DIR` enables one line-delimited JSON file per
//! tracked device, recording IMU samples, exposures, frame lifecycle
//! events and pose observations for offline analysis. Tracing is purely
//! diagnostic; write failures disable the writer and never disturb
//! tracking.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Environment variable naming the trace output directory.
pub const TRACE_DIR_ENV: &str = "OHMD_TRACE_DIR";

/// The trace directory, if tracing is enabled for this process.
pub fn trace_dir() -> Option<PathBuf> {
    std::env::var_os(TRACE_DIR_ENV).map(PathBuf::from)
}

/// One trace line. Field names follow the long-standing file format.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TraceRecord<'a> {
    Device {
        #[serde(rename = "device-id")]
        device_id: u32,
        #[serde(rename = "accel-offset")]
        accel_offset: [f64; 3],
        #[serde(rename = "accel-matrix")]
        accel_matrix: [f64; 9],
        #[serde(rename = "gyro-offset")]
        gyro_offset: [f64; 3],
        #[serde(rename = "gyro-matrix")]
        gyro_matrix: [f64; 9],
    },
    Imu {
        #[serde(rename = "local-ts")]
        local_ts: u64,
        #[serde(rename = "device-ts")]
        device_ts: u64,
        dt: f64,
        ang_vel: [f64; 3],
        accel: [f64; 3],
        mag: [f64; 3],
    },
    Exposure {
        #[serde(rename = "local-ts")]
        local_ts: u64,
        #[serde(rename = "hmd-ts")]
        hmd_ts: u32,
        #[serde(rename = "exposure-ts")]
        exposure_ts: u32,
        count: u16,
        #[serde(rename = "device-ts")]
        device_ts: u64,
        #[serde(rename = "delay-slot")]
        delay_slot: i64,
    },
    FrameStart {
        #[serde(rename = "local-ts")]
        local_ts: u64,
        source: &'a str,
    },
    FrameCaptured {
        #[serde(rename = "local-ts")]
        local_ts: u64,
        #[serde(rename = "frame-start-local-ts")]
        frame_start_local_ts: u64,
        source: &'a str,
        #[serde(rename = "delay-slot")]
        delay_slot: i64,
    },
    FrameRelease {
        #[serde(rename = "local-ts")]
        local_ts: u64,
        #[serde(rename = "frame-local-ts")]
        frame_local_ts: u64,
        source: &'a str,
        #[serde(rename = "delay-slot")]
        delay_slot: i64,
    },
    Pose {
        #[serde(rename = "local-ts")]
        local_ts: u64,
        #[serde(rename = "device-ts")]
        device_ts: u64,
        #[serde(rename = "frame-start-local-ts")]
        frame_start_local_ts: u64,
        #[serde(rename = "frame-local-ts")]
        frame_local_ts: u64,
        #[serde(rename = "frame-hmd-ts")]
        frame_hmd_ts: u32,
        #[serde(rename = "frame-exposure-count")]
        frame_exposure_count: u16,
        #[serde(rename = "frame-device-ts")]
        frame_device_ts: u64,
        #[serde(rename = "frame-fusion-slot")]
        frame_fusion_slot: i64,
        source: &'a str,
        pos: [f64; 3],
        orient: [f64; 4],
    },
}

/// Encode an optional slot index the way the trace format expects.
pub fn slot_field(slot: Option<usize>) -> i64 {
    slot.map_or(-1, |s| s as i64)
}

/// Line-delimited JSON writer for one device.
pub struct TraceWriter {
    out: BufWriter<File>,
    failed: bool,
}

impl TraceWriter {
    /// Create `<dir>/<device_name>.json`, truncating any previous trace.
    pub fn create(dir: &Path, device_name: &str) -> std::io::Result<TraceWriter> {
        let path = dir.join(format!("{}.json", device_name));
        log::info!("opening trace file {}", path.display());
        let file = File::create(path)?;
        Ok(TraceWriter {
            out: BufWriter::new(file),
            failed: false,
        })
    }

    pub fn write(&mut self, record: &TraceRecord<'_>) {
        if self.failed {
            return;
        }
        let result = serde_json::to_string(record)
            .map_err(std::io::Error::other)
            .and_then(|line| {
                self.out.write_all(line.as_bytes())?;
                self.out.write_all(b"\n")?;
                self.out.flush()
            });
        if let Err(e) = result {
            log::warn!("trace write failed, disabling trace: {}", e);
            self.failed = true;
        }
    }
}
