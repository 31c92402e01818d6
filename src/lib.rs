//! # constellation - multi-camera 6DoF tracking core
//!
//! Fuses IMU data with LED-constellation observations from external
//! cameras to track headsets and controllers. The crate provides:
//! - The tracking coordinator: exposure lifecycle, delay-slot accounting
//!   and the per-device fusion state machine
//! - Isochronous UVC capture with frame pooling and backpressure
//! - Smoothed pose output for consumers at render rate
//!
//! The Kalman filter, blob detection and pose solving are collaborators
//! behind traits; a dead-reckoning fusion backend is included for
//! bring-up.
//!
//! ## Quick Start
//! ```no_run
//! use constellation::{Pose, Tracker};
//! use constellation::device::ImuCalibration;
//! use constellation::sensor::LedModel;
//!
//! let tracker = Tracker::new([0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
//! let hmd = tracker
//!     .add_device(0, &Pose::identity(), &Pose::identity(),
//!                 LedModel::default(), &ImuCalibration::default())
//!     .unwrap();
//!
//! // IMU packets drive the timeline; consumers poll the view pose.
//! let view = hmd.get_view_pose();
//! println!("pos: {:?}", view.pose.pos);
//! ```

pub mod clock;
pub mod device;
pub mod error;
pub mod exp_filter;
pub mod fusion;
pub mod pool;
pub mod pose;
pub mod sensor;
pub mod slots;
pub mod stream;
pub mod trace;
pub mod tracker;
pub mod uvc;

pub use device::TrackedDevice;
pub use error::Error;
pub use pose::Pose;
pub use stream::UvcStream;
pub use tracker::{DeviceExposureInfo, ExposureInfo, Tracker};

/// Result type alias for constellation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Most devices a tracker will follow at once (headset plus
/// controllers).
pub const MAX_TRACKED_DEVICES: usize = 3;

/// Most cameras a tracker will fuse observations from.
pub const MAX_SENSORS: usize = 4;
