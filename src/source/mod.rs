//! The capture-source boundary.
//!
//! A [`CaptureSource`] is the driver-level collaborator producing frames at a
//! hardware-determined cadence. The pipeline consumes it through four
//! operations: format negotiation, starting delivery into a
//! [`DeliverySink`], returning free buffers, and stopping capture.
//!
//! This module also carries the session negotiation helpers (closest frame
//! size, closest fps range, rotation derivation) that sources share, and the
//! synthetic sources used for development and tests.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::pipeline::DeliverySink;
use crate::pool::FrameBuffer;
use crate::{
    FrameMetadata, PipelineError, PixelFormat, DEFAULT_POOL_BUFFERS, DEFAULT_REQUESTED_FPS,
    DEFAULT_REQUESTED_HEIGHT, DEFAULT_REQUESTED_WIDTH,
};

mod synthetic;

pub use synthetic::{ManualSource, SyntheticConfig, SyntheticSource, SyntheticStats};

/// Which physical camera a session asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

/// Session configuration, consumed once at `start()` and immutable for the
/// session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub requested_width: u32,
    pub requested_height: u32,
    pub requested_fps: f32,
    pub facing: CameraFacing,
    /// Number of pooled buffers to prime the source with. Values below
    /// [`DEFAULT_POOL_BUFFERS`] are accepted with a warning; most capture
    /// subsystems stall or drop frames at the driver level with fewer.
    pub buffer_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            requested_width: DEFAULT_REQUESTED_WIDTH,
            requested_height: DEFAULT_REQUESTED_HEIGHT,
            requested_fps: DEFAULT_REQUESTED_FPS,
            facing: CameraFacing::Back,
            buffer_count: DEFAULT_POOL_BUFFERS,
        }
    }
}

/// Frame-rate range in frames per second scaled by 1000, the fixed-point
/// convention camera APIs use instead of floating-point rates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

/// The concrete format a source settled on during negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps_range: FpsRange,
    /// Clockwise rotation of captured images relative to upright.
    pub rotation_degrees: u32,
}

impl CaptureFormat {
    /// Bytes one pooled buffer needs to hold a frame of this format.
    pub fn frame_bytes(&self) -> usize {
        self.pixel_format.frame_bytes(self.width, self.height)
    }

    /// Per-frame metadata captured at session start.
    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            width: self.width,
            height: self.height,
            rotation_degrees: self.rotation_degrees,
        }
    }
}

/// Driver-level frame producer.
///
/// Implementations own their delivery thread. The contract with the
/// pipeline:
///
/// - `configure` is called before `start` and may reject the request.
/// - After `start(sink)`, the source calls [`DeliverySink::deliver`] once per
///   captured frame, always with a buffer it previously received through
///   `add_free_buffer`.
/// - `add_free_buffer` may be called from any thread while capture runs.
/// - After `stop` returns, no further deliveries occur.
pub trait CaptureSource: Send + Sync {
    fn configure(&self, request: &SessionConfig) -> Result<CaptureFormat, PipelineError>;

    fn start(&self, sink: DeliverySink) -> Result<(), PipelineError>;

    /// Return a buffer to the source's free list, either to prime it before
    /// `start` or to recycle a drained frame.
    fn add_free_buffer(&self, buffer: FrameBuffer);

    fn stop(&self);
}

// -------------------- Negotiation helpers --------------------

/// Picks the supported size minimizing the sum of width and height distance
/// to the request. Not the only sensible policy, but a decent tradeoff
/// between closest aspect ratio and closest pixel area.
pub fn select_frame_size(
    supported: &[(u32, u32)],
    desired_width: u32,
    desired_height: u32,
) -> Option<(u32, u32)> {
    let mut selected = None;
    let mut min_diff = u32::MAX;
    for &(width, height) in supported {
        let diff = width.abs_diff(desired_width) + height.abs_diff(desired_height);
        if diff < min_diff {
            selected = Some((width, height));
            min_diff = diff;
        }
    }
    selected
}

/// Picks the range whose upper bound is closest to the desired rate while
/// its lower bound is as small as possible, so frames stay properly exposed
/// in low light. The desired value may fall outside the selected range: for
/// a request of 30.5 fps, (30, 30) beats (30, 40).
pub fn select_fps_range(supported: &[FpsRange], desired_fps: f32) -> Option<FpsRange> {
    let desired_scaled = (desired_fps * 1000.0) as u32;
    let mut selected = None;
    let mut min_upper_diff = u32::MAX;
    let mut min_lower = u32::MAX;
    for &range in supported {
        let upper_diff = range.max.abs_diff(desired_scaled);
        if upper_diff <= min_upper_diff && range.min <= min_lower {
            selected = Some(range);
            min_upper_diff = upper_diff;
            min_lower = range.min;
        }
    }
    selected
}

/// Rotation of captured images given the sensor's mounting orientation and
/// the current display rotation, both in degrees. Front-facing sensors are
/// mirrored, which flips the sign of the display compensation.
pub fn derive_rotation(
    facing: CameraFacing,
    sensor_orientation_degrees: u32,
    display_rotation_degrees: u32,
) -> u32 {
    match facing {
        CameraFacing::Front => (sensor_orientation_degrees + display_rotation_degrees) % 360,
        CameraFacing::Back => {
            (sensor_orientation_degrees + 360 - (display_rotation_degrees % 360)) % 360
        }
    }
}
