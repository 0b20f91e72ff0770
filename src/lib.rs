//! Frame acquisition and dispatch pipeline for live camera analysis.
//!
//! The pipeline receives frames from a capture source at a hardware-determined
//! cadence and hands them to an analysis stage as fast as that stage can
//! consume them, without ever blocking the delivery thread and without
//! unbounded memory growth.
//!
//! # Architecture
//!
//! - `pool`: fixed set of pre-allocated, identity-addressable frame buffers
//! - `slot`: single-slot handoff between delivery and processing threads
//!   (at most one pending frame; a new arrival replaces an unread one)
//! - `pipeline`: lifecycle controller plus the dedicated processing loop
//! - `source`: the capture-source boundary and synthetic sources for it
//! - `analyze`: the pluggable per-frame analysis stage and result sink
//!
//! Backpressure policy is drop-oldest: if analysis is slower than delivery,
//! intermediate frames are recycled unprocessed and only the most recent
//! frame reaches the stage. Frames are never reordered and never processed
//! twice.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod analyze;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod slot;
pub mod source;

pub use analyze::{AnalysisResult, AnalysisStage, Detection, MotionStubStage, ResultSink};
pub use config::VisiondConfig;
pub use pipeline::{DeliverySink, FramePipeline, PipelineState, PipelineStats};
pub use pool::{BufferId, FrameBuffer, FramePool};
pub use slot::PendingSlot;
pub use source::{
    CameraFacing, CaptureFormat, CaptureSource, FpsRange, ManualSource, SessionConfig,
    SyntheticConfig, SyntheticSource, SyntheticStats,
};

/// Default requested frame width, in pixels.
pub const DEFAULT_REQUESTED_WIDTH: u32 = 480;
/// Default requested frame height, in pixels.
pub const DEFAULT_REQUESTED_HEIGHT: u32 = 360;
/// Default requested capture rate, in frames per second.
pub const DEFAULT_REQUESTED_FPS: f32 = 30.0;

/// Default number of pooled frame buffers.
///
/// Four buffers cover the steady state: one being written by the capture
/// subsystem, one queued as its next write target, one held by the
/// processing loop while analysis runs, and one sitting in the pending
/// slot awaiting pickup. This is a floor derived from driver behavior, not
/// a tuning knob; `SessionConfig::buffer_count` can raise it.
pub const DEFAULT_POOL_BUFFERS: usize = 4;

// -------------------- Pixel formats --------------------

/// Planar pixel formats the pipeline sizes buffers for.
///
/// The pipeline never converts between formats; the format only determines
/// how many bytes one captured frame occupies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4:2:0 Y plane followed by interleaved VU. The usual camera default.
    #[default]
    Nv21,
    /// 4:2:0 Y plane followed by separate V and U planes.
    Yv12,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Nv21 | PixelFormat::Yv12 => 12,
        }
    }

    /// Bytes needed to hold one frame of this format, rounded up to a whole
    /// byte, plus one guard byte.
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        let bits = width as u64 * height as u64 * self.bits_per_pixel() as u64;
        (bits.div_ceil(8) + 1) as usize
    }
}

// -------------------- Frame metadata --------------------

/// Per-session frame metadata, fixed at `start()` and passed to the analysis
/// stage with every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation to apply before interpretation: 0, 90, 180 or 270.
    pub rotation_degrees: u32,
}

// -------------------- Error taxonomy --------------------

/// Errors surfaced synchronously by pipeline lifecycle calls.
///
/// Steady-state per-frame failures (a delivered buffer that maps to no pool
/// entry, an analysis stage returning an error) are deliberately absent:
/// those are isolated to the frame, logged, counted in [`PipelineStats`] and
/// reported through the result sink, and never halt the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No compatible capture format/rate could be negotiated.
    #[error("no compatible capture configuration: {0}")]
    Configuration(String),

    /// `start()` was called while the pipeline is already running.
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// The pipeline has been released and cannot be started again.
    #[error("pipeline has been released")]
    Released,

    /// The capture source failed outside of format negotiation.
    #[error("capture source error: {0}")]
    Source(#[from] anyhow::Error),
}
