//! The pluggable per-frame analysis stage and the result sink it feeds.
//!
//! The pipeline invokes exactly one `process` call at a time, synchronously
//! from the processing loop, and recycles the frame buffer as soon as the
//! call returns. Implementations must not retain the pixel slice or spawn
//! background work tied to its lifetime.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::FrameMetadata;

/// Result of analyzing one frame.
#[derive(Clone, Debug, Default)]
pub struct AnalysisResult {
    /// Whether the scene changed relative to the previous analyzed frame.
    pub motion_detected: bool,
    /// Bounding boxes in normalized 0..1 coordinates.
    pub detections: Vec<Detection>,
    /// Confidence of the primary detection.
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

/// External analysis collaborator invoked once per dispatched frame.
///
/// `process` runs on the pipeline's processing thread, never the capture
/// delivery thread, and never concurrently with itself or with a stage swap.
/// The pixel slice is only valid for the duration of the call; the buffer
/// behind it is recycled to the capture source immediately afterwards.
pub trait AnalysisStage: Send {
    /// Stage identifier, used in logs.
    fn name(&self) -> &'static str;

    /// Analyze one frame. An error is isolated to this frame: the pipeline
    /// logs it, reports it to the result sink, recycles the buffer and moves
    /// on to the next frame.
    fn process(&mut self, pixels: &[u8], meta: &FrameMetadata) -> Result<AnalysisResult>;

    /// Teardown notification, delivered before the stage is replaced or the
    /// pipeline is released.
    fn stop(&mut self) {}
}

/// Consumer of per-frame outcomes: an overlay, a logger, a test probe.
pub trait ResultSink: Send {
    fn on_result(&mut self, meta: FrameMetadata, result: AnalysisResult);

    /// Called when the analysis stage failed on a frame. The frame itself is
    /// gone (recycled); only the description survives.
    fn on_error(&mut self, meta: FrameMetadata, error: &anyhow::Error);

    /// Clear any retained on-screen state. Invoked on stage swap and on
    /// pipeline release.
    fn clear(&mut self) {}
}

/// Hash-comparison motion stub. Flags any inter-frame pixel change.
///
/// Useful as a placeholder stage and in tests; real deployments install a
/// detector behind [`AnalysisStage`] instead.
pub struct MotionStubStage {
    last_hash: Option<[u8; 32]>,
}

impl MotionStubStage {
    pub fn new() -> Self {
        Self { last_hash: None }
    }
}

impl Default for MotionStubStage {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisStage for MotionStubStage {
    fn name(&self) -> &'static str {
        "motion-stub"
    }

    fn process(&mut self, pixels: &[u8], _meta: &FrameMetadata) -> Result<AnalysisResult> {
        let current: [u8; 32] = Sha256::digest(pixels).into();
        let motion = match self.last_hash {
            Some(prev) => prev != current,
            None => false,
        };
        self.last_hash = Some(current);

        Ok(AnalysisResult {
            motion_detected: motion,
            detections: vec![],
            confidence: if motion { 0.85 } else { 0.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FrameMetadata {
        FrameMetadata {
            width: 4,
            height: 4,
            rotation_degrees: 0,
        }
    }

    #[test]
    fn motion_stub_flags_changed_frames() -> Result<()> {
        let mut stage = MotionStubStage::new();

        // First frame: nothing to compare against.
        assert!(!stage.process(b"frame-a", &meta())?.motion_detected);
        // Changed content is motion.
        assert!(stage.process(b"frame-b", &meta())?.motion_detected);
        // Identical content is not.
        assert!(!stage.process(b"frame-b", &meta())?.motion_detected);
        Ok(())
    }
}
