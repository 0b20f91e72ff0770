//! Synthetic capture sources.
//!
//! `SyntheticSource` stands in for a real camera: it advertises a mode
//! table, negotiates like a driver would, and runs a paced delivery thread
//! that fills free-list buffers with a deterministic pattern. When the free
//! list is empty the frame is dropped at the "driver" level, exactly like a
//! starved camera.
//!
//! `ManualSource` is the unpaced variant for deterministic tests: nothing
//! happens until the caller pumps a frame from its own thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;

use super::{
    derive_rotation, select_fps_range, select_frame_size, CaptureFormat, CaptureSource, FpsRange,
    SessionConfig,
};
use crate::pipeline::DeliverySink;
use crate::pool::{BufferId, FrameBuffer};
use crate::{PipelineError, PixelFormat};

/// Mode table and mounting parameters of a synthetic camera.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Identifier used in logs, e.g. "stub://camera0".
    pub device: String,
    pub supported_sizes: Vec<(u32, u32)>,
    pub supported_fps: Vec<FpsRange>,
    pub pixel_format: PixelFormat,
    /// Sensor mounting orientation in degrees.
    pub sensor_orientation: u32,
    /// Current display rotation in degrees.
    pub display_rotation: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera0".to_string(),
            supported_sizes: vec![(176, 144), (480, 360), (640, 480), (1280, 720)],
            supported_fps: vec![
                FpsRange {
                    min: 15_000,
                    max: 15_000,
                },
                FpsRange {
                    min: 7_000,
                    max: 30_000,
                },
                FpsRange {
                    min: 30_000,
                    max: 30_000,
                },
            ],
            pixel_format: PixelFormat::Nv21,
            sensor_orientation: 90,
            display_rotation: 0,
        }
    }
}

/// Delivery statistics of a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticStats {
    pub device: String,
    pub frames_delivered: u64,
    /// Frames lost because no free buffer was available at capture time.
    pub driver_drops: u64,
}

struct PacedWorker {
    handle: Option<JoinHandle<()>>,
}

/// Paced synthetic camera with its own delivery thread.
pub struct SyntheticSource {
    config: SyntheticConfig,
    format: Mutex<Option<CaptureFormat>>,
    worker: Mutex<PacedWorker>,
    running: Arc<AtomicBool>,
    free: Arc<Mutex<VecDeque<FrameBuffer>>>,
    frames_delivered: Arc<AtomicU64>,
    driver_drops: Arc<AtomicU64>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            format: Mutex::new(None),
            worker: Mutex::new(PacedWorker { handle: None }),
            running: Arc::new(AtomicBool::new(false)),
            free: Arc::new(Mutex::new(VecDeque::new())),
            frames_delivered: Arc::new(AtomicU64::new(0)),
            driver_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stats(&self) -> SyntheticStats {
        SyntheticStats {
            device: self.config.device.clone(),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            driver_drops: self.driver_drops.load(Ordering::Relaxed),
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn configure(&self, request: &SessionConfig) -> Result<CaptureFormat, PipelineError> {
        let (width, height) = select_frame_size(
            &self.config.supported_sizes,
            request.requested_width,
            request.requested_height,
        )
        .ok_or_else(|| {
            PipelineError::Configuration(format!(
                "{}: no suitable frame size",
                self.config.device
            ))
        })?;
        let fps_range = select_fps_range(&self.config.supported_fps, request.requested_fps)
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "{}: no suitable fps range",
                    self.config.device
                ))
            })?;
        let format = CaptureFormat {
            width,
            height,
            pixel_format: self.config.pixel_format,
            fps_range,
            rotation_degrees: derive_rotation(
                request.facing,
                self.config.sensor_orientation,
                self.config.display_rotation,
            ),
        };
        log::info!(
            "{}: negotiated {}x{} @ {}-{} mfps rotation={}",
            self.config.device,
            format.width,
            format.height,
            format.fps_range.min,
            format.fps_range.max,
            format.rotation_degrees
        );
        if let Ok(mut guard) = self.format.lock() {
            *guard = Some(format);
        }
        Ok(format)
    }

    fn start(&self, sink: DeliverySink) -> Result<(), PipelineError> {
        let format = lock_unpoisoned(&self.format)
            .ok_or_else(|| PipelineError::Source(anyhow!("source not configured")))?;

        // Delivery interval from the negotiated upper fps bound (x1000).
        let interval = Duration::from_millis((1_000_000 / format.fps_range.max.max(1)) as u64);

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let free = Arc::clone(&self.free);
        let frames_delivered = Arc::clone(&self.frames_delivered);
        let driver_drops = Arc::clone(&self.driver_drops);
        let device = self.config.device.clone();

        let handle = std::thread::Builder::new()
            .name("synthetic-capture".to_string())
            .spawn(move || {
                let mut seq: u64 = 0;
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    let popped = free.lock().ok().and_then(|mut list| list.pop_front());
                    let Some(mut buffer) = popped else {
                        driver_drops.fetch_add(1, Ordering::Relaxed);
                        log::trace!("{device}: no free buffer, dropping frame at driver");
                        continue;
                    };
                    fill_pattern(buffer.bytes_mut(), seq);
                    seq += 1;
                    sink.deliver(buffer);
                    frames_delivered.fetch_add(1, Ordering::Relaxed);
                }
                log::debug!("{device}: delivery thread exited");
            })
            .map_err(|e| PipelineError::Source(anyhow!("spawn delivery thread: {e}")))?;

        if let Ok(mut worker) = self.worker.lock() {
            worker.handle = Some(handle);
        }
        Ok(())
    }

    fn add_free_buffer(&self, buffer: FrameBuffer) {
        if let Ok(mut list) = self.free.lock() {
            list.push_back(buffer);
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Take the handle out of the lock before joining so the delivery
        // thread never contends with the join.
        let handle = self.worker.lock().ok().and_then(|mut w| w.handle.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        if let Ok(mut list) = self.free.lock() {
            list.clear();
        }
    }
}

/// Deterministic fill mixing sequence number and position, so consecutive
/// frames differ and the motion stub sees change.
fn fill_pattern(bytes: &mut [u8], seq: u64) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = ((i as u64 + seq) % 256) as u8;
    }
}

fn lock_unpoisoned<T: Copy>(mutex: &Mutex<Option<T>>) -> Option<T> {
    mutex.lock().ok().and_then(|guard| *guard)
}

// -------------------- ManualSource --------------------

struct ManualState {
    free: VecDeque<FrameBuffer>,
    sink: Option<DeliverySink>,
    delivering: bool,
    /// Every buffer id returned via `add_free_buffer` after `start`.
    recycled: Vec<BufferId>,
    seq: u64,
}

/// Hand-pumped capture source for deterministic tests.
///
/// `configure` grants the requested size exactly; `pump` delivers one frame
/// from the caller's thread, filling the buffer with the pump sequence
/// number. The source records every buffer recycled to it after `start`, so
/// tests can assert the "recycled exactly once, never processed" properties.
pub struct ManualSource {
    state: Mutex<ManualState>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                free: VecDeque::new(),
                sink: None,
                delivering: false,
                recycled: Vec::new(),
                seq: 0,
            }),
        }
    }

    /// Deliver one frame using the oldest free buffer. Returns the buffer id
    /// used, or `None` when the free list is empty or delivery has not
    /// started. The frame body is filled with the pump sequence number.
    pub fn pump(&self) -> Option<BufferId> {
        let (mut buffer, sink, seq) = {
            let mut state = self.state.lock().ok()?;
            if !state.delivering {
                return None;
            }
            let buffer = state.free.pop_front()?;
            let sink = state.sink.clone()?;
            let seq = state.seq;
            state.seq += 1;
            (buffer, sink, seq)
        };
        // Deliver outside the state lock: a displaced stale frame is
        // recycled straight back into `add_free_buffer`.
        let id = buffer.id();
        buffer.bytes_mut().fill((seq % 256) as u8);
        sink.deliver(buffer);
        Some(id)
    }

    pub fn free_len(&self) -> usize {
        self.state.lock().map(|s| s.free.len()).unwrap_or(0)
    }

    /// Buffer ids recycled to this source since `start`, in arrival order.
    pub fn recycled(&self) -> Vec<BufferId> {
        self.state
            .lock()
            .map(|s| s.recycled.clone())
            .unwrap_or_default()
    }
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for ManualSource {
    fn configure(&self, request: &SessionConfig) -> Result<CaptureFormat, PipelineError> {
        Ok(CaptureFormat {
            width: request.requested_width,
            height: request.requested_height,
            pixel_format: PixelFormat::Nv21,
            fps_range: FpsRange {
                min: 30_000,
                max: 30_000,
            },
            rotation_degrees: 0,
        })
    }

    fn start(&self, sink: DeliverySink) -> Result<(), PipelineError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::Source(anyhow!("manual source state poisoned")))?;
        state.sink = Some(sink);
        state.delivering = true;
        Ok(())
    }

    fn add_free_buffer(&self, buffer: FrameBuffer) {
        if let Ok(mut state) = self.state.lock() {
            if state.delivering {
                state.recycled.push(buffer.id());
            }
            state.free.push_back(buffer);
        }
    }

    fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.delivering = false;
            state.sink = None;
            state.free.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_negotiates_from_its_mode_table() {
        let source = SyntheticSource::new(SyntheticConfig::default());
        let format = source
            .configure(&SessionConfig::default())
            .expect("negotiation succeeds");

        assert_eq!((format.width, format.height), (480, 360));
        assert_eq!(format.fps_range.max, 30_000);
        // Back camera, sensor at 90, upright display.
        assert_eq!(format.rotation_degrees, 90);
    }

    #[test]
    fn synthetic_source_rejects_empty_mode_table() {
        let source = SyntheticSource::new(SyntheticConfig {
            supported_sizes: vec![],
            ..SyntheticConfig::default()
        });
        let err = source.configure(&SessionConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn fill_pattern_varies_between_frames() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_pattern(&mut a, 0);
        fill_pattern(&mut b, 1);
        assert_ne!(a, b);
    }
}
