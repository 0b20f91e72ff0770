//! Pipeline controller and processing loop.
//!
//! `FramePipeline` owns the lifecycle (start/stop/release), the buffer pool,
//! and the two locks that coordinate everything: the pending-slot
//! mutex/condvar (delivery vs. processing) and the stage mutex (stage swap
//! vs. in-flight analysis). The locks are deliberately separate so that a
//! blocking wait for a frame never also blocks a stage swap.
//!
//! Thread picture: the capture source drives its own delivery thread, which
//! calls into [`DeliverySink::deliver`] and never blocks on the consumer.
//! The controller owns one processing worker that blocks only in
//! `take_blocking`, runs the analysis stage on each taken frame, and
//! recycles the buffer no matter how analysis went.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::analyze::{AnalysisStage, ResultSink};
use crate::pool::{FrameBuffer, FramePool};
use crate::slot::PendingSlot;
use crate::source::{CaptureSource, SessionConfig};
use crate::{BufferId, FrameMetadata, PipelineError, DEFAULT_POOL_BUFFERS};

/// Lifecycle state of a [`FramePipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
    /// Terminal: a released pipeline cannot be started again.
    Released,
}

#[derive(Default)]
struct Counters {
    frames_delivered: AtomicU64,
    frames_dropped_stale: AtomicU64,
    frames_skipped_unmapped: AtomicU64,
    frames_processed: AtomicU64,
    analysis_errors: AtomicU64,
}

/// Snapshot of per-session frame accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames the capture source handed to the sink with a valid pool buffer.
    pub frames_delivered: u64,
    /// Unread frames displaced from the slot and recycled unprocessed.
    pub frames_dropped_stale: u64,
    /// Delivered buffers that matched no pool entry and were skipped.
    pub frames_skipped_unmapped: u64,
    /// Frames the analysis stage processed successfully.
    pub frames_processed: u64,
    /// Frames on which the analysis stage returned an error.
    pub analysis_errors: u64,
}

/// State shared between the delivery sink and the processing worker for the
/// duration of one capture session.
struct SessionShared {
    slot: PendingSlot,
    /// Identities of every pool buffer primed into this session. Immutable
    /// while the session runs, so the delivery path checks membership
    /// without taking a lock.
    registry: HashSet<BufferId>,
    metadata: FrameMetadata,
    counters: Counters,
}

impl SessionShared {
    fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_delivered: self.counters.frames_delivered.load(Ordering::Relaxed),
            frames_dropped_stale: self.counters.frames_dropped_stale.load(Ordering::Relaxed),
            frames_skipped_unmapped: self
                .counters
                .frames_skipped_unmapped
                .load(Ordering::Relaxed),
            frames_processed: self.counters.frames_processed.load(Ordering::Relaxed),
            analysis_errors: self.counters.analysis_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle the capture source delivers frames through.
///
/// `deliver` maps the raw buffer to its pool entry by identity, publishes it
/// into the pending slot (recycling whatever unread frame it displaces), and
/// returns without ever waiting on the consumer.
#[derive(Clone)]
pub struct DeliverySink {
    shared: Arc<SessionShared>,
    source: Weak<dyn CaptureSource>,
}

impl DeliverySink {
    /// Deliver one captured frame. O(1), non-blocking.
    pub fn deliver(&self, buffer: FrameBuffer) {
        if !self.shared.registry.contains(&buffer.id()) {
            self.shared
                .counters
                .frames_skipped_unmapped
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("skipping frame: {} is not a pool buffer", buffer.id());
            return;
        }
        self.shared
            .counters
            .frames_delivered
            .fetch_add(1, Ordering::Relaxed);

        if let Some(stale) = self.shared.slot.publish(buffer) {
            self.shared
                .counters
                .frames_dropped_stale
                .fetch_add(1, Ordering::Relaxed);
            match self.source.upgrade() {
                Some(source) => source.add_free_buffer(stale),
                None => log::debug!("capture source gone; stale frame {} dropped", stale.id()),
            }
        }
    }

    /// Metadata of the session this sink belongs to.
    pub fn metadata(&self) -> FrameMetadata {
        self.shared.metadata
    }
}

struct Session {
    shared: Arc<SessionShared>,
    worker: Option<JoinHandle<()>>,
}

struct Lifecycle {
    state: PipelineState,
    pool: FramePool,
    session: Option<Session>,
    /// Kept after stop so stats remain readable between sessions.
    last_shared: Option<Arc<SessionShared>>,
}

type SharedStage = Arc<Mutex<Option<Box<dyn AnalysisStage>>>>;
type SharedSink = Arc<Mutex<Option<Box<dyn ResultSink>>>>;

/// Owns the capture session: pool, slot, processing worker, and the
/// analysis-stage and result-sink references.
pub struct FramePipeline {
    source: Arc<dyn CaptureSource>,
    stage: SharedStage,
    sink: SharedSink,
    lifecycle: Mutex<Lifecycle>,
    active_workers: Arc<AtomicUsize>,
}

impl FramePipeline {
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            source,
            stage: Arc::new(Mutex::new(None)),
            sink: Arc::new(Mutex::new(None)),
            lifecycle: Mutex::new(Lifecycle {
                state: PipelineState::Stopped,
                pool: FramePool::new(),
                session: None,
                last_shared: None,
            }),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Negotiate a format, prime the pool, launch the processing worker and
    /// begin capture. Fails without state change when already running,
    /// released, or no compatible configuration exists.
    pub fn start(&self, config: &SessionConfig) -> Result<FrameMetadata, PipelineError> {
        let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match lc.state {
            PipelineState::Running => return Err(PipelineError::AlreadyRunning),
            PipelineState::Released => return Err(PipelineError::Released),
            PipelineState::Stopped => {}
        }
        if config.buffer_count == 0 {
            return Err(PipelineError::Configuration(
                "buffer_count must be at least 1".to_string(),
            ));
        }
        if config.buffer_count < DEFAULT_POOL_BUFFERS {
            log::warn!(
                "priming only {} buffers; fewer than {} stalls most capture subsystems",
                config.buffer_count,
                DEFAULT_POOL_BUFFERS
            );
        }

        let format = self.source.configure(config)?;
        let metadata = format.metadata();

        for buffer in lc.pool.acquire_set(format.frame_bytes(), config.buffer_count) {
            self.source.add_free_buffer(buffer);
        }

        let shared = Arc::new(SessionShared {
            slot: PendingSlot::new(),
            registry: lc.pool.registered_ids(),
            metadata,
            counters: Counters::default(),
        });
        shared.slot.set_active(true);

        let spawned = {
            let shared = Arc::clone(&shared);
            let stage = Arc::clone(&self.stage);
            let sink = Arc::clone(&self.sink);
            let source = Arc::clone(&self.source);
            let active_workers = Arc::clone(&self.active_workers);
            std::thread::Builder::new()
                .name("frame-processing".to_string())
                .spawn(move || run_processing_loop(shared, stage, sink, source, active_workers))
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.source.stop();
                lc.pool.reset();
                return Err(PipelineError::Source(anyhow::anyhow!("spawn worker: {e}")));
            }
        };

        let delivery = DeliverySink {
            shared: Arc::clone(&shared),
            source: Arc::downgrade(&self.source),
        };
        if let Err(e) = self.source.start(delivery) {
            // Roll back: retire the worker, the primed buffers and the pool
            // before surfacing.
            shared.slot.set_active(false);
            let _ = worker.join();
            self.source.stop();
            lc.pool.reset();
            return Err(e);
        }

        lc.session = Some(Session {
            shared,
            worker: Some(worker),
        });
        lc.state = PipelineState::Running;
        log::info!(
            "pipeline started: {}x{} rotation={} buffers={}",
            metadata.width,
            metadata.height,
            metadata.rotation_degrees,
            config.buffer_count
        );
        Ok(metadata)
    }

    /// Stop capture and processing. Idempotent; safe from any thread.
    ///
    /// Returns only after the processing worker has fully exited, so a
    /// start() immediately after never races a second worker against the
    /// same pool.
    pub fn stop(&self) {
        let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        Self::stop_locked(&self.source, &mut lc);
    }

    /// Stop, tear down the analysis stage, and clear the result sink.
    /// Terminal: the pipeline cannot be started again afterwards.
    pub fn release(&self) {
        {
            let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            Self::stop_locked(&self.source, &mut lc);
            lc.state = PipelineState::Released;
        }
        let mut stage = self.stage.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut old) = stage.take() {
            old.stop();
        }
        drop(stage);
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = sink.as_mut() {
            sink.clear();
        }
        log::info!("pipeline released");
    }

    fn stop_locked(source: &Arc<dyn CaptureSource>, lc: &mut Lifecycle) {
        let Some(mut session) = lc.session.take() else {
            return;
        };
        session.shared.slot.set_active(false);
        if let Some(worker) = session.worker.take() {
            // Unbounded join: the worker exits as soon as the in-flight
            // analysis call returns.
            let _ = worker.join();
        }
        source.stop();
        // A frame published after the worker exited would otherwise keep its
        // buffer out of circulation forever.
        drop(session.shared.slot.clear());
        lc.pool.reset();
        lc.last_shared = Some(session.shared);
        if lc.state == PipelineState::Running {
            lc.state = PipelineState::Stopped;
        }
        log::info!("pipeline stopped");
    }

    /// Swap the analysis stage. Waits for any in-flight `process` call to
    /// finish, notifies the old stage, then installs the new one; an
    /// in-flight frame always completes on the stage that started it.
    pub fn set_analysis_stage(&self, stage: Box<dyn AnalysisStage>) {
        let mut guard = self.stage.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(mut sink) = self.sink.lock() {
            if let Some(sink) = sink.as_mut() {
                sink.clear();
            }
        }
        if let Some(mut old) = guard.take() {
            old.stop();
        }
        log::debug!("analysis stage set to {}", stage.name());
        *guard = Some(stage);
    }

    pub fn set_result_sink(&self, sink: Box<dyn ResultSink>) {
        let mut guard = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(sink);
    }

    pub fn state(&self) -> PipelineState {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    /// Metadata of the current (or most recent) session.
    pub fn metadata(&self) -> Option<FrameMetadata> {
        let lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lc.session
            .as_ref()
            .map(|s| s.shared.metadata)
            .or_else(|| lc.last_shared.as_ref().map(|s| s.metadata))
    }

    /// Frame accounting for the current (or most recent) session.
    pub fn stats(&self) -> PipelineStats {
        let lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lc.session
            .as_ref()
            .map(|s| s.shared.stats())
            .or_else(|| lc.last_shared.as_ref().map(|s| s.stats()))
            .unwrap_or_default()
    }

    /// Number of live processing workers. At most 1 by construction;
    /// exposed so tests and health checks can verify the invariant.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        let mut lc = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        Self::stop_locked(&self.source, &mut lc);
    }
}

/// The continuous processing loop.
///
/// Runs detection back-to-back while frames are pending: as soon as one
/// frame finishes, the next pending frame (if any) is taken without idling.
/// When analysis is slower than delivery, intermediate frames are displaced
/// in the slot and recycled unprocessed; when it is faster, the loop parks
/// in `take_blocking` and consumes no CPU.
fn run_processing_loop(
    shared: Arc<SessionShared>,
    stage: SharedStage,
    sink: SharedSink,
    source: Arc<dyn CaptureSource>,
    active_workers: Arc<AtomicUsize>,
) {
    active_workers.fetch_add(1, Ordering::SeqCst);
    log::debug!("processing loop started");

    loop {
        let Some(buffer) = shared.slot.take_blocking() else {
            break;
        };
        let meta = shared.metadata;

        // Analysis runs outside the slot lock so the delivery thread can
        // publish the next frame concurrently.
        let outcome = match stage.lock() {
            Ok(mut guard) => guard
                .as_mut()
                .map(|stage| stage.process(buffer.bytes(), &meta)),
            Err(_) => {
                // A stage panicked and poisoned its lock; there is nothing
                // left to dispatch to.
                source.add_free_buffer(buffer);
                break;
            }
        };

        match outcome {
            Some(Ok(result)) => {
                shared
                    .counters
                    .frames_processed
                    .fetch_add(1, Ordering::Relaxed);
                if let Ok(mut sink) = sink.lock() {
                    if let Some(sink) = sink.as_mut() {
                        sink.on_result(meta, result);
                    }
                }
            }
            Some(Err(err)) => {
                shared
                    .counters
                    .analysis_errors
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!("analysis stage failed on a frame: {err:#}");
                if let Ok(mut sink) = sink.lock() {
                    if let Some(sink) = sink.as_mut() {
                        sink.on_error(meta, &err);
                    }
                }
            }
            None => log::trace!("no analysis stage installed; frame discarded"),
        }

        // Recycle regardless of how analysis went; a lost buffer would
        // starve the capture source.
        source.add_free_buffer(buffer);
    }

    active_workers.fetch_sub(1, Ordering::SeqCst);
    log::debug!("processing loop exited");
}
