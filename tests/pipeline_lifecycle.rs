//! End-to-end pipeline behavior tests.
//!
//! Exercises the lifecycle and concurrency contracts through the public API:
//! drop-oldest backpressure, buffer recycling, per-frame error isolation,
//! stage swap during an in-flight frame, and worker teardown on stop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use vision_pipeline::{
    AnalysisResult, AnalysisStage, CaptureSource, FrameMetadata, FramePipeline, ManualSource,
    MotionStubStage, PipelineState, ResultSink, SessionConfig, SyntheticConfig, SyntheticSource,
};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn small_session() -> SessionConfig {
    SessionConfig {
        requested_width: 8,
        requested_height: 8,
        ..SessionConfig::default()
    }
}

/// Stage whose `process` blocks until the gate opens. Frames are recorded by
/// their first pixel, which the manual source fills with the pump sequence.
struct GatedStage {
    gate: Arc<(Mutex<bool>, Condvar)>,
    entered: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<u8>>>,
    stopped: Arc<AtomicBool>,
}

impl GatedStage {
    fn new() -> Self {
        Self {
            gate: Arc::new((Mutex::new(false), Condvar::new())),
            entered: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
        let (lock, cvar) = &**gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl AnalysisStage for GatedStage {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn process(&mut self, pixels: &[u8], _meta: &FrameMetadata) -> Result<AnalysisResult> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let (lock, cvar) = &*self.gate;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
        drop(open);
        self.seen.lock().unwrap().push(pixels[0]);
        Ok(AnalysisResult::default())
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct FailingStage;

impl AnalysisStage for FailingStage {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn process(&mut self, _pixels: &[u8], _meta: &FrameMetadata) -> Result<AnalysisResult> {
        Err(anyhow!("injected stage failure"))
    }
}

#[derive(Clone, Default)]
struct CountingSink {
    results: Arc<AtomicUsize>,
    motion: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    cleared: Arc<AtomicUsize>,
}

impl ResultSink for CountingSink {
    fn on_result(&mut self, _meta: FrameMetadata, result: AnalysisResult) {
        self.results.fetch_add(1, Ordering::SeqCst);
        if result.motion_detected {
            self.motion.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_error(&mut self, _meta: FrameMetadata, _error: &anyhow::Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn clear(&mut self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn slow_analysis_drops_intermediate_frames_and_recycles_them_once() {
    let source = Arc::new(ManualSource::new());
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);

    let stage = GatedStage::new();
    let gate = Arc::clone(&stage.gate);
    let entered = Arc::clone(&stage.entered);
    let seen = Arc::clone(&stage.seen);
    pipeline.set_analysis_stage(Box::new(stage));

    pipeline.start(&small_session()).expect("start");

    // Frame 0 is taken and parks inside the gated stage.
    let first = source.pump().expect("pump frame 0");
    assert!(wait_until(Duration::from_secs(2), || {
        entered.load(Ordering::SeqCst) == 1
    }));

    // Three more frames while analysis is stuck: a and b are displaced by
    // their successor and recycled without ever reaching the stage.
    let a = source.pump().expect("pump a");
    let b = source.pump().expect("pump b");
    let c = source.pump().expect("pump c");
    assert!(wait_until(Duration::from_secs(2), || {
        let recycled = source.recycled();
        recycled.contains(&a) && recycled.contains(&b)
    }));

    GatedStage::open_gate(&gate);
    assert!(wait_until(Duration::from_secs(2), || {
        pipeline.stats().frames_processed == 2
    }));

    // Only frame 0 and the most recent frame were analyzed, in order.
    assert_eq!(seen.lock().unwrap().as_slice(), &[0, 3]);

    let stats = pipeline.stats();
    assert_eq!(stats.frames_delivered, 4);
    assert_eq!(stats.frames_dropped_stale, 2);

    // Every pumped buffer came back exactly once.
    pipeline.stop();
    let recycled = source.recycled();
    for id in [first, a, b, c] {
        assert_eq!(
            recycled.iter().filter(|&&r| r == id).count(),
            1,
            "{id} recycled exactly once"
        );
    }
}

#[test]
fn stage_errors_are_isolated_to_their_frame() {
    let source = Arc::new(ManualSource::new());
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);

    let sink = CountingSink::default();
    let errors = Arc::clone(&sink.errors);
    let results = Arc::clone(&sink.results);
    pipeline.set_analysis_stage(Box::new(FailingStage));
    pipeline.set_result_sink(Box::new(sink));

    pipeline.start(&small_session()).expect("start");

    for i in 0..100 {
        assert!(
            wait_until(Duration::from_secs(2), || source.free_len() > 0),
            "free buffer available before pump {i}"
        );
        source.pump().expect("pump");
        assert!(wait_until(Duration::from_secs(2), || {
            errors.load(Ordering::SeqCst) == i + 1
        }));
    }

    // Still running, and a working stage picks up right where the broken one
    // left off.
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert_eq!(pipeline.stats().analysis_errors, 100);

    pipeline.set_analysis_stage(Box::new(MotionStubStage::new()));
    source.pump().expect("pump after swap");
    assert!(wait_until(Duration::from_secs(2), || {
        results.load(Ordering::SeqCst) == 1
    }));

    pipeline.stop();
}

#[test]
fn stage_swap_waits_for_the_in_flight_frame() {
    let source = Arc::new(ManualSource::new());
    let pipeline = Arc::new(FramePipeline::new(
        Arc::clone(&source) as Arc<dyn CaptureSource>
    ));

    let old_stage = GatedStage::new();
    let gate = Arc::clone(&old_stage.gate);
    let entered = Arc::clone(&old_stage.entered);
    let old_seen = Arc::clone(&old_stage.seen);
    let old_stopped = Arc::clone(&old_stage.stopped);
    pipeline.set_analysis_stage(Box::new(old_stage));

    pipeline.start(&small_session()).expect("start");
    source.pump().expect("pump");
    assert!(wait_until(Duration::from_secs(2), || {
        entered.load(Ordering::SeqCst) == 1
    }));

    // Swap from another thread while a frame is mid-analysis.
    let new_stage = GatedStage::new();
    GatedStage::open_gate(&new_stage.gate);
    let new_seen = Arc::clone(&new_stage.seen);
    let swapper = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || pipeline.set_analysis_stage(Box::new(new_stage)))
    };

    // The swap is parked behind the in-flight call: the old stage has not
    // been told to stop yet.
    std::thread::sleep(Duration::from_millis(100));
    assert!(!old_stopped.load(Ordering::SeqCst));

    GatedStage::open_gate(&gate);
    swapper.join().expect("swap completes");
    assert!(old_stopped.load(Ordering::SeqCst));

    // The in-flight frame completed on the old stage; the next one lands on
    // the new stage.
    assert_eq!(old_seen.lock().unwrap().as_slice(), &[0]);
    source.pump().expect("pump after swap");
    assert!(wait_until(Duration::from_secs(2), || {
        new_seen.lock().unwrap().as_slice() == [1]
    }));

    pipeline.stop();
}

#[test]
fn start_stop_cycles_never_leak_workers() {
    let source = Arc::new(ManualSource::new());
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);
    pipeline.set_analysis_stage(Box::new(MotionStubStage::new()));

    for _ in 0..5 {
        pipeline.start(&small_session()).expect("start");
        assert!(wait_until(Duration::from_secs(2), || {
            pipeline.active_workers() == 1
        }));
        source.pump();
        pipeline.stop();
        assert_eq!(pipeline.active_workers(), 0);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}

#[test]
fn buffers_circulate_through_a_fixed_pool() {
    let source = Arc::new(ManualSource::new());
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);
    pipeline.set_analysis_stage(Box::new(MotionStubStage::new()));

    pipeline.start(&small_session()).expect("start");

    for i in 0..12u64 {
        assert!(wait_until(Duration::from_secs(2), || source.free_len() > 0));
        source.pump().expect("pump");
        assert!(wait_until(Duration::from_secs(2), || {
            pipeline.stats().frames_processed == i + 1
        }));
    }
    pipeline.stop();

    // Twelve frames moved through, but only the four pooled buffers exist.
    let mut unique = source.recycled();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 4);
}

#[test]
fn release_clears_the_sink_and_is_terminal() {
    let source = Arc::new(ManualSource::new());
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);

    let sink = CountingSink::default();
    let cleared = Arc::clone(&sink.cleared);
    pipeline.set_analysis_stage(Box::new(MotionStubStage::new()));
    pipeline.set_result_sink(Box::new(sink));

    pipeline.start(&small_session()).expect("start");
    pipeline.release();

    assert_eq!(pipeline.state(), PipelineState::Released);
    assert_eq!(pipeline.active_workers(), 0);
    assert_eq!(cleared.load(Ordering::SeqCst), 1);
    assert!(pipeline.start(&small_session()).is_err());
}

#[test]
fn synthetic_source_drives_the_pipeline_end_to_end() {
    let source = Arc::new(SyntheticSource::new(SyntheticConfig::default()));
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);

    let sink = CountingSink::default();
    let motion = Arc::clone(&sink.motion);
    pipeline.set_analysis_stage(Box::new(MotionStubStage::new()));
    pipeline.set_result_sink(Box::new(sink));

    let meta = pipeline.start(&SessionConfig::default()).expect("start");
    assert_eq!((meta.width, meta.height), (480, 360));
    assert_eq!(meta.rotation_degrees, 90);

    // The paced delivery thread produces distinct frames, so the motion stub
    // fires once it has two to compare.
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats().frames_processed >= 3
    }));
    assert!(motion.load(Ordering::SeqCst) >= 1);

    pipeline.stop();
    assert_eq!(pipeline.active_workers(), 0);
    assert!(source.stats().frames_delivered >= 3);
}
