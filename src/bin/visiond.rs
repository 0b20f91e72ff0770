//! visiond - frame acquisition and dispatch daemon
//!
//! This daemon:
//! 1. Negotiates a capture format with the configured source
//! 2. Primes the source with pooled frame buffers
//! 3. Runs the analysis stage on the latest pending frame
//! 4. Logs results and per-session frame accounting
//! 5. Releases the pipeline on SIGINT/SIGTERM

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vision_pipeline::{
    AnalysisResult, CaptureSource, FrameMetadata, FramePipeline, MotionStubStage, ResultSink,
    SyntheticConfig, SyntheticSource, VisiondConfig,
};

/// Sink that turns per-frame outcomes into log lines.
struct LogSink {
    motion_events: u64,
}

impl ResultSink for LogSink {
    fn on_result(&mut self, meta: FrameMetadata, result: AnalysisResult) {
        if result.motion_detected {
            self.motion_events += 1;
            log::info!(
                "motion #{}: {}x{} conf={:.2}",
                self.motion_events,
                meta.width,
                meta.height,
                result.confidence
            );
        } else {
            log::trace!("frame analyzed, no motion");
        }
    }

    fn on_error(&mut self, _meta: FrameMetadata, error: &anyhow::Error) {
        log::warn!("frame analysis error: {error:#}");
    }

    fn clear(&mut self) {
        self.motion_events = 0;
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = VisiondConfig::load()?;
    if !cfg.device.starts_with("stub://") {
        return Err(anyhow!(
            "unsupported capture device {:?} (only stub:// sources are available)",
            cfg.device
        ));
    }

    let source = Arc::new(SyntheticSource::new(SyntheticConfig {
        device: cfg.device.clone(),
        ..SyntheticConfig::default()
    }));
    let pipeline = FramePipeline::new(Arc::clone(&source) as Arc<dyn CaptureSource>);
    pipeline.set_analysis_stage(Box::new(MotionStubStage::new()));
    pipeline.set_result_sink(Box::new(LogSink { motion_events: 0 }));

    let meta = pipeline.start(&cfg.session)?;
    log::info!(
        "visiond running: device={} format={}x{} rotation={}",
        cfg.device,
        meta.width,
        meta.height,
        meta.rotation_degrees
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("failed to install signal handler: {e}"))?;
    }

    let mut last_stats_log = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));

        if last_stats_log.elapsed() >= cfg.stats_interval {
            let stats = pipeline.stats();
            let driver = source.stats();
            log::info!(
                "pipeline delivered={} processed={} dropped_stale={} errors={} driver_drops={}",
                stats.frames_delivered,
                stats.frames_processed,
                stats.frames_dropped_stale,
                stats.analysis_errors,
                driver.driver_drops
            );
            last_stats_log = Instant::now();
        }
    }

    log::info!("shutdown requested, releasing pipeline");
    pipeline.release();
    Ok(())
}
