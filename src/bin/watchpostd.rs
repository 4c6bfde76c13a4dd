//! watchpostd - multi-camera analysis daemon
//!
//! This daemon:
//! 1. Loads the pipeline configuration (file + environment)
//! 2. Registers the built-in detector backends
//! 3. Starts one reader/consumer worker per camera and the presence monitor
//! 4. Drains faults and applies the restart policy until Ctrl-C or --run-secs
//! 5. Stops every worker, then the monitor

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use watchpost::config::{PipelineConfig, CONFIG_ENV};
use watchpost::detect::{CpuMotionBackend, StubBackend};
use watchpost::{AnnotatedFrame, BackendRegistry, DefaultOpener, FrameSink, Supervisor};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON or TOML pipeline configuration.
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,
    /// Comma-separated capture sources, replacing configured ones in order.
    #[arg(long)]
    sources: Option<String>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_secs: Option<u64>,
    /// Fault polling interval in milliseconds.
    #[arg(long, default_value_t = 250)]
    supervise_ms: u64,
}

/// Counts presented frames per camera for the health log.
struct FrameCounter {
    frames: Vec<AtomicU64>,
}

impl FrameCounter {
    fn new(cameras: usize) -> Self {
        Self {
            frames: (0..cameras).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn count(&self, camera: usize) -> u64 {
        self.frames
            .get(camera)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl FrameSink for FrameCounter {
    fn present(&self, frame: &Arc<AnnotatedFrame>) {
        if let Some(counter) = self.frames.get(frame.camera) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(sources) = &args.sources {
        config = config.with_sources(sources)?;
    }

    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());
    let (threshold, cell) = (config.analysis.motion_threshold, config.analysis.motion_cell);
    registry.register_per_stream(move || CpuMotionBackend::new(threshold, cell));
    log::info!("detector backends: {}", registry.list().join(", "));

    let counter = Arc::new(FrameCounter::new(config.cameras.len()));
    let sink: Arc<dyn FrameSink> = counter.clone();
    let mut supervisor =
        Supervisor::new(&config, &registry, Arc::new(DefaultOpener), Some(sink))?;
    supervisor.start_all()?;
    log::info!(
        "watchpostd running: {} camera(s), analysis every {} tick(s)",
        supervisor.camera_count(),
        config.analysis.period
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let deadline = args
        .run_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let poll = Duration::from_millis(args.supervise_ms.max(1));
    let mut last_health_log = Instant::now();
    loop {
        match rx.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping workers...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let faults = supervisor.supervise();
        if !faults.is_empty() {
            log::debug!("handled {} fault(s)", faults.len());
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            for camera in 0..supervisor.camera_count() {
                log::info!(
                    "health: camera {} {:?}, {} frame(s) presented",
                    camera,
                    supervisor.camera_status(camera)?,
                    counter.count(camera)
                );
            }
            if let Some(state) = supervisor.presence_state() {
                log::info!("health: presence {}", state);
            }
            last_health_log = Instant::now();
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("run time elapsed, stopping workers...");
            break;
        }
    }

    supervisor.stop_all()?;
    log::info!("watchpostd stopped");
    Ok(())
}
