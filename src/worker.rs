//! Stream Worker: one reader thread and one consumer thread per camera.
//!
//! The reader owns the capture source and publishes into a [`FrameSlot`]. The
//! consumer wakes every frame period, takes the camera lock, ticks the
//! [`CameraStream`] with the newest frame, and hands the result to the sink
//! after releasing the lock. Control calls from the supervisor take the same
//! lock, so they never interleave with a tick.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::camera::CameraStream;
use crate::frame::FrameSlot;
use crate::ingest::{OwnedSource, SourceOpener};
use crate::signal::{CancelToken, ExitGuard, ExitLatch};
use crate::supervisor::{send_fault, Fault, FrameSink};
use crate::{lock_recover, pipeline_error, PipelineError};

pub const DEFAULT_FRAME_PERIOD: Duration = Duration::from_millis(40);
pub const DEFAULT_MAX_CONSECUTIVE_MISSES: u32 = 50;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between reads after a transient miss.
const MISS_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Consumer period when neither the camera nor the source fixes one.
    pub default_period: Duration,
    /// Transient misses in a row before the source is declared lost.
    pub max_consecutive_misses: u32,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            default_period: DEFAULT_FRAME_PERIOD,
            max_consecutive_misses: DEFAULT_MAX_CONSECUTIVE_MISSES,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Handles for one running reader/consumer pair.
struct Run {
    cancel: CancelToken,
    emergency: Arc<AtomicBool>,
    latch: ExitLatch,
    slot: Arc<FrameSlot>,
    threads: Vec<JoinHandle<()>>,
}

pub struct StreamWorker {
    index: usize,
    camera: Arc<Mutex<CameraStream>>,
    opener: Arc<dyn SourceOpener>,
    settings: WorkerSettings,
    faults: Option<SyncSender<Fault>>,
    sink: Option<Arc<dyn FrameSink>>,
    run: Option<Run>,
}

impl StreamWorker {
    pub fn new(
        camera: CameraStream,
        opener: Arc<dyn SourceOpener>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            index: camera.index(),
            camera: Arc::new(Mutex::new(camera)),
            opener,
            settings,
            faults: None,
            sink: None,
            run: None,
        }
    }

    /// Fault queue shared with the supervisor. Faults are dropped while it is full.
    pub fn with_faults(mut self, faults: SyncSender<Fault>) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Open the camera's source and spawn the loop pair. No-op when running.
    ///
    /// A source that cannot be opened is reported as
    /// [`PipelineError::SourceUnrecoverable`].
    pub fn start(&mut self) -> Result<()> {
        if self.run.is_some() {
            return Ok(());
        }

        let (descriptor, fixed_period) = {
            let camera = lock_recover(&self.camera);
            (camera.source().clone(), camera.frame_period())
        };
        let source = self.opener.open(&descriptor).map_err(|err| {
            anyhow::Error::new(PipelineError::SourceUnrecoverable {
                camera: self.index,
                reason: format!("open {}: {:#}", descriptor, err),
            })
        })?;
        let period = fixed_period
            .or_else(|| period_from_fps(source.fps()))
            .unwrap_or(self.settings.default_period);

        let mut run = Run {
            cancel: CancelToken::new(),
            emergency: Arc::new(AtomicBool::new(false)),
            latch: ExitLatch::new(),
            slot: Arc::new(FrameSlot::new()),
            threads: Vec::with_capacity(2),
        };
        let reader = ReaderLoop {
            camera: self.index,
            source: OwnedSource(source),
            slot: run.slot.clone(),
            cancel: run.cancel.clone(),
            emergency: run.emergency.clone(),
            max_misses: self.settings.max_consecutive_misses,
            faults: self.faults.clone(),
            _exit: run.latch.enter(),
        };
        let consumer = ConsumerLoop {
            camera: self.camera.clone(),
            index: self.index,
            slot: run.slot.clone(),
            cancel: run.cancel.clone(),
            emergency: run.emergency.clone(),
            period,
            faults: self.faults.clone(),
            sink: self.sink.clone(),
            _exit: run.latch.enter(),
        };

        let reader = thread::Builder::new()
            .name(format!("watchpost-reader-{}", self.index))
            .spawn(move || reader.run())
            .context("spawn reader thread")?;
        run.threads.push(reader);
        match thread::Builder::new()
            .name(format!("watchpost-consumer-{}", self.index))
            .spawn(move || consumer.run())
        {
            Ok(handle) => run.threads.push(handle),
            Err(err) => {
                run.cancel.cancel();
                return Err(err).context("spawn consumer thread");
            }
        }

        log::info!(
            "camera {}: worker started on {} (period {}ms)",
            self.index,
            descriptor,
            period.as_millis()
        );
        self.run = Some(run);
        Ok(())
    }

    /// Signal both loops to exit without waiting.
    pub fn stop(&self) {
        if let Some(run) = &self.run {
            run.cancel.cancel();
        }
    }

    /// Signal both loops and wait until they have exited.
    ///
    /// Calling it on a stopped worker is a no-op. On timeout the loops stay
    /// signalled and a later call waits again.
    pub fn stop_and_wait(&mut self, timeout: Duration) -> Result<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        run.cancel.cancel();
        if !run.latch.wait(timeout) {
            log::error!(
                "camera {}: worker did not stop within {}ms",
                self.index,
                timeout.as_millis()
            );
            return Err(PipelineError::ShutdownTimeout {
                component: format!("camera {} worker", self.index),
                waited: timeout,
            }
            .into());
        }
        for handle in run.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("camera {}: worker thread panicked", self.index);
            }
        }
        run.slot.clear();
        self.run = None;
        log::info!("camera {}: worker stopped", self.index);
        Ok(())
    }

    /// `stop_and_wait` with the configured timeout.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop_and_wait(self.settings.shutdown_timeout)
    }

    /// True while at least one loop of the current run is alive.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.latch.live() > 0)
    }

    /// True when the current run ended because its source failed.
    pub fn source_lost(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| run.emergency.load(Ordering::Acquire))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn camera(&self) -> Arc<Mutex<CameraStream>> {
        self.camera.clone()
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn period_from_fps(fps: Option<f64>) -> Option<Duration> {
    fps.filter(|fps| fps.is_finite() && *fps > 0.0)
        .map(|fps| Duration::from_secs_f64(1.0 / fps))
}

fn report(faults: &Option<SyncSender<Fault>>, fault: Fault) {
    if let Some(tx) = faults {
        send_fault(tx, fault);
    }
}

struct ReaderLoop {
    camera: usize,
    source: OwnedSource,
    slot: Arc<FrameSlot>,
    cancel: CancelToken,
    emergency: Arc<AtomicBool>,
    max_misses: u32,
    faults: Option<SyncSender<Fault>>,
    _exit: ExitGuard,
}

impl ReaderLoop {
    fn run(mut self) {
        let mut misses = 0u32;
        while !self.cancel.is_cancelled() {
            match self.source.0.read() {
                Ok(Some(frame)) => {
                    misses = 0;
                    self.slot.publish(frame);
                }
                Ok(None) => {
                    misses += 1;
                    if misses > self.max_misses {
                        self.fail(format!("{} consecutive read misses", misses));
                        break;
                    }
                    log::debug!("camera {}: read miss {}", self.camera, misses);
                    if self.cancel.sleep(MISS_BACKOFF) {
                        break;
                    }
                }
                Err(err) => {
                    self.fail(format!("{:#}", err));
                    break;
                }
            }
        }
        log::debug!(
            "camera {}: reader exiting ({}, {} frame(s) read)",
            self.camera,
            self.source.0.describe(),
            self.slot.published()
        );
    }

    fn fail(&self, reason: String) {
        log::error!("camera {}: source lost: {}", self.camera, reason);
        self.emergency.store(true, Ordering::Release);
        report(
            &self.faults,
            Fault::Camera {
                camera: self.camera,
                error: PipelineError::SourceUnrecoverable {
                    camera: self.camera,
                    reason,
                },
            },
        );
    }
}

struct ConsumerLoop {
    camera: Arc<Mutex<CameraStream>>,
    index: usize,
    slot: Arc<FrameSlot>,
    cancel: CancelToken,
    emergency: Arc<AtomicBool>,
    period: Duration,
    faults: Option<SyncSender<Fault>>,
    sink: Option<Arc<dyn FrameSink>>,
    _exit: ExitGuard,
}

impl ConsumerLoop {
    fn run(self) {
        loop {
            let started = Instant::now();
            if self.cancel.is_cancelled() || self.emergency.load(Ordering::Acquire) {
                break;
            }
            if let Some(frame) = self.slot.latest() {
                let outcome = {
                    let mut camera = lock_recover(&self.camera);
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    camera.tick(&frame)
                };
                match outcome {
                    Ok(Some(output)) => {
                        if let Some(sink) = &self.sink {
                            sink.present(&output);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!("camera {}: tick abandoned: {:#}", self.index, err);
                        let error = pipeline_error(&err).cloned().unwrap_or_else(|| {
                            PipelineError::TransientFrame {
                                camera: self.index,
                                reason: format!("{:#}", err),
                            }
                        });
                        report(
                            &self.faults,
                            Fault::Camera {
                                camera: self.index,
                                error,
                            },
                        );
                    }
                }
            }
            if self.cancel.sleep(self.period.saturating_sub(started.elapsed())) {
                break;
            }
        }
        log::debug!("camera {}: consumer exiting", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{AnnotatedFrame, Detectors, Mode, StreamSettings};
    use crate::detect::{DetectionCapability, DetectionResult, DetectorBackend, LabelMap};
    use crate::frame::Frame;
    use crate::ingest::{CaptureSource, SourceDescriptor};
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Script {
        Endless,
        FailAfter(u64),
        AlwaysMiss,
    }

    struct ScriptedSource {
        script: Script,
        served: u64,
        releases: Arc<AtomicUsize>,
    }

    impl CaptureSource for ScriptedSource {
        fn read(&mut self) -> Result<Option<Frame>> {
            thread::sleep(Duration::from_millis(2));
            match self.script {
                Script::FailAfter(n) if self.served >= n => anyhow::bail!("device unplugged"),
                Script::AlwaysMiss => return Ok(None),
                _ => {}
            }
            self.served += 1;
            Ok(Some(Frame::new(RgbImage::new(32, 24), self.served)))
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn fps(&self) -> Option<f64> {
            Some(200.0)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct ScriptedOpener {
        script: Script,
        releases: Arc<AtomicUsize>,
        opens: AtomicUsize,
    }

    impl ScriptedOpener {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                releases: Arc::new(AtomicUsize::new(0)),
                opens: AtomicUsize::new(0),
            })
        }
    }

    impl SourceOpener for ScriptedOpener {
        fn open(&self, _: &SourceDescriptor) -> Result<Box<dyn CaptureSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                script: self.script,
                served: 0,
                releases: self.releases.clone(),
            }))
        }
    }

    struct SlowBackend(Duration);

    impl DetectorBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn supports(&self, capability: DetectionCapability) -> bool {
            capability == DetectionCapability::ObjectDetection
        }

        fn detect(&mut self, _: &RgbImage) -> Result<DetectionResult> {
            thread::sleep(self.0);
            Ok(DetectionResult::default())
        }
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn supports(&self, capability: DetectionCapability) -> bool {
            capability == DetectionCapability::ObjectDetection
        }

        fn detect(&mut self, _: &RgbImage) -> Result<DetectionResult> {
            anyhow::bail!("inference error")
        }
    }

    /// Records the mode of every presented frame, in tick order.
    #[derive(Default)]
    struct ModeRecorder {
        modes: Mutex<Vec<Mode>>,
    }

    impl FrameSink for ModeRecorder {
        fn present(&self, frame: &Arc<AnnotatedFrame>) {
            self.modes.lock().unwrap().push(frame.mode);
        }
    }

    fn camera(detectors: Detectors, mode: Mode) -> CameraStream {
        camera_with(detectors, mode, |_| {})
    }

    fn camera_with(
        detectors: Detectors,
        mode: Mode,
        adjust: impl FnOnce(&mut StreamSettings),
    ) -> CameraStream {
        let mut settings = StreamSettings::new(SourceDescriptor::Synthetic("stub://w".into()));
        settings.mode = mode;
        settings.analysis_period = 1;
        adjust(&mut settings);
        CameraStream::new(0, settings, detectors, Arc::new(LabelMap::builtin())).unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn ticks_until_stopped_and_releases_once() {
        let opener = ScriptedOpener::new(Script::Endless);
        let mut worker = StreamWorker::new(
            camera(Detectors::default(), Mode::Original),
            opener.clone(),
            WorkerSettings::default(),
        );
        worker.start().unwrap();
        assert!(worker.is_running());

        let cam = worker.camera();
        assert!(wait_for(|| lock_recover(&cam).stats().ticks >= 3));

        worker.stop_and_wait(Duration::from_secs(5)).unwrap();
        assert!(!worker.is_running());
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();
        assert_eq!(opener.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn source_failure_reports_fault_and_ends_run() {
        let opener = ScriptedOpener::new(Script::FailAfter(3));
        let (tx, rx) = mpsc::sync_channel(16);
        let mut worker = StreamWorker::new(
            camera(Detectors::default(), Mode::Original),
            opener.clone(),
            WorkerSettings::default(),
        )
        .with_faults(tx);
        worker.start().unwrap();

        let fault = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            fault,
            Fault::Camera {
                camera: 0,
                error: PipelineError::SourceUnrecoverable { .. }
            }
        ));
        assert!(wait_for(|| !worker.is_running()));
        assert!(worker.source_lost());

        worker.stop_and_wait(Duration::from_secs(1)).unwrap();
        assert_eq!(opener.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persistent_misses_count_as_source_loss() {
        let opener = ScriptedOpener::new(Script::AlwaysMiss);
        let (tx, rx) = mpsc::sync_channel(16);
        let settings = WorkerSettings {
            max_consecutive_misses: 3,
            ..WorkerSettings::default()
        };
        let mut worker =
            StreamWorker::new(camera(Detectors::default(), Mode::Original), opener, settings)
                .with_faults(tx);
        worker.start().unwrap();
        let fault = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            fault,
            Fault::Camera {
                error: PipelineError::SourceUnrecoverable { .. },
                ..
            }
        ));
        worker.stop_and_wait(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn restart_reopens_the_source() {
        let opener = ScriptedOpener::new(Script::Endless);
        let mut worker = StreamWorker::new(
            camera(Detectors::default(), Mode::Original),
            opener.clone(),
            WorkerSettings::default(),
        );
        worker.start().unwrap();
        worker.start().unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();

        worker.start().unwrap();
        let cam = worker.camera();
        let before = lock_recover(&cam).stats().ticks;
        assert!(wait_for(|| lock_recover(&cam).stats().ticks > before));
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(opener.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn slow_detection_surfaces_shutdown_timeout() {
        let opener = ScriptedOpener::new(Script::Endless);
        let slow: crate::detect::SharedDetector =
            Arc::new(Mutex::new(SlowBackend(Duration::from_millis(400))));
        let detectors = Detectors {
            objects: Some(slow),
            motion: None,
        };
        let mut worker = StreamWorker::new(
            camera(detectors, Mode::DetectObjects),
            opener,
            WorkerSettings::default(),
        );
        worker.start().unwrap();
        // wait until the consumer is inside a detection call
        let cam = worker.camera();
        assert!(wait_for(|| cam.try_lock().is_err()));

        let err = worker.stop_and_wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::ShutdownTimeout { .. })
        ));
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn consumer_keeps_a_fixed_cadence_under_slow_ticks() {
        let opener = ScriptedOpener::new(Script::Endless);
        let slow: crate::detect::SharedDetector =
            Arc::new(Mutex::new(SlowBackend(Duration::from_millis(30))));
        let detectors = Detectors {
            objects: Some(slow),
            motion: None,
        };
        let stream = camera_with(detectors, Mode::DetectObjects, |settings| {
            settings.frame_period = Some(Duration::from_millis(40));
            settings.display_size = (16, 12);
        });
        let mut worker = StreamWorker::new(stream, opener, WorkerSettings::default());
        worker.start().unwrap();
        thread::sleep(Duration::from_secs(2));
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();

        // 50 ticks at a 40ms cadence; sleeping a full period after each 30ms
        // tick would give about 29
        let ticks = lock_recover(&worker.camera()).stats().ticks;
        assert!(ticks >= 40, "only {} ticks in 2s", ticks);
    }

    #[test]
    fn full_fault_queue_drops_instead_of_growing() {
        let opener = ScriptedOpener::new(Script::Endless);
        let (tx, rx) = mpsc::sync_channel(2);
        let detectors = Detectors {
            objects: Some(Arc::new(Mutex::new(FailingBackend))),
            motion: None,
        };
        let mut worker = StreamWorker::new(
            camera(detectors, Mode::DetectObjects),
            opener,
            WorkerSettings::default(),
        )
        .with_faults(tx);
        worker.start().unwrap();
        let cam = worker.camera();
        assert!(wait_for(|| lock_recover(&cam).stats().analysis_failures >= 6));
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();

        let queued: Vec<Fault> = rx.try_iter().collect();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|fault| matches!(
            fault,
            Fault::Camera {
                error: PipelineError::TransientFrame { .. },
                ..
            }
        )));
    }

    #[test]
    fn every_tick_sees_the_last_committed_mode() {
        let opener = ScriptedOpener::new(Script::Endless);
        let recorder = Arc::new(ModeRecorder::default());
        let sink: Arc<dyn FrameSink> = recorder.clone();
        let stream = camera_with(Detectors::default(), Mode::Original, |settings| {
            settings.frame_period = Some(Duration::from_millis(1));
            settings.display_size = (16, 12);
        });
        let mut worker =
            StreamWorker::new(stream, opener, WorkerSettings::default()).with_sink(sink);
        worker.start().unwrap();

        let cam = worker.camera();
        // (ticks completed when the mode was committed, mode)
        let mut commits = vec![(0u64, Mode::Original)];
        for i in 0..40 {
            let mode = if i % 2 == 0 {
                Mode::BorderEdit
            } else {
                Mode::Original
            };
            {
                let mut stream = lock_recover(&cam);
                stream.set_mode(mode).unwrap();
                commits.push((stream.stats().ticks, mode));
            }
            thread::sleep(Duration::from_millis(3));
        }
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();

        let modes = recorder.modes.lock().unwrap().clone();
        assert!(modes.len() > 20, "only {} frames presented", modes.len());
        for (i, mode) in modes.iter().enumerate() {
            let tick = i as u64 + 1;
            let expected = commits
                .iter()
                .rev()
                .find(|(ticks, _)| *ticks < tick)
                .map(|(_, mode)| *mode);
            assert_eq!(Some(*mode), expected, "tick {}", tick);
        }
    }

    #[test]
    fn mode_changes_go_through_the_camera_lock() {
        let opener = ScriptedOpener::new(Script::Endless);
        let mut worker = StreamWorker::new(
            camera(Detectors::default(), Mode::Original),
            opener,
            WorkerSettings::default(),
        );
        worker.start().unwrap();
        let cam = worker.camera();
        lock_recover(&cam).set_mode(Mode::BorderEdit).unwrap();
        assert!(wait_for(|| {
            lock_recover(&cam)
                .last_output()
                .is_some_and(|out| out.mode == Mode::BorderEdit)
        }));
        worker.stop_and_wait(Duration::from_secs(5)).unwrap();
    }
}
