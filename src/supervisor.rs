//! Pipeline Supervisor: owns every camera worker and the presence monitor.
//!
//! The supervisor is the only place that decides what happens to a failed
//! stream. Loops report [`Fault`]s on a channel; [`Supervisor::supervise`]
//! drains it, restarts cameras whose source was lost while the restart budget
//! lasts, and disables them afterwards. Control-surface calls are routed to
//! the owning camera under its worker lock.

use anyhow::Result;
use chrono::{DateTime, Local};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::camera::{AnnotatedFrame, CameraReconfig, CameraStream, Detectors, Mode};
use crate::config::{PipelineConfig, RestartPolicy};
use crate::detect::{BackendRegistry, ClassAllowList, DetectionCapability};
use crate::events::EventLog;
use crate::ingest::{SourceDescriptor, SourceOpener};
use crate::presence::{PresenceMonitor, PresenceState};
use crate::region::Point;
use crate::worker::StreamWorker;
use crate::{lock_recover, PipelineError};

/// Faults beyond this many undrained ones are dropped by the loops.
pub const FAULT_QUEUE_CAPACITY: usize = 256;

/// Display collaborator. Receives every annotated frame, outside the camera lock.
pub trait FrameSink: Send + Sync {
    fn present(&self, frame: &Arc<AnnotatedFrame>);
}

/// A failure reported by a background loop.
#[derive(Clone, Debug, PartialEq)]
pub enum Fault {
    Camera { camera: usize, error: PipelineError },
    Presence { error: PipelineError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraStatus {
    /// Never started.
    Idle,
    Running,
    Stopped,
    /// Restart budget exhausted; only an explicit `restart` revives it.
    Disabled,
}

/// Outcome of the single-button region workflow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BorderState {
    /// A new region is being drawn.
    Selecting,
    /// The drawn region was kept.
    Committed(String),
    /// The drawn region had too few points and was dropped.
    Discarded,
    /// All regions were removed.
    Cleared,
}

struct CameraSlot {
    worker: StreamWorker,
    status: CameraStatus,
    restarts: u32,
    started_at: Option<Instant>,
}

impl CameraSlot {
    fn mark_running(&mut self) {
        self.status = CameraStatus::Running;
        self.started_at = Some(Instant::now());
    }

    /// A source-loss report only applies to a run that actually lost its source.
    fn lost_source(&self) -> bool {
        self.worker.source_lost() || !self.worker.is_running()
    }
}

pub struct Supervisor {
    cameras: Vec<CameraSlot>,
    monitor: Option<PresenceMonitor>,
    faults_tx: SyncSender<Fault>,
    faults_rx: Receiver<Fault>,
    policy: RestartPolicy,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Build every camera stream and the presence monitor from `config`.
    ///
    /// The object backend is shared by all cameras and the monitor; motion
    /// backends are requested once per camera.
    pub fn new(
        config: &PipelineConfig,
        registry: &BackendRegistry,
        opener: Arc<dyn SourceOpener>,
        sink: Option<Arc<dyn FrameSink>>,
    ) -> Result<Self> {
        let labels = Arc::new(config.label_map()?);
        let objects = registry
            .backend_for_capability(DetectionCapability::ObjectDetection)
            .ok();
        if let Some(backend) = &objects {
            lock_recover(backend).warm_up()?;
        }
        let (faults_tx, faults_rx) = mpsc::sync_channel(FAULT_QUEUE_CAPACITY);

        let mut cameras = Vec::with_capacity(config.cameras.len());
        for index in 0..config.cameras.len() {
            let motion = registry
                .backend_for_capability(DetectionCapability::Motion)
                .ok();
            if let Some(backend) = &motion {
                lock_recover(backend).warm_up()?;
            }
            let detectors = Detectors {
                objects: objects.clone(),
                motion,
            };
            let stream = CameraStream::new(
                index,
                config.stream_settings(index)?,
                detectors,
                labels.clone(),
            )?;
            let mut worker = StreamWorker::new(stream, opener.clone(), config.worker_settings())
                .with_faults(faults_tx.clone());
            if let Some(sink) = &sink {
                worker = worker.with_sink(sink.clone());
            }
            cameras.push(CameraSlot {
                worker,
                status: CameraStatus::Idle,
                restarts: 0,
                started_at: None,
            });
        }

        let monitor = match &config.presence {
            Some(presence) => {
                let detector = objects.clone().ok_or_else(|| {
                    PipelineError::config("presence monitor needs an object detection backend")
                })?;
                let log = EventLog::with_texts(
                    &presence.log_path,
                    &presence.present_text,
                    &presence.absent_text,
                );
                let monitor = PresenceMonitor::new(
                    cameras.len(),
                    SourceDescriptor::parse(&presence.source)?,
                    opener,
                    detector,
                    log,
                    presence.settings(),
                )?
                .with_faults(faults_tx.clone());
                Some(monitor)
            }
            None => None,
        };

        log::info!(
            "supervisor: {} camera(s), presence monitor {}",
            cameras.len(),
            if monitor.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            cameras,
            monitor,
            faults_tx,
            faults_rx,
            policy: config.restart,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Start every camera that is not disabled, then the monitor.
    ///
    /// A source that fails to open does not stop the others; it is queued as a
    /// fault for `supervise`.
    pub fn start_all(&mut self) -> Result<()> {
        for slot in &mut self.cameras {
            if slot.status == CameraStatus::Disabled {
                continue;
            }
            match slot.worker.start() {
                Ok(()) => slot.mark_running(),
                Err(err) => {
                    log::error!("camera {}: start failed: {:#}", slot.worker.index(), err);
                    slot.status = CameraStatus::Stopped;
                    send_fault(
                        &self.faults_tx,
                        Fault::Camera {
                            camera: slot.worker.index(),
                            error: as_source_loss(slot.worker.index(), &err),
                        },
                    );
                }
            }
        }
        if let Some(monitor) = self.monitor.as_mut() {
            if let Err(err) = monitor.start() {
                log::error!("presence monitor: start failed: {:#}", err);
                send_fault(
                    &self.faults_tx,
                    Fault::Presence {
                        error: as_source_loss(self.cameras.len(), &err),
                    },
                );
            }
        }
        Ok(())
    }

    /// Stop and wait for every camera, then the monitor.
    ///
    /// Every component is asked to stop even if an earlier one timed out; the
    /// first timeout is returned.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for slot in &mut self.cameras {
            match slot.worker.stop_and_wait(self.shutdown_timeout) {
                Ok(()) => {
                    if slot.status == CameraStatus::Running {
                        slot.status = CameraStatus::Stopped;
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(monitor) = self.monitor.as_mut() {
            if let Err(err) = monitor.stop_and_wait(self.shutdown_timeout) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop one camera, optionally reconfigure it, and start it again.
    ///
    /// Siblings are untouched. A rejected reconfiguration leaves the camera
    /// stopped with its previous settings.
    pub fn restart(&mut self, camera: usize, reconfig: Option<CameraReconfig>) -> Result<()> {
        let timeout = self.shutdown_timeout;
        let slot = self.slot_mut(camera)?;
        slot.worker.stop_and_wait(timeout)?;
        slot.status = CameraStatus::Stopped;
        if let Some(reconfig) = reconfig {
            lock_recover(&slot.worker.camera()).reconfigure(reconfig)?;
        }
        slot.worker.start()?;
        slot.mark_running();
        slot.restarts = 0;
        log::info!("camera {}: restarted", camera);
        Ok(())
    }

    /// Drain pending faults and apply the restart policy. Returns what was drained.
    ///
    /// A source-loss fault from an earlier run of a camera that has since been
    /// restarted is ignored. Running cameras whose source was lost are handled
    /// even if their fault was dropped from a full queue.
    pub fn supervise(&mut self) -> Vec<Fault> {
        let faults: Vec<Fault> = self.faults_rx.try_iter().collect();
        for fault in &faults {
            match fault {
                Fault::Camera {
                    camera,
                    error: PipelineError::SourceUnrecoverable { reason, .. },
                } => {
                    log::warn!("camera {}: source lost: {}", camera, reason);
                    self.handle_source_loss(*camera);
                }
                Fault::Camera { camera, error } => {
                    log::debug!("camera {}: {}", camera, error);
                }
                Fault::Presence { error } => {
                    log::error!("presence monitor stopped: {}", error);
                    if let Some(monitor) = self.monitor.as_mut() {
                        if let Err(err) = monitor.stop_and_wait(self.shutdown_timeout) {
                            log::error!("presence monitor: {:#}", err);
                        }
                    }
                }
            }
        }
        for camera in 0..self.cameras.len() {
            let slot = &self.cameras[camera];
            let unreported = slot.status == CameraStatus::Running
                && slot.worker.source_lost()
                && !slot.worker.is_running();
            if unreported {
                log::warn!("camera {}: source lost without a queued fault", camera);
                self.handle_source_loss(camera);
            }
        }
        faults
    }

    fn handle_source_loss(&mut self, camera: usize) {
        let policy = self.policy;
        let timeout = self.shutdown_timeout;
        let Some(slot) = self.cameras.get_mut(camera) else {
            return;
        };
        if slot.status == CameraStatus::Disabled {
            return;
        }
        if !slot.lost_source() {
            log::debug!("camera {}: ignoring source loss of an earlier run", camera);
            return;
        }
        if slot
            .started_at
            .is_some_and(|started| started.elapsed() >= policy.healthy_after)
        {
            slot.restarts = 0;
        }
        if !policy.on_source_loss || slot.restarts >= policy.max_attempts {
            if let Err(err) = slot.worker.stop_and_wait(timeout) {
                log::error!("camera {}: {:#}", camera, err);
            }
            slot.status = CameraStatus::Disabled;
            log::error!(
                "camera {}: disabled after {} restart attempt(s)",
                camera,
                slot.restarts
            );
            return;
        }

        slot.restarts += 1;
        log::warn!(
            "camera {}: restarting (attempt {}/{})",
            camera,
            slot.restarts,
            policy.max_attempts
        );
        let restarted = slot
            .worker
            .stop_and_wait(timeout)
            .and_then(|()| slot.worker.start());
        match restarted {
            Ok(()) => slot.mark_running(),
            Err(err) => {
                log::error!("camera {}: restart failed: {:#}", camera, err);
                slot.status = CameraStatus::Stopped;
                send_fault(
                    &self.faults_tx,
                    Fault::Camera {
                        camera,
                        error: as_source_loss(camera, &err),
                    },
                );
            }
        }
    }

    // -------------------- control surface --------------------

    pub fn set_mode(&self, camera: usize, mode: Mode) -> Result<()> {
        self.with_camera(camera, |stream| stream.set_mode(mode))
    }

    pub fn set_class_allow_list(&self, camera: usize, allow_list: ClassAllowList) -> Result<()> {
        self.with_camera(camera, |stream| stream.set_class_allow_list(allow_list))
    }

    pub fn set_confidence(&self, camera: usize, confidence: f32) -> Result<()> {
        self.with_camera(camera, |stream| stream.set_confidence(confidence))
    }

    pub fn start_selecting_region(&self, camera: usize, name: Option<&str>) -> Result<()> {
        self.with_camera(camera, |stream| stream.start_selecting_region(name))
    }

    pub fn add_region_point(&self, camera: usize, point: Point) -> Result<()> {
        self.with_camera(camera, |stream| stream.add_region_point(point))
    }

    /// Name of the committed region, or `None` if the selection was dropped.
    pub fn end_selecting_region(&self, camera: usize) -> Result<Option<String>> {
        self.with_camera(camera, |stream| Ok(stream.end_selecting_region()))
    }

    pub fn clear_regions(&self, camera: usize) -> Result<()> {
        self.with_camera(camera, |stream| {
            stream.clear_regions();
            Ok(())
        })
    }

    /// Selecting: commit. Regions present: clear. Otherwise: start selecting.
    pub fn toggle_borders(&self, camera: usize) -> Result<BorderState> {
        self.with_camera(camera, |stream| {
            if stream.regions().is_selecting() {
                return Ok(match stream.end_selecting_region() {
                    Some(name) => BorderState::Committed(name),
                    None => BorderState::Discarded,
                });
            }
            if stream.regions().has_regions() {
                stream.clear_regions();
                return Ok(BorderState::Cleared);
            }
            stream.start_selecting_region(None)?;
            Ok(BorderState::Selecting)
        })
    }

    pub fn set_display_size(&self, camera: usize, width: u32, height: u32) -> Result<()> {
        self.with_camera(camera, |stream| {
            stream.set_display_size(width, height);
            Ok(())
        })
    }

    pub fn set_playing(&self, camera: usize, playing: bool) -> Result<()> {
        self.with_camera(camera, |stream| {
            if playing {
                stream.play();
            } else {
                stream.pause();
            }
            Ok(())
        })
    }

    /// Latest annotated frame of a camera.
    pub fn snapshot(&self, camera: usize) -> Result<Option<Arc<AnnotatedFrame>>> {
        self.with_camera(camera, |stream| Ok(stream.last_output()))
    }

    pub fn camera_status(&self, camera: usize) -> Result<CameraStatus> {
        let slot = self.slot(camera)?;
        if slot.status == CameraStatus::Running && !slot.worker.is_running() {
            return Ok(CameraStatus::Stopped);
        }
        Ok(slot.status)
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    /// State of the last completed presence cycle, if a monitor is configured.
    pub fn presence_state(&self) -> Option<PresenceState> {
        self.monitor.as_ref().map(PresenceMonitor::state)
    }

    /// When the presence state last changed, if it ever did.
    pub fn presence_last_transition(&self) -> Option<DateTime<Local>> {
        self.monitor.as_ref().and_then(PresenceMonitor::last_transition)
    }

    /// Shared handle to a camera stream, for embedding applications.
    pub fn camera(&self, camera: usize) -> Result<Arc<Mutex<CameraStream>>> {
        Ok(self.slot(camera)?.worker.camera())
    }

    fn slot(&self, camera: usize) -> Result<&CameraSlot> {
        self.cameras
            .get(camera)
            .ok_or_else(|| PipelineError::config(format!("no camera {}", camera)).into())
    }

    fn slot_mut(&mut self, camera: usize) -> Result<&mut CameraSlot> {
        self.cameras
            .get_mut(camera)
            .ok_or_else(|| PipelineError::config(format!("no camera {}", camera)).into())
    }

    /// Run `f` under the camera's worker lock.
    fn with_camera<R>(
        &self,
        camera: usize,
        f: impl FnOnce(&mut CameraStream) -> Result<R>,
    ) -> Result<R> {
        let handle = self.slot(camera)?.worker.camera();
        let mut stream = lock_recover(&handle);
        f(&mut stream)
    }
}

/// Queue a fault without blocking. A full queue drops it.
pub(crate) fn send_fault(tx: &SyncSender<Fault>, fault: Fault) {
    match tx.try_send(fault) {
        Ok(()) => {}
        Err(TrySendError::Full(fault)) => log::debug!("fault queue full, dropped {:?}", fault),
        // receiver gone means the supervisor is shutting down
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn as_source_loss(camera: usize, err: &anyhow::Error) -> PipelineError {
    match crate::pipeline_error(err) {
        Some(error @ PipelineError::SourceUnrecoverable { .. }) => error.clone(),
        _ => PipelineError::SourceUnrecoverable {
            camera,
            reason: format!("{:#}", err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::ingest::DefaultOpener;

    fn supervisor() -> Supervisor {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        Supervisor::new(
            &PipelineConfig::default(),
            &registry,
            Arc::new(DefaultOpener),
            None,
        )
        .unwrap()
    }

    #[test]
    fn lost_camera_is_restarted_when_its_fault_was_dropped() {
        let mut config = PipelineConfig::default();
        config.cameras[0].source = "stub://flaky?fps=0&width=16&height=12&frames=3".to_string();
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        let mut sup = Supervisor::new(&config, &registry, Arc::new(DefaultOpener), None).unwrap();
        sup.start_all().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.cameras[0].worker.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        // lose the queued report
        assert_eq!(sup.faults_rx.try_iter().count(), 1);

        assert!(sup.supervise().is_empty());
        assert_eq!(sup.cameras[0].restarts, 1);
        sup.stop_all().unwrap();
    }

    #[test]
    fn set_confidence_is_validated() {
        let sup = supervisor();
        sup.set_confidence(0, 0.4).unwrap();
        assert!(sup.set_confidence(0, 1.5).is_err());
        assert!(sup.set_confidence(3, 0.4).is_err());
    }

    #[test]
    fn toggle_borders_walks_the_region_workflow() {
        let sup = supervisor();
        assert_eq!(sup.toggle_borders(0).unwrap(), BorderState::Selecting);
        for (x, y) in [(0.0, 0.0), (40.0, 0.0), (40.0, 40.0)] {
            sup.add_region_point(0, Point::new(x, y)).unwrap();
        }
        assert_eq!(
            sup.toggle_borders(0).unwrap(),
            BorderState::Committed("zone:region_1".to_string())
        );
        assert_eq!(sup.toggle_borders(0).unwrap(), BorderState::Cleared);
        assert_eq!(sup.toggle_borders(0).unwrap(), BorderState::Selecting);
        assert_eq!(sup.toggle_borders(0).unwrap(), BorderState::Discarded);
    }

    #[test]
    fn unknown_camera_is_a_configuration_error() {
        let sup = supervisor();
        let err = sup.set_mode(7, Mode::Original).unwrap_err();
        assert!(matches!(
            crate::pipeline_error(&err),
            Some(PipelineError::Configuration(_))
        ));
        assert!(sup.camera_status(7).is_err());
    }

    #[test]
    fn rejected_mode_leaves_camera_untouched() {
        let sup = supervisor();
        assert!(sup.set_mode(0, Mode::DetectMotion).is_err());
        sup.set_mode(0, Mode::DetectObjects).unwrap();
        let camera = sup.camera(0).unwrap();
        assert_eq!(lock_recover(&camera).mode(), Mode::DetectObjects);
        assert_eq!(sup.camera_status(0).unwrap(), CameraStatus::Idle);
    }
}
