//! Presence Monitor: debounced person detection on a dedicated source.
//!
//! Each cycle drains the source for the check interval, then runs a burst of up
//! to `burst_size` single-frame detections restricted to one class. Any hit
//! makes the cycle PRESENT and ends the burst early. The event log only gets a
//! line when the cycle state differs from the previous one.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::detect::{ClassAllowList, SharedDetector, PERSON_CLASS_ID};
use crate::events::EventLog;
use crate::ingest::{OwnedSource, SourceDescriptor, SourceOpener};
use crate::signal::{CancelToken, ExitGuard, ExitLatch};
use crate::supervisor::{send_fault, Fault};
use crate::{lock_recover, PipelineError};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_BURST_SIZE: u32 = 5;
pub const DEFAULT_PRESENCE_CONFIDENCE: f32 = 0.5;

const MISS_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Absent,
    Present,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceState::Absent => f.write_str("absent"),
            PresenceState::Present => f.write_str("present"),
        }
    }
}

impl std::str::FromStr for PresenceState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "absent" => Ok(PresenceState::Absent),
            "present" => Ok(PresenceState::Present),
            other => {
                Err(PipelineError::config(format!("unknown presence state '{}'", other)).into())
            }
        }
    }
}

/// Remembers the previous cycle's state and when it last changed. Starts ABSENT.
#[derive(Clone, Copy, Debug, Default)]
pub struct PresenceTracker {
    previous: PresenceState,
    last_transition: Option<DateTime<Local>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this cycle's state; returns it when it differs from the last one.
    pub fn observe(&mut self, current: PresenceState) -> Option<PresenceState> {
        self.observe_at(current, Local::now())
    }

    /// `observe` with an explicit cycle time, stamped on a transition.
    pub fn observe_at(
        &mut self,
        current: PresenceState,
        at: DateTime<Local>,
    ) -> Option<PresenceState> {
        let changed = current != self.previous;
        self.previous = current;
        if changed {
            self.last_transition = Some(at);
        }
        changed.then_some(current)
    }

    pub fn state(&self) -> PresenceState {
        self.previous
    }

    pub fn last_transition(&self) -> Option<DateTime<Local>> {
        self.last_transition
    }
}

#[derive(Clone, Debug)]
pub struct PresenceSettings {
    pub check_interval: Duration,
    pub burst_size: u32,
    pub class_id: u32,
    pub confidence: f32,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            burst_size: DEFAULT_BURST_SIZE,
            class_id: PERSON_CLASS_ID,
            confidence: DEFAULT_PRESENCE_CONFIDENCE,
        }
    }
}

struct MonitorRun {
    cancel: CancelToken,
    latch: ExitLatch,
    thread: Option<JoinHandle<()>>,
}

pub struct PresenceMonitor {
    camera: usize,
    source: SourceDescriptor,
    opener: Arc<dyn SourceOpener>,
    detector: SharedDetector,
    log: EventLog,
    settings: PresenceSettings,
    tracker: Arc<Mutex<PresenceTracker>>,
    faults: Option<SyncSender<Fault>>,
    run: Option<MonitorRun>,
}

impl PresenceMonitor {
    /// `camera` is the index used in error reports for the security source.
    pub fn new(
        camera: usize,
        source: SourceDescriptor,
        opener: Arc<dyn SourceOpener>,
        detector: SharedDetector,
        log: EventLog,
        settings: PresenceSettings,
    ) -> Result<Self> {
        if settings.burst_size == 0 {
            return Err(PipelineError::config("presence burst size must be at least 1").into());
        }
        Ok(Self {
            camera,
            source,
            opener,
            detector,
            log,
            settings,
            tracker: Arc::new(Mutex::new(PresenceTracker::new())),
            faults: None,
            run: None,
        })
    }

    pub fn with_faults(mut self, faults: SyncSender<Fault>) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn start(&mut self) -> Result<()> {
        if self.run.is_some() {
            return Ok(());
        }
        let source = self.opener.open(&self.source).map_err(|err| {
            anyhow::Error::new(PipelineError::SourceUnrecoverable {
                camera: self.camera,
                reason: format!("open {}: {:#}", self.source, err),
            })
        })?;

        let cancel = CancelToken::new();
        let latch = ExitLatch::new();
        let monitor = MonitorLoop {
            camera: self.camera,
            source: OwnedSource(source),
            detector: self.detector.clone(),
            allow: ClassAllowList::new([self.settings.class_id]),
            settings: self.settings.clone(),
            tracker: self.tracker.clone(),
            log: self.log.clone(),
            cancel: cancel.clone(),
            faults: self.faults.clone(),
            _exit: latch.enter(),
        };
        let thread = thread::Builder::new()
            .name("watchpost-presence".to_string())
            .spawn(move || monitor.run())
            .context("spawn presence monitor thread")?;

        log::info!(
            "presence monitor started on {} (every {}s, burst {})",
            self.source,
            self.settings.check_interval.as_secs_f32(),
            self.settings.burst_size
        );
        self.run = Some(MonitorRun {
            cancel,
            latch,
            thread: Some(thread),
        });
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(run) = &self.run {
            run.cancel.cancel();
        }
    }

    /// Same contract as the stream worker: idempotent, errors on timeout.
    pub fn stop_and_wait(&mut self, timeout: Duration) -> Result<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        run.cancel.cancel();
        if !run.latch.wait(timeout) {
            log::error!(
                "presence monitor did not stop within {}ms",
                timeout.as_millis()
            );
            return Err(PipelineError::ShutdownTimeout {
                component: "presence monitor".to_string(),
                waited: timeout,
            }
            .into());
        }
        if let Some(handle) = run.thread.take() {
            if handle.join().is_err() {
                log::error!("presence monitor thread panicked");
            }
        }
        self.run = None;
        log::info!("presence monitor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| run.latch.live() > 0)
    }

    /// State decided by the most recent completed cycle.
    pub fn state(&self) -> PresenceState {
        lock_recover(&self.tracker).state()
    }

    /// Time of the cycle that last changed the state.
    pub fn last_transition(&self) -> Option<DateTime<Local>> {
        lock_recover(&self.tracker).last_transition()
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MonitorLoop {
    camera: usize,
    source: OwnedSource,
    detector: SharedDetector,
    allow: ClassAllowList,
    settings: PresenceSettings,
    tracker: Arc<Mutex<PresenceTracker>>,
    log: EventLog,
    cancel: CancelToken,
    faults: Option<SyncSender<Fault>>,
    _exit: ExitGuard,
}

impl MonitorLoop {
    fn run(mut self) {
        loop {
            match self.cycle() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    log::error!("presence monitor: source lost: {:#}", err);
                    if let Some(tx) = &self.faults {
                        send_fault(
                            tx,
                            Fault::Presence {
                                error: PipelineError::SourceUnrecoverable {
                                    camera: self.camera,
                                    reason: format!("{:#}", err),
                                },
                            },
                        );
                    }
                    break;
                }
            }
        }
        log::debug!("presence monitor exiting ({})", self.source.0.describe());
    }

    /// One full cycle. `Ok(false)` when cancelled.
    fn cycle(&mut self) -> Result<bool> {
        if !self.drain()? {
            return Ok(false);
        }
        let Some(current) = self.burst()? else {
            return Ok(false);
        };
        let now = Local::now();
        let changed = lock_recover(&self.tracker).observe_at(current, now);
        if let Some(state) = changed {
            log::info!("presence: {}", state);
            if let Err(err) = self.log.append_at(state, now) {
                log::error!("presence: event log write failed: {:#}", err);
            }
        }
        Ok(true)
    }

    /// Read and discard frames for the check interval. `Ok(false)` when cancelled.
    fn drain(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.settings.check_interval;
        while Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            if self.source.0.read()?.is_none() && self.cancel.sleep(MISS_BACKOFF) {
                return Ok(false);
            }
        }
        Ok(!self.cancel.is_cancelled())
    }

    /// Up to `burst_size` detections; stops at the first frame with a hit.
    /// `Ok(None)` when cancelled mid-burst.
    fn burst(&mut self) -> Result<Option<PresenceState>> {
        for attempt in 0..self.settings.burst_size {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let Some(frame) = self.source.0.read()? else {
                log::debug!("presence: burst read {} missed", attempt + 1);
                continue;
            };
            let result = lock_recover(&self.detector).detect(&frame.image);
            match result {
                Ok(result) => {
                    if !result
                        .filtered(self.settings.confidence, &self.allow)
                        .is_empty()
                    {
                        return Ok(Some(PresenceState::Present));
                    }
                }
                Err(err) => {
                    log::warn!("presence: detection {} failed: {:#}", attempt + 1, err);
                }
            }
        }
        Ok(Some(PresenceState::Absent))
    }
}
