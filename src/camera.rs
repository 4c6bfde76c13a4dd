//! Per-camera processing state and the tick step.
//!
//! A tick resizes the newest raw frame to the display size, advances the
//! sampling counter, runs the mode's detector when the counter wraps to zero,
//! and redraws the cached overlay onto the fresh frame. All mutation happens
//! through `&mut self`; the owning worker serialises ticks and control calls
//! behind one mutex.

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{ClassAllowList, Detection, DetectionResult, LabelMap, SharedDetector};
use crate::frame::{fit_within, resize, Frame};
use crate::ingest::SourceDescriptor;
use crate::region::{Point, Region, RegionSet};
use crate::render::{self, Annotation, ColorPolicy, Overlay, Palette};
use crate::{lock_recover, PipelineError};

/// Analysis reruns on every `DEFAULT_ANALYSIS_PERIOD`-th tick.
pub const DEFAULT_ANALYSIS_PERIOD: u32 = 5;
pub const DEFAULT_CONFIDENCE: f32 = 0.7;
pub const DEFAULT_DISPLAY_SIZE: (u32, u32) = (640, 480);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Original,
    DetectObjects,
    DetectMotion,
    BorderEdit,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::Original,
        Mode::DetectObjects,
        Mode::DetectMotion,
        Mode::BorderEdit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Original => "original",
            Mode::DetectObjects => "detect_objects",
            Mode::DetectMotion => "detect_motion",
            Mode::BorderEdit => "border_edit",
        }
    }

    /// Position in mode selector order.
    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| PipelineError::config(format!("unknown mode index {}", index)).into())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| PipelineError::config(format!("unknown mode '{}'", s)).into())
    }
}

/// Detector handles a stream may use. Motion handles must not be shared
/// between streams.
#[derive(Clone, Default)]
pub struct Detectors {
    pub objects: Option<SharedDetector>,
    pub motion: Option<SharedDetector>,
}

/// Static settings for a camera stream.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub source: SourceDescriptor,
    pub mode: Mode,
    pub allow_list: ClassAllowList,
    pub confidence: f32,
    pub analysis_period: u32,
    pub display_size: (u32, u32),
    /// Fixed consumer period; derived from the source frame rate when unset.
    pub frame_period: Option<Duration>,
    pub regions: Vec<Region>,
    pub palette: Palette,
}

impl StreamSettings {
    pub fn new(source: SourceDescriptor) -> Self {
        Self {
            source,
            mode: Mode::Original,
            allow_list: ClassAllowList::default(),
            confidence: DEFAULT_CONFIDENCE,
            analysis_period: DEFAULT_ANALYSIS_PERIOD,
            display_size: DEFAULT_DISPLAY_SIZE,
            frame_period: None,
            regions: Vec::new(),
            palette: Palette::default(),
        }
    }
}

/// Changes applied to a stream while its worker is stopped.
#[derive(Clone, Debug, Default)]
pub struct CameraReconfig {
    pub source: Option<SourceDescriptor>,
    pub mode: Option<Mode>,
    pub allow_list: Option<ClassAllowList>,
}

/// Fully drawn output of one tick.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub camera: usize,
    /// Sequence number of the source frame this was drawn from.
    pub seq: u64,
    pub mode: Mode,
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
}

/// Per-tick counters, for health logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub ticks: u64,
    pub analyses: u64,
    pub analysis_failures: u64,
}

pub struct CameraStream {
    index: usize,
    source: SourceDescriptor,
    mode: Mode,
    playing: bool,
    period: u32,
    counter: u32,
    display_size: (u32, u32),
    frame_period: Option<Duration>,
    confidence: f32,
    allow_list: ClassAllowList,
    labels: Arc<LabelMap>,
    detectors: Detectors,
    regions: RegionSet,
    overlay: Overlay,
    palette: Palette,
    last_output: Option<Arc<AnnotatedFrame>>,
    stats: StreamStats,
}

impl CameraStream {
    /// Build a stream. The sampling counter starts at `index mod period`, so
    /// cameras do not all analyse on the same tick.
    pub fn new(
        index: usize,
        settings: StreamSettings,
        detectors: Detectors,
        labels: Arc<LabelMap>,
    ) -> Result<Self> {
        if settings.analysis_period == 0 {
            return Err(PipelineError::config("analysis period must be at least 1").into());
        }
        validate_confidence(settings.confidence)?;
        settings.allow_list.validate(&labels)?;
        check_backend(settings.mode, &detectors)?;

        let mut regions = RegionSet::new();
        for region in settings.regions {
            regions.insert(region);
        }

        Ok(Self {
            index,
            source: settings.source,
            mode: settings.mode,
            playing: true,
            period: settings.analysis_period,
            counter: (index as u32) % settings.analysis_period,
            display_size: settings.display_size,
            frame_period: settings.frame_period,
            confidence: settings.confidence,
            allow_list: settings.allow_list,
            labels,
            detectors,
            regions,
            overlay: Overlay::NoOp,
            palette: settings.palette,
            last_output: None,
            stats: StreamStats::default(),
        })
    }

    /// Process one raw frame.
    ///
    /// Returns `Ok(None)` when paused or hidden. An analysis failure abandons
    /// the tick and keeps the previous overlay for later ticks.
    pub fn tick(&mut self, raw: &Frame) -> Result<Option<Arc<AnnotatedFrame>>> {
        if !self.playing {
            return Ok(None);
        }
        let (box_w, box_h) = self.display_size;
        let Some((w, h)) = fit_within(raw.width(), raw.height(), box_w, box_h) else {
            return Ok(None);
        };

        let mut image = resize(&raw.image, w, h);
        self.stats.ticks += 1;
        self.counter = (self.counter + 1) % self.period;

        if self.counter == 0 {
            self.overlay = match self.analyze(&image) {
                Ok(overlay) => overlay,
                Err(err) => {
                    self.stats.analysis_failures += 1;
                    return Err(PipelineError::TransientFrame {
                        camera: self.index,
                        reason: format!("{:#}", err),
                    }
                    .into());
                }
            };
        }

        let annotations = if self.mode == Mode::BorderEdit {
            render::render_region_editor(&mut image, &self.regions, &self.palette);
            Vec::new()
        } else {
            render::render(
                &mut image,
                &self.overlay,
                &self.regions,
                &self.palette,
                &self.labels,
            )
        };

        let output = Arc::new(AnnotatedFrame {
            camera: self.index,
            seq: raw.seq,
            mode: self.mode,
            image,
            annotations,
        });
        self.last_output = Some(output.clone());
        Ok(Some(output))
    }

    fn analyze(&mut self, image: &RgbImage) -> Result<Overlay> {
        match self.mode {
            Mode::DetectObjects => {
                let backend = self
                    .detectors
                    .objects
                    .as_ref()
                    .ok_or_else(|| anyhow!("no object detector attached"))?;
                let result = lock_recover(backend).detect(image)?;
                self.stats.analyses += 1;
                let result = result.filtered(self.confidence, &self.allow_list);
                Ok(Overlay::DrawDetections {
                    detections: self.with_labels(result),
                    policy: ColorPolicy::ByClass,
                })
            }
            Mode::DetectMotion => {
                let backend = self
                    .detectors
                    .motion
                    .as_ref()
                    .ok_or_else(|| anyhow!("no motion detector attached"))?;
                let result = lock_recover(backend).detect(image)?;
                self.stats.analyses += 1;
                Ok(Overlay::DrawDetections {
                    detections: result.detections,
                    policy: ColorPolicy::Motion,
                })
            }
            Mode::Original | Mode::BorderEdit => Ok(Overlay::NoOp),
        }
    }

    fn with_labels(&self, result: DetectionResult) -> Vec<Detection> {
        result
            .detections
            .into_iter()
            .map(|mut d| {
                if d.label.is_none() {
                    d.label = d
                        .class_id
                        .and_then(|id| self.labels.label(id))
                        .map(str::to_string);
                }
                d
            })
            .collect()
    }

    // -------------------- control surface --------------------

    /// Switch mode. Takes effect on the next tick; the cached overlay is dropped
    /// so boxes from a different detector are never redrawn.
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        check_backend(mode, &self.detectors)?;
        if mode != self.mode {
            log::info!("camera {}: mode {} -> {}", self.index, self.mode, mode);
            self.mode = mode;
            self.overlay = Overlay::NoOp;
        }
        Ok(())
    }

    pub fn set_class_allow_list(&mut self, allow_list: ClassAllowList) -> Result<()> {
        allow_list.validate(&self.labels)?;
        log::info!(
            "camera {}: class allow-list {:?}",
            self.index,
            allow_list.ids()
        );
        self.allow_list = allow_list;
        Ok(())
    }

    pub fn set_confidence(&mut self, confidence: f32) -> Result<()> {
        validate_confidence(confidence)?;
        self.confidence = confidence;
        Ok(())
    }

    /// Display box the frame is fitted into. A zero size hides the stream.
    pub fn set_display_size(&mut self, width: u32, height: u32) {
        self.display_size = (width, height);
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn start_selecting_region(&mut self, name: Option<&str>) -> Result<()> {
        self.regions.start_selecting(name)
    }

    pub fn add_region_point(&mut self, point: Point) -> Result<()> {
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(PipelineError::config("region point must be finite").into());
        }
        self.regions.add_point(point);
        Ok(())
    }

    /// Commit the in-progress region; returns its name when it was kept.
    pub fn end_selecting_region(&mut self) -> Option<String> {
        let committed = self.regions.end_selecting().map(|r| r.name().to_string());
        if let Some(name) = &committed {
            log::info!("camera {}: region {} committed", self.index, name);
        }
        committed
    }

    pub fn clear_regions(&mut self) {
        self.regions.clear();
        log::info!("camera {}: regions cleared", self.index);
    }

    /// Swap detector handles, e.g. after a restart with a new backend.
    pub fn set_detectors(&mut self, detectors: Detectors) -> Result<()> {
        check_backend(self.mode, &detectors)?;
        self.detectors = detectors;
        self.overlay = Overlay::NoOp;
        Ok(())
    }

    /// Apply every field of `reconfig` or none of them.
    pub fn reconfigure(&mut self, reconfig: CameraReconfig) -> Result<()> {
        if let Some(mode) = reconfig.mode {
            check_backend(mode, &self.detectors)?;
        }
        if let Some(allow_list) = &reconfig.allow_list {
            allow_list.validate(&self.labels)?;
        }
        if let Some(source) = reconfig.source {
            log::info!("camera {}: source {} -> {}", self.index, self.source, source);
            self.source = source;
        }
        if let Some(allow_list) = reconfig.allow_list {
            self.allow_list = allow_list;
        }
        if let Some(mode) = reconfig.mode {
            self.set_mode(mode)?;
        }
        Ok(())
    }

    // -------------------- accessors --------------------

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn frame_period(&self) -> Option<Duration> {
        self.frame_period
    }

    pub fn allow_list(&self) -> &ClassAllowList {
        &self.allow_list
    }

    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn last_output(&self) -> Option<Arc<AnnotatedFrame>> {
        self.last_output.clone()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }
}

fn validate_confidence(confidence: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(PipelineError::config(format!(
            "confidence {} must be within 0..=1",
            confidence
        ))
        .into());
    }
    Ok(())
}

fn check_backend(mode: Mode, detectors: &Detectors) -> Result<()> {
    let missing = match mode {
        Mode::DetectObjects => detectors.objects.is_none(),
        Mode::DetectMotion => detectors.motion.is_none(),
        Mode::Original | Mode::BorderEdit => false,
    };
    if missing {
        return Err(PipelineError::config(format!("mode {} has no detector backend", mode)).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, StubBackend};
    use crate::pipeline_error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::new(64, 48), seq)
    }

    fn stream_with(
        index: usize,
        mode: Mode,
        backend: StubBackend,
    ) -> (CameraStream, Arc<AtomicUsize>) {
        let calls = backend.calls();
        let shared: SharedDetector = Arc::new(Mutex::new(backend));
        let detectors = Detectors {
            objects: Some(shared),
            motion: None,
        };
        let mut settings = StreamSettings::new(SourceDescriptor::Synthetic("stub://t".into()));
        settings.mode = mode;
        settings.display_size = (64, 48);
        let stream =
            CameraStream::new(index, settings, detectors, Arc::new(LabelMap::builtin())).unwrap();
        (stream, calls)
    }

    fn person_at(x: f32, score: f32) -> Detection {
        Detection::classified(BoundingBox::new(x, 5.0, x + 10.0, 20.0), 1, "person", score)
    }

    #[test]
    fn analysis_runs_once_per_period() {
        let (mut stream, calls) = stream_with(0, Mode::DetectObjects, StubBackend::new());
        let mut analysed_on = Vec::new();
        for i in 0..12 {
            let before = calls.load(Ordering::SeqCst);
            stream.tick(&frame(i)).unwrap();
            if calls.load(Ordering::SeqCst) > before {
                analysed_on.push(i);
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(analysed_on, vec![4, 9]);
    }

    #[test]
    fn counters_are_staggered_by_camera_index() {
        let (mut stream, calls) = stream_with(2, Mode::DetectObjects, StubBackend::new());
        assert_eq!(stream.counter(), 2);
        stream.tick(&frame(1)).unwrap();
        stream.tick(&frame(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        stream.tick(&frame(3)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_overlay_is_redrawn_between_analyses() {
        let mut backend = StubBackend::new();
        backend.push_result(DetectionResult::new(vec![person_at(2.0, 0.9)]));
        let (mut stream, _) = stream_with(0, Mode::DetectObjects, backend);

        for i in 0..4 {
            let out = stream.tick(&frame(i)).unwrap().unwrap();
            assert!(out.annotations.is_empty());
        }
        for i in 4..9 {
            let out = stream.tick(&frame(i)).unwrap().unwrap();
            assert_eq!(out.annotations.len(), 1, "tick {}", i);
            assert_eq!(out.seq, i, "drawn on the current frame");
        }
        // second analysis returns nothing and replaces the cache
        let out = stream.tick(&frame(9)).unwrap().unwrap();
        assert!(out.annotations.is_empty());
    }

    #[test]
    fn results_are_filtered_by_confidence_and_allow_list() {
        let mut backend = StubBackend::new();
        backend.push_result(DetectionResult::new(vec![
            person_at(0.0, 0.9),
            person_at(20.0, 0.5),
            Detection {
                bbox: BoundingBox::new(30.0, 5.0, 40.0, 20.0),
                class_id: Some(3),
                label: None,
                score: Some(0.95),
            },
        ]));
        let (mut stream, _) = stream_with(0, Mode::DetectObjects, backend);
        for i in 0..5 {
            stream.tick(&frame(i)).unwrap();
        }
        assert_eq!(stream.overlay().detections().len(), 1);

        stream
            .set_class_allow_list(ClassAllowList::vehicles())
            .unwrap();
        let mut backend_result = StubBackend::new();
        backend_result.push_result(DetectionResult::new(vec![Detection {
            bbox: BoundingBox::new(30.0, 5.0, 40.0, 20.0),
            class_id: Some(3),
            label: None,
            score: Some(0.95),
        }]));
        stream
            .set_detectors(Detectors {
                objects: Some(Arc::new(Mutex::new(backend_result))),
                motion: None,
            })
            .unwrap();
        for i in 5..10 {
            stream.tick(&frame(i)).unwrap();
        }
        let detections = stream.overlay().detections();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label.as_deref(), Some("car"));
    }

    #[test]
    fn analysis_failure_keeps_previous_overlay() {
        let mut backend = StubBackend::new();
        backend.push_result(DetectionResult::new(vec![person_at(2.0, 0.9)]));
        backend.push_failure("inference crashed");
        let (mut stream, _) = stream_with(0, Mode::DetectObjects, backend);
        for i in 0..9 {
            stream.tick(&frame(i)).unwrap();
        }
        let err = stream.tick(&frame(9)).unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::TransientFrame { camera: 0, .. })
        ));
        assert_eq!(stream.overlay().detections().len(), 1);
        assert_eq!(stream.stats().analysis_failures, 1);

        let out = stream.tick(&frame(10)).unwrap().unwrap();
        assert_eq!(out.annotations.len(), 1);
    }

    #[test]
    fn mode_change_drops_cached_overlay() {
        let backend =
            StubBackend::new().with_fallback(DetectionResult::new(vec![person_at(2.0, 0.9)]));
        let (mut stream, _) = stream_with(0, Mode::DetectObjects, backend);
        for i in 0..5 {
            stream.tick(&frame(i)).unwrap();
        }
        assert_eq!(stream.overlay().detections().len(), 1);

        stream.set_mode(Mode::Original).unwrap();
        let out = stream.tick(&frame(5)).unwrap().unwrap();
        assert!(out.annotations.is_empty());
        assert_eq!(out.mode, Mode::Original);
    }

    #[test]
    fn original_mode_never_calls_backends() {
        let (mut stream, calls) = stream_with(0, Mode::Original, StubBackend::new());
        for i in 0..20 {
            let out = stream.tick(&frame(i)).unwrap().unwrap();
            assert_eq!(out.image.dimensions(), (64, 48));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mode_without_backend_is_rejected() {
        let (mut stream, _) = stream_with(0, Mode::Original, StubBackend::new());
        let err = stream.set_mode(Mode::DetectMotion).unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::Configuration(_))
        ));
        assert_eq!(stream.mode(), Mode::Original);
    }

    #[test]
    fn paused_or_hidden_stream_does_not_tick() {
        let (mut stream, calls) = stream_with(0, Mode::DetectObjects, StubBackend::new());
        stream.pause();
        for i in 0..10 {
            assert!(stream.tick(&frame(i)).unwrap().is_none());
        }
        stream.play();
        stream.set_display_size(0, 0);
        assert!(stream.tick(&frame(10)).unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stream.counter(), 0);
    }

    #[test]
    fn output_is_fitted_to_display_box() {
        let (mut stream, _) = stream_with(0, Mode::Original, StubBackend::new());
        stream.set_display_size(32, 32);
        let out = stream.tick(&frame(1)).unwrap().unwrap();
        assert_eq!(out.image.dimensions(), (32, 24));
    }

    #[test]
    fn rejected_reconfig_changes_nothing() {
        let (mut stream, _) = stream_with(0, Mode::DetectObjects, StubBackend::new());
        let err = stream
            .reconfigure(CameraReconfig {
                source: Some(SourceDescriptor::Device(3)),
                mode: Some(Mode::DetectMotion),
                allow_list: Some(ClassAllowList::vehicles()),
            })
            .unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::Configuration(_))
        ));
        assert_eq!(stream.mode(), Mode::DetectObjects);
        assert_eq!(stream.allow_list(), &ClassAllowList::people());
        assert_eq!(stream.source(), &SourceDescriptor::Synthetic("stub://t".into()));

        stream
            .reconfigure(CameraReconfig {
                source: Some(SourceDescriptor::Device(3)),
                allow_list: Some(ClassAllowList::vehicles()),
                ..CameraReconfig::default()
            })
            .unwrap();
        assert_eq!(stream.source(), &SourceDescriptor::Device(3));
        assert_eq!(stream.allow_list(), &ClassAllowList::vehicles());
    }

    #[test]
    fn parses_modes() {
        assert_eq!("detect-objects".parse::<Mode>().unwrap(), Mode::DetectObjects);
        assert_eq!(Mode::from_index(2).unwrap(), Mode::DetectMotion);
        assert!("thermal".parse::<Mode>().is_err());
        assert!(Mode::from_index(4).is_err());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = StreamSettings::new(SourceDescriptor::Device(0));
        settings.analysis_period = 0;
        let labels = Arc::new(LabelMap::builtin());
        assert!(CameraStream::new(0, settings, Detectors::default(), labels.clone()).is_err());

        let mut settings = StreamSettings::new(SourceDescriptor::Device(0));
        settings.confidence = 1.5;
        assert!(CameraStream::new(0, settings, Detectors::default(), labels).is_err());
    }
}
