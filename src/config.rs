use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{
    Mode, StreamSettings, DEFAULT_ANALYSIS_PERIOD, DEFAULT_CONFIDENCE, DEFAULT_DISPLAY_SIZE,
};
use crate::detect::backends::cpu::{DEFAULT_MOTION_CELL, DEFAULT_MOTION_THRESHOLD};
use crate::detect::{ClassAllowList, LabelMap, PERSON_CLASS_ID};
use crate::events::{DEFAULT_ABSENT_TEXT, DEFAULT_EVENT_LOG, DEFAULT_PRESENT_TEXT};
use crate::ingest::SourceDescriptor;
use crate::presence::{
    PresenceSettings, DEFAULT_BURST_SIZE, DEFAULT_CHECK_INTERVAL, DEFAULT_PRESENCE_CONFIDENCE,
};
use crate::region::{Point, Region};
use crate::render::Palette;
use crate::worker::{WorkerSettings, DEFAULT_FRAME_PERIOD, DEFAULT_MAX_CONSECUTIVE_MISSES};
use crate::PipelineError;

pub const CONFIG_ENV: &str = "WATCHPOST_CONFIG";
const DEFAULT_CAMERA_SOURCE: &str = "stub://camera0";
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RESTART_ATTEMPTS: u32 = 3;
const DEFAULT_HEALTHY_AFTER_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    analysis: Option<AnalysisConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    presence: Option<PresenceConfigFile>,
    shutdown_timeout_ms: Option<u64>,
    restart: Option<RestartConfigFile>,
    max_consecutive_misses: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AnalysisConfigFile {
    period: Option<u32>,
    confidence: Option<f32>,
    labels_path: Option<PathBuf>,
    motion_threshold: Option<u8>,
    motion_cell: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    source: Option<String>,
    mode: Option<String>,
    classes: Option<ClassesConfigFile>,
    display_width: Option<u32>,
    display_height: Option<u32>,
    frame_period_ms: Option<u64>,
    regions: Option<Vec<RegionConfigFile>>,
}

/// Either a preset name (`"people"`, `"vehicles"`) or explicit class ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassesConfigFile {
    Preset(String),
    Ids(Vec<u32>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionConfigFile {
    name: String,
    points: Vec<[f32; 2]>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PresenceConfigFile {
    source: Option<String>,
    check_interval_secs: Option<u64>,
    burst_size: Option<u32>,
    class_id: Option<u32>,
    confidence: Option<f32>,
    log_path: Option<PathBuf>,
    present_text: Option<String>,
    absent_text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RestartConfigFile {
    on_source_loss: Option<bool>,
    max_attempts: Option<u32>,
    healthy_after_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub analysis: AnalysisSettings,
    pub cameras: Vec<CameraConfig>,
    /// `None` disables the presence monitor.
    pub presence: Option<PresenceConfig>,
    pub shutdown_timeout: Duration,
    pub restart: RestartPolicy,
    pub max_consecutive_misses: u32,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub period: u32,
    pub confidence: f32,
    pub labels_path: Option<PathBuf>,
    pub motion_threshold: u8,
    pub motion_cell: u32,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub source: String,
    pub mode: Mode,
    pub classes: ClassAllowList,
    pub display_width: u32,
    pub display_height: u32,
    pub frame_period: Option<Duration>,
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub source: String,
    pub check_interval: Duration,
    pub burst_size: u32,
    pub class_id: u32,
    pub confidence: f32,
    pub log_path: PathBuf,
    pub present_text: String,
    pub absent_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub on_source_loss: bool,
    pub max_attempts: u32,
    /// A run that lasted this long before losing its source refills the budget.
    pub healthy_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisSettings {
                period: DEFAULT_ANALYSIS_PERIOD,
                confidence: DEFAULT_CONFIDENCE,
                labels_path: None,
                motion_threshold: DEFAULT_MOTION_THRESHOLD,
                motion_cell: DEFAULT_MOTION_CELL,
            },
            cameras: vec![CameraConfig::new(DEFAULT_CAMERA_SOURCE)],
            presence: None,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            restart: RestartPolicy {
                on_source_loss: true,
                max_attempts: DEFAULT_RESTART_ATTEMPTS,
                healthy_after: Duration::from_secs(DEFAULT_HEALTHY_AFTER_SECS),
            },
            max_consecutive_misses: DEFAULT_MAX_CONSECUTIVE_MISSES,
        }
    }
}

impl CameraConfig {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            mode: Mode::Original,
            classes: ClassAllowList::default(),
            display_width: DEFAULT_DISPLAY_SIZE.0,
            display_height: DEFAULT_DISPLAY_SIZE.1,
            frame_period: None,
            regions: Vec::new(),
        }
    }
}

impl PresenceConfig {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            burst_size: DEFAULT_BURST_SIZE,
            class_id: PERSON_CLASS_ID,
            confidence: DEFAULT_PRESENCE_CONFIDENCE,
            log_path: PathBuf::from(DEFAULT_EVENT_LOG),
            present_text: DEFAULT_PRESENT_TEXT.to_string(),
            absent_text: DEFAULT_ABSENT_TEXT.to_string(),
        }
    }

    pub fn settings(&self) -> PresenceSettings {
        PresenceSettings {
            check_interval: self.check_interval,
            burst_size: self.burst_size,
            class_id: self.class_id,
            confidence: self.confidence,
        }
    }
}

impl PipelineConfig {
    /// Load from the file named by `WATCHPOST_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let analysis = file.analysis.unwrap_or_default();
        let analysis = AnalysisSettings {
            period: analysis.period.unwrap_or(defaults.analysis.period),
            confidence: analysis.confidence.unwrap_or(defaults.analysis.confidence),
            labels_path: analysis.labels_path,
            motion_threshold: analysis
                .motion_threshold
                .unwrap_or(defaults.analysis.motion_threshold),
            motion_cell: analysis.motion_cell.unwrap_or(defaults.analysis.motion_cell),
        };

        let cameras = match file.cameras {
            Some(cameras) if !cameras.is_empty() => cameras
                .into_iter()
                .enumerate()
                .map(|(i, camera)| camera_from_file(i, camera))
                .collect::<Result<Vec<_>>>()?,
            _ => defaults.cameras,
        };

        let presence = file.presence.map(|presence| {
            let base = PresenceConfig::new(presence.source.as_deref().unwrap_or(""));
            PresenceConfig {
                check_interval: presence
                    .check_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(base.check_interval),
                burst_size: presence.burst_size.unwrap_or(base.burst_size),
                class_id: presence.class_id.unwrap_or(base.class_id),
                confidence: presence.confidence.unwrap_or(base.confidence),
                log_path: presence.log_path.unwrap_or(base.log_path),
                present_text: presence.present_text.unwrap_or(base.present_text),
                absent_text: presence.absent_text.unwrap_or(base.absent_text),
                source: base.source,
            }
        });

        let restart = file.restart.unwrap_or_default();
        Ok(Self {
            analysis,
            cameras,
            presence,
            shutdown_timeout: file
                .shutdown_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            restart: RestartPolicy {
                on_source_loss: restart
                    .on_source_loss
                    .unwrap_or(defaults.restart.on_source_loss),
                max_attempts: restart.max_attempts.unwrap_or(defaults.restart.max_attempts),
                healthy_after: restart
                    .healthy_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.restart.healthy_after),
            },
            max_consecutive_misses: file
                .max_consecutive_misses
                .unwrap_or(defaults.max_consecutive_misses),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(sources) = std::env::var("WATCHPOST_SOURCES") {
            self.set_sources(split_csv(&sources));
        }
        if let Ok(source) = std::env::var("WATCHPOST_SECURITY_SOURCE") {
            if !source.trim().is_empty() {
                match self.presence.as_mut() {
                    Some(presence) => presence.source = source,
                    None => self.presence = Some(PresenceConfig::new(&source)),
                }
            }
        }
        if let Ok(path) = std::env::var("WATCHPOST_EVENT_LOG") {
            if !path.trim().is_empty() {
                if let Some(presence) = self.presence.as_mut() {
                    presence.log_path = PathBuf::from(path);
                }
            }
        }
        if let Ok(confidence) = std::env::var("WATCHPOST_CONFIDENCE") {
            self.analysis.confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("WATCHPOST_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(period) = std::env::var("WATCHPOST_ANALYSIS_PERIOD") {
            self.analysis.period = period
                .trim()
                .parse()
                .map_err(|_| anyhow!("WATCHPOST_ANALYSIS_PERIOD must be a positive integer"))?;
        }
        if let Ok(timeout) = std::env::var("WATCHPOST_SHUTDOWN_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("WATCHPOST_SHUTDOWN_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.shutdown_timeout = Duration::from_millis(millis);
        }
        Ok(())
    }

    /// Replace camera sources in order; extra entries add cameras.
    fn set_sources(&mut self, sources: Vec<String>) {
        for (i, source) in sources.into_iter().enumerate() {
            match self.cameras.get_mut(i) {
                Some(camera) => camera.source = source,
                None => self.cameras.push(CameraConfig::new(&source)),
            }
        }
    }

    /// Apply a comma-separated source list (e.g. from the command line) and
    /// re-validate.
    pub fn with_sources(mut self, sources: &str) -> Result<Self> {
        self.set_sources(split_csv(sources));
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.analysis.period == 0 {
            return Err(PipelineError::config("analysis period must be at least 1").into());
        }
        if !(0.0..=1.0).contains(&self.analysis.confidence) {
            return Err(PipelineError::config("confidence must be within 0..=1").into());
        }
        if self.analysis.motion_cell == 0 {
            return Err(PipelineError::config("motion cell size must be non-zero").into());
        }
        if self.cameras.is_empty() {
            return Err(PipelineError::config("at least one camera is required").into());
        }
        if self.shutdown_timeout.is_zero() {
            return Err(PipelineError::config("shutdown timeout must be greater than zero").into());
        }

        let labels = self.label_map()?;
        for (i, camera) in self.cameras.iter().enumerate() {
            SourceDescriptor::parse(&camera.source)
                .map_err(|e| PipelineError::config(format!("camera {}: {}", i, e)))?;
            camera
                .classes
                .validate(&labels)
                .map_err(|e| PipelineError::config(format!("camera {}: {}", i, e)))?;
        }

        if let Some(presence) = &self.presence {
            SourceDescriptor::parse(&presence.source)
                .map_err(|e| PipelineError::config(format!("presence: {}", e)))?;
            if presence.burst_size == 0 {
                return Err(PipelineError::config("presence burst size must be at least 1").into());
            }
            if labels.label(presence.class_id).is_none() {
                return Err(PipelineError::config(format!(
                    "presence class id {} is not in the label map",
                    presence.class_id
                ))
                .into());
            }
            if !(0.0..=1.0).contains(&presence.confidence) {
                return Err(
                    PipelineError::config("presence confidence must be within 0..=1").into(),
                );
            }
        }
        Ok(())
    }

    /// Labels from `analysis.labels_path`, or the built-in COCO set.
    pub fn label_map(&self) -> Result<LabelMap> {
        match &self.analysis.labels_path {
            Some(path) => LabelMap::from_file(path),
            None => Ok(LabelMap::builtin()),
        }
    }

    pub fn stream_settings(&self, camera: usize) -> Result<StreamSettings> {
        let cfg = self
            .cameras
            .get(camera)
            .ok_or_else(|| PipelineError::config(format!("no camera {}", camera)))?;
        let mut settings = StreamSettings::new(SourceDescriptor::parse(&cfg.source)?);
        settings.mode = cfg.mode;
        settings.allow_list = cfg.classes.clone();
        settings.confidence = self.analysis.confidence;
        settings.analysis_period = self.analysis.period;
        settings.display_size = (cfg.display_width, cfg.display_height);
        settings.frame_period = cfg.frame_period;
        settings.regions = cfg.regions.clone();
        settings.palette = Palette::default();
        Ok(settings)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            default_period: DEFAULT_FRAME_PERIOD,
            max_consecutive_misses: self.max_consecutive_misses,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn camera_from_file(index: usize, file: CameraConfigFile) -> Result<CameraConfig> {
    let base = CameraConfig::new(DEFAULT_CAMERA_SOURCE);
    let source = file
        .source
        .unwrap_or_else(|| format!("stub://camera{}", index));
    let mode = match file.mode {
        Some(mode) => mode.parse::<Mode>()?,
        None => base.mode,
    };
    let classes = match file.classes {
        Some(ClassesConfigFile::Preset(name)) => ClassAllowList::preset(&name)?,
        Some(ClassesConfigFile::Ids(ids)) => ClassAllowList::new(ids),
        None => base.classes,
    };
    let regions = file
        .regions
        .unwrap_or_default()
        .into_iter()
        .map(|region| {
            let points = region.points.iter().map(|[x, y]| Point::new(*x, *y)).collect();
            Region::new(&region.name, points)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CameraConfig {
        source,
        mode,
        classes,
        display_width: file.display_width.unwrap_or(base.display_width),
        display_height: file.display_height.unwrap_or(base.display_height),
        frame_period: file
            .frame_period_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis),
        regions,
    })
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_one_synthetic_camera() {
        let cfg = PipelineConfig::from_file(PipelineConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].source, "stub://camera0");
        assert_eq!(cfg.analysis.period, 5);
        assert!(cfg.presence.is_none());
        assert_eq!(cfg.restart.max_attempts, 3);
        assert_eq!(cfg.restart.healthy_after, Duration::from_secs(60));
    }

    #[test]
    fn class_presets_and_ids_parse() {
        let file: PipelineConfigFile = serde_json::from_str(
            r#"{ "cameras": [ { "classes": "vehicles" }, { "classes": [1, 3] } ] }"#,
        )
        .unwrap();
        let cfg = PipelineConfig::from_file(file).unwrap();
        assert_eq!(cfg.cameras[0].classes, ClassAllowList::vehicles());
        assert_eq!(cfg.cameras[1].classes.ids(), &[1, 3]);
        assert_eq!(cfg.cameras[1].source, "stub://camera1");
    }

    #[test]
    fn unknown_class_id_fails_validation() {
        let file: PipelineConfigFile =
            serde_json::from_str(r#"{ "cameras": [ { "classes": [12] } ] }"#).unwrap();
        let cfg = PipelineConfig::from_file(file).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown class id 12"));
    }

    #[test]
    fn short_regions_are_rejected() {
        let file: PipelineConfigFile = serde_json::from_str(
            r#"{ "cameras": [ { "regions": [
                { "name": "zone:gate", "points": [[0,0],[1,1]] }
            ] } ] }"#,
        )
        .unwrap();
        assert!(PipelineConfig::from_file(file).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: Result<PipelineConfigFile, _> =
            serde_json::from_str(r#"{ "camera": [] }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn extra_sources_add_cameras() {
        let cfg = PipelineConfig::default()
            .with_sources("rtsp://cam-a/stream, stub://yard")
            .unwrap();
        let sources: Vec<&str> = cfg.cameras.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["rtsp://cam-a/stream", "stub://yard"]);
    }

    #[test]
    fn stream_settings_follow_camera_config() {
        let file: PipelineConfigFile = serde_json::from_str(
            r#"{
                "analysis": { "period": 3, "confidence": 0.4 },
                "cameras": [ { "source": "0", "mode": "detect_motion",
                               "display_width": 320, "display_height": 240,
                               "frame_period_ms": 100 } ]
            }"#,
        )
        .unwrap();
        let cfg = PipelineConfig::from_file(file).unwrap();
        let settings = cfg.stream_settings(0).unwrap();
        assert_eq!(settings.source, SourceDescriptor::Device(0));
        assert_eq!(settings.mode, Mode::DetectMotion);
        assert_eq!(settings.analysis_period, 3);
        assert_eq!(settings.display_size, (320, 240));
        assert_eq!(settings.frame_period, Some(Duration::from_millis(100)));
        assert!(cfg.stream_settings(1).is_err());
    }
}
