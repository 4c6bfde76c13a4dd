//! Class labels and class allow-lists.
//!
//! Labels follow the `classes_en.txt` convention: one label per line, class id
//! equals the line number starting at 1. Unused ids are marked `n/a`.

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::PipelineError;

/// Class id of "person" in the built-in numbering.
pub const PERSON_CLASS_ID: u32 = 1;

const UNUSED_LABEL: &str = "n/a";

const COCO_LABELS: [&str; 90] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "n/a", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "n/a", "backpack",
    "umbrella", "n/a", "n/a", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard",
    "sports ball", "kite", "baseball bat", "baseball glove", "skateboard", "surfboard",
    "tennis racket", "bottle", "n/a", "wine glass", "cup", "fork", "knife", "spoon", "bowl",
    "banana", "apple", "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut",
    "cake", "chair", "couch", "potted plant", "bed", "n/a", "dining table", "n/a", "n/a",
    "toilet", "n/a", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone", "microwave",
    "oven", "toaster", "sink", "refrigerator", "n/a", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[derive(Clone, Debug, PartialEq)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    /// COCO labels in TensorFlow object-detection numbering.
    pub fn builtin() -> Self {
        Self {
            labels: COCO_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read labels file {}: {}", path.display(), e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let labels: Vec<String> = raw.lines().map(|l| l.trim().to_string()).collect();
        if labels.iter().all(|l| l.is_empty()) {
            return Err(anyhow!("labels file is empty"));
        }
        Ok(Self { labels })
    }

    pub fn label(&self, class_id: u32) -> Option<&str> {
        let idx = (class_id as usize).checked_sub(1)?;
        self.labels
            .get(idx)
            .map(String::as_str)
            .filter(|l| !l.is_empty() && *l != UNUSED_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// True when `label` names the person class of this map.
    pub fn is_person(&self, label: &str) -> bool {
        self.label(PERSON_CLASS_ID) == Some(label)
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Set of class ids an object detector result is restricted to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassAllowList {
    ids: Vec<u32>,
}

impl ClassAllowList {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut ids: Vec<u32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    /// person, cat, dog
    pub fn people() -> Self {
        Self::new([PERSON_CLASS_ID, 17, 18])
    }

    /// bicycle, car, motorcycle, bus, truck
    pub fn vehicles() -> Self {
        Self::new([2, 3, 4, 6, 8])
    }

    pub fn person_only() -> Self {
        Self::new([PERSON_CLASS_ID])
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "people" => Ok(Self::people()),
            "vehicles" => Ok(Self::vehicles()),
            "person" => Ok(Self::person_only()),
            other => Err(PipelineError::config(format!("unknown class preset '{}'", other)).into()),
        }
    }

    pub fn allows(&self, class_id: u32) -> bool {
        self.ids.binary_search(&class_id).is_ok()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Reject empty lists and ids the label map does not know.
    pub fn validate(&self, labels: &LabelMap) -> Result<()> {
        if self.ids.is_empty() {
            return Err(PipelineError::config("class allow-list is empty").into());
        }
        if let Some(id) = self.ids.iter().find(|id| labels.label(**id).is_none()) {
            return Err(PipelineError::config(format!("unknown class id {}", id)).into());
        }
        Ok(())
    }
}

impl Default for ClassAllowList {
    fn default() -> Self {
        Self::people()
    }
}
