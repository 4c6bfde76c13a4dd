//! Named polygon regions ("borders") per camera.
//!
//! A region is built point by point while the set is selecting and frozen on
//! `end_selecting`. Only frozen regions with at least three points take part in
//! containment tests. Detections are anchored at their box center and tested
//! with the even-odd (ray casting) rule.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::{validate_region_name, PipelineError};

/// Minimum number of points for a committed region.
pub const MIN_REGION_POINTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

/// A frozen polygon. Construction validates the name and point count.
#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    name: String,
    points: Vec<Point>,
}

impl Region {
    pub fn new(name: &str, points: Vec<Point>) -> Result<Self> {
        validate_region_name(name)?;
        if points.len() < MIN_REGION_POINTS {
            return Err(PipelineError::config(format!(
                "region {} has {} points, needs at least {}",
                name,
                points.len(),
                MIN_REGION_POINTS
            ))
            .into());
        }
        if points.iter().any(|p| !p.is_finite()) {
            return Err(PipelineError::config(format!(
                "region {} has a non-finite point",
                name
            ))
            .into());
        }
        Ok(Self {
            name: name.to_lowercase(),
            points,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Even-odd containment. Points exactly on an edge may land either side.
    pub fn contains(&self, p: Point) -> bool {
        let pts = &self.points;
        let mut inside = false;
        let mut j = pts.len() - 1;
        for i in 0..pts.len() {
            let (a, b) = (pts[i], pts[j]);
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

#[derive(Clone, Debug)]
struct Selection {
    name: String,
    points: Vec<Point>,
}

/// Committed regions plus at most one region under construction.
#[derive(Clone, Debug, Default)]
pub struct RegionSet {
    committed: Vec<Region>,
    selecting: Option<Selection>,
    next_auto_id: u32,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any in-progress region and start a new one.
    ///
    /// Unnamed selections are named `zone:region_<n>`.
    pub fn start_selecting(&mut self, name: Option<&str>) -> Result<()> {
        let name = match name {
            Some(name) => {
                validate_region_name(name)?;
                name.to_lowercase()
            }
            None => {
                self.next_auto_id += 1;
                format!("zone:region_{}", self.next_auto_id)
            }
        };
        self.selecting = Some(Selection {
            name,
            points: Vec::new(),
        });
        Ok(())
    }

    /// Append a point to the in-progress region. No-op when not selecting.
    pub fn add_point(&mut self, point: Point) {
        if let Some(selection) = self.selecting.as_mut() {
            selection.points.push(point);
        }
    }

    /// Freeze the in-progress region if it has enough points, otherwise drop it.
    pub fn end_selecting(&mut self) -> Option<&Region> {
        let selection = self.selecting.take()?;
        match Region::new(&selection.name, selection.points) {
            Ok(region) => {
                self.committed.push(region);
                self.committed.last()
            }
            Err(err) => {
                log::debug!("discarding region selection: {}", err);
                None
            }
        }
    }

    /// Add an already-validated region, e.g. from configuration.
    pub fn insert(&mut self, region: Region) {
        self.committed.push(region);
    }

    /// Remove every committed region and leave selecting state.
    pub fn clear(&mut self) {
        self.committed.clear();
        self.selecting = None;
    }

    pub fn has_regions(&self) -> bool {
        !self.committed.is_empty()
    }

    pub fn is_selecting(&self) -> bool {
        self.selecting.is_some()
    }

    pub fn regions(&self) -> &[Region] {
        &self.committed
    }

    /// Points of the region under construction, if any.
    pub fn pending_points(&self) -> Option<&[Point]> {
        self.selecting.as_ref().map(|s| s.points.as_slice())
    }

    /// For each box: is its center inside at least one committed region?
    pub fn contains_rectangles(&self, boxes: &[BoundingBox]) -> Vec<bool> {
        boxes
            .iter()
            .map(|b| {
                let center = b.center();
                self.committed.iter().any(|region| region.contains(center))
            })
            .collect()
    }
}
