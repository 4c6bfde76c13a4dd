//! Pure drawing of overlay plans onto frames.
//!
//! Nothing here touches camera state: the caller passes the frame, the cached
//! overlay and the region set, and gets back the annotations it drew.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, Detection, LabelMap, PERSON_CLASS_ID};
use crate::region::{Point, RegionSet};

/// How detection boxes are colored when no region claims them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorPolicy {
    /// Person color for people, object color for everything else.
    ByClass,
    /// Motion color for every box.
    Motion,
}

/// Cached result of the last analysis tick, redrawn on every tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Overlay {
    #[default]
    NoOp,
    DrawDetections {
        detections: Vec<Detection>,
        policy: ColorPolicy,
    },
}

impl Overlay {
    pub fn detections(&self) -> &[Detection] {
        match self {
            Overlay::NoOp => &[],
            Overlay::DrawDetections { detections, .. } => detections,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Palette {
    pub person: Rgb<u8>,
    pub object: Rgb<u8>,
    pub motion: Rgb<u8>,
    pub region: Rgb<u8>,
    pub box_thickness: u32,
    pub region_thickness: u32,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            person: Rgb([104, 176, 77]),
            object: Rgb([0, 255, 100]),
            motion: Rgb([225, 252, 49]),
            region: Rgb([227, 28, 33]),
            box_thickness: 3,
            region_thickness: 3,
        }
    }
}

/// One drawn box, kept as data for the display collaborator (label text).
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: Option<String>,
    pub color: Rgb<u8>,
    /// Where the label text goes: above the box unless that leaves the frame top.
    pub label_origin: (f32, f32),
    pub in_region: bool,
}

/// Apply `overlay` to `image` and return what was drawn.
///
/// `labels` decides which label text names the person class.
pub fn render(
    image: &mut RgbImage,
    overlay: &Overlay,
    regions: &RegionSet,
    palette: &Palette,
    labels: &LabelMap,
) -> Vec<Annotation> {
    let Overlay::DrawDetections { detections, policy } = overlay else {
        return Vec::new();
    };

    let in_region = if regions.has_regions() {
        draw_regions(image, regions, palette);
        let boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();
        regions.contains_rectangles(&boxes)
    } else {
        vec![false; detections.len()]
    };

    detections
        .iter()
        .zip(in_region)
        .map(|(detection, in_region)| {
            let color = if in_region {
                palette.region
            } else {
                base_color(detection, *policy, palette, labels)
            };
            draw_box(image, &detection.bbox, color, palette.box_thickness);
            Annotation {
                bbox: detection.bbox,
                label: detection.label.clone(),
                color,
                label_origin: label_origin(&detection.bbox),
                in_region,
            }
        })
        .collect()
}

/// Region-editing view: committed regions closed, the pending one open.
pub fn render_region_editor(image: &mut RgbImage, regions: &RegionSet, palette: &Palette) {
    draw_regions(image, regions, palette);
    if let Some(points) = regions.pending_points() {
        draw_polyline(image, points, false, palette.region, palette.region_thickness);
    }
}

fn base_color(
    detection: &Detection,
    policy: ColorPolicy,
    palette: &Palette,
    labels: &LabelMap,
) -> Rgb<u8> {
    match policy {
        ColorPolicy::Motion => palette.motion,
        ColorPolicy::ByClass => {
            let is_person = match detection.class_id {
                Some(id) => id == PERSON_CLASS_ID,
                None => detection
                    .label
                    .as_deref()
                    .is_some_and(|label| labels.is_person(label)),
            };
            if is_person {
                palette.person
            } else {
                palette.object
            }
        }
    }
}

fn label_origin(bbox: &BoundingBox) -> (f32, f32) {
    let y = if bbox.y1 - 15.0 > 15.0 {
        bbox.y1 - 15.0
    } else {
        bbox.y1 + 15.0
    };
    (bbox.x1, y)
}

fn draw_regions(image: &mut RgbImage, regions: &RegionSet, palette: &Palette) {
    for region in regions.regions() {
        draw_polyline(
            image,
            region.points(),
            true,
            palette.region,
            palette.region_thickness,
        );
    }
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let x = bbox.x1.round() as i32;
    let y = bbox.y1.round() as i32;
    let w = bbox.width().round() as i32;
    let h = bbox.height().round() as i32;
    for t in 0..thickness as i32 {
        let (tw, th) = (w - 2 * t, h - 2 * t);
        if tw <= 0 || th <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at(x + t, y + t).of_size(tw as u32, th as u32),
            color,
        );
    }
}

fn draw_polyline(
    image: &mut RgbImage,
    points: &[Point],
    closed: bool,
    color: Rgb<u8>,
    thickness: u32,
) {
    if points.len() < 2 {
        return;
    }
    let mut segments: Vec<(Point, Point)> = points.windows(2).map(|w| (w[0], w[1])).collect();
    if closed {
        segments.push((points[points.len() - 1], points[0]));
    }
    let half = thickness as i32 / 2;
    for (a, b) in segments {
        for offset in -half..=half {
            let d = offset as f32;
            draw_line_segment_mut(image, (a.x + d, a.y), (b.x + d, b.y), color);
            draw_line_segment_mut(image, (a.x, a.y + d), (b.x, b.y + d), color);
        }
    }
}
