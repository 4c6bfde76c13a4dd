//! Synthetic frame source for `stub://` URLs.
//!
//! Produces a static gradient background with a bright square that walks
//! across the scene for part of every 200-frame cycle, so motion and presence
//! paths have something to find. Query parameters: `fps`, `width`, `height`,
//! `frames` (the source fails permanently after that many frames).

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use rand::Rng;
use std::time::{Duration, Instant};

use super::CaptureSource;
use crate::frame::Frame;

const SCENE_CYCLE: u64 = 200;
const WALKER_VISIBLE: std::ops::Range<u64> = 50..150;

/// Configuration for a synthetic source.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub url: String,
    /// Frames per second; 0 disables pacing.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Fail after this many frames.
    pub frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            fps: 25,
            width: 640,
            height: 480,
            frames: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source url must start with stub://"))?;
        let mut config = Self {
            url: url.to_string(),
            ..Self::default()
        };
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed query parameter '{}' in {}", pair, url))?;
            let parse = |v: &str| {
                v.parse::<u64>()
                    .map_err(|_| anyhow!("{} must be an integer in {}", key, url))
            };
            match key {
                "fps" => config.fps = parse(value)? as u32,
                "width" => config.width = parse(value)? as u32,
                "height" => config.height = parse(value)? as u32,
                "frames" => config.frames = Some(parse(value)?),
                other => return Err(anyhow!("unknown parameter '{}' in {}", other, url)),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero in {}", url));
        }
        Ok(config)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    next_due: Option<Instant>,
    released: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        log::info!("SyntheticSource: connected to {}", config.url);
        Self {
            config,
            frame_count: 0,
            next_due: None,
            released: false,
        }
    }

    fn pace(&mut self) {
        if self.config.fps == 0 {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / self.config.fps as f64);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + period);
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.config.width, self.config.height);
        let mut rng = rand::thread_rng();
        let mut img = RgbImage::from_fn(w, h, |x, y| {
            let base = ((x * 64 / w.max(1)) + (y * 64 / h.max(1))) as u8;
            let noise: u8 = rng.gen_range(0..3);
            Rgb([base + noise, base + noise, base + 40])
        });

        let phase = self.frame_count % SCENE_CYCLE;
        if WALKER_VISIBLE.contains(&phase) {
            let side = (w.min(h) / 6).max(1);
            let travel = w.saturating_sub(side) as u64;
            let span = WALKER_VISIBLE.end - WALKER_VISIBLE.start;
            let x0 = (travel * (phase - WALKER_VISIBLE.start) / span) as u32;
            let y0 = h.saturating_sub(side) / 2;
            for y in y0..(y0 + side).min(h) {
                for x in x0..(x0 + side).min(w) {
                    img.put_pixel(x, y, Rgb([240, 220, 200]));
                }
            }
        }
        img
    }
}

impl CaptureSource for SyntheticSource {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Err(anyhow!("{} already released", self.config.url));
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Err(anyhow!(
                    "{} ended after {} frames",
                    self.config.url,
                    limit
                ));
            }
        }
        self.pace();
        self.frame_count += 1;
        Ok(Some(Frame::new(self.render(), self.frame_count)))
    }

    fn release(&mut self) {
        if !self.released {
            log::info!(
                "SyntheticSource: released {} after {} frames",
                self.config.url,
                self.frame_count
            );
            self.released = true;
        }
    }

    fn fps(&self) -> Option<f64> {
        (self.config.fps > 0).then_some(self.config.fps as f64)
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}
