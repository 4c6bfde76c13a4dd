//! FFmpeg-backed capture for files, network streams and camera devices.
//!
//! Frames are decoded in-memory and converted to RGB24 at native resolution.
//! End of file and decoder failures are reported as unrecoverable; the reader
//! loop decides what to do with them.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::{CaptureSource, SourceDescriptor};
use crate::frame::Frame;

pub(crate) struct FfmpegSource {
    target: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: Option<f64>,
    frame_count: u64,
    released: bool,
}

impl FfmpegSource {
    pub(crate) fn open(descriptor: &SourceDescriptor) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let target = match descriptor {
            SourceDescriptor::Device(index) => {
                ffmpeg::device::register_all();
                format!("/dev/video{}", index)
            }
            SourceDescriptor::Url(url) => url.clone(),
            SourceDescriptor::File(path) => path.display().to_string(),
            SourceDescriptor::Synthetic(url) => {
                return Err(anyhow!("{} is not an ffmpeg source", url));
            }
        };

        let input = ffmpeg::format::input(&target)
            .with_context(|| format!("failed to open '{}' with ffmpeg", target))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", target))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = (rate.denominator() != 0 && rate.numerator() > 0)
            .then(|| rate.numerator() as f64 / rate.denominator() as f64);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegSource: opened {} ({}x{}, fps={:?})",
            target,
            decoder.width(),
            decoder.height(),
            fps
        );

        Ok(Self {
            target,
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            frame_count: 0,
            released: false,
        })
    }
}

impl CaptureSource for FfmpegSource {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Err(anyhow!("{} already released", self.target));
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }

            if let Err(err) = self.decoder.send_packet(&packet) {
                // a corrupt packet is a dropped frame, not a dead stream
                log::debug!("{}: skipping undecodable packet: {}", self.target, err);
                return Ok(None);
            }

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let image = frame_to_image(&rgb_frame)?;
                self.frame_count += 1;
                return Ok(Some(Frame::new(image, self.frame_count)));
            }
        }

        anyhow::bail!(
            "{} ended after {} frames",
            self.target,
            self.frame_count
        )
    }

    fn release(&mut self) {
        if !self.released {
            log::info!(
                "FfmpegSource: released {} after {} frames",
                self.target,
                self.frame_count
            );
            self.released = true;
        }
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).context("ffmpeg frame buffer size mismatch")
}
