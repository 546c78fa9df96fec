//! Test doubles for the session and engine: a camera that replays frames and
//! an encoder that treats a flat image's brightness as its face.

use crate::config::Config;
use crate::engine::{CaptureDevice, FrameSource};
use image::{GrayImage, Luma};
use rollcall_core::{
    BoundingBox, DirGallery, EncodedFace, EncoderError, Embedding, FaceEncoder, FaceGallery,
    FaceRecord,
};
use rollcall_hw::CameraError;
use std::path::Path;
use std::time::Duration;

pub const FEED_PATH: &str = "/channels/7/feeds/last.json";
pub const RESET_PATH: &str = "/update.json";

/// Config whose trigger endpoints live under `base_url` with both keys set.
pub fn trigger_config(base_url: &str) -> Config {
    let mut config = Config::for_data_dir(Path::new("/var/lib/rollcall"));
    config.trigger_read_url = format!("{base_url}{FEED_PATH}");
    config.trigger_read_key = Some("READKEY".into());
    config.trigger_reset_url = format!("{base_url}{RESET_PATH}");
    config.trigger_write_key = Some("WRITEKEY".into());
    config
}

/// One "face" per non-dark image, encoded as its mean brightness.
#[derive(Default)]
pub struct MeanEncoder;

impl FaceEncoder for MeanEncoder {
    fn encode(&mut self, image: &GrayImage) -> Result<Vec<EncodedFace>, EncoderError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let mean = image.pixels().map(|p| p.0[0] as f32).sum::<f32>() / (width * height) as f32;
        if mean < 16.0 {
            return Ok(Vec::new());
        }
        Ok(vec![EncodedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                confidence: 1.0,
            },
            embedding: Embedding::new(vec![mean / 255.0]),
        }])
    }
}

pub fn flat(shade: u8) -> GrayImage {
    GrayImage::from_pixel(64, 48, Luma([shade]))
}

pub fn enroll_reference(gallery: &DirGallery, identity: &str, shade: u8) {
    let record = FaceRecord {
        identity: identity.to_string(),
        embedding: Embedding::new(vec![shade as f32 / 255.0]),
    };
    gallery.append(&record, &flat(shade)).unwrap();
}

struct LoopDevice {
    frames: Vec<GrayImage>,
    fail_after: Option<usize>,
}

struct LoopSource<'a> {
    frames: &'a [GrayImage],
    served: usize,
    fail_after: Option<usize>,
}

impl FrameSource for LoopSource<'_> {
    fn next_image(&mut self) -> Result<GrayImage, CameraError> {
        if self.fail_after == Some(self.served) {
            return Err(CameraError::CaptureFailed("unplugged".into()));
        }
        std::thread::sleep(Duration::from_millis(2));
        let image = self.frames[self.served % self.frames.len()].clone();
        self.served += 1;
        Ok(image)
    }
}

impl CaptureDevice for LoopDevice {
    fn capture(self: Box<Self>, session: &mut dyn FnMut(&mut dyn FrameSource)) -> Result<(), CameraError> {
        let mut source = LoopSource {
            frames: &self.frames,
            served: 0,
            fail_after: self.fail_after,
        };
        session(&mut source);
        Ok(())
    }
}

/// Replays `frames` forever.
pub fn looping(frames: Vec<GrayImage>) -> Box<dyn CaptureDevice> {
    Box::new(LoopDevice {
        frames,
        fail_after: None,
    })
}

/// Replays `frames` for `count` captures, then fails.
pub fn looping_then_fail(frames: Vec<GrayImage>, count: usize) -> Box<dyn CaptureDevice> {
    Box::new(LoopDevice {
        frames,
        fail_after: Some(count),
    })
}

pub struct MissingDevice;

impl CaptureDevice for MissingDevice {
    fn capture(self: Box<Self>, _session: &mut dyn FnMut(&mut dyn FrameSource)) -> Result<(), CameraError> {
        Err(CameraError::DeviceNotFound("/dev/video-missing".into()))
    }
}

/// Opens but never delivers a frame, then gives up after `stall`.
pub struct StalledDevice {
    pub stall: Duration,
}

impl Default for StalledDevice {
    fn default() -> Self {
        Self {
            stall: Duration::from_millis(300),
        }
    }
}

impl CaptureDevice for StalledDevice {
    fn capture(self: Box<Self>, _session: &mut dyn FnMut(&mut dyn FrameSource)) -> Result<(), CameraError> {
        std::thread::sleep(self.stall);
        Err(CameraError::CaptureFailed("no frames".into()))
    }
}
