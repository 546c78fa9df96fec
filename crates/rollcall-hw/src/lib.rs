//! rollcall-hw: camera capture for the attendance kiosk.
//!
//! V4L2 devices are opened through the `v4l` crate and every frame is
//! converted to 8-bit grayscale.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::Frame;
