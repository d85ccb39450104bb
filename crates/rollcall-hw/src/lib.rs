//! rollcall-hw: camera capture for the attendance stream.
//!
//! Provides V4L2-based camera access and conversion of YUYV, MJPG and GREY
//! buffers into RGB frames with a grayscale plane for detection.

pub mod camera;
pub mod frame;

pub use camera::{
    Camera, CameraError, CaptureSession, DeviceInfo, FrameSession, FrameSource, PixelFormat,
};
pub use frame::{Frame, FrameError};
