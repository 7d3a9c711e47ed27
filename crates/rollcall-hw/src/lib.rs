//! rollcall-hw: hardware abstraction for classroom frame capture.
//!
//! Provides V4L2-based camera access, a bounded capture sequence with
//! cancellation, and JPEG encoding of captured frames for upload.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use capture::{CaptureError, CapturePlan, FrameSource};
pub use frame::{EncodedFrame, Frame};
