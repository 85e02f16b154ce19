//! geoattend-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access by device index and the pull-based
//! `FrameSource` interface the capture pipeline reads from.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
