//! moodcam-hw: Hardware abstraction for the capture device.
//!
//! Provides V4L2 camera access, the exclusive device slot, and the
//! time-bounded capture session that feeds the annotation stream.

pub mod camera;
pub mod device;
pub mod frame;
pub mod session;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use device::{CaptureDevice, DeviceLease, DeviceOpener, ExclusiveDevice, V4lOpener};
pub use frame::Frame;
pub use session::{CaptureSession, Clock, ManualClock, SessionError, SystemClock, SESSION_DURATION};
