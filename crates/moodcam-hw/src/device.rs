//! Exclusive ownership of the single capture device.
//!
//! The physical camera is one shared resource. `ExclusiveDevice` is the
//! explicit handle to it: acquiring is atomic and never blocks, and the
//! returned `DeviceLease` owns the opened device until it is released.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A source of raw frames (a V4L2 camera, or a fake in tests).
pub trait CaptureDevice: Send {
    /// Read the next frame. Synchronous; may block for one frame interval.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens the underlying device on demand, once per session.
pub trait DeviceOpener: Send + Sync {
    type Device: CaptureDevice;

    fn open(&self) -> Result<Self::Device, CameraError>;

    /// Human-readable identifier for logs and status.
    fn describe(&self) -> String;
}

/// Opens a V4L2 camera at a fixed path and resolution.
#[derive(Debug, Clone)]
pub struct V4lOpener {
    pub path: String,
    pub width: u32,
    pub height: u32,
}

impl DeviceOpener for V4lOpener {
    type Device = Camera;

    fn open(&self) -> Result<Camera, CameraError> {
        Camera::open(&self.path, self.width, self.height)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// The one capture device, shareable across request handlers.
pub struct ExclusiveDevice<O: DeviceOpener> {
    opener: O,
    busy: Arc<AtomicBool>,
}

impl<O: DeviceOpener> ExclusiveDevice<O> {
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim and open the device.
    ///
    /// Fails fast with `CameraError::DeviceBusy` while another lease is live.
    /// If opening fails, the claim is dropped before the error is returned.
    pub fn acquire(&self) -> Result<DeviceLease<O::Device>, CameraError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(device = %self.opener.describe(), "device already leased");
            return Err(CameraError::DeviceBusy);
        }

        match self.opener.open() {
            Ok(device) => {
                tracing::debug!(device = %self.opener.describe(), "device leased");
                Ok(DeviceLease {
                    device: Some(device),
                    busy: Arc::clone(&self.busy),
                })
            }
            Err(e) => {
                self.busy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Whether a lease is currently live.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn describe(&self) -> String {
        self.opener.describe()
    }
}

/// Exclusive ownership of an opened device.
pub struct DeviceLease<D: CaptureDevice> {
    device: Option<D>,
    busy: Arc<AtomicBool>,
}

impl<D: CaptureDevice> DeviceLease<D> {
    pub fn read_frame(&mut self) -> Result<Frame, CameraError> {
        match self.device.as_mut() {
            Some(device) => device.read_frame(),
            None => Err(CameraError::Released),
        }
    }

    /// Close the device and give up the claim.
    ///
    /// Idempotent: returns `true` only for the call that actually released.
    pub fn release(&mut self) -> bool {
        match self.device.take() {
            Some(device) => {
                // Device closes before the slot reopens.
                drop(device);
                self.busy.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }
}

impl<D: CaptureDevice> Drop for DeviceLease<D> {
    fn drop(&mut self) {
        self.release();
    }
}
