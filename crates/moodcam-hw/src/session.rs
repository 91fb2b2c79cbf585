//! Timed capture session over an exclusively leased device.

use crate::camera::CameraError;
use crate::device::{CaptureDevice, DeviceLease, DeviceOpener, ExclusiveDevice};
use crate::frame::Frame;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Hard wall-clock limit on how long one session may hold the device.
pub const SESSION_DURATION: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(CameraError),
    #[error("capture failed: {0}")]
    CaptureFailed(CameraError),
    #[error("session expired after {0:?}")]
    SessionExpired(Duration),
}

/// Time source for session deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Used to drive deadlines deterministically.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + offset
    }
}

/// One bounded-duration use of the capture device.
///
/// Holds the device lease for its whole life. The lease is released by
/// `close()`, or on drop if the session is abandoned mid-frame.
pub struct CaptureSession<D: CaptureDevice> {
    lease: DeviceLease<D>,
    clock: Arc<dyn Clock>,
    started: Instant,
    duration: Duration,
    frames: u32,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Acquire the device and start the session clock.
    pub fn open<O>(device: &ExclusiveDevice<O>, clock: Arc<dyn Clock>) -> Result<Self, SessionError>
    where
        O: DeviceOpener<Device = D>,
    {
        let lease = device.acquire().map_err(SessionError::DeviceUnavailable)?;
        let started = clock.now();
        tracing::info!(device = %device.describe(), duration = ?SESSION_DURATION, "capture session opened");
        Ok(Self {
            lease,
            clock,
            started,
            duration: SESSION_DURATION,
            frames: 0,
        })
    }

    /// Read the next frame, or report that the session is over.
    ///
    /// The deadline is checked before reading, so a session never outlives
    /// its duration by more than one frame interval.
    pub fn next_frame(&mut self) -> Result<Frame, SessionError> {
        let elapsed = self.elapsed();
        if elapsed >= self.duration {
            return Err(SessionError::SessionExpired(elapsed));
        }

        let frame = self.lease.read_frame().map_err(SessionError::CaptureFailed)?;
        self.frames += 1;
        Ok(frame)
    }

    /// Release the device. Safe to call more than once.
    pub fn close(&mut self) -> bool {
        let released = self.lease.release();
        if released {
            tracing::info!(
                frames = self.frames,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "capture session closed"
            );
        }
        released
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }

    /// Time left before the deadline; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.elapsed())
    }

    pub fn frames_read(&self) -> u32 {
        self.frames
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_released()
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}
