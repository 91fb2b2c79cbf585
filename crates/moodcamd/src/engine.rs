//! Stream generator: one capture session turned into a paced sequence of
//! multipart JPEG chunks.

use bytes::{BufMut, Bytes, BytesMut};
use futures_core::Stream;
use moodcam_core::encoder::EncodeError;
use moodcam_core::{FramePipeline, LabeledFace, PipelineError};
use moodcam_hw::{
    CaptureDevice, CaptureSession, Clock, DeviceOpener, ExclusiveDevice, SessionError,
};
use std::pin::Pin;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Multipart boundary token between parts.
pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// A consumer that has not pulled within this long has stopped pulling.
pub const STALL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(SessionError),
    #[error("frame encoding failed: {0}")]
    EncodingFailed(#[from] PipelineError),
    #[error("failed to start stream thread: {0}")]
    Spawn(std::io::Error),
}

/// Why a stream stopped producing chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Expired,
    CaptureFailed,
    EncodingFailed,
    Cancelled,
}

/// One part of the multipart body.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub sequence: u64,
    pub faces: Vec<LabeledFace>,
    pub jpeg: Vec<u8>,
}

impl StreamChunk {
    /// Frame the JPEG as a `multipart/x-mixed-replace` part.
    pub fn into_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.jpeg.len() + 64);
        buf.put_slice(b"--");
        buf.put_slice(BOUNDARY.as_bytes());
        buf.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
        buf.put_slice(&self.jpeg);
        buf.put_slice(b"\r\n\r\n");
        buf.freeze()
    }
}

enum State<D: CaptureDevice> {
    Running(CaptureSession<D>),
    Closed(SessionEnd),
}

/// Pull-based generator over one capture session.
///
/// Each `next()` reads, processes and encodes exactly one frame. The device
/// is released as soon as the generator reaches a terminal state, is
/// cancelled, or is dropped.
pub struct StreamGenerator<D: CaptureDevice> {
    state: State<D>,
    pipeline: Arc<FramePipeline>,
    emitted: u64,
}

impl<D: CaptureDevice> StreamGenerator<D> {
    /// Open a capture session. On failure nothing is held and no chunk is produced.
    pub fn start<O>(
        device: &ExclusiveDevice<O>,
        pipeline: Arc<FramePipeline>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StreamError>
    where
        O: DeviceOpener<Device = D>,
    {
        let session = CaptureSession::open(device, clock).map_err(StreamError::DeviceUnavailable)?;
        Ok(Self {
            state: State::Running(session),
            pipeline,
            emitted: 0,
        })
    }

    /// Stop early and release the device now.
    pub fn cancel(&mut self) {
        self.finish(SessionEnd::Cancelled);
    }

    /// `None` while running.
    pub fn end(&self) -> Option<SessionEnd> {
        match self.state {
            State::Running(_) => None,
            State::Closed(end) => Some(end),
        }
    }

    /// Time left in the session; zero once closed.
    pub fn remaining(&self) -> Duration {
        match &self.state {
            State::Running(session) => session.remaining(),
            State::Closed(_) => Duration::ZERO,
        }
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.emitted
    }

    fn finish(&mut self, end: SessionEnd) {
        if let State::Running(session) = &mut self.state {
            session.close();
            tracing::info!(?end, chunks = self.emitted, "stream closed");
            self.state = State::Closed(end);
        }
    }
}

impl<D: CaptureDevice> Iterator for StreamGenerator<D> {
    type Item = Result<StreamChunk, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        let State::Running(session) = &mut self.state else {
            return None;
        };

        let frame = match session.next_frame() {
            Ok(frame) => frame,
            Err(SessionError::SessionExpired(elapsed)) => {
                tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "session expired");
                self.finish(SessionEnd::Expired);
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "capture failed; ending stream");
                self.finish(SessionEnd::CaptureFailed);
                return None;
            }
        };

        let (width, height) = (frame.width, frame.height);
        let processed = match frame.into_rgb_image() {
            Some(image) => self.pipeline.process(image),
            None => Err(PipelineError::Encoding(EncodeError::Malformed(format!(
                "frame buffer does not match {width}x{height} RGB"
            )))),
        };

        match processed {
            Ok(out) => {
                let chunk = StreamChunk {
                    sequence: self.emitted,
                    faces: out.faces,
                    jpeg: out.jpeg,
                };
                self.emitted += 1;
                tracing::trace!(sequence = chunk.sequence, faces = chunk.faces.len(), "chunk ready");
                Some(Ok(chunk))
            }
            Err(e) => {
                tracing::error!(error = %e, "frame encoding failed; ending stream");
                self.finish(SessionEnd::EncodingFailed);
                Some(Err(StreamError::EncodingFailed(e)))
            }
        }
    }
}

impl<D: CaptureDevice> Drop for StreamGenerator<D> {
    fn drop(&mut self) {
        self.finish(SessionEnd::Cancelled);
    }
}

/// Run a generator on its own thread, producing one chunk per pull.
///
/// The returned stream asks for a frame only when polled, so at most one
/// frame is in flight. Dropping it, or not polling it for `STALL_TIMEOUT`,
/// ends the session after the frame in progress, if any.
pub fn spawn_stream<D>(mut generator: StreamGenerator<D>) -> Result<ChunkStream, StreamError>
where
    D: CaptureDevice + 'static,
{
    let (demand_tx, demand_rx) = sync_channel::<()>(1);
    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<StreamChunk, StreamError>>(1);

    std::thread::Builder::new()
        .name("moodcam-stream".into())
        .spawn(move || {
            loop {
                let wait = generator.remaining().min(STALL_TIMEOUT);
                match demand_rx.recv_timeout(wait) {
                    Ok(()) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        tracing::info!(waited_ms = wait.as_millis() as u64, "consumer stopped pulling");
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        tracing::debug!("consumer gone");
                        break;
                    }
                }

                let Some(item) = generator.next() else {
                    break;
                };
                if chunk_tx.blocking_send(item).is_err() {
                    break;
                }
            }
            generator.cancel();
            tracing::debug!(end = ?generator.end(), chunks = generator.chunks_emitted(), "stream thread exiting");
        })
        .map_err(StreamError::Spawn)?;

    Ok(ChunkStream {
        demand: demand_tx,
        chunks: chunk_rx,
        awaiting: false,
    })
}

/// Consumer-paced multipart body.
pub struct ChunkStream {
    demand: SyncSender<()>,
    chunks: mpsc::Receiver<Result<StreamChunk, StreamError>>,
    awaiting: bool,
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if !this.awaiting {
            match this.demand.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => this.awaiting = true,
                // Producer has exited; drain whatever it left behind.
                Err(TrySendError::Disconnected(())) => {}
            }
        }

        match this.chunks.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                this.awaiting = false;
                Poll::Ready(Some(item.map(StreamChunk::into_bytes)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::GrayImage;
    use moodcam_core::{
        classifier::ClassifierError, Annotator, Emotion, EmotionClassifier, FaceCrop, FaceLabel,
        FaceLocalizer, FaceRegion,
    };
    use moodcam_hw::{CameraError, Frame, ManualClock, SESSION_DURATION};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const FRAME_SIZE: u32 = 8;
    const FACE_PIXEL: u8 = 200;
    const PLAIN_PIXEL: u8 = 50;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub(crate) enum Shot {
        Plain,
        Face,
        Fail,
        /// Driver never hands over a buffer; the read gives up after its timeout.
        Stall,
        Malformed,
    }

    /// Replays a fixed script of frames, advancing the clock by `step` per read.
    pub(crate) struct ScriptedDevice {
        script: Vec<Shot>,
        next: usize,
        clock: Arc<ManualClock>,
        step: Duration,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            self.clock.advance(self.step);
            let shot = self.script.get(self.next).copied().unwrap_or(Shot::Fail);
            self.next += 1;
            let fill = match shot {
                Shot::Plain => PLAIN_PIXEL,
                Shot::Face => FACE_PIXEL,
                Shot::Fail => return Err(CameraError::CaptureFailed("scripted failure".into())),
                Shot::Stall => {
                    std::thread::sleep(Duration::from_millis(30));
                    return Err(CameraError::CaptureFailed(
                        "failed to dequeue buffer: timed out".into(),
                    ));
                }
                Shot::Malformed => {
                    return Ok(Frame {
                        data: vec![0; 5],
                        width: FRAME_SIZE,
                        height: FRAME_SIZE,
                        timestamp: std::time::Instant::now(),
                        sequence: self.next as u32,
                    })
                }
            };
            let data = vec![fill; (FRAME_SIZE * FRAME_SIZE * 3) as usize];
            Frame::from_rgb(data, FRAME_SIZE, FRAME_SIZE, self.next as u32)
                .map_err(|e| CameraError::CaptureFailed(e.to_string()))
        }
    }

    impl Drop for ScriptedDevice {
        fn drop(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct ScriptedOpener {
        pub script: Vec<Shot>,
        pub clock: Arc<ManualClock>,
        pub step: Duration,
        pub opens: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
        pub absent: bool,
    }

    impl ScriptedOpener {
        pub(crate) fn new(script: Vec<Shot>, clock: Arc<ManualClock>, step: Duration) -> Self {
            Self {
                script,
                clock,
                step,
                opens: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
                absent: false,
            }
        }
    }

    impl DeviceOpener for ScriptedOpener {
        type Device = ScriptedDevice;

        fn open(&self) -> Result<ScriptedDevice, CameraError> {
            if self.absent {
                return Err(CameraError::DeviceNotFound("/dev/video-test".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedDevice {
                script: self.script.clone(),
                next: 0,
                clock: Arc::clone(&self.clock),
                step: self.step,
                closes: Arc::clone(&self.closes),
            })
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// A whole-frame face whenever the frame is bright.
    struct BrightFrameLocalizer;

    impl FaceLocalizer for BrightFrameLocalizer {
        fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
            if gray.get_pixel(0, 0).0[0] > 128 {
                vec![FaceRegion::new(0, 0, gray.width(), gray.height())]
            } else {
                Vec::new()
            }
        }
    }

    struct AlwaysHappy;

    impl EmotionClassifier for AlwaysHappy {
        fn classify(&self, _crop: &FaceCrop) -> Result<Emotion, ClassifierError> {
            Ok(Emotion::Happy)
        }
    }

    pub(crate) fn test_pipeline() -> Arc<FramePipeline> {
        Arc::new(FramePipeline::new(
            Arc::new(BrightFrameLocalizer),
            Arc::new(AlwaysHappy),
            Annotator::boxes_only(),
        ))
    }

    fn start(
        device: &ExclusiveDevice<ScriptedOpener>,
        clock: &Arc<ManualClock>,
    ) -> Result<StreamGenerator<ScriptedDevice>, StreamError> {
        StreamGenerator::start(device, test_pipeline(), clock.clone())
    }

    async fn next_part(stream: &mut ChunkStream) -> Option<Result<Bytes, StreamError>> {
        std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_next(cx)).await
    }

    #[test]
    fn test_chunk_framing() {
        let chunk = StreamChunk {
            sequence: 0,
            faces: Vec::new(),
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        };
        assert_eq!(
            &chunk.into_bytes()[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n\r\n"
        );
    }

    #[test]
    fn test_full_session_labels_only_face_frames() {
        let clock = Arc::new(ManualClock::new());
        let script = vec![Shot::Face, Shot::Face, Shot::Face, Shot::Plain, Shot::Plain, Shot::Plain];
        let opener = ScriptedOpener::new(script, clock.clone(), Duration::from_millis(900));
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut gen = start(&device, &clock).unwrap();
        let chunks: Vec<StreamChunk> = gen.by_ref().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 6);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u64);
            assert_eq!(&chunk.jpeg[..2], &[0xFF, 0xD8]);
            if i < 3 {
                assert_eq!(chunk.faces.len(), 1);
                assert_eq!(chunk.faces[0].label, FaceLabel::Emotion(Emotion::Happy));
            } else {
                assert!(chunk.faces.is_empty());
            }
        }
        assert_eq!(gen.chunks_emitted(), 6);
        assert_eq!(gen.end(), Some(SessionEnd::Expired));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!device.is_busy());

        drop(gen);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_expiry_is_at_five_seconds() {
        let clock = Arc::new(ManualClock::new());
        let opener = ScriptedOpener::new(vec![Shot::Plain; 100], clock.clone(), Duration::from_millis(100));
        let device = ExclusiveDevice::new(opener);

        let mut gen = start(&device, &clock).unwrap();
        let count = gen.by_ref().count();
        // Reads start at 0.0s, 0.1s, ... 4.9s
        assert_eq!(count, 50);
        assert_eq!(gen.end(), Some(SessionEnd::Expired));
    }

    #[test]
    fn test_absent_device_yields_nothing() {
        let clock = Arc::new(ManualClock::new());
        let mut opener = ScriptedOpener::new(vec![Shot::Face], clock.clone(), Duration::ZERO);
        opener.absent = true;
        let device = ExclusiveDevice::new(opener);

        assert!(matches!(
            start(&device, &clock),
            Err(StreamError::DeviceUnavailable(SessionError::DeviceUnavailable(
                CameraError::DeviceNotFound(_)
            )))
        ));
        assert!(!device.is_busy());
    }

    #[test]
    fn test_capture_failure_ends_stream() {
        let clock = Arc::new(ManualClock::new());
        let script = vec![Shot::Plain, Shot::Face, Shot::Fail, Shot::Plain];
        let opener = ScriptedOpener::new(script, clock.clone(), Duration::from_millis(10));
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut gen = start(&device, &clock).unwrap();
        let chunks: Vec<_> = gen.by_ref().collect();

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
        assert_eq!(gen.end(), Some(SessionEnd::CaptureFailed));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(gen.next().is_none());
    }

    #[test]
    fn test_malformed_frame_yields_one_error() {
        let clock = Arc::new(ManualClock::new());
        let script = vec![Shot::Plain, Shot::Malformed, Shot::Plain];
        let opener = ScriptedOpener::new(script, clock.clone(), Duration::from_millis(10));
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut gen = start(&device, &clock).unwrap();
        assert!(gen.next().unwrap().is_ok());
        assert!(matches!(gen.next(), Some(Err(StreamError::EncodingFailed(_)))));
        assert!(gen.next().is_none());
        assert_eq!(gen.end(), Some(SessionEnd::EncodingFailed));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_start_is_busy() {
        let clock = Arc::new(ManualClock::new());
        let opener = ScriptedOpener::new(vec![Shot::Plain; 4], clock.clone(), Duration::ZERO);
        let opens = opener.opens.clone();
        let device = ExclusiveDevice::new(opener);

        let first = start(&device, &clock).unwrap();
        assert!(matches!(
            start(&device, &clock),
            Err(StreamError::DeviceUnavailable(SessionError::DeviceUnavailable(
                CameraError::DeviceBusy
            )))
        ));
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        drop(first);
        assert!(start(&device, &clock).is_ok());
    }

    #[test]
    fn test_cancel_releases_once() {
        let clock = Arc::new(ManualClock::new());
        let opener = ScriptedOpener::new(vec![Shot::Face; 10], clock.clone(), Duration::ZERO);
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut gen = start(&device, &clock).unwrap();
        assert!(gen.next().is_some());
        gen.cancel();
        assert_eq!(gen.end(), Some(SessionEnd::Cancelled));
        assert!(gen.next().is_none());
        gen.cancel();
        drop(gen);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!device.is_busy());
    }

    #[tokio::test]
    async fn test_stream_yields_parts_then_ends() {
        let clock = Arc::new(ManualClock::new());
        let script = vec![Shot::Face, Shot::Plain, Shot::Fail];
        let opener = ScriptedOpener::new(script, clock.clone(), Duration::from_millis(10));
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut stream = spawn_stream(start(&device, &clock).unwrap()).unwrap();
        for _ in 0..2 {
            let part = next_part(&mut stream).await.unwrap().unwrap();
            assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
            assert!(part.ends_with(b"\r\n\r\n"));
        }
        assert!(next_part(&mut stream).await.is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!device.is_busy());
    }

    #[tokio::test]
    async fn test_stream_is_consumer_paced() {
        let clock = Arc::new(ManualClock::new());
        let step = Duration::from_millis(10);
        let opener = ScriptedOpener::new(vec![Shot::Plain; 20], clock.clone(), step);
        let device = ExclusiveDevice::new(opener);
        let t0 = clock.now();

        let mut stream = spawn_stream(start(&device, &clock).unwrap()).unwrap();
        // Every read advances the clock, so an unchanged clock means no reads.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(clock.now(), t0);

        assert!(next_part(&mut stream).await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(clock.now() - t0, step);
    }

    #[tokio::test]
    async fn test_read_timeout_ends_stream_and_releases() {
        let clock = Arc::new(ManualClock::new());
        let script = vec![Shot::Face, Shot::Stall, Shot::Face];
        let opener = ScriptedOpener::new(script, clock.clone(), Duration::from_millis(10));
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut stream = spawn_stream(start(&device, &clock).unwrap()).unwrap();
        assert!(next_part(&mut stream).await.unwrap().is_ok());
        assert!(next_part(&mut stream).await.is_none());

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!device.is_busy());
        assert!(start(&device, &clock).is_ok());
    }

    #[tokio::test]
    async fn test_stalled_consumer_releases_device() {
        let clock = Arc::new(ManualClock::new());
        let opener = ScriptedOpener::new(vec![Shot::Plain; 50], clock.clone(), Duration::from_millis(10));
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut stream = spawn_stream(start(&device, &clock).unwrap()).unwrap();
        assert!(next_part(&mut stream).await.is_some());
        let stalled_at = std::time::Instant::now();

        // Stop pulling but keep the stream alive.
        while device.is_busy() && stalled_at.elapsed() < Duration::from_secs(3) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!device.is_busy());
        assert!(stalled_at.elapsed() < SESSION_DURATION);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // The stream ends once the producer has given up.
        assert!(next_part(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_device() {
        let clock = Arc::new(ManualClock::new());
        let opener = ScriptedOpener::new(vec![Shot::Face; 50], clock.clone(), Duration::ZERO);
        let closes = opener.closes.clone();
        let device = ExclusiveDevice::new(opener);

        let mut stream = spawn_stream(start(&device, &clock).unwrap()).unwrap();
        assert!(next_part(&mut stream).await.is_some());
        assert!(device.is_busy());
        drop(stream);

        for _ in 0..200 {
            if !device.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!device.is_busy());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
