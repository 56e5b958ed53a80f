//! Per-camera capture workers.
//!
//! Each configured camera gets one worker that acquires frames, submits
//! them for detection, and publishes motion events and status updates
//! through the shared outbound channel.
//!
//! A capture worker is responsible for:
//! - Opening its frame source (`stub://` synthetic or ffmpeg-decoded)
//! - Submitting frames on the bounded detection channel
//! - Forwarding detection replies as MQTT sensor events
//! - Reporting its own status (`scanning`, `stopped`, `error`)
//!
//! Both channel submissions block under backpressure, but the blocking is
//! sliced so a stop request is observed within one poll interval.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::config::CameraConfig;
use crate::detect::{DetectionRequest, DetectionResult};
use crate::mqtt::PublisherHandle;
use crate::worker::{StopToken, Worker};

/// How long one `next_frame` call may wait before handing control back to
/// the loop so the stop token gets rechecked.
const SOURCE_POLL: Duration = Duration::from_millis(250);

/// Retry slice for blocked channel submissions.
const SUBMIT_POLL: Duration = Duration::from_millis(250);

/// Bounded wait for status updates. Statuses are droppable; a capture
/// worker must not hang on them during shutdown.
const STATUS_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames buffered between the ffmpeg reader thread and the worker.
const DECODE_QUEUE: usize = 4;

/// Synthetic scene length in frames before the scene shifts.
const SCENE_LENGTH: u64 = 50;

const STATUS_SCANNING: &str = "scanning";
const STATUS_STOPPED: &str = "stopped";
const STATUS_ERROR: &str = "error";

/// One decoded RGB frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source frame counter, starting at 1.
    pub seq: u64,
    pub captured_at: SystemTime,
}

// ----------------------------------------------------------------------------
// Frame sources
// ----------------------------------------------------------------------------

/// Camera frame source.
///
/// `stub://` sources generate synthetic scenes; anything else is decoded
/// by an external ffmpeg process.
pub struct CaptureSource {
    backend: SourceBackend,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    Ffmpeg(FfmpegSource),
}

impl CaptureSource {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let backend = if config.source.starts_with("stub://") {
            SourceBackend::Synthetic(SyntheticSource::new(config))
        } else {
            SourceBackend::Ffmpeg(FfmpegSource::spawn(config)?)
        };
        Ok(Self { backend })
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// `None` means no frame was ready yet; the caller decides whether to
    /// keep waiting. An error means the source is gone for good.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.next_frame(timeout),
            SourceBackend::Ffmpeg(source) => source.next_frame(timeout),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Synthetic scene generator for `stub://` sources.
///
/// Frames repeat a deterministic pattern for [`SCENE_LENGTH`] frames, then
/// the scene shifts to a new pattern, which reads as motion downstream.
struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_due: Option<Instant>,
    frame_count: u64,
    scene_state: u8,
    scene_seed: u64,
}

impl SyntheticSource {
    fn new(config: &CameraConfig) -> Self {
        let interval_ms = if config.fps == 0 {
            1_000
        } else {
            (1_000 / config.fps).max(1)
        };
        Self {
            width: config.width,
            height: config.height,
            frame_interval: Duration::from_millis(interval_ms as u64),
            next_due: None,
            frame_count: 0,
            scene_state: 0,
            scene_seed: 0,
        }
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        // Pace output to the configured frame rate.
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let remaining = due - now;
            if remaining > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(remaining);
        }
        self.next_due = Some(Instant::now() + self.frame_interval);

        self.frame_count += 1;
        if self.frame_count.is_multiple_of(SCENE_LENGTH) {
            self.scene_state = self.scene_state.wrapping_add(1);
            self.scene_seed = rand::random();
        }

        Ok(Some(Frame {
            pixels: self.generate_pixels(),
            width: self.width,
            height: self.height,
            seq: self.frame_count,
            captured_at: SystemTime::now(),
        }))
    }

    /// Generate synthetic pixel data.
    ///
    /// Deterministic within a scene so repeated frames read as a still
    /// picture downstream. The seed varies the pattern stride; the scene
    /// counter shifts it, so consecutive scenes never coincide.
    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let stride = 2 * (self.scene_seed % 8) + 1;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64)
                .wrapping_mul(stride)
                .wrapping_add(self.scene_state as u64)
                % 256) as u8;
        }
        pixels
    }
}

// ----------------------------------------------------------------------------
// ffmpeg child-process source
// ----------------------------------------------------------------------------

/// Frames decoded by an external ffmpeg process writing raw RGB to stdout.
///
/// A reader thread slices stdout into frame-sized chunks and hands them
/// over on a small bounded queue. Dropping the source kills the child,
/// which unblocks the reader mid-read.
struct FfmpegSource {
    child: Child,
    frames: Receiver<Vec<u8>>,
    width: u32,
    height: u32,
    seq: u64,
    source: String,
}

impl FfmpegSource {
    fn spawn(config: &CameraConfig) -> Result<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if config.source.starts_with("rtsp://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i")
            .arg(&config.source)
            .arg("-vf")
            .arg(format!("scale={}:{}", config.width, config.height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn ffmpeg for '{}'", config.source))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stderr"))?;

        let frame_bytes = (config.width * config.height * 3) as usize;
        let (tx, rx) = bounded(DECODE_QUEUE);
        thread::spawn(move || read_frames(stdout, frame_bytes, tx));

        let camera = config.name.clone();
        thread::spawn(move || forward_stderr(stderr, camera));

        Ok(Self {
            child,
            frames: rx,
            width: config.width,
            height: config.height,
            seq: 0,
            source: config.source.clone(),
        })
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(pixels) => {
                self.seq += 1;
                Ok(Some(Frame {
                    pixels,
                    width: self.width,
                    height: self.height,
                    seq: self.seq,
                    captured_at: SystemTime::now(),
                }))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("video stream for '{}' ended", self.source))
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_frames(mut stdout: impl Read, frame_bytes: usize, tx: Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; frame_bytes];
    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                if tx.send(buffer.clone()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn forward_stderr(stderr: impl Read, camera: String) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => {
                log::warn!(target: camera.as_str(), "ffmpeg: {}", line)
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

// ----------------------------------------------------------------------------
// Capture worker
// ----------------------------------------------------------------------------

/// Build the capture worker for one camera.
///
/// The worker comes back in Created state; the orchestrator starts it once
/// the broker connection is up.
pub fn capture_worker(
    config: CameraConfig,
    publisher: PublisherHandle,
    detections: Sender<DetectionRequest>,
) -> Worker {
    let name = config.name.clone();
    Worker::new(name, move |token| {
        CaptureUnit::new(config, publisher, detections).run(&token)
    })
}

struct CaptureUnit {
    config: CameraConfig,
    publisher: PublisherHandle,
    detections: Sender<DetectionRequest>,
    replies_tx: Sender<DetectionResult>,
    replies_rx: Receiver<DetectionResult>,
}

impl CaptureUnit {
    fn new(
        config: CameraConfig,
        publisher: PublisherHandle,
        detections: Sender<DetectionRequest>,
    ) -> Self {
        // Replies are unbounded: the detector must never block on a capture
        // worker that is itself blocked submitting to the detector.
        let (replies_tx, replies_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            publisher,
            detections,
            replies_tx,
            replies_rx,
        }
    }

    fn run(&self, token: &StopToken) -> Result<()> {
        let camera = self.config.name.as_str();
        let mut source = match CaptureSource::open(&self.config) {
            Ok(source) => source,
            Err(err) => {
                self.report_status(STATUS_ERROR);
                return Err(err);
            }
        };
        log::info!(target: camera, "capturing from {}", self.config.source);
        self.report_status(STATUS_SCANNING);

        let result = self.pump(&mut source, token);
        match &result {
            Ok(()) => self.report_status(STATUS_STOPPED),
            Err(_) => self.report_status(STATUS_ERROR),
        }
        result
    }

    /// Main loop: forward finished detection results, then submit the next
    /// frame for analysis.
    fn pump(&self, source: &mut CaptureSource, token: &StopToken) -> Result<()> {
        while !token.is_stop_requested() {
            self.forward_results(token)?;
            let Some(frame) = source.next_frame(SOURCE_POLL)? else {
                continue;
            };
            let request = DetectionRequest {
                camera: self.config.name.clone(),
                frame,
                reply: self.replies_tx.clone(),
            };
            if !submit(&self.detections, request, token, "detection")? {
                break;
            }
        }
        Ok(())
    }

    /// Publish any motion events the detector has replied with. Quiet
    /// frames produce no message.
    fn forward_results(&self, token: &StopToken) -> Result<()> {
        loop {
            match self.replies_rx.try_recv() {
                Ok(result) => {
                    if !result.motion_detected {
                        continue;
                    }
                    log::info!(
                        target: self.config.name.as_str(),
                        "motion detected (frame {}, confidence {:.2})",
                        result.frame_seq,
                        result.confidence
                    );
                    let message = self.publisher.detection_message(&result)?;
                    if !submit(self.publisher.sender(), message, token, "outbound")? {
                        return Ok(());
                    }
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn report_status(&self, status: &str) {
        let message = self.publisher.status_message(status);
        match self.publisher.try_publish(message, STATUS_TIMEOUT) {
            Ok(None) => {}
            Ok(Some(_)) => log::debug!(
                target: self.config.name.as_str(),
                "dropped status update '{}': outbound channel full",
                status
            ),
            Err(err) => log::debug!(
                target: self.config.name.as_str(),
                "dropped status update '{}': {}",
                status,
                err
            ),
        }
    }
}

/// Blocking submit honoring channel backpressure while staying responsive
/// to stop requests. Returns `Ok(false)` when a stop arrived before the
/// item was accepted.
fn submit<T>(tx: &Sender<T>, item: T, token: &StopToken, what: &str) -> Result<bool> {
    let mut item = item;
    loop {
        if token.is_stop_requested() {
            return Ok(false);
        }
        match tx.send_timeout(item, SUBMIT_POLL) {
            Ok(()) => return Ok(true),
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => {
                anyhow::bail!("{} channel closed", what)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            name: "front_door".to_string(),
            source: "stub://front_door".to_string(),
            width: 8,
            height: 8,
            fps: 60,
        }
    }

    #[test]
    fn synthetic_source_produces_frames() {
        let config = stub_config();
        let mut source = CaptureSource::open(&config).expect("open stub source");

        let frame = source
            .next_frame(Duration::from_secs(1))
            .expect("next frame")
            .expect("frame ready");
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 8);
        assert_eq!(frame.pixels.len(), 8 * 8 * 3);
        assert_eq!(frame.seq, 1);
    }

    #[test]
    fn synthetic_scene_is_steady_then_shifts() {
        let config = stub_config();
        let mut source = CaptureSource::open(&config).expect("open stub source");

        let mut frames = Vec::new();
        while frames.len() < SCENE_LENGTH as usize {
            if let Some(frame) = source
                .next_frame(Duration::from_secs(1))
                .expect("next frame")
            {
                frames.push(frame);
            }
        }

        // Frames before the scene boundary repeat the same pixels.
        assert_eq!(frames[0].pixels, frames[48].pixels);
        // The boundary frame starts a new scene.
        assert_ne!(frames[48].pixels, frames[49].pixels);
    }

    #[test]
    fn sequence_numbers_increase() {
        let config = stub_config();
        let mut source = CaptureSource::open(&config).expect("open stub source");

        let mut last_seq = 0;
        for _ in 0..5 {
            if let Some(frame) = source
                .next_frame(Duration::from_secs(1))
                .expect("next frame")
            {
                assert!(frame.seq > last_seq);
                last_seq = frame.seq;
            }
        }
        assert!(last_seq >= 1);
    }
}
