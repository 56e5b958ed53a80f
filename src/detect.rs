//! Motion detection.
//!
//! A single detector worker drains the bounded request channel and replies
//! on each request's per-worker channel. The backend sits behind a trait
//! seam; the shipped backend is a frame-hash stub, which keeps the daemon
//! runnable end to end without any inference runtime. A real model plugs in
//! behind the same contract.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

use crate::capture::Frame;
use crate::worker::StopToken;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pixel sample size used for the changed-fraction estimate.
const SAMPLE_TARGET: usize = 4096;

/// One frame submitted for analysis, with the channel the result goes
/// back on.
pub struct DetectionRequest {
    pub camera: String,
    pub frame: Frame,
    pub reply: Sender<DetectionResult>,
}

/// Outcome of analyzing one frame. Serializes into the MQTT sensor
/// payload as-is.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionResult {
    pub camera: String,
    pub frame_seq: u64,
    pub motion_detected: bool,
    /// Fraction of sampled pixel bytes that changed since the previous
    /// frame from the same camera.
    pub confidence: f64,
}

/// Detection backend seam.
pub trait DetectorBackend: Send {
    fn detect(&mut self, camera: &str, frame: &Frame) -> DetectionResult;
}

struct FrameSignature {
    hash: [u8; 32],
    sample: Vec<u8>,
}

/// Frame-hash motion stub: reports motion whenever a camera's pixel hash
/// changes, with the changed fraction of a sparse pixel sample as a coarse
/// confidence. The first frame from a camera never counts as motion.
pub struct MotionStub {
    last: HashMap<String, FrameSignature>,
}

impl MotionStub {
    pub fn new() -> Self {
        Self {
            last: HashMap::new(),
        }
    }
}

impl Default for MotionStub {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for MotionStub {
    fn detect(&mut self, camera: &str, frame: &Frame) -> DetectionResult {
        let hash = pixel_hash(&frame.pixels);
        let sample = sample_pixels(&frame.pixels);
        let (motion_detected, confidence) = match self.last.get(camera) {
            None => (false, 0.0),
            Some(previous) if previous.hash == hash => (false, 0.0),
            Some(previous) => (true, changed_fraction(&previous.sample, &sample)),
        };
        self.last
            .insert(camera.to_string(), FrameSignature { hash, sample });
        DetectionResult {
            camera: camera.to_string(),
            frame_seq: frame.seq,
            motion_detected,
            confidence,
        }
    }
}

fn pixel_hash(pixels: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pixels);
    hasher.finalize().into()
}

fn sample_pixels(pixels: &[u8]) -> Vec<u8> {
    let step = (pixels.len() / SAMPLE_TARGET).max(1);
    pixels.iter().step_by(step).copied().collect()
}

fn changed_fraction(previous: &[u8], current: &[u8]) -> f64 {
    let len = previous.len().min(current.len());
    if len == 0 {
        return 0.0;
    }
    let changed = previous
        .iter()
        .zip(current)
        .filter(|(a, b)| a != b)
        .count();
    changed as f64 / len as f64
}

/// Drain the detection channel until every producer is gone or a stop is
/// requested. Replies are best-effort: a capture worker that already
/// exited simply loses its result.
pub fn detection_loop(
    requests: Receiver<DetectionRequest>,
    mut backend: Box<dyn DetectorBackend>,
    token: StopToken,
) {
    loop {
        if token.is_stop_requested() {
            break;
        }
        match requests.recv_timeout(POLL_INTERVAL) {
            Ok(request) => {
                let result = backend.detect(&request.camera, &request.frame);
                let _ = request.reply.try_send(result);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("detection loop finished");
}
