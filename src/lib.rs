//! Vigil NVR
//!
//! A single-process network video recorder daemon: one capture worker per
//! configured camera, one motion detector, and one MQTT publisher, glued
//! together by two bounded channels and a lifecycle orchestrator.
//!
//! # Architecture
//!
//! Workers never share state directly. Capture workers submit frames on
//! the bounded detection channel and publish events on the bounded
//! outbound channel; both channels block their producers at capacity, so
//! a slow consumer throttles the pipeline instead of growing a queue or
//! dropping work.
//!
//! Startup order matters: the publisher and detector come up first, the
//! broker connection is established and verified, and only then do the
//! capture workers start. Shutdown stops capture workers one at a time in
//! creation order and lets the background workers drain out on their own.
//!
//! # Module Structure
//!
//! - `worker`: start/stop/join lifecycle and cooperative stop tokens
//! - `capture`: per-camera frame acquisition and the capture loop
//! - `detect`: the detection worker and its backend seam
//! - `mqtt`: broker session, publisher worker, per-camera handles
//! - `logging`: duplicate-collapsing log pipeline
//! - `cleanup`: recording retention passes
//! - `config`: TOML configuration with environment overrides
//! - `orchestrator`: startup order, wait loop, shutdown sequence

pub mod capture;
pub mod cleanup;
pub mod config;
pub mod detect;
pub mod logging;
pub mod mqtt;
pub mod orchestrator;
pub mod worker;

pub use capture::{capture_worker, CaptureSource, Frame};
pub use config::{validate_camera_name, CameraConfig, VigilConfig};
pub use detect::{detection_loop, DetectionRequest, DetectionResult, DetectorBackend, MotionStub};
pub use logging::{LogPipeline, StyleMode};
pub use mqtt::{availability_topic, publisher_loop, MqttPublisher, OutboundMessage, PublisherHandle};
pub use orchestrator::{
    detection_channel, outbound_channel, run, run_with_shutdown, DETECTION_CHANNEL_CAPACITY,
    OUTBOUND_CHANNEL_CAPACITY,
};
pub use worker::{StopToken, Worker, WorkerState};
