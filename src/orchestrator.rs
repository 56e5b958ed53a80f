//! Worker lifecycle orchestration.
//!
//! The orchestrator owns both bounded channels and every worker handle.
//! Startup is strictly ordered: cleanup (non-fatal), publisher worker,
//! detector worker, capture worker construction, broker connect (fatal),
//! capture worker start. No capture worker runs before the broker session
//! is acknowledged.
//!
//! Shutdown is triggered by SIGINT or SIGTERM, which are handled
//! identically: every capture worker is stopped and joined sequentially in
//! creation order. The publisher and detector are deliberately never
//! stopped; their loops end on their own once the capture workers (the
//! only remaining producers) are gone.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::mpsc;
use std::time::Duration;

use crate::capture::capture_worker;
use crate::cleanup;
use crate::config::VigilConfig;
use crate::detect::{detection_loop, DetectionRequest, MotionStub};
use crate::mqtt::{publisher_loop, MqttPublisher, OutboundMessage};
use crate::worker::Worker;

/// Outbound channel capacity: absorbs publisher hiccups without stalling
/// capture workers immediately.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 50;

/// Detection channel capacity: keeps at most two frames in flight so the
/// detector always sees near-live input. A full channel throttles the
/// capture workers instead of queueing stale frames.
pub const DETECTION_CHANNEL_CAPACITY: usize = 2;

/// Poll slice for the main wait loop.
const WAIT_POLL: Duration = Duration::from_millis(250);

/// The channel every capture worker publishes into and the publisher
/// worker drains. Producers block once [`OUTBOUND_CHANNEL_CAPACITY`]
/// messages are queued; nothing is dropped or reordered.
pub fn outbound_channel() -> (Sender<OutboundMessage>, Receiver<OutboundMessage>) {
    bounded(OUTBOUND_CHANNEL_CAPACITY)
}

/// The channel capture workers submit frames into and the detector
/// drains. Submission blocks while [`DETECTION_CHANNEL_CAPACITY`] requests
/// are in flight.
pub fn detection_channel() -> (Sender<DetectionRequest>, Receiver<DetectionRequest>) {
    bounded(DETECTION_CHANNEL_CAPACITY)
}

/// Run the daemon until a termination request arrives.
pub fn run(config: VigilConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install termination handler")?;

    run_with_shutdown(config, shutdown_rx)
}

/// Startup sequence, wait loop, and shutdown. Split from [`run`] so tests
/// can drive termination without process signals.
pub fn run_with_shutdown(config: VigilConfig, shutdown: mpsc::Receiver<()>) -> Result<()> {
    // Cleanup failures never block startup.
    if let Err(err) = cleanup::run_once(&config.cleanup) {
        log::warn!("startup cleanup pass failed: {}", err);
    }
    let _cleanup_worker = match cleanup::start_recurring(config.cleanup.clone()) {
        Ok(worker) => Some(worker),
        Err(err) => {
            log::warn!("could not start recurring cleanup: {}", err);
            None
        }
    };

    let (outbound_tx, outbound_rx) = outbound_channel();
    let mut publisher = MqttPublisher::new(config.mqtt.clone());

    let client = publisher.client();
    let mut publisher_worker = Worker::new("publisher", move |token| {
        publisher_loop(client, outbound_rx, token);
        Ok(())
    });
    publisher_worker.start()?;
    log::debug!("publisher worker started");

    let (detection_tx, detection_rx) = detection_channel();
    let mut detector_worker = Worker::new("detector", move |token| {
        detection_loop(detection_rx, Box::new(MotionStub::new()), token);
        Ok(())
    });
    detector_worker.start()?;
    log::debug!("detector worker started");

    // Capture workers are constructed up front but must not start until
    // the broker session is up; their loops assume a live connection.
    let mut capture_workers = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        let handle = publisher.handle_for(&outbound_tx, &camera.name);
        capture_workers.push(capture_worker(camera.clone(), handle, detection_tx.clone()));
    }

    let _mqtt = publisher.connect()?;

    if let Err(err) = start_capture_workers(&mut capture_workers) {
        shutdown_capture_workers(&mut capture_workers);
        return Err(err);
    }

    // Past this point only the capture workers hold senders, so both
    // daemon loops end on their own once the capture workers are gone.
    drop(detection_tx);
    drop(outbound_tx);

    wait_for_shutdown(&shutdown, &capture_workers);

    shutdown_capture_workers(&mut capture_workers);
    log::info!("shutdown complete");
    Ok(())
}

fn start_capture_workers(workers: &mut [Worker]) -> Result<()> {
    for worker in workers.iter_mut() {
        worker.start()?;
        log::info!("started capture worker '{}'", worker.name());
    }
    Ok(())
}

/// Block until a termination request arrives or every capture worker has
/// exited on its own. Worker exits observed here are unexpected (no stop
/// was requested) and are logged as such.
fn wait_for_shutdown(shutdown: &mpsc::Receiver<()>, workers: &[Worker]) {
    let mut reported = vec![false; workers.len()];
    loop {
        match shutdown.recv_timeout(WAIT_POLL) {
            Ok(()) => {
                log::info!("termination requested, stopping capture workers");
                return;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::warn!("termination handler dropped, stopping capture workers");
                return;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let mut all_finished = true;
        for (worker, reported) in workers.iter().zip(reported.iter_mut()) {
            if worker.is_finished() {
                if !*reported {
                    *reported = true;
                    log::error!("capture worker '{}' exited unexpectedly", worker.name());
                }
            } else {
                all_finished = false;
            }
        }
        if all_finished {
            log::warn!("all capture workers have exited, shutting down");
            return;
        }
    }
}

/// Stop and join capture workers strictly in creation order: worker i is
/// fully stopped before worker i+1 is signaled. A failed join is logged
/// and never blocks the remaining workers from their stop request.
fn shutdown_capture_workers(workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        log::info!("stopping capture worker '{}'", worker.name());
        worker.stop();
        if let Err(err) = worker.join() {
            log::error!("capture worker '{}' shutdown failed: {}", worker.name(), err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn spinning_worker(name: &str) -> Worker {
        Worker::new(name, |token| {
            while !token.is_stop_requested() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        })
    }

    #[test]
    fn channel_capacities_match_contract() {
        let (tx, _rx) = outbound_channel();
        assert_eq!(tx.capacity(), Some(OUTBOUND_CHANNEL_CAPACITY));
        let (tx, _rx) = detection_channel();
        assert_eq!(tx.capacity(), Some(DETECTION_CHANNEL_CAPACITY));
    }

    #[test]
    fn shutdown_is_sequential_in_creation_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut workers: Vec<Worker> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                Worker::new(format!("capture-{i}"), move |token| {
                    while !token.is_stop_requested() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    order.lock().expect("order lock").push(i);
                    Ok(())
                })
            })
            .collect();

        for worker in &mut workers {
            worker.start().expect("start");
        }
        // Give every worker time to reach its loop.
        thread::sleep(Duration::from_millis(30));

        shutdown_capture_workers(&mut workers);

        // Worker i exits before worker i+1 is even signaled, so the exit
        // order must match creation order exactly.
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
        for worker in &workers {
            assert_eq!(worker.state(), WorkerState::Stopped);
        }
    }

    #[test]
    fn wait_returns_on_termination_signal() {
        let (tx, rx) = mpsc::channel();
        let mut workers = vec![spinning_worker("spin")];
        workers[0].start().expect("start");

        tx.send(()).expect("signal");
        wait_for_shutdown(&rx, &workers);

        // The wait observes the signal; stopping is the shutdown
        // sequence's job.
        assert!(!workers[0].is_finished());
        shutdown_capture_workers(&mut workers);
        assert!(workers[0].is_finished());
    }

    #[test]
    fn wait_returns_once_all_workers_exit() {
        let (_tx, rx) = mpsc::channel();
        let mut workers = vec![Worker::new("oneshot", |_token| Ok(()))];
        workers[0].start().expect("start");

        // No signal is ever sent; the exit of the only worker ends the
        // wait on its own.
        wait_for_shutdown(&rx, &workers);
        assert!(workers[0].is_finished());
    }
}
