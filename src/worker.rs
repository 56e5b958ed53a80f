//! Worker lifecycle.
//!
//! Every long-running unit in the daemon (publisher, detector, cleanup,
//! per-camera capture) runs as a `Worker`: one named OS thread plus a shared
//! lifecycle state. Cancellation is cooperative: `stop` records a request and
//! the loop observes its `StopToken` at a safe point and returns on its own.
//! `join` blocks until the thread has exited, whether the exit was clean, an
//! error, or a panic.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Lifecycle of a worker. There is no transition out of `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed; the thread has not been spawned yet.
    Created,
    /// The thread is running and no stop has been requested.
    Running,
    /// Stop requested; the loop has not exited yet.
    StopRequested,
    /// The thread has exited (cleanly, with an error, or by panicking).
    Stopped,
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOP_REQUESTED: u8 = 2;
const STATE_STOPPED: u8 = 3;

fn decode_state(raw: u8) -> WorkerState {
    match raw {
        STATE_CREATED => WorkerState::Created,
        STATE_RUNNING => WorkerState::Running,
        STATE_STOP_REQUESTED => WorkerState::StopRequested,
        _ => WorkerState::Stopped,
    }
}

/// Cooperative cancellation handle passed into a worker body.
///
/// Loops are expected to check it at least once per poll interval; blocking
/// operations inside worker loops use the timeout variants so the check is
/// never starved.
#[derive(Clone, Debug)]
pub struct StopToken {
    state: Arc<AtomicU8>,
}

impl StopToken {
    pub fn is_stop_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_STOP_REQUESTED
    }
}

/// Records `Stopped` when the thread exits, panic included.
struct StoppedGuard {
    state: Arc<AtomicU8>,
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
    }
}

type WorkerBody = Box<dyn FnOnce(StopToken) -> Result<()> + Send + 'static>;

/// A named worker thread with an explicit start/stop/join lifecycle.
pub struct Worker {
    name: String,
    state: Arc<AtomicU8>,
    body: Option<WorkerBody>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker in the `Created` state. The body does not run until
    /// `start` is called.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopToken) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            state: Arc::new(AtomicU8::new(STATE_CREATED)),
            body: Some(Box::new(body)),
            join: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    /// True once the thread has exited. Non-blocking; used by the
    /// orchestrator's health poll.
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }

    /// Spawn the worker thread. Errors if the worker was already started.
    pub fn start(&mut self) -> Result<()> {
        let body = self
            .body
            .take()
            .ok_or_else(|| anyhow!("worker '{}' already started", self.name))?;
        let token = StopToken {
            state: Arc::clone(&self.state),
        };
        let guard_state = Arc::clone(&self.state);
        let name = self.name.clone();

        // Running must be visible before the body can observe the token;
        // the guard moves the state to Stopped on any exit path.
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _guard = StoppedGuard { state: guard_state };
                if let Err(err) = body(token) {
                    log::error!("worker '{}' stopped: {}", name, err);
                }
            });
        match spawned {
            Ok(handle) => {
                self.join = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.state.store(STATE_STOPPED, Ordering::SeqCst);
                Err(anyhow!("failed to spawn worker '{}': {}", self.name, err))
            }
        }
    }

    /// Request the loop to exit. Idempotent; a no-op unless the worker is
    /// currently running.
    pub fn stop(&self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOP_REQUESTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Block until the thread has exited. Returns an error if the body
    /// panicked. Immediate on a worker that was never started or was
    /// already joined.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.join.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| anyhow!("worker '{}' panicked", self.name))
    }
}
