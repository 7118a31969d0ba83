//! Periodic telemetry sampling
//!
//! The poller never talks to the device itself; it enqueues a run-command
//! request so the dispatcher stays the only thread driving the machine.

use crate::pending::{CommandQueue, PendingCommand};
use parking_lot::{Condvar, Mutex};
use printhost_core::{MachineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

struct PollerSignal {
    stopped: Mutex<bool>,
    suspended: AtomicBool,
    wake: Condvar,
}

/// Enqueues a status query at a fixed interval
pub struct StatusPoller {
    signal: Arc<PollerSignal>,
    worker: Option<JoinHandle<()>>,
}

impl StatusPoller {
    /// Start polling with `instruction` every `interval`
    ///
    /// A sample is skipped while other requests are still queued.
    pub fn start(queue: Arc<CommandQueue>, instruction: String, interval: Duration) -> Result<Self> {
        let signal = Arc::new(PollerSignal {
            stopped: Mutex::new(false),
            suspended: AtomicBool::new(false),
            wake: Condvar::new(),
        });

        let worker_signal = Arc::clone(&signal);
        let worker = thread::Builder::new()
            .name("status-poller".to_string())
            .spawn(move || {
                debug!("Polling with {} every {:?}", instruction, interval);
                let mut stopped = worker_signal.stopped.lock();
                while !*stopped {
                    worker_signal.wake.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    if worker_signal.suspended.load(Ordering::Acquire) {
                        continue;
                    }
                    if queue.is_empty() {
                        trace!("Status sample");
                        queue.push(PendingCommand::RunCommand(instruction.clone()));
                    }
                }
                debug!("Status poller stopped");
            })
            .map_err(|e| MachineError::ThreadSpawn {
                name: "status-poller".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            signal,
            worker: Some(worker),
        })
    }

    /// Skip samples until [`resume`](Self::resume)
    pub fn suspend(&self) {
        debug!("Status polling suspended");
        self.signal.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        if self.signal.suspended.swap(false, Ordering::AcqRel) {
            debug!("Status polling resumed");
        }
    }

    /// Stop polling and wait for the worker
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Status poller panicked");
            }
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
