//! Machine control facade
//!
//! [`Machine`] is the handle other threads use. Requests are enqueued for
//! the dispatcher thread; state is read from immutable snapshots. Listeners
//! are called on a dedicated event thread.

use crate::dispatcher::{Dispatcher, MachineShared};
use crate::pending::{BuildTarget, ExtruderRequest, PendingCommand};
use crate::source::CommandSource;
use parking_lot::Mutex;
use printhost_communication::{Connector, Direction};
use printhost_core::{
    thread_safe_rw_map, Error, MachineError, MachineEvent, MachineListener, MachineListenerHandle,
    MachineState, MachineStatusSnapshot, Result, ThreadSafeRwMap,
};
use printhost_settings::MachineConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type Listeners = ThreadSafeRwMap<String, Arc<dyn MachineListener>>;

/// Handle to a machine and its dispatcher thread
pub struct Machine {
    name: String,
    shared: Arc<MachineShared>,
    listeners: Listeners,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

fn spawn_error(name: &str, e: std::io::Error) -> Error {
    MachineError::ThreadSpawn {
        name: name.to_string(),
        reason: e.to_string(),
    }
    .into()
}

fn deliver_events(mut rx: broadcast::Receiver<MachineEvent>, listeners: Listeners) {
    loop {
        match rx.blocking_recv() {
            Ok(event) => {
                let targets: Vec<_> = listeners.read().values().cloned().collect();
                for listener in &targets {
                    event.deliver_to(listener.as_ref());
                }
                if event == MachineEvent::Shutdown {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Listeners missed {} machine events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Event delivery stopped");
}

impl Machine {
    /// Validate the configuration and start the dispatcher
    ///
    /// The machine starts disconnected; `connector` opens a transport on
    /// every connect request.
    pub fn new(config: MachineConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::other(format!("Invalid machine configuration: {}", e)))?;

        let shared = Arc::new(MachineShared::new(config.dispatcher.event_capacity));
        let listeners: Listeners = thread_safe_rw_map();

        let rx = shared.events.subscribe();
        let event_listeners = Arc::clone(&listeners);
        let event_thread = thread::Builder::new()
            .name("machine-events".to_string())
            .spawn(move || deliver_events(rx, event_listeners))
            .map_err(|e| spawn_error("machine-events", e))?;

        let name = config.name.clone();
        let shutdown_timeout = config.shutdown_timeout();
        let dispatcher = Dispatcher::new(config, connector, Arc::clone(&shared));
        let dispatcher = match thread::Builder::new()
            .name("machine-dispatcher".to_string())
            .spawn(move || dispatcher.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.events.publish(MachineEvent::Shutdown);
                let _ = event_thread.join();
                return Err(spawn_error("machine-dispatcher", e));
            }
        };

        info!("Machine {} created", name);
        Ok(Self {
            name,
            shared,
            listeners,
            dispatcher: Mutex::new(Some(dispatcher)),
            event_thread: Mutex::new(Some(event_thread)),
            shutdown_timeout,
        })
    }

    /// Machine name from the configuration
    pub fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, command: PendingCommand) -> Result<()> {
        if self.shared.is_done() {
            return Err(MachineError::DispatcherStopped.into());
        }
        debug!("Enqueueing {}", command.name());
        self.shared.queue.push(command);
        Ok(())
    }

    /// Connect to the configured port, or to `port` when given
    pub fn connect(&self, port: Option<&str>) -> Result<()> {
        self.enqueue(PendingCommand::Connect {
            port: port.map(str::to_string),
        })
    }

    /// Disconnect from the device
    pub fn disconnect(&self) -> Result<()> {
        self.enqueue(PendingCommand::Disconnect)
    }

    /// Re-run the device handshake
    pub fn reset(&self) -> Result<()> {
        self.enqueue(PendingCommand::Reset)
    }

    /// Stream a job to the connected device
    pub fn build(&self, source: Box<dyn CommandSource>) -> Result<()> {
        self.enqueue(PendingCommand::Build {
            source,
            target: BuildTarget::Device,
        })
    }

    /// Capture a job to a local file; works without a device
    pub fn build_to_file(
        &self,
        source: Box<dyn CommandSource>,
        path: impl Into<PathBuf>,
    ) -> Result<()> {
        self.enqueue(PendingCommand::Build {
            source,
            target: BuildTarget::LocalFile(path.into()),
        })
    }

    /// Capture a job to the device's storage
    pub fn build_to_remote(&self, source: Box<dyn CommandSource>, name: &str) -> Result<()> {
        self.enqueue(PendingCommand::Build {
            source,
            target: BuildTarget::RemoteFile(name.to_string()),
        })
    }

    /// Play a file already stored on the device
    pub fn build_remote(&self, name: &str) -> Result<()> {
        self.enqueue(PendingCommand::PlayRemote {
            name: name.to_string(),
        })
    }

    /// Suspend the running build after the current line
    pub fn pause(&self) -> Result<()> {
        self.enqueue(PendingCommand::Pause)
    }

    /// Resume a paused build
    pub fn unpause(&self) -> Result<()> {
        self.enqueue(PendingCommand::Unpause)
    }

    /// Interrupt the driver from this thread so a sender blocked on the
    /// device buffer lets go before the stop request is dispatched
    fn interrupt_build(&self) {
        if !self.state().has_build() {
            return;
        }
        if let Some(driver) = self.shared.driver() {
            if let Err(e) = driver.interrupt() {
                warn!("Failed to interrupt {}: {}", driver.name(), e);
            }
        }
    }

    /// Stop the build and halt motion
    pub fn stop_motion(&self) -> Result<()> {
        self.interrupt_build();
        self.enqueue(PendingCommand::StopMotion)
    }

    /// Stop the build, halt motion and switch heaters off
    pub fn stop_all(&self) -> Result<()> {
        self.interrupt_build();
        self.enqueue(PendingCommand::StopAll)
    }

    /// Send one instruction outside of a build
    pub fn run_command(&self, instruction: &str) -> Result<()> {
        self.enqueue(PendingCommand::RunCommand(instruction.to_string()))
    }

    /// Run the extruder continuously
    pub fn start_extruder(&self, feedrate: f64, direction: Direction) -> Result<()> {
        self.enqueue(PendingCommand::Extruder(ExtruderRequest::Start {
            feedrate,
            direction,
        }))
    }

    /// Stop a continuously running extruder
    pub fn stop_extruder(&self) -> Result<()> {
        self.enqueue(PendingCommand::Extruder(ExtruderRequest::Stop))
    }

    /// Current status snapshot
    pub fn get_state(&self) -> MachineStatusSnapshot {
        self.shared.snapshot()
    }

    /// Current machine state
    pub fn state(&self) -> MachineState {
        self.shared.snapshot().state
    }

    /// Wait for a snapshot matching `predicate`
    pub fn wait_for_state(
        &self,
        predicate: impl Fn(&MachineStatusSnapshot) -> bool,
        timeout: Duration,
    ) -> Option<MachineStatusSnapshot> {
        self.shared.wait_for_state(predicate, timeout)
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn MachineListener>) -> MachineListenerHandle {
        let handle = MachineListenerHandle::generate();
        self.listeners.write().insert(handle.0.clone(), listener);
        handle
    }

    /// Remove a listener; `false` when it was not registered
    pub fn unsubscribe(&self, handle: &MachineListenerHandle) -> bool {
        self.listeners.write().remove(&handle.0).is_some()
    }

    /// Raw event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<MachineEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the dispatcher and release the device
    ///
    /// Waits at most the configured shutdown timeout.
    pub fn shutdown(&self) -> Result<()> {
        let Some(dispatcher) = self.dispatcher.lock().take() else {
            return Ok(());
        };

        self.shared.queue.push(PendingCommand::Shutdown);
        if let Some(driver) = self.shared.driver() {
            driver.abort_waiters();
        }

        if !self.shared.wait_done(self.shutdown_timeout) {
            warn!("Dispatcher for {} did not stop in time", self.name);
            return Err(MachineError::ShutdownTimeout {
                timeout_ms: self.shutdown_timeout.as_millis() as u64,
            }
            .into());
        }

        if dispatcher.join().is_err() {
            warn!("Dispatcher thread panicked");
        }
        if let Some(events) = self.event_thread.lock().take() {
            if events.join().is_err() {
                warn!("Event thread panicked");
            }
        }
        info!("Machine {} shut down", self.name);
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Machine shutdown: {}", e);
        }
    }
}
