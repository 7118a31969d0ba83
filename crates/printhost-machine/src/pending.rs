//! Operator requests and the dispatcher's command queue
//!
//! Any thread may push a [`PendingCommand`]; only the dispatcher drains the
//! queue. Pushing always wakes a dispatcher blocked on an idle machine.

use crate::source::CommandSource;
use parking_lot::{Condvar, Mutex};
use printhost_communication::Direction;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Where a build's instructions go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    /// Stream to the connected device
    Device,
    /// Capture to a local file
    LocalFile(PathBuf),
    /// Capture to the device's own storage under a name
    RemoteFile(String),
}

/// Manual extruder control
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtruderRequest {
    /// Run continuously at a feedrate
    Start {
        /// Feedrate in distance per minute
        feedrate: f64,
        /// Extrude or retract
        direction: Direction,
    },
    /// Stop running
    Stop,
}

/// An operator request awaiting the dispatcher
pub enum PendingCommand {
    /// Attach to a device; `None` uses the configured port
    Connect {
        /// Port override
        port: Option<String>,
    },
    /// Detach from the device
    Disconnect,
    /// Re-run the device handshake
    Reset,
    /// Start a build
    Build {
        /// Job to run
        source: Box<dyn CommandSource>,
        /// Destination
        target: BuildTarget,
    },
    /// Play a file stored on the device
    PlayRemote {
        /// Remote file name
        name: String,
    },
    /// Suspend the running build
    Pause,
    /// Resume a paused build
    Unpause,
    /// Stop the build and halt motion
    StopMotion,
    /// Stop the build, halt motion and switch heaters off
    StopAll,
    /// Send one instruction outside of a build
    RunCommand(String),
    /// Manual extruder control
    Extruder(ExtruderRequest),
    /// Exit the dispatcher loop
    Shutdown,
}

impl PendingCommand {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::Reset => "reset",
            Self::Build { .. } => "build",
            Self::PlayRemote { .. } => "play-remote",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::StopMotion => "stop-motion",
            Self::StopAll => "stop-all",
            Self::RunCommand(_) => "run-command",
            Self::Extruder(_) => "extruder",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { port } => f.debug_struct("Connect").field("port", port).finish(),
            Self::Build { source, target } => f
                .debug_struct("Build")
                .field("lines", &source.line_count())
                .field("target", target)
                .finish(),
            Self::PlayRemote { name } => f.debug_struct("PlayRemote").field("name", name).finish(),
            Self::RunCommand(instruction) => f.debug_tuple("RunCommand").field(instruction).finish(),
            Self::Extruder(request) => f.debug_tuple("Extruder").field(request).finish(),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Default)]
struct QueueState {
    commands: VecDeque<PendingCommand>,
    woken: bool,
}

/// Thread-safe FIFO of pending commands
#[derive(Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a command and wake the dispatcher
    pub fn push(&self, command: PendingCommand) {
        self.state.lock().commands.push_back(command);
        self.ready.notify_all();
    }

    /// Wake the dispatcher without enqueuing anything
    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.ready.notify_all();
    }

    /// Take every queued command in arrival order
    pub fn drain(&self) -> Vec<PendingCommand> {
        let mut state = self.state.lock();
        state.woken = false;
        state.commands.drain(..).collect()
    }

    /// Block until a command arrives or the queue is woken
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.commands.is_empty() && !state.woken {
            self.ready.wait(&mut state);
        }
    }

    /// Like [`wait`](Self::wait) but for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.commands.is_empty() && !state.woken {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return;
            }
        }
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.state.lock().commands.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().commands.is_empty()
    }
}
