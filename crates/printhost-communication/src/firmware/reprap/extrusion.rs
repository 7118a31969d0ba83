//! Extrusion-rate updater
//!
//! While enabled, a worker thread emits one extruder move per command period,
//! each worth `feedrate * period / 60000` of filament, keeping at most a small
//! number of lines queued on the device.

use super::driver::ProtocolDriver;
use super::framing::format_number;
use parking_lot::{Condvar, Mutex};
use printhost_core::{MachineError, Result};
use printhost_settings::MachineConfig;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where extrusion moves go
pub trait ExtrusionSink: Send + Sync {
    /// Lines sent but not yet acknowledged
    fn queue_depth(&self) -> usize;

    /// Last commanded extruder position
    fn e_position(&self) -> f64;

    /// Send one instruction
    fn send(&self, instruction: &str) -> Result<()>;
}

impl ExtrusionSink for ProtocolDriver {
    fn queue_depth(&self) -> usize {
        ProtocolDriver::queue_depth(self)
    }

    fn e_position(&self) -> f64 {
        ProtocolDriver::e_position(self)
    }

    fn send(&self, instruction: &str) -> Result<()> {
        ProtocolDriver::send(self, instruction)
    }
}

/// Extruder motor direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Push filament
    #[default]
    Forward,
    /// Retract filament
    Reverse,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Updater timing and tool selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrusionConfig {
    /// Time covered by one emitted move
    pub period: Duration,
    /// Queue depth above which a tick sends nothing
    pub max_queued: usize,
    /// Tool to extrude with
    pub tool: u8,
}

impl From<&MachineConfig> for ExtrusionConfig {
    fn from(config: &MachineConfig) -> Self {
        Self {
            period: config.extrusion_period(),
            max_queued: config.extrusion.max_queued_commands,
            tool: config.extrusion.tool_index,
        }
    }
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Not enabled; nothing to do
    Idle,
    /// Device queue is deep enough already
    Throttled,
    /// A move was sent
    Sent {
        /// Signed distance of the move
        distance: f64,
        /// When the move is due to complete
        deadline: Instant,
    },
}

#[derive(Debug, Default)]
struct UpdaterState {
    enabled: bool,
    feedrate: f64,
    direction: Direction,
    deadline: Option<Instant>,
    position: Option<f64>,
    tool_selected: bool,
    shutdown: bool,
}

struct UpdaterInner {
    sink: Arc<dyn ExtrusionSink>,
    config: ExtrusionConfig,
    state: Mutex<UpdaterState>,
    wake: Condvar,
}

impl UpdaterInner {
    fn tick(&self) -> Result<TickOutcome> {
        let (instructions, outcome) = {
            let mut state = self.state.lock();
            if !state.enabled || state.feedrate <= 0.0 {
                return Ok(TickOutcome::Idle);
            }
            if self.sink.queue_depth() > self.config.max_queued {
                return Ok(TickOutcome::Throttled);
            }

            let distance =
                distance_per_period(state.feedrate, self.config.period) * state.direction.sign();
            let now = Instant::now();
            let deadline = state.deadline.map_or(now, |d| d.max(now)) + self.config.period;
            state.deadline = Some(deadline);

            let mut instructions = Vec::with_capacity(2);
            if !state.tool_selected {
                instructions.push(format!("T{}", self.config.tool));
                state.tool_selected = true;
            }
            let target = state.position.unwrap_or_else(|| self.sink.e_position()) + distance;
            state.position = Some(target);
            instructions.push(format!(
                "G1 E{} F{}",
                format_number(target),
                format_number(state.feedrate)
            ));

            (instructions, TickOutcome::Sent { distance, deadline })
        };

        for instruction in &instructions {
            if let Err(e) = self.sink.send(instruction) {
                let mut state = self.state.lock();
                state.position = None;
                state.tool_selected = false;
                return Err(e);
            }
        }
        Ok(outcome)
    }

    fn run(&self) {
        loop {
            let wake_at = match self.tick() {
                Ok(TickOutcome::Idle) => None,
                Ok(TickOutcome::Throttled) => Some(Instant::now() + self.config.period),
                // Stay one period ahead of the device
                Ok(TickOutcome::Sent { deadline, .. }) => Some(
                    deadline
                        .checked_sub(self.config.period)
                        .unwrap_or_else(Instant::now),
                ),
                Err(e) if e.is_retryable() => Some(Instant::now() + self.config.period),
                Err(e) => {
                    warn!("Extrusion stopped: {}", e);
                    self.state.lock().enabled = false;
                    None
                }
            };

            let mut state = self.state.lock();
            if state.shutdown {
                break;
            }
            match wake_at {
                Some(at) => {
                    self.wake.wait_until(&mut state, at);
                }
                None if !state.enabled => self.wake.wait(&mut state),
                None => {
                    self.wake.wait_for(&mut state, self.config.period);
                }
            }
            if state.shutdown {
                break;
            }
        }
        debug!("Extrusion updater stopped");
    }
}

/// Linear distance covered in one period at `feedrate` per minute
pub fn distance_per_period(feedrate: f64, period: Duration) -> f64 {
    feedrate * period.as_millis() as f64 / 60000.0
}

/// Periodic extruder move producer
pub struct ExtrusionUpdater {
    inner: Arc<UpdaterInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExtrusionUpdater {
    /// Create an updater; nothing runs until [`start`](Self::start)
    pub fn new(sink: Arc<dyn ExtrusionSink>, config: ExtrusionConfig) -> Self {
        Self {
            inner: Arc::new(UpdaterInner {
                sink,
                config,
                state: Mutex::new(UpdaterState::default()),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.inner.state.lock().shutdown = false;

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("extrusion-updater".to_string())
            .spawn(move || inner.run())
            .map_err(|e| MachineError::ThreadSpawn {
                name: "extrusion-updater".to_string(),
                reason: e.to_string(),
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker thread and wait for it
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.enabled = false;
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Extrusion updater panicked");
            }
        }
    }

    /// Start extruding at `feedrate` in `direction`
    pub fn enable(&self, feedrate: f64, direction: Direction) {
        let mut state = self.inner.state.lock();
        state.enabled = true;
        state.feedrate = feedrate;
        state.direction = direction;
        state.deadline = None;
        state.position = None;
        state.tool_selected = false;
        info!(
            "Extruding {:?} at {} per minute",
            direction,
            format_number(feedrate)
        );
        self.inner.wake.notify_all();
    }

    /// Stop extruding
    pub fn disable(&self) {
        let mut state = self.inner.state.lock();
        if state.enabled {
            info!("Extrusion off");
        }
        state.enabled = false;
        self.inner.wake.notify_all();
    }

    /// Change the feedrate without restarting
    pub fn set_feedrate(&self, feedrate: f64) {
        self.inner.state.lock().feedrate = feedrate;
    }

    /// Change the direction without restarting
    pub fn set_direction(&self, direction: Direction) {
        self.inner.state.lock().direction = direction;
    }

    /// Whether extrusion is on
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Distance one tick covers at the current feedrate
    pub fn distance_per_tick(&self) -> f64 {
        distance_per_period(self.inner.state.lock().feedrate, self.inner.config.period)
    }

    /// Run one tick on the calling thread
    pub fn tick(&self) -> Result<TickOutcome> {
        self.inner.tick()
    }
}

impl Drop for ExtrusionUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}
