//! RepRap protocol driver
//!
//! Delivers an ordered stream of instructions to the device as numbered,
//! checksummed lines, without overrunning the device receive buffer.
//!
//! Locking: one mutex guards the in-flight buffer, the line counter and the
//! last-known values. The transport writer is only ever locked while that
//! state lock is held, so wire order always matches buffer order. Senders are
//! serialized by a separate send lock taken before the state lock.

use super::framing::{command_code, word_value, LineProtocol, RepRapProtocol};
use super::inflight::InFlightBuffer;
use super::response_parser::{DeviceResponse, StorageNotice};
use crate::communication::Transport;
use parking_lot::{Condvar, Mutex};
use printhost_core::{ConnectionError, DriverError, Error, ProtocolError, Result, ToolStatus};
use printhost_settings::MachineConfig;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Instruction that resets the device line counter
const LINE_RESET: &str = "M110";

/// Driver configuration and device policy
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Device receive buffer size in bytes
    pub max_buffer_size: usize,
    /// Apply 5D firmware rewrites
    pub five_d: bool,
    /// Per-attempt handshake timeout
    pub handshake_timeout: Duration,
    /// Number of handshake attempts
    pub handshake_retries: u32,
    /// Pulse the reset line before the handshake
    pub pulse_reset: bool,
    /// Upper bound on waiting for the start banner after a reset pulse
    pub reset_settle: Duration,
    /// Instructions sent after a successful handshake
    pub post_connect: Vec<String>,
    /// Instruction written ahead of the data stream on interrupt
    pub stop_instruction: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from(&MachineConfig::default())
    }
}

impl From<&MachineConfig> for DriverConfig {
    fn from(config: &MachineConfig) -> Self {
        Self {
            max_buffer_size: config.protocol.max_buffer_size,
            five_d: config.protocol.five_d,
            handshake_timeout: config.handshake_timeout(),
            handshake_retries: config.connection.handshake_retries.max(1),
            pulse_reset: config.connection.pulse_reset,
            reset_settle: config.reset_settle(),
            post_connect: config.protocol.post_connect.clone(),
            stop_instruction: config.protocol.stop_motion_instruction.clone(),
        }
    }
}

/// Conditions after which the driver can no longer deliver instructions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    /// Device reported a hardware fault
    Fault(String),
    /// Transport failed
    ConnectionLost(String),
}

impl FatalCondition {
    /// Convert into the error returned to senders
    pub fn to_error(&self) -> Error {
        match self {
            FatalCondition::Fault(message) => DriverError::Fault {
                message: message.clone(),
            }
            .into(),
            FatalCondition::ConnectionLost(reason) => ConnectionError::ConnectionLost {
                reason: reason.clone(),
            }
            .into(),
        }
    }
}

impl std::fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalCondition::Fault(message) => write!(f, "Device fault: {}", message),
            FatalCondition::ConnectionLost(reason) => write!(f, "Connection lost: {}", reason),
        }
    }
}

/// Callback run on the reader thread when a fatal condition is first seen
pub type FatalHook = Box<dyn Fn(&FatalCondition) + Send + Sync>;

struct DriverState {
    inflight: InFlightBuffer,
    line_number: u32,
    /// Framed lines the device asked for again, sent ahead of new lines
    retransmit: VecDeque<String>,
    /// One entry per unacknowledged unnumbered control line: how many
    /// numbered lines ahead of it on the wire are still unacknowledged
    control_lines: VecDeque<usize>,
    feedrate: f64,
    e_position: f64,
    tool: ToolStatus,
    start_received: bool,
    initialized: bool,
    aborted: bool,
    connected: bool,
    fatal: Option<FatalCondition>,
    storage: VecDeque<StorageNotice>,
}

impl DriverState {
    fn new(capacity: usize) -> Self {
        Self {
            inflight: InFlightBuffer::new(capacity),
            line_number: 0,
            retransmit: VecDeque::new(),
            control_lines: VecDeque::new(),
            feedrate: 0.0,
            e_position: 0.0,
            tool: ToolStatus::default(),
            start_received: false,
            initialized: false,
            aborted: false,
            connected: true,
            fatal: None,
            storage: VecDeque::new(),
        }
    }

    fn reset_session(&mut self) {
        self.inflight.clear();
        self.retransmit.clear();
        self.control_lines.clear();
        self.line_number = 0;
        self.start_received = false;
        self.initialized = false;
        self.aborted = false;
        self.fatal = None;
        self.storage.clear();
    }

    /// Update last-known values from an outgoing instruction
    fn track(&mut self, instruction: &str) {
        match command_code(instruction) {
            Some(('G', _)) => {
                if let Some(feedrate) = word_value(instruction, 'F') {
                    self.feedrate = feedrate;
                }
                if let Some(position) = word_value(instruction, 'E') {
                    self.e_position = position;
                }
            }
            Some(('M', 104 | 109)) => {
                if let Some(target) = word_value(instruction, 'S') {
                    self.tool.target_temperature = target;
                }
            }
            Some(('M', 140 | 190)) => {
                if let Some(target) = word_value(instruction, 'S') {
                    self.tool.platform_target_temperature = target;
                }
            }
            _ => {}
        }
    }

    /// Credit one `ok` to whichever line is oldest on the wire
    fn credit_acknowledgment(&mut self) {
        if self.control_lines.front() == Some(&0) {
            self.control_lines.pop_front();
            return;
        }
        if self.inflight.pop_oldest().is_some() {
            self.numbered_line_settled();
        } else if self.control_lines.pop_front().is_none() {
            debug!("Acknowledgment with nothing in flight");
        }
    }

    /// A numbered line left the wire ahead of every pending control line
    fn numbered_line_settled(&mut self) {
        for ahead in self.control_lines.iter_mut() {
            *ahead = ahead.saturating_sub(1);
        }
    }

    fn update_temperatures(&mut self, tool: Option<f64>, platform: Option<f64>) {
        if let Some(t) = tool {
            self.tool.temperature = t;
        }
        if let Some(b) = platform {
            self.tool.platform_temperature = b;
        }
    }

    fn check_sendable(&self) -> Result<()> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.to_error());
        }
        if !self.connected {
            return Err(ConnectionError::NotConnected.into());
        }
        if self.aborted {
            return Err(DriverError::Aborted.into());
        }
        Ok(())
    }
}

struct DriverInner {
    config: DriverConfig,
    protocol: Box<dyn LineProtocol>,
    state: Mutex<DriverState>,
    /// Signalled whenever in-flight capacity may have been freed
    capacity: Condvar,
    /// Signalled on handshake, banner and storage responses
    responses: Condvar,
    writer: Mutex<Option<Box<dyn Transport>>>,
    send_lock: Mutex<()>,
    running: AtomicBool,
    fatal_hook: Mutex<Option<FatalHook>>,
}

impl DriverInner {
    /// Write one line; callers hold the state lock
    fn transmit(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        let transport = writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        transport.write_all(&bytes)?;
        trace!(">> {}", line);
        Ok(())
    }

    fn set_fatal(&self, state: &mut DriverState, condition: FatalCondition) {
        if state.fatal.is_some() {
            return;
        }
        error!("{}", condition);
        state.fatal = Some(condition.clone());
        self.capacity.notify_all();
        self.responses.notify_all();
        if let Some(hook) = self.fatal_hook.lock().as_ref() {
            hook(&condition);
        }
    }

    fn handle_line(&self, line: &str) {
        let Some(response) = self.protocol.parse_response(line) else {
            return;
        };
        trace!("<< {}", line);

        let mut state = self.state.lock();
        match response {
            DeviceResponse::Ok {
                tool_temperature,
                platform_temperature,
            } => {
                state.credit_acknowledgment();
                state.initialized = true;
                state.update_temperatures(tool_temperature, platform_temperature);
                self.flush_retransmits(&mut state);
                self.capacity.notify_all();
                self.responses.notify_all();
            }
            DeviceResponse::Temperature {
                tool_temperature,
                platform_temperature,
            } => state.update_temperatures(tool_temperature, platform_temperature),
            DeviceResponse::Start => {
                info!("Device reported start");
                state.start_received = true;
                state.line_number = 0;
                self.responses.notify_all();
            }
            DeviceResponse::Resend(target) => {
                self.handle_resend(&mut state, target, line);
                self.capacity.notify_all();
            }
            DeviceResponse::Fault(message) => {
                self.set_fatal(&mut state, FatalCondition::Fault(message));
            }
            DeviceResponse::Error(message) => warn!("Device error: {}", message),
            DeviceResponse::Storage(notice) => {
                debug!("Storage: {:?}", notice);
                state.storage.push_back(notice);
                self.responses.notify_all();
            }
            DeviceResponse::Echo(message) => debug!("Device: {}", message),
            DeviceResponse::Unknown(text) => warn!("Unknown response: {}", text),
        }
    }

    /// Queue the oldest unacknowledged line for retransmission, resynchronizing
    /// the device line counter first when the request does not match it
    fn handle_resend(&self, state: &mut DriverState, target: Option<u32>, raw: &str) {
        let Some(entry) = state.inflight.pop_oldest() else {
            warn!("Resend requested with nothing in flight: {}", raw);
            return;
        };
        // The rejected line will not be acknowledged where it was
        state.numbered_line_settled();

        let buffered = self.protocol.line_number_of(&entry.line);
        // The device must accept the retransmitted line next, whatever it asked for
        let resync_to = match (target, buffered) {
            (Some(t), Some(b)) if t == b => None,
            (Some(t), Some(b)) => {
                warn!("Device asked for line {} but line {} is oldest in flight", t, b);
                Some(b.saturating_sub(1))
            }
            (None, Some(b)) => {
                warn!("Unreadable resend target '{}'", raw);
                Some(b.saturating_sub(1))
            }
            (_, None) => None,
        };

        if let Some(number) = resync_to {
            warn!("Resynchronizing device line counter to {}", number);
            state
                .retransmit
                .push_back(self.protocol.frame(number, LINE_RESET));
        }

        debug!("Retransmitting {}", entry.line);
        state.retransmit.push_back(entry.line);
        self.flush_retransmits(state);
    }

    /// Write an unnumbered line outside flow control
    fn transmit_control(&self, state: &mut DriverState, line: &str) -> Result<()> {
        if let Err(e) = self.transmit(line) {
            let condition = FatalCondition::ConnectionLost(e.to_string());
            self.set_fatal(state, condition.clone());
            return Err(condition.to_error());
        }
        let ahead = state.inflight.len();
        state.control_lines.push_back(ahead);
        state.track(line);
        Ok(())
    }

    /// Send queued retransmissions while there is room
    fn flush_retransmits(&self, state: &mut DriverState) {
        while let Some(line) = state.retransmit.front().cloned() {
            if !state.inflight.has_room(&line) && !state.inflight.is_empty() {
                break;
            }
            state.retransmit.pop_front();
            if let Err(e) = self.transmit(&line) {
                self.set_fatal(state, FatalCondition::ConnectionLost(e.to_string()));
                return;
            }
            state.inflight.push(line);
        }
    }
}

fn reader_loop(inner: Arc<DriverInner>, mut transport: Box<dyn Transport>) {
    let mut pending: Vec<u8> = Vec::with_capacity(128);
    let mut buf = [0u8; 256];

    while inner.running.load(Ordering::Acquire) {
        match transport.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                for &byte in &buf[..n] {
                    match byte {
                        b'\n' => {
                            let line = String::from_utf8_lossy(&pending).trim().to_string();
                            pending.clear();
                            if !line.is_empty() {
                                inner.handle_line(&line);
                            }
                        }
                        b'\r' => {}
                        _ => pending.push(byte),
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if inner.running.load(Ordering::Acquire) {
                    let mut state = inner.state.lock();
                    inner.set_fatal(&mut state, FatalCondition::ConnectionLost(e.to_string()));
                }
                break;
            }
        }
    }
    debug!("Response reader stopped");
}

/// Protocol driver for RepRap style firmware
pub struct ProtocolDriver {
    inner: Arc<DriverInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl ProtocolDriver {
    /// Attach to a transport and run the initialization handshake
    ///
    /// On failure the transport is released and no driver is returned.
    pub fn connect(transport: Box<dyn Transport>, config: DriverConfig) -> Result<Self> {
        let protocol = Box::new(RepRapProtocol::new(config.five_d));
        let driver = Self::open(transport, config, protocol)?;
        if let Err(e) = driver.initialize() {
            driver.close();
            return Err(e);
        }
        Ok(driver)
    }

    /// Attach to a transport and start the response reader, without a handshake
    pub fn open(
        transport: Box<dyn Transport>,
        config: DriverConfig,
        protocol: Box<dyn LineProtocol>,
    ) -> Result<Self> {
        let name = transport.name();
        let reader_transport = transport
            .try_clone()
            .map_err(|e| ConnectionError::IoError {
                reason: format!("Failed to clone transport {}: {}", name, e),
            })?;

        let inner = Arc::new(DriverInner {
            state: Mutex::new(DriverState::new(config.max_buffer_size)),
            config,
            protocol,
            capacity: Condvar::new(),
            responses: Condvar::new(),
            writer: Mutex::new(Some(transport)),
            send_lock: Mutex::new(()),
            running: AtomicBool::new(true),
            fatal_hook: Mutex::new(None),
        });

        let reader_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("response-reader".to_string())
            .spawn(move || reader_loop(reader_inner, reader_transport))
            .map_err(|e| ConnectionError::IoError {
                reason: format!("Failed to start response reader: {}", e),
            })?;

        info!("Attached to {}", name);
        Ok(Self {
            inner,
            reader: Mutex::new(Some(handle)),
            name,
        })
    }

    /// Transport name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the initialization handshake
    ///
    /// Optionally pulses the reset line and waits for the start banner, then
    /// sends a line counter reset and waits for its acknowledgment, retrying
    /// up to the configured count. On timeout all session state is cleared.
    pub fn initialize(&self) -> Result<()> {
        let config = &self.inner.config;
        self.inner.state.lock().reset_session();

        if config.pulse_reset {
            {
                let _state = self.inner.state.lock();
                let mut writer = self.inner.writer.lock();
                if let Some(transport) = writer.as_mut() {
                    transport
                        .pulse_reset()
                        .map_err(|e| ConnectionError::IoError {
                            reason: format!("Failed to pulse reset: {}", e),
                        })?;
                }
            }
            let deadline = Instant::now() + config.reset_settle;
            let mut state = self.inner.state.lock();
            while !state.start_received {
                if self.inner.responses.wait_until(&mut state, deadline).timed_out() {
                    debug!("No start banner after reset pulse");
                    break;
                }
            }
        }

        let mut acknowledged = false;
        for attempt in 1..=config.handshake_retries {
            {
                let mut state = self.inner.state.lock();
                state.inflight.clear();
                state.retransmit.clear();
                state.initialized = false;
            }

            self.send(LINE_RESET)?;

            let deadline = Instant::now() + config.handshake_timeout;
            let mut state = self.inner.state.lock();
            while !state.initialized && state.fatal.is_none() {
                if self.inner.responses.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if let Some(fatal) = &state.fatal {
                return Err(fatal.to_error());
            }
            if state.initialized {
                acknowledged = true;
                break;
            }
            warn!(
                "Handshake attempt {} of {} timed out",
                attempt, config.handshake_retries
            );
        }

        if !acknowledged {
            self.inner.state.lock().reset_session();
            let waited = config.handshake_timeout * config.handshake_retries;
            return Err(ConnectionError::ConnectionTimeout {
                timeout_ms: waited.as_millis() as u64,
            }
            .into());
        }

        info!("Handshake with {} complete", self.name);
        for instruction in &config.post_connect {
            self.send(instruction)?;
        }
        Ok(())
    }

    /// Send one instruction
    ///
    /// Blocks while the device buffer has no room for the framed line.
    /// Returns `Ok` without sending when nothing is left after cleaning.
    pub fn send(&self, instruction: &str) -> Result<()> {
        let Some(prepared) = self.inner.protocol.prepare(instruction) else {
            return Ok(());
        };

        let _sender = self.inner.send_lock.lock();
        let mut state = self.inner.state.lock();
        state.check_sendable()?;
        state.track(&prepared);

        loop {
            state.check_sendable()?;

            let numbered = self
                .inner
                .protocol
                .assign_line_number(&prepared, state.line_number);
            let framed = self.inner.protocol.frame(numbered.number, &numbered.body);

            if !state.inflight.fits_at_all(&framed) {
                return Err(ProtocolError::LineTooLong {
                    length: InFlightBuffer::wire_length(&framed),
                    capacity: state.inflight.capacity(),
                }
                .into());
            }

            if state.retransmit.is_empty() && state.inflight.has_room(&framed) {
                let previous = state.line_number;
                state.line_number = numbered.number;
                state.inflight.push(framed.clone());

                if let Err(e) = self.inner.transmit(&framed) {
                    state.inflight.release_newest(&framed);
                    state.line_number = previous;
                    let condition = FatalCondition::ConnectionLost(e.to_string());
                    self.inner.set_fatal(&mut state, condition.clone());
                    return Err(condition.to_error());
                }
                return Ok(());
            }

            self.inner.capacity.wait(&mut state);
        }
    }

    /// Deliver the stop instruction ahead of the data stream
    ///
    /// Marks the driver aborted so blocked and future senders fail with
    /// [`DriverError::Aborted`] until [`resume_sending`](Self::resume_sending).
    /// The stop line is written unnumbered and does not wait for capacity.
    pub fn interrupt(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.aborted = true;
        self.inner.capacity.notify_all();

        if !state.connected || state.fatal.is_some() {
            return Ok(());
        }

        let instruction = self.inner.config.stop_instruction.trim().to_string();
        info!("Interrupting with {}", instruction);
        self.inner.transmit_control(&mut state, &instruction)
    }

    /// Send one instruction unnumbered, without waiting for buffer room
    ///
    /// Works while other senders are blocked or aborted. The acknowledgment
    /// is credited after the numbered lines already in flight.
    pub fn send_control(&self, instruction: &str) -> Result<()> {
        let Some(prepared) = self.inner.protocol.prepare(instruction) else {
            return Ok(());
        };
        let mut state = self.inner.state.lock();
        if let Some(fatal) = &state.fatal {
            return Err(fatal.to_error());
        }
        if !state.connected {
            return Err(ConnectionError::NotConnected.into());
        }
        debug!("Control line {}", prepared);
        self.inner.transmit_control(&mut state, &prepared)
    }

    /// Wake blocked senders with [`DriverError::Aborted`] without writing anything
    pub fn abort_waiters(&self) {
        self.inner.state.lock().aborted = true;
        self.inner.capacity.notify_all();
    }

    /// Allow sending again after an interrupt
    pub fn resume_sending(&self) {
        self.inner.state.lock().aborted = false;
    }

    /// Detach from the transport and stop the response reader
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.connected = false;
            if let Some(mut transport) = self.inner.writer.lock().take() {
                if let Err(e) = transport.close() {
                    debug!("Error closing {}: {}", self.name, e);
                }
            }
            self.inner.capacity.notify_all();
            self.inner.responses.notify_all();
        }

        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                warn!("Response reader panicked");
            }
        }
        info!("Detached from {}", self.name);
    }

    /// True when every transmitted line has been acknowledged
    pub fn is_finished(&self) -> bool {
        let state = self.inner.state.lock();
        state.inflight.is_empty() && state.retransmit.is_empty()
    }

    /// Block until [`is_finished`](Self::is_finished) or the timeout elapses
    pub fn wait_until_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !(state.inflight.is_empty() && state.retransmit.is_empty()) {
            if state.fatal.is_some() || !state.connected {
                return false;
            }
            if self.inner.capacity.wait_until(&mut state, deadline).timed_out() {
                return state.inflight.is_empty() && state.retransmit.is_empty();
            }
        }
        true
    }

    /// Lines sent or queued for retransmission but not yet acknowledged
    pub fn queue_depth(&self) -> usize {
        let state = self.inner.state.lock();
        state.inflight.len() + state.retransmit.len()
    }

    /// Bytes currently in flight
    pub fn in_flight_bytes(&self) -> usize {
        self.inner.state.lock().inflight.total_bytes()
    }

    /// Line number of the most recently framed line
    pub fn line_number(&self) -> u32 {
        self.inner.state.lock().line_number
    }

    /// Last commanded feedrate
    pub fn feedrate(&self) -> f64 {
        self.inner.state.lock().feedrate
    }

    /// Last commanded extruder position
    pub fn e_position(&self) -> f64 {
        self.inner.state.lock().e_position
    }

    /// Last known tool telemetry
    pub fn tool_status(&self) -> ToolStatus {
        self.inner.state.lock().tool
    }

    /// Whether the start banner was seen since the last handshake
    pub fn start_received(&self) -> bool {
        self.inner.state.lock().start_received
    }

    /// Fatal condition, if one occurred
    pub fn fatal_condition(&self) -> Option<FatalCondition> {
        self.inner.state.lock().fatal.clone()
    }

    /// Whether the transport is still attached
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Install the callback run when a fatal condition is first seen
    pub fn set_fatal_hook(&self, hook: FatalHook) {
        *self.inner.fatal_hook.lock() = Some(hook);
    }

    /// Drop storage notices received so far
    pub fn clear_storage_notices(&self) {
        self.inner.state.lock().storage.clear();
    }

    /// Wait for the next storage notice
    pub fn next_storage_notice(&self, timeout: Duration) -> Option<StorageNotice> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(notice) = state.storage.pop_front() {
                return Some(notice);
            }
            if state.fatal.is_some() || !state.connected {
                return None;
            }
            if self.inner.responses.wait_until(&mut state, deadline).timed_out() {
                return state.storage.pop_front();
            }
        }
    }
}

impl Drop for ProtocolDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_config_from_machine_config() {
        let mut machine = MachineConfig::default();
        machine.protocol.max_buffer_size = 64;
        machine.connection.handshake_retries = 5;
        let config = DriverConfig::from(&machine);
        assert_eq!(config.max_buffer_size, 64);
        assert_eq!(config.handshake_retries, 5);
        assert_eq!(config.stop_instruction, "M410");
        assert_eq!(config.post_connect, vec!["G90".to_string()]);
    }

    #[test]
    fn test_state_tracks_last_known_values() {
        let mut state = DriverState::new(128);
        state.track("G1 X10 E2.5 F1200");
        state.track("M104 S210");
        state.track("M140 S60");
        state.track("M92 E400");
        assert_eq!(state.feedrate, 1200.0);
        assert_eq!(state.e_position, 2.5);
        assert_eq!(state.tool.target_temperature, 210.0);
        assert_eq!(state.tool.platform_target_temperature, 60.0);

        state.track("G92 E0");
        assert_eq!(state.e_position, 0.0);
    }

    #[test]
    fn test_control_acknowledgment_waits_for_earlier_lines() {
        let mut state = DriverState::new(128);
        state.inflight.push("N1 G28*18".to_string());
        state.inflight.push("N2 G1 X5*97".to_string());
        state.control_lines.push_back(state.inflight.len());
        state.inflight.push("N3 G1 X6*98".to_string());

        state.credit_acknowledgment();
        state.credit_acknowledgment();
        assert_eq!(state.inflight.len(), 1);
        assert_eq!(state.control_lines.front(), Some(&0));

        state.credit_acknowledgment();
        assert!(state.control_lines.is_empty());
        assert_eq!(state.inflight.len(), 1);

        state.credit_acknowledgment();
        assert_eq!(state.inflight.len(), 0);
    }

    #[test]
    fn test_fatal_condition_errors() {
        let err = FatalCondition::Fault("Extruder Fail".to_string()).to_error();
        assert!(err.is_fatal_device_error());
        let err = FatalCondition::ConnectionLost("eof".to_string()).to_error();
        assert!(err.is_connection_error());
    }
}
