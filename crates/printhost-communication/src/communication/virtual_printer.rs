//! In-process virtual printer
//!
//! An agreeable RepRap firmware living behind a [`Transport`]: it checks line
//! numbers and checksums, acknowledges every accepted line, reports
//! temperatures and keeps SD card files in memory. Tests script it through
//! the [`VirtualPrinter`] handle.

use super::{ConnectionParams, Connector, Transport};
use crate::firmware::reprap::framing::{command_code, word_value, RepRapProtocol};
use parking_lot::{Condvar, Mutex};
use printhost_core::Result;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a read waits for output before reporting a timeout
const READ_WAIT: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct SdCard {
    files: HashMap<String, Vec<String>>,
    capturing: Option<String>,
    selected: Option<String>,
    printing: bool,
    played: usize,
}

#[derive(Debug)]
struct PrinterState {
    auto_ack: bool,
    last_line: u32,
    fail_next_checksum: bool,
    linked: bool,
    pending: Vec<u8>,
    output: VecDeque<u8>,
    held: Option<VecDeque<u8>>,
    written: Vec<String>,
    tool_temperature: f64,
    tool_target: f64,
    platform_temperature: f64,
    platform_target: f64,
    sd: SdCard,
}

impl PrinterState {
    fn new() -> Self {
        Self {
            auto_ack: true,
            last_line: 0,
            fail_next_checksum: false,
            linked: true,
            pending: Vec::new(),
            output: VecDeque::new(),
            held: None,
            written: Vec::new(),
            tool_temperature: 21.0,
            tool_target: 0.0,
            platform_temperature: 20.0,
            platform_target: 0.0,
            sd: SdCard::default(),
        }
    }

    fn reply(&mut self, line: &str) {
        let output = self.held.as_mut().unwrap_or(&mut self.output);
        output.extend(line.as_bytes());
        output.push_back(b'\n');
    }

    fn receive(&mut self, line: &str) {
        self.written.push(line.to_string());
        if !self.auto_ack {
            return;
        }

        let body = if line.starts_with(['N', 'n']) {
            match self.accept_numbered(line) {
                Some(body) => body,
                None => return,
            }
        } else {
            line.trim().to_string()
        };
        self.execute(&body);
    }

    /// Validate a numbered line; `None` when a resend was requested
    fn accept_numbered(&mut self, line: &str) -> Option<String> {
        let decoded = RepRapProtocol::decode(line).filter(|_| !self.fail_next_checksum);
        let Some((number, body)) = decoded else {
            self.fail_next_checksum = false;
            let expected = self.last_line + 1;
            self.reply(&format!("Error:checksum mismatch, Last Line: {}", self.last_line));
            self.reply(&format!("Resend:{}", expected));
            return None;
        };

        if let Some(('M', 110)) = command_code(&body) {
            self.last_line = word_value(&body, 'N').map(|n| n as u32).unwrap_or(number);
            return Some(body);
        }

        if number != self.last_line + 1 {
            let expected = self.last_line + 1;
            self.reply(&format!(
                "Error:Line Number is not Last Line Number+1, Last Line: {}",
                self.last_line
            ));
            self.reply(&format!("Resend:{}", expected));
            return None;
        }

        self.last_line = number;
        Some(body)
    }

    fn execute(&mut self, body: &str) {
        if let Some(name) = self.sd.capturing.clone() {
            if command_code(body) != Some(('M', 29)) {
                if let Some(file) = self.sd.files.get_mut(&name) {
                    file.push(body.to_string());
                }
                self.reply("ok");
                return;
            }
        }

        match command_code(body) {
            Some(('M', 105)) => {
                let report = format!(
                    "ok T:{:.1} /{:.1} B:{:.1} /{:.1}",
                    self.tool_temperature,
                    self.tool_target,
                    self.platform_temperature,
                    self.platform_target
                );
                self.reply(&report);
                return;
            }
            Some(('M', 104 | 109)) => {
                if let Some(target) = word_value(body, 'S') {
                    self.tool_target = target;
                    self.tool_temperature = target.max(21.0);
                }
            }
            Some(('M', 140 | 190)) => {
                if let Some(target) = word_value(body, 'S') {
                    self.platform_target = target;
                    self.platform_temperature = target.max(20.0);
                }
            }
            Some(('M', 28)) => {
                let name = argument(body);
                self.sd.files.insert(name.clone(), Vec::new());
                self.sd.capturing = Some(name.clone());
                self.reply(&format!("Writing to file: {}", name));
            }
            Some(('M', 29)) => {
                self.sd.capturing = None;
                self.reply("Done saving file.");
            }
            Some(('M', 23)) => {
                let name = argument(body);
                match self.sd.files.get(&name) {
                    Some(lines) => {
                        let size = file_size(lines);
                        self.reply(&format!("File opened: {} Size: {}", name, size));
                        self.reply("File selected");
                        self.sd.selected = Some(name);
                        self.sd.played = 0;
                    }
                    None => self.reply(&format!("open failed, File: {}.", name)),
                }
            }
            Some(('M', 24)) => {
                self.sd.printing = self.sd.selected.is_some();
            }
            Some(('M', 27)) => self.report_playback(),
            _ => {}
        }
        self.reply("ok");
    }

    /// Report playback progress, advancing one stored line per query
    fn report_playback(&mut self) {
        let playing = match &self.sd.selected {
            Some(name) if self.sd.printing => self.sd.files.get(name).cloned(),
            _ => None,
        };
        let Some(lines) = playing else {
            self.reply("Not SD printing");
            return;
        };

        self.sd.played = (self.sd.played + 1).min(lines.len());
        if self.sd.played >= lines.len() {
            self.sd.printing = false;
            self.reply("Done printing file");
        } else {
            let done = file_size(&lines[..self.sd.played]);
            self.reply(&format!("SD printing byte {}/{}", done, file_size(&lines)));
        }
    }
}

fn argument(body: &str) -> String {
    body.split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default()
}

fn file_size(lines: &[String]) -> usize {
    lines.iter().map(|l| l.len() + 1).sum()
}

struct Shared {
    state: Mutex<PrinterState>,
    output_ready: Condvar,
    input_ready: Condvar,
}

/// Handle for scripting and inspecting a virtual printer
#[derive(Clone)]
pub struct VirtualPrinter {
    shared: Arc<Shared>,
}

impl VirtualPrinter {
    /// Create a printer that acknowledges everything
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PrinterState::new()),
                output_ready: Condvar::new(),
                input_ready: Condvar::new(),
            }),
        }
    }

    /// A transport connected to this printer
    pub fn transport(&self) -> Box<dyn Transport> {
        self.shared.state.lock().linked = true;
        Box::new(VirtualTransport {
            shared: Arc::clone(&self.shared),
        })
    }

    /// When off, lines are recorded and nothing is answered
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.state.lock().auto_ack = enabled;
    }

    /// Queue a raw response line for the host
    pub fn inject_response(&self, line: &str) {
        self.shared.state.lock().reply(line);
        self.shared.output_ready.notify_all();
    }

    /// Queue `count` plain acknowledgments
    pub fn acknowledge(&self, count: usize) {
        let mut state = self.shared.state.lock();
        for _ in 0..count {
            state.reply("ok");
        }
        self.shared.output_ready.notify_all();
    }

    /// Keep executing lines but withhold every response until released
    pub fn hold_responses(&self) {
        let mut state = self.shared.state.lock();
        if state.held.is_none() {
            state.held = Some(VecDeque::new());
        }
    }

    /// Deliver withheld responses and stop holding
    pub fn release_responses(&self) {
        let mut state = self.shared.state.lock();
        if let Some(held) = state.held.take() {
            state.output.extend(held);
        }
        self.shared.output_ready.notify_all();
    }

    /// Reject the next numbered line as corrupted
    pub fn fail_next_checksum(&self) {
        self.shared.state.lock().fail_next_checksum = true;
    }

    /// Break the link; reads and writes fail until a new transport is opened
    pub fn unplug(&self) {
        self.shared.state.lock().linked = false;
        self.shared.output_ready.notify_all();
    }

    /// Every line received so far, as written on the wire
    pub fn written_lines(&self) -> Vec<String> {
        self.shared.state.lock().written.clone()
    }

    /// Forget recorded lines
    pub fn clear_written(&self) {
        self.shared.state.lock().written.clear();
    }

    /// Wait until at least `count` lines were received
    pub fn wait_for_written(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.written.len() < count {
            if self
                .shared
                .input_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.written.len() >= count;
            }
        }
        true
    }

    /// Store a file on the virtual SD card
    pub fn add_file(&self, name: &str, lines: &[&str]) {
        self.shared
            .state
            .lock()
            .sd
            .files
            .insert(name.to_string(), lines.iter().map(|l| l.to_string()).collect());
    }

    /// Contents of a file on the virtual SD card
    pub fn file(&self, name: &str) -> Option<Vec<String>> {
        self.shared.state.lock().sd.files.get(name).cloned()
    }

    /// Current tool and platform target temperatures
    pub fn targets(&self) -> (f64, f64) {
        let state = self.shared.state.lock();
        (state.tool_target, state.platform_target)
    }
}

impl Default for VirtualPrinter {
    fn default() -> Self {
        Self::new()
    }
}

struct VirtualTransport {
    shared: Arc<Shared>,
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "virtual printer unplugged")
}

impl Transport for VirtualTransport {
    fn name(&self) -> String {
        "virtual".to_string()
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if !state.linked {
            return Err(unplugged());
        }

        for &byte in data {
            if byte == b'\n' {
                let raw = std::mem::take(&mut state.pending);
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if !line.is_empty() {
                    state.receive(&line);
                }
            } else if byte != b'\r' {
                state.pending.push(byte);
            }
        }

        self.shared.input_ready.notify_all();
        self.shared.output_ready.notify_all();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + READ_WAIT;
        let mut state = self.shared.state.lock();
        loop {
            if !state.linked {
                return Err(unplugged());
            }
            if !state.output.is_empty() {
                let n = buf.len().min(state.output.len());
                for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if self
                .shared
                .output_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(0);
            }
        }
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.last_line = 0;
        state.sd.capturing = None;
        state.sd.printing = false;
        state.reply("start");
        self.shared.output_ready.notify_all();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(VirtualTransport {
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Connector that hands out transports to one virtual printer
#[derive(Clone, Default)]
pub struct VirtualConnector {
    printer: VirtualPrinter,
}

impl VirtualConnector {
    /// Connect to an existing printer
    pub fn new(printer: VirtualPrinter) -> Self {
        Self { printer }
    }

    /// The printer behind this connector
    pub fn printer(&self) -> &VirtualPrinter {
        &self.printer
    }
}

impl Connector for VirtualConnector {
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
        tracing::info!("Opening virtual printer in place of {}", params.port);
        Ok(self.printer.transport())
    }
}
