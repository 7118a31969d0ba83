//! Byte transports to the device
//!
//! A [`Transport`] is a bidirectional, line-agnostic byte channel. The
//! protocol driver clones it once so a dedicated reader thread can block on
//! reads while senders write through the original handle.

pub mod serial;
pub mod virtual_printer;

use printhost_core::Result;
use printhost_settings::MachineConfig;
use std::io;
use std::time::Duration;

/// Low-level byte channel to a device
pub trait Transport: Send {
    /// Human-readable name, usually the port
    fn name(&self) -> String;

    /// Write every byte of `data`
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read available bytes; returns `Ok(0)` when the read timed out
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Pulse the reset control line, if the link has one
    fn pulse_reset(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Open a second handle onto the same link
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    /// Release the link
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Parameters for opening a transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout; reads return empty after it elapses
    pub read_timeout: Duration,
}

impl ConnectionParams {
    /// Create parameters for a port with the default read timeout
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout: Duration::from_millis(50),
        }
    }

    /// Connection parameters from the machine configuration
    pub fn from_config(config: &MachineConfig) -> Self {
        Self {
            port: config.connection.port.clone(),
            baud_rate: config.connection.baud_rate,
            read_timeout: config.read_timeout(),
        }
    }

    /// Builder method to override the port
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Builder method to set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Opens transports on demand
///
/// The machine keeps one connector and asks it for a fresh transport on
/// every connect request.
pub trait Connector: Send + Sync {
    /// Open a transport for the given parameters
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_config() {
        let mut config = MachineConfig::default();
        config.connection.port = "COM4".to_string();
        config.connection.read_timeout_ms = 20;

        let params = ConnectionParams::from_config(&config);
        assert_eq!(params.port, "COM4");
        assert_eq!(params.baud_rate, 115200);
        assert_eq!(params.read_timeout, Duration::from_millis(20));

        let params = params.with_port("/dev/ttyACM1");
        assert_eq!(params.port, "/dev/ttyACM1");
    }
}
