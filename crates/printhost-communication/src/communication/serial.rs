//! Serial port transport
//!
//! Provides port enumeration and a [`Transport`] over the `serialport`
//! crate for USB-serial printer boards.

use super::{ConnectionParams, Connector, Transport};
use printhost_core::{ConnectionError, Result};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// How long the reset line is held low when pulsing it
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that look like printer controller boards
///
/// Accepted names:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::IoError {
            reason: format!("Failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_printer_port(&port.port_name))
        .map(|port| match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let info = SerialPortInfo::new(
                    &port.port_name,
                    format!(
                        "USB {}",
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                )
                .with_usb_ids(usb.vid, usb.pid);
                match &usb.manufacturer {
                    Some(mfg) => info.with_manufacturer(mfg),
                    None => info,
                }
            }
            _ => SerialPortInfo::new(&port.port_name, "Serial Port"),
        })
        .collect())
}

fn is_printer_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    ["/dev/ttyUSB", "/dev/ttyACM", "/dev/cu.usbserial-", "/dev/cu.usbmodem"]
        .iter()
        .any(|prefix| port_name.starts_with(prefix))
}

/// Serial port transport
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port with the given parameters
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        if params.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be > 0".to_string(),
            }
            .into());
        }

        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(params.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                match e.kind() {
                    serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                        port: params.port.clone(),
                    },
                    _ => ConnectionError::FailedToOpen {
                        port: params.port.clone(),
                        reason: e.to_string(),
                    },
                }
            })?;

        tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);
        Ok(Self {
            port,
            name: params.port.clone(),
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn pulse_reset(&mut self) -> io::Result<()> {
        // Boards with auto-reset restart on the falling edge of DTR
        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(false)?;
        thread::sleep(RESET_PULSE);
        self.port.write_data_terminal_ready(true)?;
        self.port.write_request_to_send(true)?;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port = self.port.try_clone()?;
        Ok(Box::new(SerialTransport {
            port,
            name: self.name.clone(),
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// Connector that opens serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(params)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printer_port_patterns() {
        assert!(is_printer_port("COM3"));
        assert!(is_printer_port("/dev/ttyUSB0"));
        assert!(is_printer_port("/dev/ttyACM1"));
        assert!(is_printer_port("/dev/cu.usbmodem14101"));
        assert!(!is_printer_port("COM"));
        assert!(!is_printer_port("COMX"));
        assert!(!is_printer_port("/dev/ttyS0"));
        assert!(!is_printer_port("/dev/cu.Bluetooth-Incoming-Port"));
    }

    #[test]
    fn test_port_info_builder() {
        let info = SerialPortInfo::new("/dev/ttyACM0", "USB Serial")
            .with_manufacturer("Arduino")
            .with_usb_ids(0x2341, 0x0042);
        assert_eq!(info.manufacturer.as_deref(), Some("Arduino"));
        assert_eq!(info.vid, Some(0x2341));
        assert_eq!(info.pid, Some(0x0042));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let params = ConnectionParams::new("/dev/ttyUSB_printhost_missing", 115200);
        assert!(SerialTransport::open(&params).is_err());
    }
}
