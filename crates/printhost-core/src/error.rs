//! Error handling for PrintHost
//!
//! Provides error types for every layer of the machine host:
//! - Connection errors (transport, handshake)
//! - Protocol errors (framing, response parsing)
//! - Driver errors (send path outcomes)
//! - Storage errors (device-side file capture and playback)
//! - Build errors (strategies and their destinations)
//! - Machine errors (dispatcher requests and lifecycle)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents errors opening, initializing or keeping a link to the device.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Device did not answer the initialization handshake
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The total time spent waiting in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// No transport is attached
    #[error("Not connected")]
    NotConnected,

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Protocol error type
///
/// Represents problems with the framed line protocol itself.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// A framed line can never fit the device receive buffer
    #[error("Line of {length} bytes exceeds device buffer of {capacity} bytes")]
    LineTooLong {
        /// Wire length of the framed line including the newline.
        length: usize,
        /// Configured device buffer capacity.
        capacity: usize,
    },
}

/// Driver error type
///
/// Outcomes of the protocol driver send path that are not transport failures.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Transient failure; the same instruction should be sent again
    #[error("Retry required: {reason}")]
    Retryable {
        /// Why the send should be retried.
        reason: String,
    },

    /// Sending was interrupted by a stop request
    #[error("Send aborted by stop request")]
    Aborted,

    /// Device reported a hardware fault
    #[error("Device fault: {message}")]
    Fault {
        /// The fault message reported by the device.
        message: String,
    },
}

impl DriverError {
    /// Check whether the failed instruction should be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Retryable { .. } | DriverError::Aborted)
    }
}

/// Storage error type
///
/// Failures reported by device-side storage (SD card) commands.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// No storage medium present or it failed to initialize
    #[error("No storage card available")]
    NoCard,

    /// File could not be opened or created
    #[error("Failed to open remote file {name}")]
    OpenFailed {
        /// The remote file name.
        name: String,
    },

    /// Device did not confirm a storage command in time
    #[error("Storage command '{command}' not confirmed after {timeout_ms}ms")]
    Timeout {
        /// The command awaiting confirmation.
        command: String,
        /// How long the host waited.
        timeout_ms: u64,
    },

    /// Device answered with something unexpected
    #[error("Unexpected storage response: {response}")]
    Unexpected {
        /// The response that was received.
        response: String,
    },
}

/// Build error type
///
/// Failures raised by build strategies that are neither retryable nor terminal.
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    /// The command source could not be read
    #[error("Command source error: {reason}")]
    Source {
        /// The reason the source failed.
        reason: String,
    },

    /// The capture destination could not be written
    #[error("Failed to write {destination}: {reason}")]
    Output {
        /// The capture destination.
        destination: String,
        /// The reason the write failed.
        reason: String,
    },

    /// The build needs a connected device
    #[error("Build requires a connected device")]
    DeviceRequired,
}

/// Machine error type
///
/// Errors from the machine control facade and its dispatcher thread.
#[derive(Error, Debug, Clone)]
pub enum MachineError {
    /// The dispatcher thread is gone
    #[error("Machine dispatcher is not running")]
    DispatcherStopped,

    /// The dispatcher did not stop in time
    #[error("Machine shutdown timed out after {timeout_ms}ms")]
    ShutdownTimeout {
        /// The bounded wait in milliseconds.
        timeout_ms: u64,
    },

    /// A worker thread could not be started
    #[error("Failed to spawn {name} thread: {reason}")]
    ThreadSpawn {
        /// The thread name.
        name: String,
        /// The reason spawning failed.
        reason: String,
    },
}

/// Main error type for PrintHost
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Driver error
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Storage error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Build error
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Machine error
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::ConnectionTimeout { .. })
                | Error::Storage(StorageError::Timeout { .. })
                | Error::Machine(MachineError::ShutdownTimeout { .. })
        )
    }

    /// Check if the failed operation may simply be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Driver(e) if e.is_retryable())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this error means the device itself is unusable
    pub fn is_fatal_device_error(&self) -> bool {
        matches!(
            self,
            Error::Driver(DriverError::Fault { .. })
                | Error::Connection(ConnectionError::ConnectionLost { .. })
                | Error::Connection(ConnectionError::NotConnected)
        )
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
