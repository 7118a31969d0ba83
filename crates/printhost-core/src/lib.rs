//! # PrintHost Core
//!
//! Core types and utilities for PrintHost.
//! Provides the error taxonomy, the machine state model, build progress and
//! tool telemetry, and the event types published by the machine dispatcher.

pub mod core;
pub mod data;
pub mod error;
pub mod types;

pub use crate::core::{
    event::{EventDispatcher, MachineEvent},
    MachineListener, MachineListenerHandle,
};

pub use data::{BuildMode, BuildProgress, MachineState, MachineStatusSnapshot, ToolStatus};

pub use error::{
    BuildError, ConnectionError, DriverError, Error, MachineError, ProtocolError, Result,
    StorageError,
};

pub use types::{thread_safe_rw_map, ThreadSafeRwMap};
