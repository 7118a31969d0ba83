//! # PrintHost
//!
//! Host software for RepRap-style 3D printers and similar G-code machines:
//! - Numbered, checksummed line protocol with flow control and resend recovery
//! - Builds streamed to the device, captured to a local file, captured to the
//!   device's SD card, or played from the SD card
//! - A single dispatcher thread owning the machine state, with listeners
//!   notified on a separate event thread
//!
//! ## Architecture
//!
//! PrintHost is organized as a workspace with multiple crates:
//!
//! 1. **printhost-core** - Errors, machine state model, events, listeners
//! 2. **printhost-settings** - Machine configuration (TOML/JSON)
//! 3. **printhost-communication** - Transports, RepRap protocol driver, SD storage, extrusion
//! 4. **printhost-machine** - Command sources, build strategies, dispatcher, `Machine`
//! 5. **printhost** - Command line front end that integrates all crates

pub use printhost_communication::{
    list_ports, ConnectionParams, Connector, Direction, ProtocolDriver, SerialConnector,
    SerialPortInfo, Transport, VirtualConnector, VirtualPrinter,
};

pub use printhost_core::{
    BuildMode, BuildProgress, Error, MachineEvent, MachineListener, MachineListenerHandle,
    MachineState, MachineStatusSnapshot, Result, ToolStatus,
};

pub use printhost_machine::{
    BuildStrategy, CommandSource, FileSource, Machine, StringListSource,
};

pub use printhost_settings::MachineConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output on stderr, keeping stdout for command output
/// - RUST_LOG environment variable support, `info` by default
/// - Thread names, so dispatcher and reader lines can be told apart
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
