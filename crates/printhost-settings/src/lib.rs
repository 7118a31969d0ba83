//! PrintHost Settings Crate
//!
//! Handles the machine configuration: an explicitly constructed value that is
//! passed to the machine at creation time, loadable from TOML or JSON.

pub mod config;
pub mod error;

pub use config::{
    BuildSettings, ConnectionSettings, DispatcherSettings, ExtrusionSettings, MachineConfig,
    OptionalHaltPolicy, PollingSettings, ProtocolSettings, RemoteSettings,
};
pub use error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
