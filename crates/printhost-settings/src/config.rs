//! Machine configuration for PrintHost
//!
//! Provides configuration file handling and validation.
//! Supports JSON and TOML file formats, stored by default in the
//! platform-specific configuration directory.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (port, baud rate, handshake)
//! - Protocol settings (device buffer, firmware dialect, control instructions)
//! - Extrusion settings (rate updater period and queue depth)
//! - Build settings (warmup/cooldown, optional halt policy, simulation)
//! - Polling, remote storage and dispatcher timing

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port name
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Read timeout of the response reader in milliseconds
    pub read_timeout_ms: u64,
    /// How long to wait for the handshake acknowledgment, per attempt
    pub handshake_timeout_ms: u64,
    /// Number of handshake attempts
    pub handshake_retries: u32,
    /// Pulse the reset control line before the handshake
    pub pulse_reset: bool,
    /// Upper bound on waiting for the start banner after a reset pulse
    pub reset_settle_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            read_timeout_ms: 50,
            handshake_timeout_ms: 1000,
            handshake_retries: 3,
            pulse_reset: false,
            reset_settle_ms: 2000,
        }
    }
}

/// Line protocol and device policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Device receive buffer size in bytes
    pub max_buffer_size: usize,
    /// Apply rewrites for 5D firmware (drops legacy extruder M-codes)
    pub five_d: bool,
    /// Instructions sent after a successful handshake
    pub post_connect: Vec<String>,
    /// Instruction delivered ahead of the data stream on stop requests
    pub stop_motion_instruction: String,
    /// Instructions that switch all heaters off
    pub heaters_off: Vec<String>,
    /// Instruction that makes the device report temperatures
    pub temperature_query: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 128,
            five_d: true,
            post_connect: vec!["G90".to_string()],
            stop_motion_instruction: "M410".to_string(),
            heaters_off: vec!["M104 S0".to_string(), "M140 S0".to_string()],
            temperature_query: "M105".to_string(),
        }
    }
}

/// Extrusion-rate updater settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrusionSettings {
    /// Duration covered by one emitted extrusion command
    pub command_period_ms: u64,
    /// Queue depth above which the updater holds back
    pub max_queued_commands: usize,
    /// Tool the extrusion commands address
    pub tool_index: u8,
}

impl Default for ExtrusionSettings {
    fn default() -> Self {
        Self {
            command_period_ms: 500,
            max_queued_commands: 2,
            tool_index: 0,
        }
    }
}

/// What to do when a build reaches an optional halt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionalHaltPolicy {
    /// Keep building
    Continue,
    /// End the build
    Stop,
}

impl std::fmt::Display for OptionalHaltPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Build settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Instructions run before every build
    pub warmup: Vec<String>,
    /// Instructions run after every build
    pub cooldown: Vec<String>,
    /// Answer used for optional halts when no operator prompt is installed
    pub optional_halt: OptionalHaltPolicy,
    /// Feed direct builds through the in-process simulator as well
    pub simulate: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            warmup: Vec::new(),
            cooldown: Vec::new(),
            optional_halt: OptionalHaltPolicy::Continue,
            simulate: false,
        }
    }
}

/// Status polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Poll the device for temperatures while connected
    pub enabled: bool,
    /// Polling interval in milliseconds
    pub interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
        }
    }
}

/// Remote storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Minimum time between playback status queries
    pub poll_interval_ms: u64,
    /// How long to wait for a storage command to be confirmed
    pub response_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            response_timeout_ms: 2000,
        }
    }
}

/// Dispatcher timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Bounded wait for the dispatcher thread on shutdown
    pub shutdown_timeout_ms: u64,
    /// Poll interval while a build waits for the device to drain
    pub finish_poll_ms: u64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5000,
            finish_poll_ms: 10,
            event_capacity: 256,
        }
    }
}

/// Complete machine configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Machine name shown in logs
    pub name: String,
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Protocol settings
    pub protocol: ProtocolSettings,
    /// Extrusion settings
    pub extrusion: ExtrusionSettings,
    /// Build settings
    pub build: BuildSettings,
    /// Polling settings
    pub polling: PollingSettings,
    /// Remote storage settings
    pub remote: RemoteSettings,
    /// Dispatcher settings
    pub dispatcher: DispatcherSettings,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "RepRap".to_string(),
            connection: ConnectionSettings::default(),
            protocol: ProtocolSettings::default(),
            extrusion: ExtrusionSettings::default(),
            build: BuildSettings::default(),
            polling: PollingSettings::default(),
            remote: RemoteSettings::default(),
            dispatcher: DispatcherSettings::default(),
        }
    }
}

impl MachineConfig {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the configuration file
    pub fn default_config_path() -> SettingsResult<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            SettingsError::ConfigDirectory("no configuration directory on this platform".into())
        })?;
        Ok(dir.join("printhost").join("machine.toml"))
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SettingsError::LoadError(format!("{}: {}", path.display(), e))
        })?;

        let config: Self = match extension(path) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                )
                .into())
            }
        };

        config.validate()?;
        tracing::debug!("Loaded machine config from {}", path.display());
        Ok(config)
    }

    /// Load config from file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!(
                "No config at {}, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match extension(path) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                )
                .into())
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::ConfigDirectory(e.to_string()))?;
        }

        std::fs::write(path, content)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        if self.connection.baud_rate == 0 {
            return Err(invalid("connection.baud_rate", "must be > 0"));
        }

        if self.connection.read_timeout_ms == 0 {
            return Err(invalid("connection.read_timeout_ms", "must be > 0"));
        }

        if self.connection.handshake_timeout_ms == 0 {
            return Err(invalid("connection.handshake_timeout_ms", "must be > 0"));
        }

        if self.connection.handshake_retries == 0 {
            return Err(invalid("connection.handshake_retries", "must be >= 1"));
        }

        // Room for at least one short framed line such as "N0 M110 *123\n"
        if self.protocol.max_buffer_size < 16 {
            return Err(ConfigError::ValueOutOfRange {
                key: "protocol.max_buffer_size".to_string(),
                value: self.protocol.max_buffer_size.to_string(),
            }
            .into());
        }

        if self.protocol.stop_motion_instruction.trim().is_empty() {
            return Err(
                ConfigError::EmptyInstruction("protocol.stop_motion_instruction".into()).into(),
            );
        }

        if self.protocol.temperature_query.trim().is_empty() {
            return Err(ConfigError::EmptyInstruction("protocol.temperature_query".into()).into());
        }

        if self.extrusion.command_period_ms == 0 {
            return Err(invalid("extrusion.command_period_ms", "must be > 0"));
        }

        if self.polling.enabled && self.polling.interval_ms == 0 {
            return Err(invalid("polling.interval_ms", "must be > 0 when polling"));
        }

        if self.remote.response_timeout_ms == 0 {
            return Err(invalid("remote.response_timeout_ms", "must be > 0"));
        }

        if self.dispatcher.event_capacity == 0 {
            return Err(invalid("dispatcher.event_capacity", "must be > 0"));
        }

        Ok(())
    }

    /// Read timeout of the response reader
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.read_timeout_ms)
    }

    /// Per-attempt handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.handshake_timeout_ms)
    }

    /// Upper bound on waiting for the start banner after a reset pulse
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.connection.reset_settle_ms)
    }

    /// Extrusion command period
    pub fn extrusion_period(&self) -> Duration {
        Duration::from_millis(self.extrusion.command_period_ms)
    }

    /// Status poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Minimum time between remote playback status queries
    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.remote.poll_interval_ms)
    }

    /// Storage command confirmation timeout
    pub fn remote_response_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.response_timeout_ms)
    }

    /// Bounded wait for the dispatcher thread on shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.shutdown_timeout_ms)
    }

    /// Poll interval while waiting for a build to drain
    pub fn finish_poll(&self) -> Duration {
        Duration::from_millis(self.dispatcher.finish_poll_ms.max(1))
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn invalid(key: &str, reason: &str) -> SettingsError {
    SettingsError::InvalidSetting {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = MachineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol.max_buffer_size, 128);
        assert_eq!(config.extrusion.command_period_ms, 500);
        assert_eq!(config.extrusion.max_queued_commands, 2);
        assert_eq!(config.polling.interval_ms, 1000);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("machine.toml");

        let mut config = MachineConfig::default();
        config.name = "Mendel".to_string();
        config.build.warmup = vec!["M104 S200".to_string(), "M109".to_string()];
        config.build.optional_halt = OptionalHaltPolicy::Stop;
        config.save_to_file(&path).unwrap();

        let loaded = MachineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("machine.json");

        let mut config = MachineConfig::default();
        config.connection.port = "/dev/ttyACM0".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = MachineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.connection.port, "/dev/ttyACM0");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("machine.toml");
        std::fs::write(
            &path,
            "name = \"Prusa\"\n[protocol]\nmax_buffer_size = 64\n[build]\noptional_halt = \"stop\"\n",
        )
        .unwrap();

        let config = MachineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.name, "Prusa");
        assert_eq!(config.protocol.max_buffer_size, 64);
        assert_eq!(config.protocol.temperature_query, "M105");
        assert_eq!(config.build.optional_halt, OptionalHaltPolicy::Stop);
        assert_eq!(config.connection.baud_rate, 115200);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("machine.yaml");
        std::fs::write(&path, "name: x").unwrap();

        let err = MachineConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Config(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_validation_rejects_tiny_buffer() {
        let mut config = MachineConfig::default();
        config.protocol.max_buffer_size = 8;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::Config(ConfigError::ValueOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let mut config = MachineConfig::default();
        config.connection.handshake_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(SettingsError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = MachineConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, MachineConfig::default());
    }
}
