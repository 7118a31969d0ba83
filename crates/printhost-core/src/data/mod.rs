//! Data models for machine state, build progress and tool telemetry
//!
//! This module provides:
//! - The machine state machine value and its transition rules
//! - Build progress accounting with a linear time estimate
//! - Tool and platform temperature telemetry
//! - Immutable status snapshots handed out to callers and listeners

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Whether a build streams to a live device or runs without one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildMode {
    /// Streaming while connected to the device
    Online,
    /// Capturing to a local file with no device attached
    Offline,
}

/// Machine state
///
/// Owned and mutated only by the dispatcher; everything else sees copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    /// No device attached
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and idle
    Ready,
    /// Running a build against the connected device
    Building,
    /// Running a build with no device attached
    BuildingOffline,
    /// Build suspended; `resume` is the building variant to return to
    Paused {
        /// The building variant that was paused.
        resume: BuildMode,
    },
    /// Stop request being carried out
    Stopping,
    /// Device reported a fatal fault
    Error,
}

impl MachineState {
    /// The building state for a given mode
    pub fn building(mode: BuildMode) -> Self {
        match mode {
            BuildMode::Online => MachineState::Building,
            BuildMode::Offline => MachineState::BuildingOffline,
        }
    }

    /// Check if a device is attached in this state
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            MachineState::Disconnected | MachineState::Connecting | MachineState::BuildingOffline
        )
    }

    /// Check if a build is actively advancing
    pub fn is_building(&self) -> bool {
        matches!(self, MachineState::Building | MachineState::BuildingOffline)
    }

    /// Check if a build is paused
    pub fn is_paused(&self) -> bool {
        matches!(self, MachineState::Paused { .. })
    }

    /// Check if a build exists, running or paused
    pub fn has_build(&self) -> bool {
        self.is_building() || self.is_paused()
    }

    /// Check if a new build may start from this state
    pub fn can_start_build(&self) -> bool {
        matches!(self, MachineState::Ready | MachineState::Connecting)
    }

    /// Check if this state indicates an error condition
    pub fn is_error(&self) -> bool {
        matches!(self, MachineState::Error)
    }

    /// The building mode this state belongs to, if any
    pub fn build_mode(&self) -> Option<BuildMode> {
        match self {
            MachineState::Building => Some(BuildMode::Online),
            MachineState::BuildingOffline => Some(BuildMode::Offline),
            MachineState::Paused { resume } => Some(*resume),
            _ => None,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Disconnected => write!(f, "Disconnected"),
            MachineState::Connecting => write!(f, "Connecting"),
            MachineState::Ready => write!(f, "Ready"),
            MachineState::Building => write!(f, "Building"),
            MachineState::BuildingOffline => write!(f, "Building (offline)"),
            MachineState::Paused { .. } => write!(f, "Paused"),
            MachineState::Stopping => write!(f, "Stopping"),
            MachineState::Error => write!(f, "Error"),
        }
    }
}

/// Build progress
///
/// Written by the active build strategy, read by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildProgress {
    /// Lines fully handed to the destination
    pub lines_processed: u64,
    /// Total lines, when the source knows it
    pub lines_total: Option<u64>,
    /// Time since the build started
    pub elapsed: Duration,
    /// Linear extrapolation of the total build time
    pub estimated_total: Option<Duration>,
}

impl BuildProgress {
    /// Create a progress record, extrapolating the total time from the rate so far
    pub fn new(lines_processed: u64, lines_total: Option<u64>, elapsed: Duration) -> Self {
        let estimated_total = match lines_total {
            Some(total) if lines_processed > 0 => {
                let per_line = elapsed.as_secs_f64() / lines_processed as f64;
                Some(Duration::from_secs_f64(per_line * total as f64))
            }
            _ => None,
        };

        Self {
            lines_processed,
            lines_total,
            elapsed,
            estimated_total,
        }
    }

    /// Fraction complete in `0.0..=1.0` when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.lines_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.lines_processed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    /// Estimated time remaining
    pub fn remaining(&self) -> Option<Duration> {
        self.estimated_total
            .map(|total| total.saturating_sub(self.elapsed))
    }
}

impl fmt::Display for BuildProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lines_total {
            Some(total) => write!(f, "{}/{} lines", self.lines_processed, total)?,
            None => write!(f, "{} lines", self.lines_processed)?,
        }
        write!(f, " in {:.1}s", self.elapsed.as_secs_f64())
    }
}

/// Tool and platform temperature telemetry
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolStatus {
    /// Tool index the readings belong to
    pub tool: u8,
    /// Last reported tool temperature
    pub temperature: f64,
    /// Last commanded tool temperature
    pub target_temperature: f64,
    /// Last reported platform temperature
    pub platform_temperature: f64,
    /// Last commanded platform temperature
    pub platform_target_temperature: f64,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T{}: {:.1}/{:.1} B: {:.1}/{:.1}",
            self.tool,
            self.temperature,
            self.target_temperature,
            self.platform_temperature,
            self.platform_target_temperature
        )
    }
}

/// Immutable copy of the machine status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatusSnapshot {
    /// Machine state
    pub state: MachineState,
    /// Human-readable message attached to the last transition
    pub message: Option<String>,
    /// Progress of the current build, if any
    pub progress: Option<BuildProgress>,
    /// Last known tool telemetry
    pub tool: ToolStatus,
    /// When this snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl MachineStatusSnapshot {
    /// Create a new snapshot for a disconnected machine
    pub fn new() -> Self {
        Self {
            state: MachineState::Disconnected,
            message: None,
            progress: None,
            tool: ToolStatus::default(),
            timestamp: Utc::now(),
        }
    }

    /// Builder method to set the state
    pub fn with_state(mut self, state: MachineState) -> Self {
        self.state = state;
        self
    }

    /// Builder method to set the message
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    /// Builder method to set the build progress
    pub fn with_progress(mut self, progress: Option<BuildProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Builder method to set the tool telemetry
    pub fn with_tool(mut self, tool: ToolStatus) -> Self {
        self.tool = tool;
        self
    }
}

impl Default for MachineStatusSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_remembers_origin() {
        let paused = MachineState::Paused {
            resume: BuildMode::Offline,
        };
        assert_eq!(paused.build_mode(), Some(BuildMode::Offline));
        assert_eq!(
            MachineState::building(BuildMode::Offline),
            MachineState::BuildingOffline
        );
        assert!(paused.has_build());
        assert!(!paused.is_building());
    }

    #[test]
    fn test_build_start_states() {
        assert!(MachineState::Ready.can_start_build());
        assert!(MachineState::Connecting.can_start_build());
        assert!(!MachineState::Building.can_start_build());
        assert!(!MachineState::Error.can_start_build());
    }

    #[test]
    fn test_progress_estimate() {
        let progress = BuildProgress::new(25, Some(100), Duration::from_secs(10));
        assert_eq!(progress.estimated_total, Some(Duration::from_secs(40)));
        assert_eq!(progress.remaining(), Some(Duration::from_secs(30)));
        assert_eq!(progress.fraction(), Some(0.25));

        let unknown = BuildProgress::new(25, None, Duration::from_secs(10));
        assert_eq!(unknown.estimated_total, None);
        assert_eq!(unknown.fraction(), None);
    }

    #[test]
    fn test_progress_before_first_line() {
        let progress = BuildProgress::new(0, Some(10), Duration::from_millis(5));
        assert_eq!(progress.estimated_total, None);
        assert_eq!(progress.to_string(), "0/10 lines in 0.0s");
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = MachineStatusSnapshot::new().with_state(MachineState::Ready);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: MachineStatusSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, MachineState::Ready);
    }
}
