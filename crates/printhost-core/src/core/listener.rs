//! Machine listener interface
//!
//! Defines the listener trait for machine events. Listeners run on the
//! machine's event thread, never on the dispatcher thread.

use crate::core::event::MachineEvent;
use crate::data::{BuildProgress, MachineState, ToolStatus};

/// Handle for a registered machine listener.
///
/// Uniquely identifies a listener subscription. Can be used to unsubscribe
/// from machine events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineListenerHandle(pub String);

impl MachineListenerHandle {
    /// Create a handle with a fresh unique id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Listener trait for machine events
///
/// Implement this trait to receive notifications of machine state changes
pub trait MachineListener: Send + Sync {
    /// Called when the machine state changes
    fn on_state_changed(
        &self,
        _previous: MachineState,
        _current: MachineState,
        _message: Option<&str>,
    ) {
    }

    /// Called after each build step
    fn on_progress(&self, _progress: &BuildProgress) {}

    /// Called when tool telemetry is sampled
    fn on_tool_status(&self, _status: &ToolStatus) {}

    /// Called once when the machine shuts down
    fn on_shutdown(&self) {}
}

impl MachineEvent {
    /// Deliver this event to the matching listener callback
    pub fn deliver_to(&self, listener: &dyn MachineListener) {
        match self {
            MachineEvent::StateChanged {
                previous,
                current,
                message,
            } => listener.on_state_changed(*previous, *current, message.as_deref()),
            MachineEvent::Progress(progress) => listener.on_progress(progress),
            MachineEvent::ToolStatus(status) => listener.on_tool_status(status),
            MachineEvent::Shutdown => listener.on_shutdown(),
        }
    }
}
