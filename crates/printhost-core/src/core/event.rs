//! Event system for machine state, progress and telemetry
//!
//! Provides:
//! - Event types published by the machine dispatcher
//! - Event dispatcher for publishing events to subscribers

use crate::data::{BuildProgress, MachineState, ToolStatus};
use tokio::sync::broadcast;

/// Machine event types
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// Machine state changed
    StateChanged {
        /// State before the transition.
        previous: MachineState,
        /// State after the transition.
        current: MachineState,
        /// Human-readable reason, set for failures and notable transitions.
        message: Option<String>,
    },
    /// Build advanced
    Progress(BuildProgress),
    /// Tool telemetry sampled
    ToolStatus(ToolStatus),
    /// Dispatcher exited; no further events follow
    Shutdown,
}

impl std::fmt::Display for MachineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineEvent::StateChanged {
                previous,
                current,
                message: Some(message),
            } => write!(f, "State: {} -> {} ({})", previous, current, message),
            MachineEvent::StateChanged {
                previous, current, ..
            } => write!(f, "State: {} -> {}", previous, current),
            MachineEvent::Progress(progress) => write!(f, "Progress: {}", progress),
            MachineEvent::ToolStatus(status) => write!(f, "Tool: {}", status),
            MachineEvent::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for machine events.
    tx: broadcast::Sender<MachineEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 256)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that will see the event; zero when
    /// nobody is listening.
    pub fn publish(&self, event: MachineEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!("No subscribers for event: {}", event);
                0
            }
        }
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.publish(MachineEvent::Shutdown), 0);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        assert_eq!(dispatcher.subscriber_count(), 1);

        dispatcher.publish(MachineEvent::StateChanged {
            previous: MachineState::Disconnected,
            current: MachineState::Connecting,
            message: None,
        });
        dispatcher.publish(MachineEvent::Shutdown);

        assert!(matches!(
            rx.try_recv(),
            Ok(MachineEvent::StateChanged {
                current: MachineState::Connecting,
                ..
            })
        ));
        assert_eq!(rx.try_recv(), Ok(MachineEvent::Shutdown));
    }

    #[test]
    fn test_event_display() {
        let event = MachineEvent::StateChanged {
            previous: MachineState::Connecting,
            current: MachineState::Disconnected,
            message: Some("handshake timed out".to_string()),
        };
        assert_eq!(
            event.to_string(),
            "State: Connecting -> Disconnected (handshake timed out)"
        );
    }
}
