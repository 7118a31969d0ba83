//! Machine events and listener plumbing

pub mod event;
pub mod listener;

pub use event::{EventDispatcher, MachineEvent};
pub use listener::{MachineListener, MachineListenerHandle};
