//! # PrintHost Machine
//!
//! The machine layer of PrintHost: command sources, build strategies and
//! the dispatcher thread that owns the machine state.
//!
//! ```text
//! operator ──> Machine ──> CommandQueue ──> Dispatcher ──> BuildStrategy ──> ProtocolDriver
//!                 ^                              │
//!                 └──── snapshots / events <─────┘
//! ```

pub mod builder;
pub mod controller;
mod dispatcher;
pub mod interpreter;
pub mod pending;
pub mod poller;
pub mod simulator;
pub mod source;

pub use builder::{
    BuildStrategy, DeviceSink, Direct, DirectBuilder, FileSink, HaltPolicy, HaltPrompt,
    InstructionSink, RemoteCaptureSink, RemotePlaybackBuilder, ToLocalFile, ToRemoteFile,
    UsingRemoteFile,
};
pub use controller::Machine;
pub use interpreter::{DeviceInstruction, GcodeInterpreter};
pub use pending::{BuildTarget, CommandQueue, ExtruderRequest, PendingCommand};
pub use poller::StatusPoller;
pub use simulator::{MotionSimulator, Simulator};
pub use source::{ChainedSource, CommandSource, FileSource, StringListSource};
