//! Build strategies
//!
//! A build strategy feeds a command source to one destination, one unit of
//! work per call, and reports when everything it produced has been
//! delivered. The dispatcher owns exactly one strategy per build.
//!
//! Direct, local-file and remote-file builds share [`DirectBuilder`] and
//! differ only in their [`InstructionSink`]; playback of a file already on
//! the device is [`RemotePlaybackBuilder`].

pub mod direct;
pub mod remote_playback;
pub mod to_local_file;
pub mod to_remote_file;

pub use direct::{DeviceSink, Direct, DirectBuilder};
pub use remote_playback::{RemotePlaybackBuilder, UsingRemoteFile};
pub use to_local_file::{FileSink, ToLocalFile};
pub use to_remote_file::{RemoteCaptureSink, ToRemoteFile};

use printhost_core::{BuildProgress, Result};
use printhost_settings::OptionalHaltPolicy;
use std::time::Duration;

/// Execution policy for one build
pub trait BuildStrategy: Send {
    /// Push one unit of work toward the destination
    ///
    /// A retryable error leaves the strategy positioned on the same work so
    /// the next call attempts it again.
    fn advance_one_step(&mut self) -> Result<()>;

    /// True once all work was produced and the destination has taken it
    fn is_finished(&mut self) -> Result<bool>;

    /// Units of work fully delivered
    fn lines_processed(&self) -> u64;

    /// Total units of work, when known
    fn lines_total(&self) -> Option<u64>;

    /// How long the dispatcher may wait between steps
    ///
    /// `None` means step again immediately.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Give up on the build, releasing the destination
    fn abort(&mut self) {}

    /// Progress record for listeners
    fn progress(&self, elapsed: Duration) -> BuildProgress {
        BuildProgress::new(self.lines_processed(), self.lines_total(), elapsed)
    }
}

/// Destination for interpreted instructions
pub trait InstructionSink: Send {
    /// Deliver one instruction
    fn accept(&mut self, instruction: &str) -> Result<()>;

    /// True when nothing accepted is still outstanding
    fn is_drained(&self) -> bool;

    /// Called once after the last instruction
    fn complete(&mut self) -> Result<()>;

    /// Called when the build is abandoned
    fn abort(&mut self) {}
}

/// Decides whether a build continues past an optional halt
pub trait HaltPrompt: Send {
    /// `true` to keep building
    fn continue_build(&mut self) -> bool;
}

/// Answers optional halts from the configured policy
#[derive(Debug, Clone, Copy)]
pub struct HaltPolicy(pub OptionalHaltPolicy);

impl HaltPrompt for HaltPolicy {
    fn continue_build(&mut self) -> bool {
        matches!(self.0, OptionalHaltPolicy::Continue)
    }
}
