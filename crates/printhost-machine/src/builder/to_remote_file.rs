//! Capture a build into a file on the device's own storage

use super::direct::DirectBuilder;
use super::InstructionSink;
use printhost_communication::{ProtocolDriver, RemoteStorage};
use printhost_core::Result;
use std::sync::Arc;
use tracing::warn;

/// Sends instructions to the device while it records them to storage
///
/// The capture is opened on the first instruction and closed in
/// [`complete`](InstructionSink::complete).
pub struct RemoteCaptureSink {
    driver: Arc<ProtocolDriver>,
    storage: Arc<dyn RemoteStorage>,
    name: String,
    capturing: bool,
}

impl RemoteCaptureSink {
    /// Create a sink capturing into `name`
    pub fn new(
        driver: Arc<ProtocolDriver>,
        storage: Arc<dyn RemoteStorage>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            storage,
            name: name.into(),
            capturing: false,
        }
    }

    /// Remote file name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_capturing(&mut self) -> Result<()> {
        if !self.capturing {
            self.storage.begin_capture(&self.name)?;
            self.capturing = true;
        }
        Ok(())
    }
}

impl InstructionSink for RemoteCaptureSink {
    fn accept(&mut self, instruction: &str) -> Result<()> {
        self.ensure_capturing()?;
        self.driver.send(instruction)
    }

    fn is_drained(&self) -> bool {
        self.driver.is_finished()
    }

    fn complete(&mut self) -> Result<()> {
        self.ensure_capturing()?;
        self.storage.end_capture(&self.name)?;
        self.capturing = false;
        Ok(())
    }

    fn abort(&mut self) {
        if self.capturing {
            if let Err(e) = self.storage.end_capture(&self.name) {
                warn!("Failed to close remote file {}: {}", self.name, e);
            }
            self.capturing = false;
        }
    }
}

/// Build captured to remote storage
pub type ToRemoteFile = DirectBuilder<RemoteCaptureSink>;
