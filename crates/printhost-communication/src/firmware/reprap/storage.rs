//! SD card storage on RepRap firmware
//!
//! Capture writes every following line into a file on the card until the
//! capture is ended. Playback has the device execute a stored file on its
//! own while the host polls for progress.

use super::driver::ProtocolDriver;
use super::response_parser::StorageNotice;
use printhost_core::{ConnectionError, Result, StorageError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Device-side playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Nothing is playing
    Idle,
    /// Playing, with byte progress
    Printing {
        /// Bytes played so far
        done: u64,
        /// File size in bytes
        total: u64,
    },
    /// The file played to the end
    Finished,
}

/// Remote storage capability
pub trait RemoteStorage: Send + Sync {
    /// Start capturing subsequent lines into `name`
    fn begin_capture(&self, name: &str) -> Result<()>;

    /// Stop capturing and close `name`
    fn end_capture(&self, name: &str) -> Result<()>;

    /// Select `name` and start playing it
    fn start_playback(&self, name: &str) -> Result<()>;

    /// Query playback progress
    fn playback_status(&self) -> Result<PlaybackStatus>;
}

/// SD card commands over a connected protocol driver
pub struct SdCardStorage {
    driver: Arc<ProtocolDriver>,
    timeout: Duration,
}

impl SdCardStorage {
    /// Create storage access; `timeout` bounds every confirmation wait
    pub fn new(driver: Arc<ProtocolDriver>, timeout: Duration) -> Self {
        Self { driver, timeout }
    }

    /// Wait until `accept` returns a result for a notice, or time out
    fn await_notice<T>(
        &self,
        command: &str,
        mut accept: impl FnMut(StorageNotice) -> Option<Result<T>>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(notice) = self.driver.next_storage_notice(remaining) {
                match accept(notice) {
                    Some(result) => return result,
                    None => continue,
                }
            }

            if let Some(fatal) = self.driver.fatal_condition() {
                return Err(fatal.to_error());
            }
            if !self.driver.is_connected() {
                return Err(ConnectionError::NotConnected.into());
            }
            if Instant::now() >= deadline {
                return Err(StorageError::Timeout {
                    command: command.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
                .into());
            }
        }
    }
}

impl RemoteStorage for SdCardStorage {
    fn begin_capture(&self, name: &str) -> Result<()> {
        let command = format!("M28 {}", name);
        self.driver.clear_storage_notices();
        self.driver.send(&command)?;
        self.await_notice(&command, |notice| match notice {
            StorageNotice::WritingFile(_) => Some(Ok(())),
            StorageNotice::NoCard => Some(Err(StorageError::NoCard.into())),
            StorageNotice::OpenFailed(_) => Some(Err(StorageError::OpenFailed {
                name: name.to_string(),
            }
            .into())),
            _ => None,
        })?;
        info!("Capturing to remote file {}", name);
        Ok(())
    }

    fn end_capture(&self, name: &str) -> Result<()> {
        let command = format!("M29 {}", name);
        self.driver.send(&command)?;
        self.await_notice(&command, |notice| match notice {
            StorageNotice::DoneSaving => Some(Ok(())),
            _ => None,
        })?;
        info!("Remote file {} saved", name);
        Ok(())
    }

    fn start_playback(&self, name: &str) -> Result<()> {
        let command = format!("M23 {}", name);
        self.driver.clear_storage_notices();
        self.driver.send(&command)?;

        let size = self.await_notice(&command, |notice| match notice {
            StorageNotice::FileOpened { size, .. } => Some(Ok(size)),
            StorageNotice::FileSelected => Some(Ok(None)),
            StorageNotice::NoCard => Some(Err(StorageError::NoCard.into())),
            StorageNotice::OpenFailed(_) => Some(Err(StorageError::OpenFailed {
                name: name.to_string(),
            }
            .into())),
            _ => None,
        })?;

        self.driver.send("M24")?;
        match size {
            Some(bytes) => info!("Playing remote file {} ({} bytes)", name, bytes),
            None => info!("Playing remote file {}", name),
        }
        Ok(())
    }

    fn playback_status(&self) -> Result<PlaybackStatus> {
        self.driver.send("M27")?;
        let status = self.await_notice("M27", |notice| match notice {
            StorageNotice::PlaybackProgress { done, total } if total > 0 && done >= total => {
                Some(Ok(PlaybackStatus::Finished))
            }
            StorageNotice::PlaybackProgress { done, total } => {
                Some(Ok(PlaybackStatus::Printing { done, total }))
            }
            StorageNotice::DonePrinting => Some(Ok(PlaybackStatus::Finished)),
            StorageNotice::NotPrinting => Some(Ok(PlaybackStatus::Idle)),
            StorageNotice::NoCard => Some(Err(StorageError::NoCard.into())),
            _ => None,
        })?;
        debug!("Playback status: {:?}", status);
        Ok(status)
    }
}
