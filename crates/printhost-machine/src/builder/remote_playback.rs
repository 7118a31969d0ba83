//! Playback of a file already held by the device

use super::BuildStrategy;
use printhost_communication::{PlaybackStatus, RemoteStorage};
use printhost_core::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The device plays the file; the host only watches
///
/// Progress is reported in bytes of the remote file.
pub struct RemotePlaybackBuilder {
    storage: Arc<dyn RemoteStorage>,
    name: String,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    done: u64,
    total: Option<u64>,
    finished: bool,
}

/// Build played from remote storage
pub type UsingRemoteFile = RemotePlaybackBuilder;

impl RemotePlaybackBuilder {
    /// Select `name` on the device and start playing it
    pub fn start(
        storage: Arc<dyn RemoteStorage>,
        name: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let name = name.into();
        storage.start_playback(&name)?;
        Ok(Self {
            storage,
            name,
            poll_interval,
            last_poll: None,
            done: 0,
            total: None,
            finished: false,
        })
    }

    /// Remote file name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl BuildStrategy for RemotePlaybackBuilder {
    fn advance_one_step(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_finished(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        if let Some(last) = self.last_poll {
            if last.elapsed() < self.poll_interval {
                return Ok(false);
            }
        }

        self.last_poll = Some(Instant::now());
        match self.storage.playback_status()? {
            PlaybackStatus::Printing { done, total } => {
                self.done = done;
                self.total = Some(total);
            }
            status => {
                debug!("Playback of {} reported {:?}", self.name, status);
                if let Some(total) = self.total {
                    self.done = total;
                }
                info!("Remote playback of {} finished", self.name);
                self.finished = true;
            }
        }
        Ok(self.finished)
    }

    fn lines_processed(&self) -> u64 {
        self.done
    }

    fn lines_total(&self) -> Option<u64> {
        self.total
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }
}
