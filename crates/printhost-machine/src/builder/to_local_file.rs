//! Capture a build into a local file

use super::direct::DirectBuilder;
use super::InstructionSink;
use printhost_core::{BuildError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Writes one instruction per line to a file
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FileSink {
    /// Create or truncate the destination file
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| BuildError::Output {
            destination: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!("Capturing build to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Instructions written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    fn output_error(&self, e: std::io::Error) -> BuildError {
        BuildError::Output {
            destination: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

impl InstructionSink for FileSink {
    fn accept(&mut self, instruction: &str) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(self
                .output_error(std::io::Error::other("file already closed"))
                .into());
        };
        if let Err(e) = writeln!(writer, "{}", instruction) {
            return Err(self.output_error(e).into());
        }
        self.written += 1;
        Ok(())
    }

    fn is_drained(&self) -> bool {
        true
    }

    fn complete(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                return Err(self.output_error(e).into());
            }
        }
        info!("Wrote {} instructions to {}", self.written, self.path.display());
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Build captured to a local file
pub type ToLocalFile = DirectBuilder<FileSink>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildStrategy, HaltPolicy};
    use crate::source::StringListSource;
    use printhost_settings::OptionalHaltPolicy;

    #[test]
    fn test_capture_writes_interpreted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.gcode");
        let sink = FileSink::create(&path).unwrap();

        let mut builder: ToLocalFile = DirectBuilder::new(
            Box::new(StringListSource::new(["G28 ; home", "(comment)", "G1 X5"])),
            sink,
            Box::new(HaltPolicy(OptionalHaltPolicy::Continue)),
        );
        while !builder.is_finished().unwrap() {
            builder.advance_one_step().unwrap();
        }

        assert_eq!(builder.sink().written(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "G28\nG1 X5\n");
    }

    #[test]
    fn test_unwritable_destination_is_output_error() {
        let result = FileSink::create(Path::new("/nonexistent/printhost/out.gcode"));
        assert!(matches!(
            result,
            Err(printhost_core::Error::Build(BuildError::Output { .. }))
        ));
    }
}
