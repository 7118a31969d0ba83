//! Command sources
//!
//! A build pulls its instructions from a restartable, finite sequence of
//! text lines. Sources here cover in-memory lists, files on disk, and a
//! chain used to bracket a job with warmup and cooldown instructions.

use printhost_core::{BuildError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Ordered, restartable sequence of instruction lines
pub trait CommandSource: Send {
    /// Next line, or `None` once the source is exhausted
    fn next_line(&mut self) -> Result<Option<String>>;

    /// Restart from the first line
    fn rewind(&mut self) -> Result<()>;

    /// Total number of lines, when known
    fn line_count(&self) -> Option<u64>;
}

/// Lines held in memory
#[derive(Debug, Clone, Default)]
pub struct StringListSource {
    lines: Vec<String>,
    cursor: usize,
}

impl StringListSource {
    /// Create a source over the given lines
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            cursor: 0,
        }
    }

    /// Create a source from multi-line text
    pub fn from_text(text: &str) -> Self {
        Self::new(text.lines())
    }
}

impl CommandSource for StringListSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        let line = self.lines.get(self.cursor).cloned();
        if line.is_some() {
            self.cursor += 1;
        }
        Ok(line)
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn line_count(&self) -> Option<u64> {
        Some(self.lines.len() as u64)
    }
}

/// Lines read lazily from a file
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    line_count: u64,
}

impl FileSource {
    /// Open a file, counting its lines up front
    pub fn open(path: &Path) -> Result<Self> {
        let source_error = |e: std::io::Error| BuildError::Source {
            reason: format!("{}: {}", path.display(), e),
        };

        let file = File::open(path).map_err(source_error)?;
        let mut reader = BufReader::new(file);
        let mut line_count = 0u64;
        let mut buf = Vec::new();
        while reader.read_until(b'\n', &mut buf).map_err(source_error)? > 0 {
            line_count += 1;
            buf.clear();
        }
        reader.seek(SeekFrom::Start(0)).map_err(source_error)?;

        tracing::debug!("Opened {} ({} lines)", path.display(), line_count);
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            line_count,
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandSource for FileSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| BuildError::Source {
                reason: format!("{}: {}", self.path.display(), e),
            })?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| BuildError::Source {
                reason: format!("{}: {}", self.path.display(), e),
            })?;
        Ok(())
    }

    fn line_count(&self) -> Option<u64> {
        Some(self.line_count)
    }
}

/// Several sources played back to back
#[derive(Default)]
pub struct ChainedSource {
    parts: Vec<Box<dyn CommandSource>>,
    current: usize,
}

impl ChainedSource {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source to the chain
    pub fn then(mut self, source: Box<dyn CommandSource>) -> Self {
        self.parts.push(source);
        self
    }

    /// Bracket a job with warmup and cooldown instructions
    pub fn bracketed(warmup: &[String], job: Box<dyn CommandSource>, cooldown: &[String]) -> Self {
        let mut chain = Self::new();
        if !warmup.is_empty() {
            chain = chain.then(Box::new(StringListSource::new(warmup.iter().cloned())));
        }
        chain = chain.then(job);
        if !cooldown.is_empty() {
            chain = chain.then(Box::new(StringListSource::new(cooldown.iter().cloned())));
        }
        chain
    }
}

impl CommandSource for ChainedSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        while let Some(part) = self.parts.get_mut(self.current) {
            if let Some(line) = part.next_line()? {
                return Ok(Some(line));
            }
            self.current += 1;
        }
        Ok(None)
    }

    fn rewind(&mut self) -> Result<()> {
        for part in &mut self.parts {
            part.rewind()?;
        }
        self.current = 0;
        Ok(())
    }

    fn line_count(&self) -> Option<u64> {
        self.parts.iter().map(|p| p.line_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn drain(source: &mut dyn CommandSource) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line().unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_string_list_rewinds() {
        let mut source = StringListSource::from_text("G28\nG1 X1\n");
        assert_eq!(source.line_count(), Some(2));
        assert_eq!(drain(&mut source), vec!["G28", "G1 X1"]);
        assert_eq!(source.next_line().unwrap(), None);

        source.rewind().unwrap();
        assert_eq!(source.next_line().unwrap().as_deref(), Some("G28"));
    }

    #[test]
    fn test_file_source_reads_and_rewinds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "G28\r\nG1 X5\nM2").unwrap();

        let mut source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.line_count(), Some(3));
        assert_eq!(drain(&mut source), vec!["G28", "G1 X5", "M2"]);

        source.rewind().unwrap();
        assert_eq!(drain(&mut source).len(), 3);
    }

    #[test]
    fn test_missing_file_is_source_error() {
        let result = FileSource::open(Path::new("/nonexistent/printhost/job.gcode"));
        assert!(matches!(
            result,
            Err(printhost_core::Error::Build(BuildError::Source { .. }))
        ));
    }

    #[test]
    fn test_bracketed_chain() {
        let warmup = vec!["M104 S200".to_string()];
        let cooldown = vec!["M104 S0".to_string(), "M84".to_string()];
        let job = Box::new(StringListSource::new(["G28", "G1 X1"]));

        let mut chain = ChainedSource::bracketed(&warmup, job, &cooldown);
        assert_eq!(chain.line_count(), Some(5));
        assert_eq!(
            drain(&mut chain),
            vec!["M104 S200", "G28", "G1 X1", "M104 S0", "M84"]
        );

        chain.rewind().unwrap();
        assert_eq!(chain.next_line().unwrap().as_deref(), Some("M104 S200"));
    }

    #[test]
    fn test_unknown_count_propagates() {
        struct Endless;
        impl CommandSource for Endless {
            fn next_line(&mut self) -> Result<Option<String>> {
                Ok(Some("G4 P1".to_string()))
            }
            fn rewind(&mut self) -> Result<()> {
                Ok(())
            }
            fn line_count(&self) -> Option<u64> {
                None
            }
        }

        let chain = ChainedSource::new()
            .then(Box::new(StringListSource::new(["G28"])))
            .then(Box::new(Endless));
        assert_eq!(chain.line_count(), None);
    }
}
