use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::pipeline::FileOutcome;

/// A file the detector considers fully written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDetected {
    pub absolute_path: PathBuf,
    /// Path below the watched directory. Destination keys mirror it.
    pub relative_path: PathBuf,
    pub size: u64,
    pub extension: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

impl FileDetected {
    /// Builds an event from the file's current metadata.
    pub fn from_path(root: &Path, absolute_path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(absolute_path)?;
        let relative_path = absolute_path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "'{}' is outside '{}'",
                        absolute_path.display(),
                        root.display()
                    ),
                )
            })?;

        Ok(Self {
            absolute_path: absolute_path.to_path_buf(),
            extension: absolute_path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase),
            relative_path,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// File name used for classification.
    pub fn file_name(&self) -> String {
        self.relative_path
            .file_name()
            .or_else(|| self.absolute_path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Broadcast once per finished file.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
    pub elapsed: Duration,
}

impl FileReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, FileOutcome::Failed { .. })
    }
}
