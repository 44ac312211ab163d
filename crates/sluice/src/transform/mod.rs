//! Stateless transforms applied before upload.
//!
//! Outputs are spooled into temp files in the work directory so uploads can
//! re-read them on retry and know their size up front.

pub mod convert;
pub mod extract;

use std::io::{self, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;

pub use convert::{ConversionStats, Converter, ParquetConverter};
pub use extract::{ArchiveEntry, ArchiveExtractor, EntryCursor, Extractor, OpenArchive};

/// Content errors are deterministic and never retried.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Archive entry '{0}' has an unsafe path")]
    UnsafeEntryPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Creates an empty spool file inside `work_dir`.
pub fn spool_file(work_dir: &Path) -> Result<NamedTempFile, TransformError> {
    std::fs::create_dir_all(work_dir)?;
    Ok(tempfile::Builder::new()
        .prefix("sluice-")
        .suffix(".spool")
        .tempfile_in(work_dir)?)
}

/// Copies an archive entry into a spool file. Read failures come from the
/// archive and are reported as corruption; write failures are local I/O.
pub fn spool_entry<R: Read + ?Sized>(
    reader: &mut R,
    entry_path: &str,
    work_dir: &Path,
) -> Result<(NamedTempFile, u64), TransformError> {
    let mut spool = spool_file(work_dir)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransformError::CorruptArchive(format!(
                    "reading '{}': {}",
                    entry_path, e
                )))
            }
        };
        spool.write_all(&buf[..n])?;
        total += n as u64;
    }
    spool.as_file().sync_all()?;
    Ok((spool, total))
}
