use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::classify::ArchiveFormat;
use crate::transform::TransformError;

type TarSource = Box<dyn Read + Send>;

/// Opens archives for entry-by-entry reading.
pub trait Extractor: Send + Sync {
    fn open(&self, source: &Path, format: ArchiveFormat) -> Result<OpenArchive, TransformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
    fn open(&self, source: &Path, format: ArchiveFormat) -> Result<OpenArchive, TransformError> {
        let file = File::open(source)?;
        match format {
            ArchiveFormat::Zip => {
                let archive = ZipArchive::new(BufReader::new(file)).map_err(zip_error)?;
                Ok(OpenArchive::Zip(archive))
            }
            ArchiveFormat::Tar => Ok(OpenArchive::Tar(tar::Archive::new(Box::new(
                BufReader::new(file),
            )))),
            ArchiveFormat::TarGz => Ok(OpenArchive::Tar(tar::Archive::new(Box::new(
                GzDecoder::new(BufReader::new(file)),
            )))),
        }
    }
}

/// An opened archive. Entries are read once, top to bottom.
pub enum OpenArchive {
    Zip(ZipArchive<BufReader<File>>),
    Tar(tar::Archive<TarSource>),
}

impl OpenArchive {
    pub fn cursor(&mut self) -> Result<EntryCursor<'_>, TransformError> {
        match self {
            OpenArchive::Zip(archive) => Ok(EntryCursor::Zip { archive, next: 0 }),
            OpenArchive::Tar(archive) => {
                let entries = archive
                    .entries()
                    .map_err(|e| TransformError::CorruptArchive(e.to_string()))?;
                Ok(EntryCursor::Tar(entries))
            }
        }
    }
}

/// One archive member. The reader must be consumed before the next call to
/// [`EntryCursor::next_entry`].
pub struct ArchiveEntry<'a> {
    pub path: String,
    pub is_dir: bool,
    pub reader: Box<dyn Read + 'a>,
}

impl std::fmt::Debug for ArchiveEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEntry")
            .field("path", &self.path)
            .field("is_dir", &self.is_dir)
            .finish_non_exhaustive()
    }
}

/// Pull-based cursor over archive entries. `Ok(None)` means done.
pub enum EntryCursor<'a> {
    Zip {
        archive: &'a mut ZipArchive<BufReader<File>>,
        next: usize,
    },
    Tar(tar::Entries<'a, TarSource>),
}

impl EntryCursor<'_> {
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>, TransformError> {
        match self {
            EntryCursor::Zip { archive, next } => loop {
                if *next >= archive.len() {
                    return Ok(None);
                }
                let index = *next;
                *next += 1;

                // Symlink flag is read before borrowing the entry reader.
                let skip = archive.by_index(index).map_err(zip_error)?.is_symlink();
                if skip {
                    debug!(index, "Skipping zip symlink entry");
                    continue;
                }

                let file = archive.by_index(index).map_err(zip_error)?;
                let path = file.name().to_string();
                if file.enclosed_name().is_none() {
                    return Err(TransformError::UnsafeEntryPath(path));
                }
                return Ok(Some(ArchiveEntry {
                    is_dir: file.is_dir(),
                    path,
                    reader: Box::new(file),
                }));
            },
            EntryCursor::Tar(entries) => loop {
                let entry = match entries.next() {
                    None => return Ok(None),
                    Some(entry) => entry.map_err(|e| TransformError::CorruptArchive(e.to_string()))?,
                };

                let is_dir = match entry.header().entry_type() {
                    EntryType::Regular | EntryType::Continuous => false,
                    EntryType::Directory => true,
                    other => {
                        debug!(entry_type = ?other, "Skipping special tar entry");
                        continue;
                    }
                };

                let path = entry
                    .path()
                    .map_err(|e| TransformError::CorruptArchive(e.to_string()))?
                    .to_string_lossy()
                    .into_owned();
                return Ok(Some(ArchiveEntry {
                    path,
                    is_dir,
                    reader: Box::new(entry),
                }));
            },
        }
    }
}

fn zip_error(e: ZipError) -> TransformError {
    match e {
        ZipError::Io(source) if source.kind() != std::io::ErrorKind::UnexpectedEof => {
            TransformError::Io(source)
        }
        other => TransformError::CorruptArchive(other.to_string()),
    }
}
