use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first, falling back to
/// copy + delete across devices.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Quarantine for sources whose pipeline failed.
///
/// The relative layout of the watched tree is kept and each file name gets a
/// UTC timestamp prefix, so repeated failures of one path never collide.
#[derive(Debug, Clone)]
pub struct ErrorArea {
    root: PathBuf,
}

impl ErrorArea {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Moves `source` into the error area. `relative_path` is the path of
    /// the source below the watched directory.
    pub fn relocate(&self, source: &Path, relative_path: &Path) -> Result<PathBuf, StorageError> {
        self.relocate_at(source, relative_path, Utc::now())
    }

    fn relocate_at(
        &self,
        source: &Path,
        relative_path: &Path,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, StorageError> {
        let dir = match safe_parent(relative_path) {
            Some(parent) => self.root.join(parent),
            None => self.root.clone(),
        };
        ensure_directory(&dir)?;

        let original_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let filename = format!("{}_{}", now.format("%Y%m%dT%H%M%S%.3fZ"), original_name);
        let target = resolve_conflict(&dir, &filename)?;

        move_file(source, &target)?;
        Ok(target)
    }
}

/// Parent of `relative` restricted to normal components.
fn safe_parent(relative: &Path) -> Option<PathBuf> {
    let parent: PathBuf = relative
        .parent()?
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    (!parent.as_os_str().is_empty()).then_some(parent)
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Returns `directory/filename`, or the first free `_2`, `_3`, ... variant.
fn resolve_conflict(directory: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    let path = directory.join(filename);
    if std::fs::symlink_metadata(&path).is_err() {
        return Ok(path);
    }

    let (base, ext) = match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], Some(&filename[dot..])),
        _ => (filename, None),
    };

    for counter in 2..=1000 {
        let candidate = match ext {
            Some(ext) => format!("{}_{}{}", base, counter, ext),
            None => format!("{}_{}", base, counter),
        };
        let candidate = directory.join(candidate);
        if std::fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
    }

    Err(StorageError::FileExists(path))
}
