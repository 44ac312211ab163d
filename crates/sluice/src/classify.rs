//! File classification and destination key derivation.
//!
//! Classification looks at the file name only. Content is never sniffed, so
//! the same name always takes the same branch.

use std::path::{Component, Path};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    fn suffixes(self) -> &'static [&'static str] {
        match self {
            ArchiveFormat::Zip => &[".zip"],
            ArchiveFormat::Tar => &[".tar"],
            ArchiveFormat::TarGz => &[".tar.gz", ".tgz"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Tsv,
    JsonLines,
}

impl TabularFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "csv" => Some(TabularFormat::Csv),
            "tsv" => Some(TabularFormat::Tsv),
            "jsonl" | "ndjson" => Some(TabularFormat::JsonLines),
            _ => None,
        }
    }
}

/// The processing branch a file takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Archive(ArchiveFormat),
    Convertible(TabularFormat),
    Passthrough,
}

impl FileClass {
    /// Classifies a file by name. Matching is case-insensitive.
    pub fn of(file_name: &str) -> Self {
        let lower = file_name.to_lowercase();

        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return FileClass::Archive(ArchiveFormat::TarGz);
        }

        match extension(&lower) {
            Some("zip") => FileClass::Archive(ArchiveFormat::Zip),
            Some("tar") => FileClass::Archive(ArchiveFormat::Tar),
            Some(ext) => TabularFormat::from_extension(ext)
                .map(FileClass::Convertible)
                .unwrap_or(FileClass::Passthrough),
            None => FileClass::Passthrough,
        }
    }

    /// Classifies an entry found inside an archive. Nested archives are not
    /// extracted and travel as opaque blobs.
    pub fn of_archive_entry(entry_name: &str) -> Self {
        match Self::of(entry_name) {
            FileClass::Archive(_) => FileClass::Passthrough,
            other => other,
        }
    }
}

/// Returns the extension of the last path segment, ignoring dotfiles.
fn extension(name: &str) -> Option<&str> {
    let base = name.rsplit('/').next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Path '{0}' escapes its root")]
    Unsafe(String),

    #[error("Path is empty")]
    Empty,
}

/// Derives object keys from paths relative to the watched directory.
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Key for a passthrough or convertible source file.
    pub fn object_key(&self, relative: &Path, class: FileClass) -> Result<String, KeyError> {
        let rel = normalize_path(relative)?;
        let key = match class {
            FileClass::Convertible(_) => replace_extension(&rel, "parquet"),
            _ => rel,
        };
        Ok(self.prefixed(&key))
    }

    /// Root prefix under which an archive's entries land. Always ends in `/`.
    pub fn archive_root(&self, relative: &Path, format: ArchiveFormat) -> Result<String, KeyError> {
        let rel = normalize_path(relative)?;
        let lower = rel.to_lowercase();
        let stem = format
            .suffixes()
            .iter()
            .find(|s| lower.ends_with(*s))
            .map(|s| &rel[..rel.len() - s.len()])
            .filter(|stem| !stem.is_empty() && !stem.ends_with('/'))
            .unwrap_or(&rel);
        Ok(format!("{}/", self.prefixed(stem)))
    }

    /// Key for an archive entry below `root`.
    pub fn entry_key(root: &str, entry_path: &str, class: FileClass) -> Result<String, KeyError> {
        let rel = normalize_entry(entry_path)?;
        let rel = match class {
            FileClass::Convertible(_) => replace_extension(&rel, "parquet"),
            _ => rel,
        };
        Ok(format!("{}{}", root, rel))
    }

    fn prefixed(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }
}

fn normalize_path(path: &Path) -> Result<String, KeyError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(KeyError::Unsafe(path.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(KeyError::Empty);
    }
    Ok(parts.join("/"))
}

/// Archive entry names come from untrusted input and may use either separator.
fn normalize_entry(entry_path: &str) -> Result<String, KeyError> {
    if entry_path.starts_with('/') || entry_path.starts_with('\\') {
        return Err(KeyError::Unsafe(entry_path.to_string()));
    }
    let mut parts = Vec::new();
    for part in entry_path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return Err(KeyError::Unsafe(entry_path.to_string())),
            p if p.contains(':') && parts.is_empty() => {
                return Err(KeyError::Unsafe(entry_path.to_string()))
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(KeyError::Empty);
    }
    Ok(parts.join("/"))
}

fn replace_extension(key: &str, new_ext: &str) -> String {
    let (dir, base) = match key.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, key),
    };
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    match dir {
        Some(dir) => format!("{}/{}.{}", dir, stem, new_ext),
        None => format!("{}.{}", stem, new_ext),
    }
}

/// Content type recorded on a passthrough object.
pub fn passthrough_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
