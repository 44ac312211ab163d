use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer_opt, Config as DebouncerConfig, DebouncedEventKind};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::WorkerError;
use crate::sanitize;
use crate::worker::job::FileDetected;
use crate::worker::orchestrator::DetectionSender;

/// Finds files in the watched directory, either by a one-off walk or by
/// polling for changes.
pub struct DirectoryScanner {
    root: PathBuf,
    error_directory: PathBuf,
    recursive: bool,
    excludes: Vec<glob::Pattern>,
    poll_interval: Duration,
    debounce: Duration,
    stability: Duration,
}

/// A changed file waiting for its size to settle.
struct Settling {
    size: u64,
    since: Instant,
}

impl DirectoryScanner {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(root: P, error_directory: Q) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            error_directory: error_directory.as_ref().to_path_buf(),
            recursive: true,
            excludes: Vec::new(),
            poll_interval: Duration::from_secs(2),
            debounce: Duration::from_millis(500),
            stability: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, WorkerError> {
        let excludes = config
            .watch
            .exclude
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|e| WorkerError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: config.watch_directory.clone(),
            error_directory: config.error_directory.clone(),
            recursive: config.watch.recursive,
            excludes,
            poll_interval: Duration::from_millis(config.watch.poll_interval_ms),
            debounce: Duration::from_millis(config.watch.debounce_ms),
            stability: Duration::from_millis(config.watch.stability_ms),
        })
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<glob::Pattern>) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_timing(mut self, poll_interval: Duration, debounce: Duration, stability: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.debounce = debounce;
        self.stability = stability;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self) -> Result<Vec<FileDetected>, WorkerError> {
        let mut found = Vec::new();
        let max_depth = if self.recursive { usize::MAX } else { 1 };

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WorkerError::ScanFailed {
                        path: self.root.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!("Skipping unreadable entry during scan: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            match FileDetected::from_path(&self.root, entry.path()) {
                Ok(event) => {
                    debug!("Found file: {}", sanitize::redact_path(entry.path()));
                    found.push(event);
                }
                Err(e) => warn!(
                    "Skipping {}: {}",
                    sanitize::redact_path(entry.path()),
                    e
                ),
            }
        }

        info!(
            "Scanned {} files in {}",
            found.len(),
            sanitize::redact_path(&self.root)
        );
        Ok(found)
    }

    /// Polls the watched directory until `shutdown` is set or the sender's
    /// orchestrator stops accepting. A file is handed over once its size
    /// stays unchanged for the stability window.
    pub fn watch(&self, sender: DetectionSender, shutdown: Arc<AtomicBool>) -> Result<(), WorkerError> {
        // PollWatcher for Docker/NFS compatibility
        let poll_config = NotifyConfig::default().with_poll_interval(self.poll_interval);
        let debouncer_config = DebouncerConfig::default()
            .with_timeout(self.debounce)
            .with_notify_config(poll_config);

        let (tx, rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer_opt::<_, PollWatcher>(debouncer_config, tx)
            .map_err(|e| WorkerError::WatchError(e.to_string()))?;

        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer
            .watcher()
            .watch(&self.root, mode)
            .map_err(|e| WorkerError::WatchError(e.to_string()))?;

        info!("Watching directory: {}", sanitize::redact_path(&self.root));

        let mut settling: HashMap<PathBuf, Settling> = HashMap::new();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Watch mode shutting down...");
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    for event in events {
                        if matches!(event.kind, DebouncedEventKind::Any) {
                            self.note_change(&event.path, &mut settling);
                        }
                    }
                }
                Ok(Err(errors)) => {
                    warn!("Watch error: {:?}", errors);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    error!("Watch channel disconnected");
                    break;
                }
            }

            for event in self.settled(&mut settling, Instant::now()) {
                info!("File ready: {}", sanitize::redact_path(&event.absolute_path));
                match sender.blocking_send(event) {
                    Ok(()) => {}
                    Err(WorkerError::NotAccepting) | Err(WorkerError::ChannelClosed) => {
                        info!("Orchestrator stopped accepting, ending watch");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    fn note_change(&self, path: &Path, settling: &mut HashMap<PathBuf, Settling>) {
        if self.is_excluded(path) {
            return;
        }
        let Ok(metadata) = std::fs::metadata(path) else {
            settling.remove(path);
            return;
        };
        if !metadata.is_file() {
            return;
        }
        settling.insert(
            path.to_path_buf(),
            Settling {
                size: metadata.len(),
                since: Instant::now(),
            },
        );
    }

    /// Returns files whose size held still for the stability window and
    /// restarts the clock on any that are still growing.
    fn settled(&self, settling: &mut HashMap<PathBuf, Settling>, now: Instant) -> Vec<FileDetected> {
        let mut ready = Vec::new();

        settling.retain(|path, entry| {
            if now.duration_since(entry.since) < self.stability {
                return true;
            }
            let Ok(metadata) = std::fs::metadata(path) else {
                return false;
            };
            if metadata.len() != entry.size {
                entry.size = metadata.len();
                entry.since = now;
                return true;
            }
            match FileDetected::from_path(&self.root, path) {
                Ok(event) => ready.push(event),
                Err(e) => warn!("Skipping {}: {}", sanitize::redact_path(path), e),
            }
            false
        });

        ready.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));
        ready
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if path.starts_with(&self.error_directory) {
            return true;
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        relative.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            self.excludes.iter().any(|p| p.matches(&name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn patterns(raw: &[&str]) -> Vec<glob::Pattern> {
        raw.iter().map(|p| glob::Pattern::new(p).unwrap()).collect()
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"));

        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn test_scan_finds_nested_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        std::fs::write(temp_dir.path().join("top.csv"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("a/b/deep.bin"), b"yy").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"));
        let found = scanner.scan().unwrap();

        let relative: Vec<_> = found.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(
            relative,
            vec![PathBuf::from("a/b/deep.bin"), PathBuf::from("top.csv")]
        );
        assert_eq!(found[0].size, 2);
    }

    #[test]
    fn test_scan_non_recursive() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        std::fs::write(temp_dir.path().join("sub/nested.txt"), b"n").unwrap();
        std::fs::write(temp_dir.path().join("top.txt"), b"t").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"))
            .with_recursive(false);
        let found = scanner.scan().unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].absolute_path.ends_with("top.txt"));
    }

    #[test]
    fn test_scan_skips_error_directory() {
        let temp_dir = TempDir::new().unwrap();
        let errors = temp_dir.path().join("errors");
        std::fs::create_dir(&errors).unwrap();
        std::fs::write(errors.join("bad.csv"), b"bad").unwrap();
        std::fs::write(temp_dir.path().join("good.csv"), b"good").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), &errors);
        let found = scanner.scan().unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].absolute_path.ends_with("good.csv"));
    }

    #[test]
    fn test_scan_applies_excludes() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join(".git")).unwrap();
        std::fs::write(temp_dir.path().join(".git/config"), b"c").unwrap();
        std::fs::write(temp_dir.path().join("upload.part"), b"p").unwrap();
        std::fs::write(temp_dir.path().join("keep.json"), b"{}").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"))
            .with_excludes(patterns(&[".*", "*.part"]));
        let found = scanner.scan().unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].absolute_path.ends_with("keep.json"));
    }

    #[test]
    fn test_scan_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = DirectoryScanner::new(temp_dir.path().join("nope"), temp_dir.path().join("errors"));

        assert!(matches!(scanner.scan(), Err(WorkerError::ScanFailed { .. })));
    }

    #[test]
    fn test_settled_waits_for_stable_size() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("growing.bin");
        std::fs::write(&file, b"12").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"))
            .with_timing(Duration::from_millis(50), Duration::from_millis(50), Duration::from_millis(200));
        let mut settling = HashMap::new();
        scanner.note_change(&file, &mut settling);
        let start = settling[&file].since;

        // Inside the window nothing is ready.
        assert!(scanner.settled(&mut settling, start).is_empty());

        // Size changed when the window elapsed: the clock restarts.
        std::fs::write(&file, b"1234").unwrap();
        let later = start + Duration::from_millis(250);
        assert!(scanner.settled(&mut settling, later).is_empty());
        assert_eq!(settling[&file].size, 4);

        let ready = scanner.settled(&mut settling, later + Duration::from_millis(250));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].size, 4);
        assert!(settling.is_empty());
    }

    #[test]
    fn test_settled_drops_vanished_files() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("brief.txt");
        std::fs::write(&file, b"x").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"));
        let mut settling = HashMap::new();
        scanner.note_change(&file, &mut settling);
        std::fs::remove_file(&file).unwrap();

        let ready = scanner.settled(&mut settling, Instant::now() + Duration::from_secs(5));
        assert!(ready.is_empty());
        assert!(settling.is_empty());
    }

    #[test]
    fn test_note_change_ignores_excluded() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("draft.tmp");
        std::fs::write(&file, b"x").unwrap();

        let scanner = DirectoryScanner::new(temp_dir.path(), temp_dir.path().join("errors"))
            .with_excludes(patterns(&["*.tmp"]));
        let mut settling = HashMap::new();
        scanner.note_change(&file, &mut settling);

        assert!(settling.is_empty());
    }
}
