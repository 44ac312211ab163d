use tracing::error;

use crate::classify::FileClass;
use crate::worker::job::FileDetected;

use super::progress::{ProgressEvent, ProgressReporter};
use super::state::FileState;

/// State of one file's run through the pipeline.
pub struct FileContext<'a> {
    pub event: &'a FileDetected,
    progress: &'a dyn ProgressReporter,
    state: FileState,

    // Set in ChecksumPending
    pub checksum: Option<String>,

    // Set in Classifying
    pub class: Option<FileClass>,

    // Set before the first upload
    pub destination_key: Option<String>,

    pub objects_uploaded: usize,
    pub bytes_transferred: u64,
}

impl<'a> FileContext<'a> {
    pub fn new(event: &'a FileDetected, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            event,
            progress,
            state: FileState::Detected,
            checksum: None,
            class: None,
            destination_key: None,
            objects_uploaded: 0,
            bytes_transferred: 0,
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn advance(&mut self, next: FileState) {
        if !self.state.can_transition_to(next) {
            error!(from = %self.state, to = %next, "Illegal pipeline transition");
            debug_assert!(false, "illegal transition {} -> {}", self.state, next);
        }
        self.state = next;
        self.progress.report(ProgressEvent::State {
            path: &self.event.absolute_path,
            state: next,
        });
    }

    pub fn record_upload(&mut self, key: &str, bytes: u64) {
        self.objects_uploaded += 1;
        self.bytes_transferred += bytes;
        self.progress.report(ProgressEvent::ObjectUploaded {
            path: &self.event.absolute_path,
            key,
            bytes,
        });
    }
}
