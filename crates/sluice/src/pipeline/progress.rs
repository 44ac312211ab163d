use std::path::Path;

use tracing::debug;

use crate::sanitize;

use super::state::FileState;

/// Events emitted while a file moves through the pipeline.
pub enum ProgressEvent<'a> {
    State {
        path: &'a Path,
        state: FileState,
    },
    ObjectUploaded {
        path: &'a Path,
        key: &'a str,
        bytes: u64,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent<'_>);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent<'_>) {}
}

/// Emits every event as a debug-level tracing event.
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::State { path, state } => {
                debug!(file = %sanitize::redact_path(path), %state, "State changed");
            }
            ProgressEvent::ObjectUploaded { path, key, bytes } => {
                debug!(file = %sanitize::redact_path(path), key, bytes, "Object uploaded");
            }
        }
    }
}
