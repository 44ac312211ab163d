pub mod context;
pub mod error;
pub mod progress;
pub mod runner;
pub mod state;

pub use context::FileContext;
pub use error::{FatalError, PipelineError};
pub use progress::{NoopProgress, ProgressEvent, ProgressReporter, TracingProgress};
pub use runner::{FileOutcome, FilePipeline, SkipReason};
pub use state::FileState;
