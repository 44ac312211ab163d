pub mod job;
pub mod orchestrator;
pub mod scanner;

pub use job::{FileDetected, FileReport};
pub use orchestrator::{DetectionSender, Orchestrator, OrchestratorOptions, StopReport};
pub use scanner::DirectoryScanner;
