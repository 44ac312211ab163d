pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    Config, ConversionConfig, LogFormat, ParquetCompression, RetryConfig, S3Config, WatchConfig,
};

use std::path::PathBuf;

/// Returns the default config location: `~/.sluice/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".sluice").join("config.json"))
}
