use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub watch_directory: PathBuf,
    pub error_directory: PathBuf,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub work_directory: Option<PathBuf>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub s3: S3Config,
    #[serde(default)]
    pub conversion: ConversionConfig,
}

impl Config {
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.worker_count * 4)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn work_directory(&self) -> PathBuf {
        self.work_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_stability_ms")]
    pub stability_ms: u64,
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_stability_ms() -> u64 {
    1000
}

fn default_exclude() -> Vec<String> {
    vec![
        ".*".to_string(),
        "*.tmp".to_string(),
        "*.part".to_string(),
        "*~".to_string(),
    ]
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            stability_ms: default_stability_ms(),
            scan_on_start: true,
            exclude: default_exclude(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

pub const MIN_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    #[serde(default = "default_part_size")]
    pub part_size_bytes: u64,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub access_key_file: Option<String>,
    #[serde(default)]
    pub access_key_env: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub secret_key_file: Option<String>,
    #[serde(default)]
    pub secret_key_env: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    #[default]
    Snappy,
    Zstd,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
    #[serde(default)]
    pub compression: ParquetCompression,
}

fn default_batch_rows() -> usize {
    8192
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            batch_rows: default_batch_rows(),
            compression: ParquetCompression::default(),
        }
    }
}
