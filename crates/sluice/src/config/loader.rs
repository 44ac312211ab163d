use std::path::Path;

use crate::config::schema::{Config, MIN_PART_SIZE_BYTES};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.worker_count == 0 {
        return Err(invalid("worker_count must be > 0"));
    }
    if config.queue_capacity() == 0 {
        return Err(invalid("queue_capacity must be > 0"));
    }

    if config.watch_directory == config.error_directory {
        return Err(invalid(
            "error_directory must differ from watch_directory",
        ));
    }

    for pattern in &config.watch.exclude {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(invalid(format!(
                "Invalid exclude pattern '{}': {}",
                pattern, e
            )));
        }
    }

    if config.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be >= 1"));
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
    }

    if config.s3.part_size_bytes < MIN_PART_SIZE_BYTES {
        return Err(invalid(format!(
            "s3.part_size_bytes must be at least {} bytes",
            MIN_PART_SIZE_BYTES
        )));
    }

    let has_access = has_source(
        &config.s3.access_key,
        &config.s3.access_key_file,
        &config.s3.access_key_env,
    );
    let has_secret = has_source(
        &config.s3.secret_key,
        &config.s3.secret_key_file,
        &config.s3.secret_key_env,
    );
    if has_access != has_secret {
        return Err(invalid(
            "s3 access key and secret key must be configured together",
        ));
    }

    if config.conversion.batch_rows == 0 {
        return Err(invalid("conversion.batch_rows must be > 0"));
    }

    Ok(())
}

fn has_source(direct: &Option<String>, file: &Option<String>, env: &Option<String>) -> bool {
    [direct, file, env]
        .iter()
        .any(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
}
