//! Secret resolution for object store credentials.
//!
//! Sources are tried in priority order:
//!
//! 1. **Direct value** - for local testing (`"access_key": "minioadmin"`)
//! 2. **File reference** - for Docker secrets (`"access_key_file": "/run/secrets/s3_key"`)
//! 3. **Env var reference** - for Kubernetes (`"access_key_env": "S3_ACCESS_KEY"`)

use secrecy::SecretString;
use std::fs;

/// Error type for secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Resolves a secret from the first non-empty source.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct {
        if !value.is_empty() {
            return Ok(SecretString::from(value.to_string()));
        }
    }

    if let Some(path) = file_path {
        if !path.is_empty() {
            let expanded = expand_home(path);
            return match fs::read_to_string(&expanded) {
                Ok(content) => Ok(SecretString::from(content.trim().to_string())),
                Err(e) => Err(SecretError::FileReadError {
                    path: expanded,
                    source: e,
                }),
            };
        }
    }

    if let Some(var_name) = env_var {
        if !var_name.is_empty() {
            return match std::env::var(var_name) {
                // Env vars may carry a trailing newline.
                Ok(value) => Ok(SecretString::from(value.trim())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: var_name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: var_name.to_string(),
                }),
            };
        }
    }

    Err(SecretError::NoSourceProvided)
}

/// Like [`resolve_secret`], but a missing source is `Ok(None)`.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` to the user's home directory.
///
/// `~user/path` is not supported.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if path == "~" {
                return home.to_string_lossy().into_owned();
            }
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn test_direct_value_wins() {
        let secret = resolve_secret(Some("direct"), Some("/nonexistent"), Some("NOPE")).unwrap();
        assert_eq!(secret.expose_secret(), "direct");
    }

    #[test]
    fn test_empty_direct_falls_through_to_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let secret = resolve_secret(Some(""), Some(&path), None).unwrap();
        assert_eq!(secret.expose_secret(), "from-file");
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = resolve_secret(None, Some("/definitely/not/here"), None).unwrap_err();
        assert!(matches!(err, SecretError::FileReadError { .. }));
    }

    #[test]
    fn test_env_var_is_trimmed() {
        std::env::set_var("SLUICE_TEST_SECRET_TRIM", "value\n");
        let secret = resolve_secret(None, None, Some("SLUICE_TEST_SECRET_TRIM")).unwrap();
        assert_eq!(secret.expose_secret(), "value");
        std::env::remove_var("SLUICE_TEST_SECRET_TRIM");
    }

    #[test]
    fn test_env_var_not_set() {
        let err = resolve_secret(None, None, Some("SLUICE_TEST_SECRET_UNSET")).unwrap_err();
        assert!(matches!(err, SecretError::EnvVarNotSet { .. }));
    }

    #[test]
    fn test_no_source() {
        assert!(matches!(
            resolve_secret(None, None, None),
            Err(SecretError::NoSourceProvided)
        ));
        assert!(resolve_secret_optional(None, Some(""), None).unwrap().is_none());
    }
}
