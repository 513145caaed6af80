//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::RuntimeConfig;
use crate::config::validation::{validate_config, ValidationErrors};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Source format, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Load and validate configuration from a TOML or JSON file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, ConfigFormat::from_path(path))
}

/// Parse and validate configuration from an in-memory document.
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<RuntimeConfig, ConfigError> {
    let config: RuntimeConfig = match format {
        ConfigFormat::Toml => toml::from_str(content)?,
        ConfigFormat::Json => serde_json::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [health]
            interval = "1s"

            [[policies]]
            name = "inventory"

            [policies.retry]
            max_attempts = 4
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].retry.as_ref().unwrap().max_attempts, 4);
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"policies": [{{"name": "search", "bulkhead": {{"max_concurrent": 4, "max_queue": 2, "queue_timeout": "250ms"}}}}]}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let bulkhead = config.policies[0].bulkhead.as_ref().unwrap();
        assert_eq!(bulkhead.max_concurrent, 4);
        assert_eq!(bulkhead.queue_timeout.as_millis(), 250);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let raw = r#"
            [[policies]]
            name = "bad"
            [policies.circuit_breaker]
            failure_threshold = 0
        "#;

        match parse_config(raw, ConfigFormat::Toml) {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.has_field("policies[0].circuit_breaker.failure_threshold"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_type_mismatch_is_parse_error() {
        let raw = r#"
            [[policies]]
            name = "bad"
            [policies.retry]
            max_attempts = "three"
        "#;
        assert!(matches!(
            parse_config(raw, ConfigFormat::Toml),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config(Path::new("/nonexistent/policies.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
