//! Configuration validation
//!
//! Collects every problem in a [`RelayConfig`] instead of stopping at the
//! first one.

use super::relay_config::{DataStoreConfig, RelayConfig, DEFAULT_PASSWORD, REAPER_DISABLED};
use crate::RelayError;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a relay configuration
pub fn validate_config(config: &RelayConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.host.trim().is_empty() {
        errors.push(ValidationError::new("host", "Host must not be empty"));
    }

    if config.port == 0 {
        errors.push(ValidationError::new("port", "Port must be greater than 0"));
    }

    if config.password.is_empty() {
        errors.push(ValidationError::new(
            "password",
            "A server secret is required to derive endpoint tokens",
        ));
    }

    if !config.endpoint_url.starts_with("http://") && !config.endpoint_url.starts_with("https://")
    {
        errors.push(ValidationError::new(
            "endpoint_url",
            format!(
                "Endpoint URL '{}' must start with http:// or https://",
                config.endpoint_url
            ),
        ));
    }

    for (field, prefix) in [
        ("endpoint_prefix", &config.endpoint_prefix),
        ("sockjs_prefix", &config.sockjs_prefix),
    ] {
        if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
            errors.push(ValidationError::new(
                field,
                format!("Prefix '{}' must look like '/name'", prefix),
            ));
        }
    }

    if config.endpoint_prefix == config.sockjs_prefix {
        errors.push(ValidationError::new(
            "sockjs_prefix",
            "Transport prefix must differ from the endpoint prefix",
        ));
    }

    let timeout = config.useragent_reaper_timeout;
    if timeout != REAPER_DISABLED && timeout <= 0 {
        errors.push(ValidationError::new(
            "useragent_reaper_timeout",
            format!(
                "Reaper timeout must be positive or {} to disable, got {}",
                REAPER_DISABLED, timeout
            ),
        ));
    }

    if config.ack_interval == 0 {
        errors.push(ValidationError::new(
            "ack_interval",
            "Ack interval must be greater than 0",
        ));
    }

    if config.max_body_size == 0 {
        errors.push(ValidationError::new(
            "max_body_size",
            "Body size limit must be greater than 0",
        ));
    }

    if let DataStoreConfig::Sqlite { path } = &config.datastore {
        if path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "datastore.path",
                "SQLite datastore needs a path",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and convert to a crate error
pub fn validate_config_result(config: &RelayConfig) -> crate::Result<()> {
    if config.password == DEFAULT_PASSWORD {
        tracing::warn!("Using the default server secret; set 'password' in the config");
    }

    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        RelayError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&RelayConfig::new()).is_ok());
        assert!(validate_config_result(&RelayConfig::new()).is_ok());
    }

    #[test]
    fn test_reaper_timeout_rules() {
        assert!(validate_config(&RelayConfig::new().with_reaper_timeout(-1)).is_ok());
        assert!(validate_config(&RelayConfig::new().with_reaper_timeout(1)).is_ok());

        for bad in [0, -2, -1000] {
            let errors = validate_config(&RelayConfig::new().with_reaper_timeout(bad)).unwrap_err();
            assert_eq!(errors[0].field, "useragent_reaper_timeout");
        }
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = RelayConfig::new()
            .with_port(0)
            .with_password("")
            .with_ack_interval(0)
            .with_endpoint_url("ftp://nope");
        config.endpoint_prefix = "update".to_string();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"port"));
        assert!(fields.contains(&"password"));
        assert!(fields.contains(&"ack_interval"));
        assert!(fields.contains(&"endpoint_url"));
        assert!(fields.contains(&"endpoint_prefix"));
    }

    #[test]
    fn test_prefixes_must_differ() {
        let mut config = RelayConfig::new();
        config.sockjs_prefix = config.endpoint_prefix.clone();
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "sockjs_prefix"));
    }

    #[test]
    fn test_sqlite_path_required() {
        let config = RelayConfig::new().with_datastore(DataStoreConfig::Sqlite {
            path: PathBuf::new(),
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "datastore.path");
    }

    #[test]
    fn test_result_message_lists_fields() {
        let err = validate_config_result(&RelayConfig::new().with_port(0)).unwrap_err();
        assert!(err.to_string().contains("port: Port must be greater than 0"));
    }

    #[test]
    fn test_display() {
        let err = ValidationError::new("port", "bad");
        assert_eq!(err.to_string(), "port: bad");
    }
}
