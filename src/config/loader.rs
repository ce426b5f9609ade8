//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.listener.hostname, "localhost");
        assert_eq!(config.cache.max_entries, 500);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn loads_partial_sections_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[listener]
hostname = "proxy.test"
same_origin_port = 2000
cross_origin_port = 2001

[cache]
enabled = true

[observability]
log_format = "json"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.hostname, "proxy.test");
        assert_eq!(config.listener.cross_origin_port, 2001);
        assert!(config.cache.enabled);
        assert_eq!(config.observability.log_format, crate::config::LogFormat::Json);
        assert_eq!(config.transport.page_request_secs, 120);
    }

    #[test]
    fn reports_validation_errors() {
        let err = parse_config(
            r#"
[listener]
same_origin_port = 3000
cross_origin_port = 3000
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("3000"));
    }

    #[test]
    fn reports_parse_errors() {
        assert!(matches!(parse_config("listener = 5"), Err(ConfigError::Parse(_))));
    }
}
