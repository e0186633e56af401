//! Configuration loading from disk.

use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Resolve the routes file path. A relative `routesfile` is taken relative
/// to the directory containing the config file.
pub fn resolve_routes_file(config_path: &Path, routesfile: &str) -> PathBuf {
    let routes = Path::new(routesfile);
    if routes.is_absolute() {
        return routes.to_path_buf();
    }

    match config_path.parent() {
        Some(dir) => dir.join(routes),
        None => routes.to_path_buf(),
    }
}
