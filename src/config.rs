use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::store::validate_identifier;

/// Settings for one access logger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggerSettings {
    /// Database connection URI (e.g. "sqlite:./data/access.db")
    pub url: String,
    /// Target table name
    pub table: String,
    /// Preset name or format pattern
    #[serde(default = "default_format")]
    pub format: String,
    /// Log when the request arrives instead of when the response finishes
    #[serde(default)]
    pub immediate: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_format() -> String {
    "default".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Load settings from `path` (any format the `config` crate understands),
/// overridden by `ACCESS_LOG__*` environment variables.
pub fn load_settings(path: impl AsRef<Path>) -> anyhow::Result<LoggerSettings> {
    let config = config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(config::Environment::with_prefix("ACCESS_LOG").separator("__"))
        .build()?;

    let settings: LoggerSettings = config.try_deserialize()?;
    validate_settings(&settings)?;

    Ok(settings)
}

pub fn validate_settings(settings: &LoggerSettings) -> anyhow::Result<()> {
    if settings.url.trim().is_empty() {
        anyhow::bail!("Database url cannot be empty");
    }

    if validate_identifier(&settings.table).is_err() {
        anyhow::bail!(
            "Table name '{}' must be a plain identifier (letters, digits, underscore)",
            settings.table
        );
    }

    if settings.format.trim().is_empty() {
        anyhow::bail!("Format cannot be empty");
    }

    if settings.max_connections == 0 {
        anyhow::bail!("max_connections must be at least 1");
    }

    Ok(())
}
