//! Process configuration loaded from defaults, an optional TOML file, and
//! `CINEVAULT_`-prefixed environment variables (`CINEVAULT_DATABASE__URL`
//! overrides `database.url`).

use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{IngestError, Result};
use crate::ingest::orchestration::config::IngestConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("database.url", "postgres://localhost/cinevault")
            .map_err(config_error)?
            .set_default("database.max_connections", 16i64)
            .map_err(config_error)?
            .set_default("database.acquire_timeout_secs", 10i64)
            .map_err(config_error)?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CINEVAULT").separator("__"),
        );

        builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)
    }
}

fn config_error(err: config::ConfigError) -> IngestError {
    IngestError::InvalidInput(format!("configuration error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_file() {
        let settings = Settings::load(None).expect("default settings");
        assert_eq!(settings.database.max_connections, 16);
        assert!(settings.database.url.starts_with("postgres://"));
    }
}
