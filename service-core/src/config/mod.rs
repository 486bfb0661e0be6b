use crate::error::AppError;
use config::{Config as Cfg, ConfigError, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Settings every service shares, layered from an optional `configuration`
/// file and `APP__*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            otlp_endpoint: None,
        }
    }
}

fn layered() -> Result<Cfg, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(config)
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        Ok(layered()?.try_deserialize()?)
    }
}

/// Deserialize a named section of the layered configuration.
///
/// Returns `Ok(None)` when the section is absent so callers can fall back to
/// built-in defaults; a present but malformed section is an error.
pub fn load_section<T: DeserializeOwned>(section: &str) -> Result<Option<T>, AppError> {
    match layered()?.get::<T>(section) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
