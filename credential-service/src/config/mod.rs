//! Configuration module for credential-service.

use chrono::Duration;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{CredentialType, CredentialTypePolicy, PassageDirection, PolicyRegistry};
use crate::services::codec::{CodecConfig, KdfParams};
use crate::services::risk::{FraudConfig, RiskConfig};
use crate::services::validation::CheckpointContext;

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub qr: QrConfig,
    pub fraud: FraudConfig,
    pub risk: RiskConfig,
    pub checkpoint: CheckpointConfig,
    pub policies: PolicyRegistry,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct QrConfig {
    pub encryption_key: Secret<String>,
    pub max_age_seconds: i64,
    pub clock_skew_seconds: i64,
    pub kdf: KdfParams,
}

impl QrConfig {
    /// Build the codec configuration, validating key length and KDF cost.
    pub fn codec_config(&self) -> Result<CodecConfig, AppError> {
        CodecConfig::new(self.encryption_key.clone())?
            .with_max_age(Duration::seconds(self.max_age_seconds))
            .with_clock_skew(Duration::seconds(self.clock_skew_seconds))
            .with_kdf(self.kdf)
    }
}

/// Identity of the checkpoint this process serves.
#[derive(Debug, Clone, Default)]
pub struct CheckpointConfig {
    pub device_id: Option<String>,
    pub location: Option<String>,
    pub access_type: Option<String>,
    pub event_id: Option<Uuid>,
    pub direction: Option<PassageDirection>,
}

impl CheckpointConfig {
    pub fn context(&self) -> CheckpointContext {
        CheckpointContext {
            device_id: self.device_id.clone(),
            ip_address: None,
            location: self.location.clone(),
            access_type: self.access_type.clone(),
            event_id: self.event_id,
            direction: self.direction,
        }
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl CredentialConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let encryption_key = non_empty("QR_ENCRYPTION_KEY").ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("QR_ENCRYPTION_KEY is required"))
        })?;

        let default_kdf = KdfParams::default();
        let qr = QrConfig {
            encryption_key: Secret::new(encryption_key),
            max_age_seconds: parse_or("QR_MAX_AGE_SECONDS", CodecConfig::DEFAULT_MAX_AGE_SECONDS),
            clock_skew_seconds: parse_or(
                "QR_CLOCK_SKEW_SECONDS",
                CodecConfig::DEFAULT_CLOCK_SKEW_SECONDS,
            ),
            kdf: KdfParams {
                memory_kib: parse_or("QR_KDF_MEMORY_KIB", default_kdf.memory_kib),
                iterations: parse_or("QR_KDF_ITERATIONS", default_kdf.iterations),
                parallelism: default_kdf.parallelism,
            },
        };
        // Fail at startup rather than on the first scan.
        qr.codec_config()?;

        let default_fraud = FraudConfig::default();
        let fraud = FraudConfig {
            reuse_threshold: parse_or("FRAUD_REUSE_THRESHOLD", default_fraud.reuse_threshold),
            burst_threshold: parse_or("FRAUD_BURST_THRESHOLD", default_fraud.burst_threshold),
            ..default_fraud
        };

        let direction = match non_empty("CHECKPOINT_DIRECTION") {
            Some(value) => Some(PassageDirection::parse(&value.to_lowercase()).ok_or_else(
                || {
                    AppError::ConfigError(anyhow::anyhow!(
                        "CHECKPOINT_DIRECTION must be entry or exit, got {}",
                        value
                    ))
                },
            )?),
            None => None,
        };
        let event_id = match non_empty("CHECKPOINT_EVENT_ID") {
            Some(value) => Some(Uuid::parse_str(&value).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("CHECKPOINT_EVENT_ID is not a UUID: {}", e))
            })?),
            None => None,
        };

        let overrides = core_config::load_section::<HashMap<CredentialType, CredentialTypePolicy>>(
            "credential_policies",
        )?
        .unwrap_or_default();

        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "credential-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone()),
            otlp_endpoint: env::var("OTLP_ENDPOINT")
                .ok()
                .or_else(|| common.otlp_endpoint.clone()),
            common,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            qr,
            fraud,
            risk: RiskConfig::default(),
            checkpoint: CheckpointConfig {
                device_id: non_empty("CHECKPOINT_DEVICE_ID"),
                location: non_empty("CHECKPOINT_LOCATION"),
                access_type: non_empty("CHECKPOINT_ACCESS_TYPE"),
                event_id,
                direction,
            },
            policies: PolicyRegistry::with_overrides(overrides),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 10] = [
        "DATABASE_URL",
        "QR_ENCRYPTION_KEY",
        "QR_MAX_AGE_SECONDS",
        "QR_KDF_MEMORY_KIB",
        "QR_KDF_ITERATIONS",
        "FRAUD_REUSE_THRESHOLD",
        "CHECKPOINT_EVENT_ID",
        "CHECKPOINT_DIRECTION",
        "CHECKPOINT_ACCESS_TYPE",
        "DATABASE_MAX_CONNECTIONS",
    ];

    fn reset() {
        for var in VARS {
            env::remove_var(var);
        }
        env::set_var("DATABASE_URL", "postgres://localhost/credentials_test");
        env::set_var("QR_ENCRYPTION_KEY", "k".repeat(32));
    }

    #[test]
    #[serial]
    fn loads_defaults() {
        reset();

        let config = CredentialConfig::from_env().unwrap();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.qr.max_age_seconds, CodecConfig::DEFAULT_MAX_AGE_SECONDS);
        assert_eq!(config.qr.kdf, KdfParams::default());
        assert_eq!(config.fraud.reuse_threshold, 100);
        assert_eq!(config.fraud.burst_threshold, 10);
        assert!(config.checkpoint.access_type.is_none());
        assert!(config.qr.codec_config().is_ok());
    }

    #[test]
    #[serial]
    fn encryption_key_is_required() {
        reset();
        env::remove_var("QR_ENCRYPTION_KEY");

        let err = CredentialConfig::from_env().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn short_key_is_rejected() {
        reset();
        env::set_var("QR_ENCRYPTION_KEY", "too-short");

        assert!(CredentialConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn checkpoint_and_thresholds_from_env() {
        reset();
        let event_id = Uuid::new_v4();
        env::set_var("CHECKPOINT_EVENT_ID", event_id.to_string());
        env::set_var("CHECKPOINT_DIRECTION", "Exit");
        env::set_var("CHECKPOINT_ACCESS_TYPE", "hall-a");
        env::set_var("FRAUD_REUSE_THRESHOLD", "25");
        env::set_var("QR_KDF_ITERATIONS", "4");

        let config = CredentialConfig::from_env().unwrap();
        let context = config.checkpoint.context();
        assert_eq!(context.event_id, Some(event_id));
        assert_eq!(context.direction, Some(PassageDirection::Exit));
        assert_eq!(context.access_type.as_deref(), Some("hall-a"));
        assert_eq!(config.fraud.reuse_threshold, 25);
        assert_eq!(config.qr.kdf.iterations, 4);
    }

    #[test]
    #[serial]
    fn malformed_event_id_is_rejected() {
        reset();
        env::set_var("CHECKPOINT_EVENT_ID", "not-a-uuid");

        assert!(CredentialConfig::from_env().is_err());
    }
}
