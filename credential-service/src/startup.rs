//! Application startup and lifecycle management.

use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::config::CredentialConfig;
use crate::services::{
    get_metrics, init_metrics, CheckpointContext, CredentialStore, Database, FraudDetector,
    GrantEvaluator, IssuanceService, LifecycleManager, PayloadCodec, RiskScorer,
    ValidationService,
};

/// Feeds scanned tokens, one per line, through validation and writes one
/// JSON result per line.
#[derive(Clone)]
pub struct ScanLoop {
    validation: ValidationService,
    context: CheckpointContext,
}

impl ScanLoop {
    pub fn new(validation: ValidationService, context: CheckpointContext) -> Self {
        Self {
            validation,
            context,
        }
    }

    /// Run until the reader is exhausted. Returns the number of scans handled.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut handled = 0;

        while let Some(line) = lines.next_line().await? {
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            handled += 1;

            let output = match self.validation.validate(token, &self.context).await {
                Ok(result) => serde_json::to_string(&result)?,
                Err(e) => {
                    tracing::error!(error = %e, "Validation could not be completed");
                    json!({ "valid": false, "error": e.to_string() }).to_string()
                }
            };

            writer.write_all(output.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        Ok(handled)
    }
}

/// Application container wiring the store, codec and services together.
pub struct Application {
    config: CredentialConfig,
    db: Arc<Database>,
    lifecycle: LifecycleManager,
    issuance: IssuanceService,
    validation: ValidationService,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CredentialConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: CredentialConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: CredentialConfig, run_migrations: bool) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        let codec = Arc::new(PayloadCodec::new(config.qr.codec_config()?));

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let credentials: Arc<dyn CredentialStore> = db.clone();
        let policies = Arc::new(config.policies.clone());

        let lifecycle = LifecycleManager::new(credentials.clone());
        let issuance = IssuanceService::new(credentials.clone(), codec.clone(), policies.clone());
        let validation = ValidationService::new(codec, db.clone(), GrantEvaluator::new(policies))
            .with_risk(
                RiskScorer::new(config.risk.clone()),
                FraudDetector::new(config.fraud.clone()),
            );

        tracing::info!(
            device_id = ?config.checkpoint.device_id,
            access_type = ?config.checkpoint.access_type,
            event_id = ?config.checkpoint.event_id,
            "Credential service assembled"
        );

        Ok(Self {
            config,
            db,
            lifecycle,
            issuance,
            validation,
        })
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn issuance(&self) -> &IssuanceService {
        &self.issuance
    }

    pub fn validation(&self) -> &ValidationService {
        &self.validation
    }

    /// Persist expirations that passed while the checkpoint was offline.
    /// Validity is still decided at check time; this only tidies stored state.
    pub async fn sweep_expired(&self) {
        match self.lifecycle.expire_overdue(chrono::Utc::now()).await {
            Ok(expired) if !expired.is_empty() => {
                tracing::info!(count = expired.len(), "Expired overdue credentials");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
        }
    }

    /// Run the checkpoint scan loop on stdin until EOF.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.db.health_check().await.map_err(|e| {
            std::io::Error::other(format!("Database unavailable: {}", e))
        })?;

        self.sweep_expired().await;

        tracing::info!(
            service = %self.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            "Checkpoint ready to accept scans"
        );

        let scans = ScanLoop::new(self.validation.clone(), self.config.checkpoint.context());
        let result = scans
            .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await;

        let handled = result?;
        tracing::info!(scans = handled, "Scanner input closed");
        if let Ok(snapshot) = get_metrics() {
            tracing::debug!(metrics = %snapshot, "Final metrics snapshot");
        }
        Ok(())
    }
}
