//! PostgreSQL store for credential-service.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    AccessGrant, Credential, CredentialState, CredentialType, FraudIndicator, GrantDeactivation,
    LifecycleEvent, PassageDirection, PersonalDataFlags, RiskLevel, ValidationLogEntry,
    ValidationOutcome, WeekdayMask,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    ConsumeOutcome, CredentialRecord, CredentialStore, GrantChange, TokenReplacement,
    TransitionRecord, UsageClaim, ValidationLogStore, ValidationStore,
};

const CREDENTIAL_COLUMNS: &str = "credential_id, event_id, credential_code, credential_type, \
    holder_ref, personal_data, qr_payload, qr_hash, state, activation_utc, expiration_utc, \
    usage_count, usage_limit, last_used_utc, reprint_count, created_utc";

const GRANT_COLUMNS: &str = "grant_id, credential_id, access_type_code, is_active, deactivation, \
    valid_from_utc, valid_until_utc, weekday_mask, daily_start, daily_end, daily_limit, \
    daily_usage_count, usage_date, total_limit, total_usage_count, allowed_locations, \
    denied_locations, requires_escort, allows_guests, created_utc";

const LOG_COLUMNS: &str = "log_id, credential_id, access_type_code, token_fingerprint, \
    attempted_utc, outcome, failure_reason, device_id, ip_address, location, direction, \
    entry_log_id, risk_level, risk_score, fraud_indicators";

fn corrupt(what: &str, value: &str) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Invalid {} in database: {}", what, value))
}

fn query_failed(context: &str, e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{}: {}", context, db_err))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e)),
    }
}

#[derive(FromRow)]
struct CredentialRow {
    credential_id: Uuid,
    event_id: Uuid,
    credential_code: String,
    credential_type: String,
    holder_ref: Option<String>,
    personal_data: Option<Json<PersonalDataFlags>>,
    qr_payload: String,
    qr_hash: String,
    state: String,
    activation_utc: Option<DateTime<Utc>>,
    expiration_utc: Option<DateTime<Utc>>,
    usage_count: i32,
    usage_limit: Option<i32>,
    last_used_utc: Option<DateTime<Utc>>,
    reprint_count: i32,
    created_utc: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = AppError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let credential_type: CredentialType = row
            .credential_type
            .parse()
            .map_err(|_| corrupt("credential type", &row.credential_type))?;
        let state =
            CredentialState::parse(&row.state).ok_or_else(|| corrupt("credential state", &row.state))?;

        Ok(Credential {
            credential_id: row.credential_id,
            event_id: row.event_id,
            credential_code: row.credential_code,
            credential_type,
            holder_ref: row.holder_ref,
            personal_data: row.personal_data.map(|Json(flags)| flags),
            qr_payload: row.qr_payload,
            qr_hash: row.qr_hash,
            state,
            activation_utc: row.activation_utc,
            expiration_utc: row.expiration_utc,
            usage_count: row.usage_count,
            usage_limit: row.usage_limit,
            last_used_utc: row.last_used_utc,
            reprint_count: row.reprint_count,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct GrantRow {
    grant_id: Uuid,
    credential_id: Uuid,
    access_type_code: String,
    is_active: bool,
    deactivation: Option<String>,
    valid_from_utc: Option<DateTime<Utc>>,
    valid_until_utc: Option<DateTime<Utc>>,
    weekday_mask: i16,
    daily_start: Option<NaiveTime>,
    daily_end: Option<NaiveTime>,
    daily_limit: Option<i32>,
    daily_usage_count: i32,
    usage_date: Option<NaiveDate>,
    total_limit: Option<i32>,
    total_usage_count: i32,
    allowed_locations: Vec<String>,
    denied_locations: Vec<String>,
    requires_escort: bool,
    allows_guests: bool,
    created_utc: DateTime<Utc>,
}

impl TryFrom<GrantRow> for AccessGrant {
    type Error = AppError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let deactivation = match row.deactivation {
            Some(ref value) => Some(
                GrantDeactivation::parse(value).ok_or_else(|| corrupt("grant deactivation", value))?,
            ),
            None => None,
        };
        let weekday_mask = u8::try_from(row.weekday_mask)
            .map(WeekdayMask::from_bits)
            .map_err(|_| corrupt("weekday mask", &row.weekday_mask.to_string()))?;

        Ok(AccessGrant {
            grant_id: row.grant_id,
            credential_id: row.credential_id,
            access_type_code: row.access_type_code,
            is_active: row.is_active,
            deactivation,
            valid_from_utc: row.valid_from_utc,
            valid_until_utc: row.valid_until_utc,
            weekday_mask,
            daily_start: row.daily_start,
            daily_end: row.daily_end,
            daily_limit: row.daily_limit,
            daily_usage_count: row.daily_usage_count,
            usage_date: row.usage_date,
            total_limit: row.total_limit,
            total_usage_count: row.total_usage_count,
            allowed_locations: row.allowed_locations,
            denied_locations: row.denied_locations,
            requires_escort: row.requires_escort,
            allows_guests: row.allows_guests,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct LifecycleEventRow {
    event_id: Uuid,
    credential_id: Uuid,
    action_code: String,
    from_state: String,
    to_state: String,
    actor: String,
    reason: Option<String>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<LifecycleEventRow> for LifecycleEvent {
    type Error = AppError;

    fn try_from(row: LifecycleEventRow) -> Result<Self, Self::Error> {
        Ok(LifecycleEvent {
            event_id: row.event_id,
            credential_id: row.credential_id,
            action_code: row.action_code,
            from_state: CredentialState::parse(&row.from_state)
                .ok_or_else(|| corrupt("credential state", &row.from_state))?,
            to_state: CredentialState::parse(&row.to_state)
                .ok_or_else(|| corrupt("credential state", &row.to_state))?,
            actor: row.actor,
            reason: row.reason,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    log_id: Uuid,
    credential_id: Option<Uuid>,
    access_type_code: Option<String>,
    token_fingerprint: String,
    attempted_utc: DateTime<Utc>,
    outcome: String,
    failure_reason: Option<String>,
    device_id: Option<String>,
    ip_address: Option<String>,
    location: Option<String>,
    direction: Option<String>,
    entry_log_id: Option<Uuid>,
    risk_level: String,
    risk_score: i32,
    fraud_indicators: Json<Vec<FraudIndicator>>,
}

impl TryFrom<LogRow> for ValidationLogEntry {
    type Error = AppError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let direction = match row.direction {
            Some(ref value) => Some(
                PassageDirection::parse(value).ok_or_else(|| corrupt("direction", value))?,
            ),
            None => None,
        };

        Ok(ValidationLogEntry {
            log_id: row.log_id,
            credential_id: row.credential_id,
            access_type_code: row.access_type_code,
            token_fingerprint: row.token_fingerprint,
            attempted_utc: row.attempted_utc,
            outcome: ValidationOutcome::parse(&row.outcome)
                .ok_or_else(|| corrupt("outcome", &row.outcome))?,
            failure_reason: row.failure_reason,
            device_id: row.device_id,
            ip_address: row.ip_address,
            location: row.location,
            direction,
            entry_log_id: row.entry_log_id,
            risk_level: RiskLevel::parse(&row.risk_level)
                .ok_or_else(|| corrupt("risk level", &row.risk_level))?,
            risk_score: row.risk_score,
            fraud_indicators: row.fraud_indicators.0,
        })
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "credential-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), AppError> {
        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })
    }

    async fn load_grants(&self, credential_id: Uuid) -> Result<Vec<AccessGrant>, AppError> {
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {} FROM access_grants WHERE credential_id = $1 ORDER BY created_utc, grant_id",
            GRANT_COLUMNS
        ))
        .bind(credential_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to load access grants", e))?;

        rows.into_iter().map(AccessGrant::try_from).collect()
    }

    async fn load_record(&self, row: Option<CredentialRow>) -> Result<Option<CredentialRecord>, AppError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let credential = Credential::try_from(row)?;
        let grants = self.load_grants(credential.credential_id).await?;
        Ok(Some(CredentialRecord { credential, grants }))
    }

    async fn find_one(&self, column: &str, value: &str, operation: &str) -> Result<Option<CredentialRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {} FROM credentials WHERE {} = $1",
            CREDENTIAL_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to load credential", e))?;

        let record = self.load_record(row).await?;
        timer.observe_duration();
        Ok(record)
    }

    async fn credential_exists(
        tx: &mut Transaction<'static, Postgres>,
        credential_id: Uuid,
    ) -> Result<bool, AppError> {
        let found: Option<(Uuid,)> =
            sqlx::query_as("SELECT credential_id FROM credentials WHERE credential_id = $1")
                .bind(credential_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| query_failed("Failed to look up credential", e))?;
        Ok(found.is_some())
    }

    async fn insert_event(
        tx: &mut Transaction<'static, Postgres>,
        event: &LifecycleEvent,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_events (event_id, credential_id, action_code, from_state, to_state, actor, reason, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id)
        .bind(event.credential_id)
        .bind(&event.action_code)
        .bind(event.from_state.as_str())
        .bind(event.to_state.as_str())
        .bind(&event.actor)
        .bind(&event.reason)
        .bind(event.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| query_failed("Failed to record lifecycle event", e))?;
        Ok(())
    }

    async fn insert_grant(
        tx: &mut Transaction<'static, Postgres>,
        grant: &AccessGrant,
    ) -> Result<(), AppError> {
        sqlx::query(&format!(
            "INSERT INTO access_grants ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
            GRANT_COLUMNS
        ))
        .bind(grant.grant_id)
        .bind(grant.credential_id)
        .bind(&grant.access_type_code)
        .bind(grant.is_active)
        .bind(grant.deactivation.map(|d| d.as_str()))
        .bind(grant.valid_from_utc)
        .bind(grant.valid_until_utc)
        .bind(i16::from(grant.weekday_mask.bits()))
        .bind(grant.daily_start)
        .bind(grant.daily_end)
        .bind(grant.daily_limit)
        .bind(grant.daily_usage_count)
        .bind(grant.usage_date)
        .bind(grant.total_limit)
        .bind(grant.total_usage_count)
        .bind(&grant.allowed_locations)
        .bind(&grant.denied_locations)
        .bind(grant.requires_escort)
        .bind(grant.allows_guests)
        .bind(grant.created_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| query_failed("Failed to insert access grant", e))?;
        Ok(())
    }

    /// Conditional increments inside `tx`. A refusal leaves nothing to
    /// commit; the caller drops the transaction.
    async fn consume(
        tx: &mut Transaction<'static, Postgres>,
        claim: &UsageClaim,
    ) -> Result<ConsumeOutcome, AppError> {
        // The row lock makes check and increment one step.
        let updated = sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            UPDATE credentials
            SET usage_count = usage_count + 1, last_used_utc = $2
            WHERE credential_id = $1
              AND state = 'active'
              AND (expiration_utc IS NULL OR expiration_utc >= $2)
              AND (usage_limit IS NULL OR usage_count < usage_limit)
            RETURNING {}
            "#,
            CREDENTIAL_COLUMNS
        ))
        .bind(claim.credential_id)
        .bind(claim.now)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| query_failed("Failed to increment credential usage", e))?;

        let Some(row) = updated else {
            return Self::credential_refusal(tx, claim).await;
        };

        if let Some(grant_id) = claim.grant_id {
            let today = claim.now.date_naive();
            let granted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                UPDATE access_grants
                SET daily_usage_count = CASE WHEN usage_date = $3 THEN daily_usage_count + 1 ELSE 1 END,
                    usage_date = $3,
                    total_usage_count = total_usage_count + 1
                WHERE grant_id = $1
                  AND credential_id = $2
                  AND is_active
                  AND (daily_limit IS NULL
                       OR (CASE WHEN usage_date = $3 THEN daily_usage_count ELSE 0 END) < daily_limit)
                  AND (total_limit IS NULL OR total_usage_count < total_limit)
                RETURNING grant_id
                "#,
            )
            .bind(grant_id)
            .bind(claim.credential_id)
            .bind(today)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| query_failed("Failed to increment grant usage", e))?;

            if granted.is_none() {
                return Self::grant_refusal(tx, claim, grant_id).await;
            }
        }

        Ok(ConsumeOutcome::Consumed(Credential::try_from(row)?))
    }

    async fn insert_log<'e, E>(executor: E, entry: &ValidationLogEntry) -> Result<(), AppError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(&format!(
            "INSERT INTO validation_logs ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            LOG_COLUMNS
        ))
        .bind(entry.log_id)
        .bind(entry.credential_id)
        .bind(&entry.access_type_code)
        .bind(&entry.token_fingerprint)
        .bind(entry.attempted_utc)
        .bind(entry.outcome.as_str())
        .bind(&entry.failure_reason)
        .bind(&entry.device_id)
        .bind(&entry.ip_address)
        .bind(&entry.location)
        .bind(entry.direction.map(|d| d.as_str()))
        .bind(entry.entry_log_id)
        .bind(entry.risk_level.as_str())
        .bind(entry.risk_score)
        .bind(Json(&entry.fraud_indicators))
        .execute(executor)
        .await
        .map_err(|e| query_failed("Failed to append validation log", e))?;
        Ok(())
    }

    /// Explain why a conditional credential increment matched no row.
    async fn credential_refusal(
        tx: &mut Transaction<'static, Postgres>,
        claim: &UsageClaim,
    ) -> Result<ConsumeOutcome, AppError> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {} FROM credentials WHERE credential_id = $1",
            CREDENTIAL_COLUMNS
        ))
        .bind(claim.credential_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| query_failed("Failed to load credential", e))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Credential {} not found", claim.credential_id))
        })?;

        let credential = Credential::try_from(row)?;
        if credential.state != CredentialState::Active || credential.is_expired_at(claim.now) {
            Ok(ConsumeOutcome::CredentialInactive)
        } else {
            Ok(ConsumeOutcome::CredentialLimitReached)
        }
    }

    /// Explain why a conditional grant increment matched no row.
    async fn grant_refusal(
        tx: &mut Transaction<'static, Postgres>,
        claim: &UsageClaim,
        grant_id: Uuid,
    ) -> Result<ConsumeOutcome, AppError> {
        let row = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {} FROM access_grants WHERE grant_id = $1 AND credential_id = $2",
            GRANT_COLUMNS
        ))
        .bind(grant_id)
        .bind(claim.credential_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| query_failed("Failed to load access grant", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Access grant {} not found", grant_id)))?;

        let grant = AccessGrant::try_from(row)?;
        let used_today = grant.daily_usage_on(claim.now.date_naive());
        if !grant.is_active {
            Ok(ConsumeOutcome::GrantInactive)
        } else if grant.daily_limit.is_some_and(|limit| used_today >= limit) {
            Ok(ConsumeOutcome::DailyLimitReached)
        } else {
            Ok(ConsumeOutcome::TotalLimitReached)
        }
    }
}

#[async_trait]
impl CredentialStore for Database {
    #[instrument(skip(self, record), fields(credential_id = %record.credential.credential_id))]
    async fn insert_credential(&self, record: &CredentialRecord) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_credential"])
            .start_timer();

        let c = &record.credential;
        let mut tx = self.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO credentials ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            CREDENTIAL_COLUMNS
        ))
        .bind(c.credential_id)
        .bind(c.event_id)
        .bind(&c.credential_code)
        .bind(c.credential_type.as_str())
        .bind(&c.holder_ref)
        .bind(c.personal_data.map(Json))
        .bind(&c.qr_payload)
        .bind(&c.qr_hash)
        .bind(c.state.as_str())
        .bind(c.activation_utc)
        .bind(c.expiration_utc)
        .bind(c.usage_count)
        .bind(c.usage_limit)
        .bind(c.last_used_utc)
        .bind(c.reprint_count)
        .bind(c.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to insert credential", e))?;

        for grant in &record.grants {
            Self::insert_grant(&mut tx, grant).await?;
        }

        Self::commit(tx).await?;
        timer.observe_duration();

        info!(credential_code = %c.credential_code, "Credential stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, credential_id: Uuid) -> Result<Option<CredentialRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_credential_by_id"])
            .start_timer();

        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {} FROM credentials WHERE credential_id = $1",
            CREDENTIAL_COLUMNS
        ))
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to load credential", e))?;

        let record = self.load_record(row).await?;
        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn find_by_code(&self, code: &str) -> Result<Option<CredentialRecord>, AppError> {
        self.find_one("credential_code", code, "find_credential_by_code")
            .await
    }

    #[instrument(skip(self))]
    async fn find_by_hash(&self, qr_hash: &str) -> Result<Option<CredentialRecord>, AppError> {
        self.find_one("qr_hash", qr_hash, "find_credential_by_hash")
            .await
    }

    #[instrument(skip(self), fields(credential_id = %claim.credential_id))]
    async fn try_increment(&self, claim: &UsageClaim) -> Result<ConsumeOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["try_increment"])
            .start_timer();

        let mut tx = self.begin().await?;
        let outcome = Self::consume(&mut tx, claim).await?;
        if matches!(outcome, ConsumeOutcome::Consumed(_)) {
            Self::commit(tx).await?;
        }
        timer.observe_duration();

        Ok(outcome)
    }

    #[instrument(skip(self, transition), fields(credential_id = %transition.credential_id))]
    async fn apply_transition(
        &self,
        transition: &TransitionRecord,
    ) -> Result<Option<Credential>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_transition"])
            .start_timer();

        let mut tx = self.begin().await?;

        let updated = sqlx::query_as::<_, CredentialRow>(&format!(
            "UPDATE credentials SET state = $3 WHERE credential_id = $1 AND state = $2 RETURNING {}",
            CREDENTIAL_COLUMNS
        ))
        .bind(transition.credential_id)
        .bind(transition.expected_state.as_str())
        .bind(transition.new_state.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to update credential state", e))?;

        let Some(row) = updated else {
            if !Self::credential_exists(&mut tx, transition.credential_id).await? {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Credential {} not found",
                    transition.credential_id
                )));
            }
            warn!("Credential state changed before transition was applied");
            return Ok(None);
        };

        match transition.grant_change {
            GrantChange::None => {}
            GrantChange::Deactivate(marker) => {
                sqlx::query(
                    r#"
                    UPDATE access_grants
                    SET is_active = FALSE, deactivation = $2
                    WHERE credential_id = $1 AND (is_active OR deactivation = 'credential_suspended')
                    "#,
                )
                .bind(transition.credential_id)
                .bind(marker.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to deactivate access grants", e))?;
            }
            GrantChange::Restore(marker) => {
                sqlx::query(
                    r#"
                    UPDATE access_grants
                    SET is_active = TRUE, deactivation = NULL
                    WHERE credential_id = $1 AND deactivation = $2
                    "#,
                )
                .bind(transition.credential_id)
                .bind(marker.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to restore access grants", e))?;
            }
        }

        Self::insert_event(&mut tx, &transition.event).await?;
        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(Some(Credential::try_from(row)?))
    }

    #[instrument(skip(self, grant), fields(credential_id = %grant.credential_id))]
    async fn assign_grant(&self, grant: &AccessGrant) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["assign_grant"])
            .start_timer();

        let mut tx = self.begin().await?;

        if !Self::credential_exists(&mut tx, grant.credential_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Credential {} not found",
                grant.credential_id
            )));
        }

        let superseded: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE access_grants
            SET is_active = FALSE, deactivation = 'superseded'
            WHERE credential_id = $1
              AND access_type_code = $2
              AND (is_active OR deactivation = 'credential_suspended')
            RETURNING grant_id
            "#,
        )
        .bind(grant.credential_id)
        .bind(&grant.access_type_code)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to supersede access grants", e))?;

        Self::insert_grant(&mut tx, grant).await?;
        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(superseded.last().map(|(id,)| *id))
    }

    #[instrument(skip(self, replacement), fields(credential_id = %replacement.credential_id))]
    async fn replace_token(
        &self,
        replacement: &TokenReplacement,
    ) -> Result<Option<Credential>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["replace_token"])
            .start_timer();

        let mut tx = self.begin().await?;

        let updated = sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            UPDATE credentials
            SET qr_payload = $3, qr_hash = $4, reprint_count = reprint_count + 1
            WHERE credential_id = $1 AND qr_hash = $2
            RETURNING {}
            "#,
            CREDENTIAL_COLUMNS
        ))
        .bind(replacement.credential_id)
        .bind(&replacement.expected_hash)
        .bind(&replacement.qr_payload)
        .bind(&replacement.qr_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to replace credential token", e))?;

        let Some(row) = updated else {
            if !Self::credential_exists(&mut tx, replacement.credential_id).await? {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Credential {} not found",
                    replacement.credential_id
                )));
            }
            return Ok(None);
        };

        Self::insert_event(&mut tx, &replacement.event).await?;
        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(Some(Credential::try_from(row)?))
    }

    #[instrument(skip(self))]
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Credential>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_overdue"])
            .start_timer();

        let rows = sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            SELECT {}
            FROM credentials
            WHERE state IN ('pending', 'active', 'suspended') AND expiration_utc < $1
            ORDER BY expiration_utc
            "#,
            CREDENTIAL_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list overdue credentials", e))?;

        timer.observe_duration();
        rows.into_iter().map(Credential::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn lifecycle_events(&self, credential_id: Uuid) -> Result<Vec<LifecycleEvent>, AppError> {
        let rows = sqlx::query_as::<_, LifecycleEventRow>(
            r#"
            SELECT event_id, credential_id, action_code, from_state, to_state, actor, reason, created_utc
            FROM lifecycle_events
            WHERE credential_id = $1
            ORDER BY created_utc, event_id
            "#,
        )
        .bind(credential_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to load lifecycle events", e))?;

        rows.into_iter().map(LifecycleEvent::try_from).collect()
    }
}

#[async_trait]
impl ValidationLogStore for Database {
    #[instrument(skip(self, entry), fields(log_id = %entry.log_id))]
    async fn append(&self, entry: &ValidationLogEntry) -> Result<Uuid, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_validation_log"])
            .start_timer();

        Self::insert_log(&self.pool, entry).await?;

        timer.observe_duration();
        Ok(entry.log_id)
    }

    #[instrument(skip(self))]
    async fn history_for_credential(
        &self,
        credential_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ValidationLogEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["validation_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, LogRow>(&format!(
            r#"
            SELECT {}
            FROM validation_logs
            WHERE credential_id = $1 AND ($2::timestamptz IS NULL OR attempted_utc >= $2)
            ORDER BY attempted_utc, log_id
            "#,
            LOG_COLUMNS
        ))
        .bind(credential_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to load validation history", e))?;

        timer.observe_duration();
        rows.into_iter().map(ValidationLogEntry::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn count_token_uses(
        &self,
        credential_id: Uuid,
        token_fingerprint: &str,
    ) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_token_uses"])
            .start_timer();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM validation_logs WHERE token_fingerprint = $1 AND credential_id = $2",
        )
        .bind(token_fingerprint)
        .bind(credential_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to count token uses", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn last_entry_passage(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<ValidationLogEntry>, AppError> {
        let row = sqlx::query_as::<_, LogRow>(&format!(
            r#"
            SELECT {}
            FROM validation_logs
            WHERE credential_id = $1 AND outcome = 'success' AND direction = 'entry'
            ORDER BY attempted_utc DESC
            LIMIT 1
            "#,
            LOG_COLUMNS
        ))
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to load entry passage", e))?;

        row.map(ValidationLogEntry::try_from).transpose()
    }

    #[instrument(skip(self, indicators), fields(count = indicators.len()))]
    async fn append_fraud_indicators(
        &self,
        log_id: Uuid,
        indicators: &[FraudIndicator],
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE validation_logs
            SET fraud_indicators = fraud_indicators || $2
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .bind(Json(indicators))
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to annotate validation log", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Log entry {} not found",
                log_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ValidationStore for Database {
    #[instrument(skip(self, entry), fields(credential_id = %claim.credential_id, log_id = %entry.log_id))]
    async fn consume_and_record(
        &self,
        claim: &UsageClaim,
        entry: &ValidationLogEntry,
    ) -> Result<ConsumeOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["consume_and_record"])
            .start_timer();

        let mut tx = self.begin().await?;
        let outcome = Self::consume(&mut tx, claim).await?;
        if matches!(outcome, ConsumeOutcome::Consumed(_)) {
            Self::insert_log(&mut *tx, entry).await?;
            Self::commit(tx).await?;
        }
        timer.observe_duration();

        Ok(outcome)
    }
}
