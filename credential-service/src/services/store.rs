//! Persistence seams.
//!
//! Every conditional write (usage increments, state transitions, token
//! replacement, grant supersession) is a single store operation so that
//! concurrent checkpoints cannot interleave a read and a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    AccessGrant, Credential, CredentialState, FraudIndicator, GrantDeactivation, LifecycleEvent,
    ValidationLogEntry,
};

/// A credential together with all of its grants, active or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub credential: Credential,
    pub grants: Vec<AccessGrant>,
}

impl CredentialRecord {
    pub fn active_grant(&self, access_type_code: &str) -> Option<&AccessGrant> {
        self.grants
            .iter()
            .find(|g| g.is_active && g.access_type_code == access_type_code)
    }
}

/// One use of a credential, optionally through a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageClaim {
    pub credential_id: Uuid,
    pub grant_id: Option<Uuid>,
    pub now: DateTime<Utc>,
}

/// Result of the atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Counters were incremented; carries the updated credential.
    Consumed(Credential),
    /// Credential is no longer active.
    CredentialInactive,
    CredentialLimitReached,
    DailyLimitReached,
    TotalLimitReached,
    GrantInactive,
}

/// How a transition touches the credential's grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantChange {
    None,
    /// Deactivate active grants, and re-mark grants held by a suspension.
    Deactivate(GrantDeactivation),
    /// Reactivate grants carrying this marker.
    Restore(GrantDeactivation),
}

/// A planned state change, applied only if the stored state still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub credential_id: Uuid,
    pub expected_state: CredentialState,
    pub new_state: CredentialState,
    pub grant_change: GrantChange,
    pub event: LifecycleEvent,
}

/// Replacement of a credential's printed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReplacement {
    pub credential_id: Uuid,
    pub expected_hash: String,
    pub qr_payload: String,
    pub qr_hash: String,
    pub event: LifecycleEvent,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Persist a new credential with its initial grants.
    async fn insert_credential(&self, record: &CredentialRecord) -> Result<(), AppError>;

    async fn find_by_id(&self, credential_id: Uuid) -> Result<Option<CredentialRecord>, AppError>;

    async fn find_by_code(&self, code: &str) -> Result<Option<CredentialRecord>, AppError>;

    async fn find_by_hash(&self, qr_hash: &str) -> Result<Option<CredentialRecord>, AppError>;

    /// Atomically check every applicable limit and increment the credential
    /// counter (and the grant counters when a grant is named).
    async fn try_increment(&self, claim: &UsageClaim) -> Result<ConsumeOutcome, AppError>;

    /// Apply a transition if the stored state equals `expected_state`.
    /// Returns `None` when the state changed underneath.
    async fn apply_transition(
        &self,
        transition: &TransitionRecord,
    ) -> Result<Option<Credential>, AppError>;

    /// Attach a grant, superseding any grant of the same access type that is
    /// active or held by a suspension. Returns the id of the superseded grant.
    async fn assign_grant(&self, grant: &AccessGrant) -> Result<Option<Uuid>, AppError>;

    /// Swap the token if the stored hash still equals `expected_hash`, bumping
    /// the reprint counter. Returns `None` when the hash changed underneath.
    async fn replace_token(
        &self,
        replacement: &TokenReplacement,
    ) -> Result<Option<Credential>, AppError>;

    /// Non-terminal credentials whose expiration is before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Credential>, AppError>;

    async fn lifecycle_events(&self, credential_id: Uuid) -> Result<Vec<LifecycleEvent>, AppError>;
}

#[async_trait]
pub trait ValidationLogStore: Send + Sync {
    /// Append one entry; returns its id.
    async fn append(&self, entry: &ValidationLogEntry) -> Result<Uuid, AppError>;

    /// Entries for a credential, oldest first, optionally from `since` on.
    async fn history_for_credential(
        &self,
        credential_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ValidationLogEntry>, AppError>;

    /// Number of entries recorded for one token of a credential.
    async fn count_token_uses(
        &self,
        credential_id: Uuid,
        token_fingerprint: &str,
    ) -> Result<i64, AppError>;

    /// Latest successful entry passage of a credential.
    async fn last_entry_passage(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<ValidationLogEntry>, AppError>;

    /// The only permitted mutation of a log entry.
    async fn append_fraud_indicators(
        &self,
        log_id: Uuid,
        indicators: &[FraudIndicator],
    ) -> Result<(), AppError>;
}

/// Store behind checkpoint validation: credentials and their log together.
#[async_trait]
pub trait ValidationStore: CredentialStore + ValidationLogStore {
    /// Consume one use and append its log entry as one atomic write. When the
    /// use is refused nothing is written and the refusal is returned.
    async fn consume_and_record(
        &self,
        claim: &UsageClaim,
        entry: &ValidationLogEntry,
    ) -> Result<ConsumeOutcome, AppError>;
}
