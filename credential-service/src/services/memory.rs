//! In-memory store, used by tests and single-process deployments.
//!
//! Each operation holds the table lock for its whole check-and-write, which
//! makes every conditional update atomic. Locks are taken tables first, then
//! logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{
    AccessGrant, Credential, CredentialState, FraudIndicator, GrantDeactivation, LifecycleEvent,
    PassageDirection, ValidationLogEntry, ValidationOutcome,
};
use crate::services::store::{
    ConsumeOutcome, CredentialRecord, CredentialStore, GrantChange, TokenReplacement,
    TransitionRecord, UsageClaim, ValidationLogStore, ValidationStore,
};

#[derive(Default)]
struct Tables {
    credentials: HashMap<Uuid, Credential>,
    grants: HashMap<Uuid, Vec<AccessGrant>>,
    events: Vec<LifecycleEvent>,
}

impl Tables {
    fn consume(&mut self, claim: &UsageClaim) -> Result<ConsumeOutcome, AppError> {
        let today = claim.now.date_naive();

        let credential = self
            .credentials
            .get_mut(&claim.credential_id)
            .ok_or_else(|| credential_not_found(claim.credential_id))?;

        if credential.state != CredentialState::Active || credential.is_expired_at(claim.now) {
            return Ok(ConsumeOutcome::CredentialInactive);
        }
        if !credential.has_usage_remaining() {
            return Ok(ConsumeOutcome::CredentialLimitReached);
        }

        if let Some(grant_id) = claim.grant_id {
            let grant = self
                .grants
                .get_mut(&claim.credential_id)
                .and_then(|grants| grants.iter_mut().find(|g| g.grant_id == grant_id))
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!("Access grant {} not found", grant_id))
                })?;

            if !grant.is_active {
                return Ok(ConsumeOutcome::GrantInactive);
            }
            let used_today = grant.daily_usage_on(today);
            if grant.daily_limit.is_some_and(|limit| used_today >= limit) {
                return Ok(ConsumeOutcome::DailyLimitReached);
            }
            if grant
                .total_limit
                .is_some_and(|limit| grant.total_usage_count >= limit)
            {
                return Ok(ConsumeOutcome::TotalLimitReached);
            }

            grant.daily_usage_count = used_today + 1;
            grant.usage_date = Some(today);
            grant.total_usage_count += 1;
        }

        credential.usage_count += 1;
        credential.last_used_utc = Some(claim.now);
        Ok(ConsumeOutcome::Consumed(credential.clone()))
    }

    fn record(&self, credential: &Credential) -> CredentialRecord {
        CredentialRecord {
            credential: credential.clone(),
            grants: self
                .grants
                .get(&credential.credential_id)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    logs: Mutex<Vec<ValidationLogEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Store mutex poisoned: {}", e)))
    }

    fn logs(&self) -> Result<MutexGuard<'_, Vec<ValidationLogEntry>>, AppError> {
        self.logs
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Log mutex poisoned: {}", e)))
    }
}

fn credential_not_found(credential_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Credential {} not found", credential_id))
}

fn apply_grant_change(grants: &mut [AccessGrant], change: GrantChange) {
    match change {
        GrantChange::None => {}
        GrantChange::Deactivate(marker) => {
            for grant in grants.iter_mut() {
                let held_by_suspension =
                    grant.deactivation == Some(GrantDeactivation::CredentialSuspended);
                if grant.is_active || held_by_suspension {
                    grant.is_active = false;
                    grant.deactivation = Some(marker);
                }
            }
        }
        GrantChange::Restore(marker) => {
            for grant in grants
                .iter_mut()
                .filter(|g| g.deactivation == Some(marker))
            {
                grant.is_active = true;
                grant.deactivation = None;
            }
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn insert_credential(&self, record: &CredentialRecord) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        let credential = &record.credential;

        let duplicate = tables.credentials.values().any(|c| {
            c.credential_id == credential.credential_id
                || c.credential_code == credential.credential_code
                || c.qr_hash == credential.qr_hash
        });
        if duplicate {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Credential {} already exists",
                credential.credential_code
            )));
        }

        tables
            .credentials
            .insert(credential.credential_id, credential.clone());
        tables
            .grants
            .insert(credential.credential_id, record.grants.clone());
        Ok(())
    }

    async fn find_by_id(&self, credential_id: Uuid) -> Result<Option<CredentialRecord>, AppError> {
        let tables = self.tables()?;
        Ok(tables
            .credentials
            .get(&credential_id)
            .map(|c| tables.record(c)))
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<CredentialRecord>, AppError> {
        let tables = self.tables()?;
        Ok(tables
            .credentials
            .values()
            .find(|c| c.credential_code == code)
            .map(|c| tables.record(c)))
    }

    async fn find_by_hash(&self, qr_hash: &str) -> Result<Option<CredentialRecord>, AppError> {
        let tables = self.tables()?;
        Ok(tables
            .credentials
            .values()
            .find(|c| c.qr_hash == qr_hash)
            .map(|c| tables.record(c)))
    }

    async fn try_increment(&self, claim: &UsageClaim) -> Result<ConsumeOutcome, AppError> {
        let mut tables = self.tables()?;
        tables.consume(claim)
    }

    async fn apply_transition(
        &self,
        transition: &TransitionRecord,
    ) -> Result<Option<Credential>, AppError> {
        let mut guard = self.tables()?;
        let tables = &mut *guard;

        let credential = tables
            .credentials
            .get_mut(&transition.credential_id)
            .ok_or_else(|| credential_not_found(transition.credential_id))?;

        if credential.state != transition.expected_state {
            return Ok(None);
        }
        credential.state = transition.new_state;
        let updated = credential.clone();

        if let Some(grants) = tables.grants.get_mut(&transition.credential_id) {
            apply_grant_change(grants, transition.grant_change);
        }
        tables.events.push(transition.event.clone());

        Ok(Some(updated))
    }

    async fn assign_grant(&self, grant: &AccessGrant) -> Result<Option<Uuid>, AppError> {
        let mut tables = self.tables()?;
        if !tables.credentials.contains_key(&grant.credential_id) {
            return Err(credential_not_found(grant.credential_id));
        }

        let grants = tables.grants.entry(grant.credential_id).or_default();
        let mut superseded = None;
        for existing in grants.iter_mut().filter(|g| {
            let held_by_suspension =
                g.deactivation == Some(GrantDeactivation::CredentialSuspended);
            g.access_type_code == grant.access_type_code && (g.is_active || held_by_suspension)
        }) {
            existing.is_active = false;
            existing.deactivation = Some(GrantDeactivation::Superseded);
            superseded = Some(existing.grant_id);
        }
        grants.push(grant.clone());

        Ok(superseded)
    }

    async fn replace_token(
        &self,
        replacement: &TokenReplacement,
    ) -> Result<Option<Credential>, AppError> {
        let mut guard = self.tables()?;
        let tables = &mut *guard;

        let hash_taken = tables.credentials.values().any(|c| {
            c.credential_id != replacement.credential_id && c.qr_hash == replacement.qr_hash
        });
        if hash_taken {
            return Err(AppError::Conflict(anyhow::anyhow!("QR hash already in use")));
        }

        let credential = tables
            .credentials
            .get_mut(&replacement.credential_id)
            .ok_or_else(|| credential_not_found(replacement.credential_id))?;

        if credential.qr_hash != replacement.expected_hash {
            return Ok(None);
        }
        credential.qr_payload = replacement.qr_payload.clone();
        credential.qr_hash = replacement.qr_hash.clone();
        credential.reprint_count += 1;
        let updated = credential.clone();
        tables.events.push(replacement.event.clone());

        Ok(Some(updated))
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Credential>, AppError> {
        let tables = self.tables()?;
        Ok(tables
            .credentials
            .values()
            .filter(|c| !c.state.is_terminal() && c.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn lifecycle_events(&self, credential_id: Uuid) -> Result<Vec<LifecycleEvent>, AppError> {
        let tables = self.tables()?;
        Ok(tables
            .events
            .iter()
            .filter(|e| e.credential_id == credential_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ValidationLogStore for InMemoryStore {
    async fn append(&self, entry: &ValidationLogEntry) -> Result<Uuid, AppError> {
        self.logs()?.push(entry.clone());
        Ok(entry.log_id)
    }

    async fn history_for_credential(
        &self,
        credential_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ValidationLogEntry>, AppError> {
        let logs = self.logs()?;
        let mut history: Vec<ValidationLogEntry> = logs
            .iter()
            .filter(|e| e.credential_id == Some(credential_id))
            .filter(|e| since.is_none_or(|s| e.attempted_utc >= s))
            .cloned()
            .collect();
        history.sort_by_key(|e| e.attempted_utc);
        Ok(history)
    }

    async fn count_token_uses(
        &self,
        credential_id: Uuid,
        token_fingerprint: &str,
    ) -> Result<i64, AppError> {
        let logs = self.logs()?;
        let count = logs
            .iter()
            .filter(|e| {
                e.credential_id == Some(credential_id) && e.token_fingerprint == token_fingerprint
            })
            .count();
        Ok(count as i64)
    }

    async fn last_entry_passage(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<ValidationLogEntry>, AppError> {
        let logs = self.logs()?;
        Ok(logs
            .iter()
            .filter(|e| {
                e.credential_id == Some(credential_id)
                    && e.outcome == ValidationOutcome::Success
                    && e.direction == Some(PassageDirection::Entry)
            })
            .max_by_key(|e| e.attempted_utc)
            .cloned())
    }

    async fn append_fraud_indicators(
        &self,
        log_id: Uuid,
        indicators: &[FraudIndicator],
    ) -> Result<(), AppError> {
        let mut logs = self.logs()?;
        let entry = logs
            .iter_mut()
            .find(|e| e.log_id == log_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Log entry {} not found", log_id)))?;
        entry.fraud_indicators.extend_from_slice(indicators);
        Ok(())
    }
}

#[async_trait]
impl ValidationStore for InMemoryStore {
    async fn consume_and_record(
        &self,
        claim: &UsageClaim,
        entry: &ValidationLogEntry,
    ) -> Result<ConsumeOutcome, AppError> {
        let mut tables = self.tables()?;
        let mut logs = self.logs()?;

        let outcome = tables.consume(claim)?;
        if matches!(outcome, ConsumeOutcome::Consumed(_)) {
            logs.push(entry.clone());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CredentialType, NewAccessGrant};

    fn credential(usage_limit: Option<i32>) -> Credential {
        let id = Uuid::new_v4();
        Credential {
            credential_id: id,
            event_id: Uuid::new_v4(),
            credential_code: format!("VIS-{}", &id.simple().to_string()[..8].to_uppercase()),
            credential_type: CredentialType::Visitor,
            holder_ref: None,
            personal_data: None,
            qr_payload: "token".to_string(),
            qr_hash: id.to_string(),
            state: CredentialState::Active,
            activation_utc: None,
            expiration_utc: None,
            usage_count: 0,
            usage_limit,
            last_used_utc: None,
            reprint_count: 0,
            created_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn increment_stops_at_limit() {
        let store = InMemoryStore::new();
        let cred = credential(Some(2));
        let claim = UsageClaim {
            credential_id: cred.credential_id,
            grant_id: None,
            now: Utc::now(),
        };
        store
            .insert_credential(&CredentialRecord {
                credential: cred,
                grants: vec![],
            })
            .await
            .unwrap();

        assert!(matches!(
            store.try_increment(&claim).await.unwrap(),
            ConsumeOutcome::Consumed(_)
        ));
        assert!(matches!(
            store.try_increment(&claim).await.unwrap(),
            ConsumeOutcome::Consumed(_)
        ));
        assert_eq!(
            store.try_increment(&claim).await.unwrap(),
            ConsumeOutcome::CredentialLimitReached
        );
    }

    #[tokio::test]
    async fn grant_daily_counter_rolls_over() {
        let store = InMemoryStore::new();
        let cred = credential(None);
        let now = Utc::now();
        let grant = NewAccessGrant {
            daily_limit: Some(1),
            ..NewAccessGrant::for_access_type("hall-a")
        }
        .into_grant(cred.credential_id, now);
        let claim = UsageClaim {
            credential_id: cred.credential_id,
            grant_id: Some(grant.grant_id),
            now,
        };
        store
            .insert_credential(&CredentialRecord {
                credential: cred,
                grants: vec![grant],
            })
            .await
            .unwrap();

        assert!(matches!(
            store.try_increment(&claim).await.unwrap(),
            ConsumeOutcome::Consumed(_)
        ));
        assert_eq!(
            store.try_increment(&claim).await.unwrap(),
            ConsumeOutcome::DailyLimitReached
        );

        let tomorrow = UsageClaim {
            now: now + chrono::Duration::days(1),
            ..claim
        };
        assert!(matches!(
            store.try_increment(&tomorrow).await.unwrap(),
            ConsumeOutcome::Consumed(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_code_is_conflict() {
        let store = InMemoryStore::new();
        let first = credential(None);
        let mut second = credential(None);
        second.credential_code = first.credential_code.clone();

        store
            .insert_credential(&CredentialRecord {
                credential: first,
                grants: vec![],
            })
            .await
            .unwrap();
        let err = store
            .insert_credential(&CredentialRecord {
                credential: second,
                grants: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn assign_grant_supersedes_active_grant_of_same_type() {
        let store = InMemoryStore::new();
        let cred = credential(None);
        let now = Utc::now();
        let first = NewAccessGrant::for_access_type("hall-a").into_grant(cred.credential_id, now);
        let first_id = first.grant_id;
        store
            .insert_credential(&CredentialRecord {
                credential: cred.clone(),
                grants: vec![first],
            })
            .await
            .unwrap();

        let second = NewAccessGrant::for_access_type("hall-a").into_grant(cred.credential_id, now);
        let superseded = store.assign_grant(&second).await.unwrap();
        assert_eq!(superseded, Some(first_id));

        let record = store.find_by_id(cred.credential_id).await.unwrap().unwrap();
        let active: Vec<_> = record.grants.iter().filter(|g| g.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].grant_id, second.grant_id);
    }

    fn log_entry(credential_id: Option<Uuid>, outcome: ValidationOutcome) -> ValidationLogEntry {
        ValidationLogEntry {
            log_id: Uuid::new_v4(),
            credential_id,
            access_type_code: None,
            token_fingerprint: "ab".repeat(32),
            attempted_utc: Utc::now(),
            outcome,
            failure_reason: None,
            device_id: None,
            ip_address: None,
            location: None,
            direction: None,
            entry_log_id: None,
            risk_level: crate::models::RiskLevel::Low,
            risk_score: 0,
            fraud_indicators: vec![],
        }
    }

    #[tokio::test]
    async fn refused_use_records_nothing() {
        let store = InMemoryStore::new();
        let cred = credential(Some(1));
        let id = cred.credential_id;
        let claim = UsageClaim {
            credential_id: id,
            grant_id: None,
            now: Utc::now(),
        };
        store
            .insert_credential(&CredentialRecord {
                credential: cred,
                grants: vec![],
            })
            .await
            .unwrap();

        let first = log_entry(Some(id), ValidationOutcome::Success);
        assert!(matches!(
            store.consume_and_record(&claim, &first).await.unwrap(),
            ConsumeOutcome::Consumed(_)
        ));
        let second = log_entry(Some(id), ValidationOutcome::Success);
        assert_eq!(
            store.consume_and_record(&claim, &second).await.unwrap(),
            ConsumeOutcome::CredentialLimitReached
        );

        let history = store.history_for_credential(id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].log_id, first.log_id);
        assert_eq!(
            store.find_by_id(id).await.unwrap().unwrap().credential.usage_count,
            1
        );
        assert_eq!(store.count_token_uses(id, &"ab".repeat(32)).await.unwrap(), 1);
        assert_eq!(store.count_token_uses(id, "cd").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fraud_annotation_is_the_only_log_mutation() {
        let store = InMemoryStore::new();
        let entry = ValidationLogEntry {
            failure_reason: Some("structural_error".into()),
            ..log_entry(None, ValidationOutcome::Failure)
        };
        store.append(&entry).await.unwrap();

        let err = store
            .append_fraud_indicators(Uuid::new_v4(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
