//! Credential lifecycle.
//!
//! ```text
//! pending ──activate──▶ active ◀──reactivate── suspended
//!                         │ ──────suspend──────▶ │
//!                         └─(expiration passes)─▶ expired
//! any non-terminal ──revoke──▶ revoked
//! ```
//!
//! Decisions are made by [`plan_transition`], a pure function; the manager
//! only applies the resulting plan through a compare-and-set on the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{Credential, CredentialState, GrantDeactivation, LifecycleEvent};
use crate::services::error::ServiceError;
use crate::services::grants::DenialReason;
use crate::services::metrics;
use crate::services::store::{
    ConsumeOutcome, CredentialStore, GrantChange, TransitionRecord, UsageClaim,
};

const MAX_TRANSITION_ATTEMPTS: usize = 3;
const SYSTEM_ACTOR: &str = "system";

/// Why a credential is not currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Revoked,
    Expired,
    Suspended,
    Pending,
    NotYetActive,
    UsageLimitReached,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revoked => "credential_revoked",
            Self::Expired => "credential_expired",
            Self::Suspended => "credential_suspended",
            Self::Pending => "credential_pending",
            Self::NotYetActive => "credential_not_yet_active",
            Self::UsageLimitReached => "usage_limit_reached",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State as of `now`: a non-terminal credential past its expiration is
/// expired whether or not a sweep has persisted it.
pub fn effective_state(credential: &Credential, now: DateTime<Utc>) -> CredentialState {
    if !credential.state.is_terminal() && credential.is_expired_at(now) {
        CredentialState::Expired
    } else {
        credential.state
    }
}

/// Check usability at `now`, reporting the first reason it fails.
///
/// An expiration in the past dominates every other field.
pub fn validity(credential: &Credential, now: DateTime<Utc>) -> Result<(), InvalidReason> {
    match effective_state(credential, now) {
        CredentialState::Revoked => Err(InvalidReason::Revoked),
        CredentialState::Expired => Err(InvalidReason::Expired),
        CredentialState::Suspended => Err(InvalidReason::Suspended),
        CredentialState::Pending => Err(InvalidReason::Pending),
        CredentialState::Active if credential.is_not_yet_active_at(now) => {
            Err(InvalidReason::NotYetActive)
        }
        CredentialState::Active if !credential.has_usage_remaining() => {
            Err(InvalidReason::UsageLimitReached)
        }
        CredentialState::Active => Ok(()),
    }
}

pub fn is_valid(credential: &Credential, now: DateTime<Utc>) -> bool {
    validity(credential, now).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Activate,
    Suspend,
    Reactivate,
    Revoke,
    /// Persist an expiration that has already passed.
    Expire,
}

impl LifecycleCommand {
    pub fn action_code(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Suspend => "suspend",
            Self::Reactivate => "reactivate",
            Self::Revoke => "revoke",
            Self::Expire => "expire",
        }
    }

    fn requires_reason(&self) -> bool {
        matches!(self, Self::Suspend | Self::Revoke)
    }
}

impl std::fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.action_code())
    }
}

/// State change to apply, with its effect on the credential's grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Stored state the change is conditional on.
    pub from: CredentialState,
    pub to: CredentialState,
    pub grant_change: GrantChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    Apply(Transition),
    /// Already in the target state.
    NoOp,
}

/// Decide what `command` does to `credential` at `now`.
pub fn plan_transition(
    credential: &Credential,
    command: LifecycleCommand,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, ServiceError> {
    use CredentialState::*;
    use LifecycleCommand::*;

    let stored = credential.state;
    let current = effective_state(credential, now);
    let apply = |to, grant_change| {
        Ok(TransitionPlan::Apply(Transition {
            from: stored,
            to,
            grant_change,
        }))
    };

    match (command, current) {
        (Expire, Expired) if stored == Expired => Ok(TransitionPlan::NoOp),
        (Expire, Expired) => apply(Expired, GrantChange::None),
        (Expire, state) => Err(ServiceError::State(format!(
            "cannot expire a {} credential",
            state
        ))),
        (Suspend, Suspended) | (Revoke, Revoked) => Ok(TransitionPlan::NoOp),
        (command, state) if state.is_terminal() => Err(ServiceError::State(format!(
            "cannot {} a {} credential",
            command, state
        ))),
        (Activate, Pending) => apply(Active, GrantChange::None),
        (Suspend, Active) => apply(
            Suspended,
            GrantChange::Deactivate(GrantDeactivation::CredentialSuspended),
        ),
        (Reactivate, Suspended) => apply(
            Active,
            GrantChange::Restore(GrantDeactivation::CredentialSuspended),
        ),
        (Revoke, _) => apply(
            Revoked,
            GrantChange::Deactivate(GrantDeactivation::CredentialRevoked),
        ),
        (command, state) => Err(ServiceError::State(format!(
            "cannot {} a {} credential",
            command, state
        ))),
    }
}

/// Applies administrative transitions and usage registration.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<dyn CredentialStore>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn activate(
        &self,
        credential_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Credential, ServiceError> {
        self.transition(credential_id, LifecycleCommand::Activate, actor, reason)
            .await
    }

    pub async fn suspend(
        &self,
        credential_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Credential, ServiceError> {
        self.transition(credential_id, LifecycleCommand::Suspend, actor, reason)
            .await
    }

    pub async fn reactivate(
        &self,
        credential_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Credential, ServiceError> {
        self.transition(credential_id, LifecycleCommand::Reactivate, actor, reason)
            .await
    }

    pub async fn revoke(
        &self,
        credential_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Credential, ServiceError> {
        self.transition(credential_id, LifecycleCommand::Revoke, actor, reason)
            .await
    }

    #[instrument(skip(self, reason), fields(action = %command))]
    pub async fn transition(
        &self,
        credential_id: Uuid,
        command: LifecycleCommand,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Credential, ServiceError> {
        if actor.trim().is_empty() {
            return Err(ServiceError::Validation("actor is required".to_string()));
        }
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if command.requires_reason() && reason.is_none() {
            return Err(ServiceError::Validation(format!(
                "a reason is required to {}",
                command
            )));
        }

        // A lost compare-and-set is retried against the fresh state, so two
        // concurrent suspends end with one transition and one no-op.
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let now = Utc::now();
            let credential = self
                .store
                .find_by_id(credential_id)
                .await?
                .ok_or(ServiceError::CredentialNotFound)?
                .credential;

            let transition = match plan_transition(&credential, command, now)? {
                TransitionPlan::NoOp => {
                    info!(
                        credential_id = %credential_id,
                        state = %credential.state,
                        "Credential already in target state"
                    );
                    return Ok(credential);
                }
                TransitionPlan::Apply(transition) => transition,
            };

            if let Some(updated) = self
                .apply(credential_id, command, transition, actor, reason, now)
                .await?
            {
                return Ok(updated);
            }

            warn!(credential_id = %credential_id, "Credential changed concurrently, retrying");
        }

        Err(ServiceError::Conflict(format!(
            "credential {} kept changing during {}",
            credential_id, command
        )))
    }

    async fn apply(
        &self,
        credential_id: Uuid,
        command: LifecycleCommand,
        transition: Transition,
        actor: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, ServiceError> {
        let record = TransitionRecord {
            credential_id,
            expected_state: transition.from,
            new_state: transition.to,
            grant_change: transition.grant_change,
            event: LifecycleEvent::new(
                credential_id,
                command.action_code(),
                transition.from,
                transition.to,
                actor,
                reason,
                now,
            ),
        };

        let updated = self.store.apply_transition(&record).await?;
        if updated.is_some() {
            metrics::record_transition(transition.to.as_str());
            info!(
                credential_id = %credential_id,
                from_state = %transition.from,
                to_state = %transition.to,
                actor = actor,
                "Credential state changed"
            );
        }
        Ok(updated)
    }

    /// Atomically consume one use of the credential.
    pub async fn register_use(&self, credential_id: Uuid) -> Result<Credential, ServiceError> {
        self.register_use_at(credential_id, Utc::now()).await
    }

    pub async fn register_use_at(
        &self,
        credential_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Credential, ServiceError> {
        let claim = UsageClaim {
            credential_id,
            grant_id: None,
            now,
        };

        match self.store.try_increment(&claim).await? {
            ConsumeOutcome::Consumed(credential) => Ok(credential),
            ConsumeOutcome::CredentialLimitReached => Err(ServiceError::RateExceeded(format!(
                "credential {} has no uses left",
                credential_id
            ))),
            ConsumeOutcome::CredentialInactive => Err(ServiceError::State(format!(
                "credential {} is not active",
                credential_id
            ))),
            ConsumeOutcome::DailyLimitReached => {
                Err(ServiceError::AccessDenied(DenialReason::DailyLimitReached))
            }
            ConsumeOutcome::TotalLimitReached => {
                Err(ServiceError::AccessDenied(DenialReason::TotalLimitReached))
            }
            ConsumeOutcome::GrantInactive => {
                Err(ServiceError::AccessDenied(DenialReason::GrantInactive))
            }
        }
    }

    /// Persist expirations that have passed. Returns the ids moved to expired.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, ServiceError> {
        let overdue = self.store.list_overdue(now).await?;
        let mut expired = Vec::with_capacity(overdue.len());

        for credential in overdue {
            let transition = match plan_transition(&credential, LifecycleCommand::Expire, now)? {
                TransitionPlan::Apply(transition) => transition,
                TransitionPlan::NoOp => continue,
            };

            let applied = self
                .apply(
                    credential.credential_id,
                    LifecycleCommand::Expire,
                    transition,
                    SYSTEM_ACTOR,
                    Some("expiration passed"),
                    now,
                )
                .await?;

            match applied {
                Some(_) => expired.push(credential.credential_id),
                None => warn!(
                    credential_id = %credential.credential_id,
                    "Credential changed during expiry sweep, skipped"
                ),
            }
        }

        info!(count = expired.len(), "Expiry sweep complete");
        Ok(expired)
    }

    pub async fn audit_trail(&self, credential_id: Uuid) -> Result<Vec<LifecycleEvent>, ServiceError> {
        Ok(self.store.lifecycle_events(credential_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CredentialType;
    use chrono::Duration;

    fn credential(state: CredentialState) -> Credential {
        Credential {
            credential_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            credential_code: "STF-AB12CD34".to_string(),
            credential_type: CredentialType::Staff,
            holder_ref: None,
            personal_data: None,
            qr_payload: String::new(),
            qr_hash: String::new(),
            state,
            activation_utc: None,
            expiration_utc: None,
            usage_count: 0,
            usage_limit: None,
            last_used_utc: None,
            reprint_count: 0,
            created_utc: Utc::now(),
        }
    }

    fn planned(plan: TransitionPlan) -> Transition {
        match plan {
            TransitionPlan::Apply(t) => t,
            TransitionPlan::NoOp => panic!("expected a transition"),
        }
    }

    #[test]
    fn active_credential_without_bounds_is_valid() {
        assert!(is_valid(&credential(CredentialState::Active), Utc::now()));
    }

    #[test]
    fn expiration_dominates_every_state() {
        let now = Utc::now();
        for state in [
            CredentialState::Pending,
            CredentialState::Active,
            CredentialState::Suspended,
            CredentialState::Expired,
        ] {
            let mut cred = credential(state);
            cred.expiration_utc = Some(now - Duration::seconds(1));
            assert_eq!(validity(&cred, now), Err(InvalidReason::Expired));
        }
    }

    #[test]
    fn expiration_bound_is_inclusive() {
        let now = Utc::now();
        let mut cred = credential(CredentialState::Active);
        cred.expiration_utc = Some(now);
        cred.activation_utc = Some(now);
        assert!(is_valid(&cred, now));
    }

    #[test]
    fn not_yet_active_and_usage_limit() {
        let now = Utc::now();
        let mut cred = credential(CredentialState::Active);
        cred.activation_utc = Some(now + Duration::hours(1));
        assert_eq!(validity(&cred, now), Err(InvalidReason::NotYetActive));

        let mut cred = credential(CredentialState::Active);
        cred.usage_limit = Some(1);
        cred.usage_count = 1;
        assert_eq!(validity(&cred, now), Err(InvalidReason::UsageLimitReached));
    }

    #[test]
    fn suspend_and_reactivate_cycle_grants() {
        let now = Utc::now();
        let t = planned(
            plan_transition(&credential(CredentialState::Active), LifecycleCommand::Suspend, now)
                .unwrap(),
        );
        assert_eq!(t.to, CredentialState::Suspended);
        assert_eq!(
            t.grant_change,
            GrantChange::Deactivate(GrantDeactivation::CredentialSuspended)
        );

        let t = planned(
            plan_transition(
                &credential(CredentialState::Suspended),
                LifecycleCommand::Reactivate,
                now,
            )
            .unwrap(),
        );
        assert_eq!(t.to, CredentialState::Active);
        assert_eq!(
            t.grant_change,
            GrantChange::Restore(GrantDeactivation::CredentialSuspended)
        );
    }

    #[test]
    fn suspend_and_revoke_are_idempotent() {
        let now = Utc::now();
        assert_eq!(
            plan_transition(&credential(CredentialState::Suspended), LifecycleCommand::Suspend, now)
                .unwrap(),
            TransitionPlan::NoOp
        );
        assert_eq!(
            plan_transition(&credential(CredentialState::Revoked), LifecycleCommand::Revoke, now)
                .unwrap(),
            TransitionPlan::NoOp
        );
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let now = Utc::now();
        for command in [
            LifecycleCommand::Activate,
            LifecycleCommand::Suspend,
            LifecycleCommand::Reactivate,
        ] {
            let err =
                plan_transition(&credential(CredentialState::Revoked), command, now).unwrap_err();
            assert!(matches!(err, ServiceError::State(_)));
        }

        let err = plan_transition(&credential(CredentialState::Expired), LifecycleCommand::Revoke, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::State(_)));
    }

    #[test]
    fn lapsed_active_credential_counts_as_expired() {
        let now = Utc::now();
        let mut cred = credential(CredentialState::Active);
        cred.expiration_utc = Some(now - Duration::minutes(1));

        let err = plan_transition(&cred, LifecycleCommand::Suspend, now).unwrap_err();
        assert!(matches!(err, ServiceError::State(_)));

        let t = planned(plan_transition(&cred, LifecycleCommand::Expire, now).unwrap());
        assert_eq!(t.from, CredentialState::Active);
        assert_eq!(t.to, CredentialState::Expired);
    }

    #[test]
    fn expire_before_expiration_is_rejected() {
        let err = plan_transition(
            &credential(CredentialState::Active),
            LifecycleCommand::Expire,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::State(_)));
    }

    #[test]
    fn invalid_source_states_are_rejected() {
        let now = Utc::now();
        assert!(plan_transition(&credential(CredentialState::Active), LifecycleCommand::Activate, now)
            .is_err());
        assert!(
            plan_transition(&credential(CredentialState::Pending), LifecycleCommand::Suspend, now)
                .is_err()
        );
        assert!(plan_transition(
            &credential(CredentialState::Active),
            LifecycleCommand::Reactivate,
            now
        )
        .is_err());
    }

    #[test]
    fn revoke_from_any_non_terminal_state() {
        let now = Utc::now();
        for state in [
            CredentialState::Pending,
            CredentialState::Active,
            CredentialState::Suspended,
        ] {
            let t = planned(
                plan_transition(&credential(state), LifecycleCommand::Revoke, now).unwrap(),
            );
            assert_eq!(t.from, state);
            assert_eq!(t.to, CredentialState::Revoked);
        }
    }
}
