//! Credential issuance, grant assignment and reprints.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    AccessGrant, Credential, CredentialState, CredentialType, GrantDeactivation, LifecycleEvent,
    NewAccessGrant, PersonalDataFlags, PolicyRegistry, QrPayload, PAYLOAD_VERSION,
};
use crate::services::codec::{token_fingerprint, PayloadCodec};
use crate::services::error::ServiceError;
use crate::services::lifecycle::{effective_state, LifecycleManager};
use crate::services::store::{CredentialRecord, CredentialStore, TokenReplacement};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;
const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueRequest {
    pub event_id: Uuid,
    /// Lowercase type name; absent means `general`.
    #[serde(default)]
    pub credential_type: Option<String>,
    #[serde(default)]
    pub holder_ref: Option<String>,
    #[serde(default)]
    pub activation_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_limit: Option<i32>,
    #[serde(default)]
    pub personal_data: Option<PersonalDataFlags>,
    #[serde(default)]
    pub grants: Vec<NewAccessGrant>,
    /// Activate immediately instead of leaving the credential pending.
    #[serde(default)]
    pub activate_now: bool,
    pub issued_by: String,
}

/// `<PREFIX>-<8 characters>` from an alphabet without look-alike characters.
pub fn generate_code(credential_type: CredentialType) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", credential_type.code_prefix(), suffix)
}

fn validate_grant(grant: &NewAccessGrant) -> Result<(), ServiceError> {
    if grant.access_type_code.trim().is_empty() {
        return Err(ServiceError::Validation(
            "access type code is required".to_string(),
        ));
    }
    if let (Some(from), Some(until)) = (grant.valid_from_utc, grant.valid_until_utc) {
        if from > until {
            return Err(ServiceError::Validation(format!(
                "grant for {} ends before it starts",
                grant.access_type_code
            )));
        }
    }
    if grant.daily_limit.is_some_and(|l| l <= 0) || grant.total_limit.is_some_and(|l| l <= 0) {
        return Err(ServiceError::Validation(format!(
            "grant limits for {} must be positive",
            grant.access_type_code
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IssuanceService {
    store: Arc<dyn CredentialStore>,
    codec: Arc<PayloadCodec>,
    policies: Arc<PolicyRegistry>,
    lifecycle: LifecycleManager,
}

impl IssuanceService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        codec: Arc<PayloadCodec>,
        policies: Arc<PolicyRegistry>,
    ) -> Self {
        let lifecycle = LifecycleManager::new(store.clone());
        Self {
            store,
            codec,
            policies,
            lifecycle,
        }
    }

    async fn seal(&self, payload: QrPayload) -> Result<String, ServiceError> {
        let codec = self.codec.clone();
        let token = tokio::task::spawn_blocking(move || codec.encode(&payload))
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Encoding task failed: {}", e)))??;
        Ok(token)
    }

    /// Create a credential with its initial grants.
    #[instrument(skip(self, request), fields(event_id = %request.event_id))]
    pub async fn issue(&self, request: IssueRequest) -> Result<CredentialRecord, ServiceError> {
        let credential_type = CredentialType::resolve(request.credential_type.as_deref())?;
        let policy = self.policies.policy(credential_type);

        if request.issued_by.trim().is_empty() {
            return Err(ServiceError::Validation("issuer is required".to_string()));
        }
        if request.usage_limit.is_some_and(|l| l <= 0) {
            return Err(ServiceError::Validation(
                "usage limit must be positive".to_string(),
            ));
        }
        let mut access_types = HashSet::new();
        for grant in &request.grants {
            validate_grant(grant)?;
            if !access_types.insert(grant.access_type_code.as_str()) {
                return Err(ServiceError::Validation(format!(
                    "duplicate grant for access type {}",
                    grant.access_type_code
                )));
            }
        }

        let now = Utc::now();
        let expiration_utc = request.expiration_utc.or_else(|| {
            policy
                .default_validity_days
                .map(|days| request.activation_utc.unwrap_or(now) + Duration::days(days))
        });
        if let (Some(activation), Some(expiration)) = (request.activation_utc, expiration_utc) {
            if activation > expiration {
                return Err(ServiceError::Validation(
                    "credential expires before it activates".to_string(),
                ));
            }
        }

        let credential_id = Uuid::new_v4();
        let mut attempts = 0;
        let record = loop {
            attempts += 1;
            let credential_code = generate_code(credential_type);
            let payload = QrPayload {
                id: credential_id,
                cred: credential_code.clone(),
                evt: request.event_id,
                exp: expiration_utc.map(|e| e.timestamp()),
                ts: now.timestamp(),
                v: PAYLOAD_VERSION,
                pd: request.personal_data,
            };
            let token = self.seal(payload).await?;

            let record = CredentialRecord {
                credential: Credential {
                    credential_id,
                    event_id: request.event_id,
                    credential_code,
                    credential_type,
                    holder_ref: request.holder_ref.clone(),
                    personal_data: request.personal_data,
                    qr_hash: token_fingerprint(&token),
                    qr_payload: token,
                    state: CredentialState::Pending,
                    activation_utc: request.activation_utc,
                    expiration_utc,
                    usage_count: 0,
                    usage_limit: request.usage_limit,
                    last_used_utc: None,
                    reprint_count: 0,
                    created_utc: now,
                },
                grants: request
                    .grants
                    .iter()
                    .cloned()
                    .map(|g| g.into_grant(credential_id, now))
                    .collect(),
            };

            match self.store.insert_credential(&record).await {
                Ok(()) => break record,
                Err(AppError::Conflict(e)) if attempts < MAX_CODE_ATTEMPTS => {
                    warn!(error = %e, attempt = attempts, "Credential code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(
            credential_id = %credential_id,
            credential_code = %record.credential.credential_code,
            credential_type = %credential_type,
            grants = record.grants.len(),
            "Credential issued"
        );

        if request.activate_now {
            let credential = self
                .lifecycle
                .activate(credential_id, &request.issued_by, Some("activated at issuance"))
                .await?;
            return Ok(CredentialRecord {
                credential,
                grants: record.grants,
            });
        }

        Ok(record)
    }

    /// Attach a grant; an active grant of the same access type is superseded.
    #[instrument(skip(self, grant), fields(access_type = %grant.access_type_code))]
    pub async fn assign_grant(
        &self,
        credential_id: Uuid,
        grant: NewAccessGrant,
    ) -> Result<AccessGrant, ServiceError> {
        validate_grant(&grant)?;
        let now = Utc::now();

        let credential = self
            .store
            .find_by_id(credential_id)
            .await?
            .ok_or(ServiceError::CredentialNotFound)?
            .credential;

        let state = effective_state(&credential, now);
        if state.is_terminal() {
            return Err(ServiceError::State(format!(
                "cannot assign a grant to a {} credential",
                state
            )));
        }

        let mut grant = grant.into_grant(credential_id, now);
        // Held like the other grants so reactivation restores it.
        if state == CredentialState::Suspended {
            grant.is_active = false;
            grant.deactivation = Some(GrantDeactivation::CredentialSuspended);
        }

        let superseded = self.store.assign_grant(&grant).await?;
        info!(
            credential_id = %credential_id,
            grant_id = %grant.grant_id,
            superseded = ?superseded,
            "Access grant assigned"
        );

        Ok(grant)
    }

    /// Issue a fresh token for a credential. Earlier tokens stop validating.
    #[instrument(skip(self))]
    pub async fn reprint(&self, credential_id: Uuid, actor: &str) -> Result<Credential, ServiceError> {
        if actor.trim().is_empty() {
            return Err(ServiceError::Validation("actor is required".to_string()));
        }
        let now = Utc::now();

        let credential = self
            .store
            .find_by_id(credential_id)
            .await?
            .ok_or(ServiceError::CredentialNotFound)?
            .credential;

        let state = effective_state(&credential, now);
        if state.is_terminal() {
            return Err(ServiceError::State(format!(
                "cannot reprint a {} credential",
                state
            )));
        }

        let policy = self.policies.policy(credential.credential_type);
        if !policy.reprint_allowed(credential.reprint_count) {
            return Err(ServiceError::Policy(format!(
                "{} credentials allow {} reprints",
                credential.credential_type,
                policy.max_reprints.unwrap_or_default()
            )));
        }

        let token = self
            .seal(QrPayload {
                id: credential.credential_id,
                cred: credential.credential_code.clone(),
                evt: credential.event_id,
                exp: credential.expiration_utc.map(|e| e.timestamp()),
                ts: now.timestamp(),
                v: PAYLOAD_VERSION,
                pd: credential.personal_data,
            })
            .await?;

        let replacement = TokenReplacement {
            credential_id,
            expected_hash: credential.qr_hash.clone(),
            qr_hash: token_fingerprint(&token),
            qr_payload: token,
            event: LifecycleEvent::new(
                credential_id,
                "reprint",
                credential.state,
                credential.state,
                actor,
                None,
                now,
            ),
        };

        let updated = self
            .store
            .replace_token(&replacement)
            .await?
            .ok_or_else(|| {
                ServiceError::Conflict(format!(
                    "credential {} was reprinted concurrently",
                    credential_id
                ))
            })?;

        info!(
            credential_id = %credential_id,
            reprint_count = updated.reprint_count,
            "Credential reprinted"
        );
        Ok(updated)
    }
}
