//! Checkpoint validation.
//!
//! A scan runs through decode, credential lookup, lifecycle validity and grant
//! evaluation, gets a risk score from its recent history, and then either
//! consumes a use together with its log entry in one store write or records
//! the refusal alone. Every attempt leaves exactly one entry; if writing it
//! fails the whole attempt fails and no use is consumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    Credential, FraudIndicator, PassageDirection, QrPayload, RiskLevel, ValidationLogEntry,
    ValidationOutcome,
};
use crate::services::codec::{token_fingerprint, CodecError, PayloadCodec};
use crate::services::error::ServiceError;
use crate::services::grants::{DenialReason, GrantDecision, GrantEvaluator};
use crate::services::lifecycle::{validity, InvalidReason};
use crate::services::metrics;
use crate::services::risk::{AttemptSample, FraudDetector, RiskAssessment, RiskScorer};
use crate::services::store::{
    ConsumeOutcome, CredentialStore, UsageClaim, ValidationLogStore, ValidationStore,
};

/// Where and how a token was scanned.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointContext {
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub location: Option<String>,
    /// Access type the checkpoint guards; grants are only evaluated when set.
    pub access_type: Option<String>,
    /// Event the checkpoint belongs to; tokens for other events are refused.
    pub event_id: Option<Uuid>,
    pub direction: Option<PassageDirection>,
}

/// Why a scan was refused, at the stage it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    Token(CodecError),
    CredentialNotFound,
    /// Token decodes but has been replaced by a reprint.
    TokenSuperseded,
    /// Token contents disagree with the stored credential.
    PayloadMismatch,
    WrongEvent,
    Credential(InvalidReason),
    Access(DenialReason),
}

impl ValidationFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Token(e) => e.reason_code(),
            Self::CredentialNotFound => "credential_not_found",
            Self::TokenSuperseded => "token_superseded",
            Self::PayloadMismatch => "payload_mismatch",
            Self::WrongEvent => "wrong_event",
            Self::Credential(reason) => reason.as_str(),
            Self::Access(reason) => reason.as_str(),
        }
    }

    pub fn outcome(&self) -> ValidationOutcome {
        match self {
            Self::Token(CodecError::Decryption | CodecError::Integrity)
            | Self::CredentialNotFound
            | Self::PayloadMismatch => ValidationOutcome::Suspicious,
            Self::TokenSuperseded
            | Self::Credential(InvalidReason::Revoked | InvalidReason::Suspended)
            | Self::Access(_) => ValidationOutcome::Blocked,
            Self::Token(_) | Self::WrongEvent | Self::Credential(_) => ValidationOutcome::Failure,
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Token(e) => e.to_string(),
            other => other.reason_code().to_string(),
        }
    }
}

/// Answer returned to the checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub outcome: ValidationOutcome,
    /// Reason code of the failure, if any.
    pub reason: Option<String>,
    #[serde(skip)]
    pub failure: Option<ValidationFailure>,
    pub risk_level: RiskLevel,
    pub risk_score: i32,
    pub fraud_indicators: Vec<FraudIndicator>,
    pub log_id: Uuid,
    pub credential_id: Option<Uuid>,
    pub credential_code: Option<String>,
    pub access_type_code: Option<String>,
    pub requires_escort: bool,
    pub allows_guests: bool,
    pub validated_utc: DateTime<Utc>,
}

struct AuthorizedGrant {
    grant_id: Uuid,
    access_type_code: String,
    requires_escort: bool,
    allows_guests: bool,
}

/// Outcome of the read-only checks. A scan that passes them carries the
/// claim still to be consumed.
struct Decision {
    credential: Option<Credential>,
    grant: Option<AuthorizedGrant>,
    failure: Option<ValidationFailure>,
    claim: Option<UsageClaim>,
}

impl Decision {
    fn failed(credential: Option<Credential>, failure: ValidationFailure) -> Self {
        Self {
            credential,
            grant: None,
            failure: Some(failure),
            claim: None,
        }
    }
}

#[derive(Clone)]
pub struct ValidationService {
    codec: Arc<PayloadCodec>,
    store: Arc<dyn ValidationStore>,
    evaluator: GrantEvaluator,
    scorer: RiskScorer,
    detector: FraudDetector,
}

impl ValidationService {
    pub fn new(
        codec: Arc<PayloadCodec>,
        store: Arc<dyn ValidationStore>,
        evaluator: GrantEvaluator,
    ) -> Self {
        Self {
            codec,
            store,
            evaluator,
            scorer: RiskScorer::default(),
            detector: FraudDetector::default(),
        }
    }

    pub fn with_risk(mut self, scorer: RiskScorer, detector: FraudDetector) -> Self {
        self.scorer = scorer;
        self.detector = detector;
        self
    }

    /// Validate a scanned token at a checkpoint.
    pub async fn validate(
        &self,
        token: &str,
        context: &CheckpointContext,
    ) -> Result<ValidationResult, ServiceError> {
        self.validate_at(token, context, Utc::now()).await
    }

    #[instrument(skip(self, token, context), fields(device_id = ?context.device_id))]
    pub async fn validate_at(
        &self,
        token: &str,
        context: &CheckpointContext,
        now: DateTime<Utc>,
    ) -> Result<ValidationResult, ServiceError> {
        let started = Instant::now();
        let fingerprint = token_fingerprint(token);

        let mut decision = self.decide(token, &fingerprint, context, now).await?;

        let (assessment, indicators) = match &decision.credential {
            Some(credential) => {
                self.assess(credential, &fingerprint, context, now)
                    .await?
            }
            None => (
                RiskAssessment {
                    score: 0,
                    level: RiskLevel::Low,
                    factors: Vec::new(),
                },
                Vec::new(),
            ),
        };

        let entry_log_id = match (&decision.claim, context.direction) {
            (Some(claim), Some(PassageDirection::Exit)) => self
                .store
                .last_entry_passage(claim.credential_id)
                .await?
                .map(|entry| entry.log_id),
            _ => None,
        };

        let access_type_code = decision
            .grant
            .as_ref()
            .map(|g| g.access_type_code.clone())
            .or_else(|| context.access_type.clone());

        let mut entry = ValidationLogEntry {
            log_id: Uuid::new_v4(),
            credential_id: decision.credential.as_ref().map(|c| c.credential_id),
            access_type_code: access_type_code.clone(),
            token_fingerprint: fingerprint.clone(),
            attempted_utc: now,
            outcome: decision
                .failure
                .as_ref()
                .map_or(ValidationOutcome::Success, ValidationFailure::outcome),
            failure_reason: decision.failure.as_ref().map(ValidationFailure::detail),
            device_id: context.device_id.clone(),
            ip_address: context.ip_address.clone(),
            location: context.location.clone(),
            direction: context.direction,
            entry_log_id,
            risk_level: assessment.level,
            risk_score: assessment.score,
            fraud_indicators: indicators.clone(),
        };

        let consumed = match decision.claim.take() {
            Some(claim) => {
                let attempt = self
                    .store
                    .consume_and_record(&claim, &entry)
                    .await
                    .map_err(|e| record_failed(e, &fingerprint, started))?;
                match attempt {
                    ConsumeOutcome::Consumed(updated) => {
                        decision.credential = Some(updated);
                        true
                    }
                    refused => {
                        let failure = self.refusal(refused, &claim, now).await?;
                        entry.outcome = failure.outcome();
                        entry.failure_reason = Some(failure.detail());
                        entry.entry_log_id = None;
                        decision.grant = None;
                        decision.failure = Some(failure);
                        false
                    }
                }
            }
            None => false,
        };

        if !consumed {
            self.store
                .append(&entry)
                .await
                .map_err(|e| record_failed(e, &fingerprint, started))?;
        }
        let log_id = entry.log_id;
        let outcome = entry.outcome;

        for indicator in &indicators {
            metrics::record_fraud_indicator(indicator.kind.as_str());
        }
        metrics::record_validation(outcome.as_str(), started.elapsed().as_secs_f64());

        let reason = decision.failure.as_ref().map(|f| f.reason_code().to_string());
        info!(
            log_id = %log_id,
            credential_id = ?entry.credential_id,
            result = %outcome,
            reason = ?reason,
            risk_level = %assessment.level,
            fraud_indicators = indicators.len(),
            "Validation attempt recorded"
        );

        let grant = decision.grant.as_ref();
        Ok(ValidationResult {
            valid: decision.failure.is_none(),
            outcome,
            reason,
            failure: decision.failure,
            risk_level: assessment.level,
            risk_score: assessment.score,
            fraud_indicators: indicators,
            log_id,
            credential_id: entry.credential_id,
            credential_code: decision.credential.map(|c| c.credential_code),
            access_type_code,
            requires_escort: grant.is_some_and(|g| g.requires_escort),
            allows_guests: grant.is_some_and(|g| g.allows_guests),
            validated_utc: now,
        })
    }

    /// Decoding runs the key derivation, so it is kept off the async workers.
    async fn decode(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<QrPayload, CodecError>, ServiceError> {
        let codec = self.codec.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || codec.decode_at(&token, now))
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Decoding task failed: {}", e)))
    }

    async fn decide(
        &self,
        token: &str,
        fingerprint: &str,
        context: &CheckpointContext,
        now: DateTime<Utc>,
    ) -> Result<Decision, ServiceError> {
        let payload = match self.decode(token, now).await? {
            Ok(payload) => payload,
            Err(e) => {
                warn!(token_fingerprint = %fingerprint, error = %e, "Token rejected");
                return Ok(Decision::failed(None, ValidationFailure::Token(e)));
            }
        };

        let Some(record) = self.store.find_by_id(payload.id).await? else {
            warn!(credential_id = %payload.id, "Authentic token for unknown credential");
            return Ok(Decision::failed(None, ValidationFailure::CredentialNotFound));
        };
        let credential = record.credential;

        if credential.qr_hash != fingerprint {
            return Ok(Decision::failed(
                Some(credential),
                ValidationFailure::TokenSuperseded,
            ));
        }
        if credential.credential_code != payload.cred || credential.event_id != payload.evt {
            return Ok(Decision::failed(
                Some(credential),
                ValidationFailure::PayloadMismatch,
            ));
        }
        if context.event_id.is_some_and(|event| event != payload.evt) {
            return Ok(Decision::failed(Some(credential), ValidationFailure::WrongEvent));
        }

        if let Err(reason) = validity(&credential, now) {
            return Ok(Decision::failed(
                Some(credential),
                ValidationFailure::Credential(reason),
            ));
        }

        let grant = match context.access_type.as_deref() {
            None => None,
            Some(access_type) => match self.evaluator.authorize(
                credential.credential_type,
                &record.grants,
                Some(access_type),
                now,
                context.location.as_deref(),
            ) {
                GrantDecision::Denied(reason) => {
                    return Ok(Decision::failed(
                        Some(credential),
                        ValidationFailure::Access(reason),
                    ));
                }
                GrantDecision::Authorized {
                    grant_id,
                    access_type_code,
                    requires_escort,
                    allows_guests,
                } => Some(AuthorizedGrant {
                    grant_id,
                    access_type_code,
                    requires_escort,
                    allows_guests,
                }),
            },
        };

        let claim = UsageClaim {
            credential_id: credential.credential_id,
            grant_id: grant.as_ref().map(|g| g.grant_id),
            now,
        };
        Ok(Decision {
            credential: Some(credential),
            grant,
            failure: None,
            claim: Some(claim),
        })
    }

    /// Map a refused claim to the failure reported for the scan.
    async fn refusal(
        &self,
        refused: ConsumeOutcome,
        claim: &UsageClaim,
        now: DateTime<Utc>,
    ) -> Result<ValidationFailure, ServiceError> {
        let failure = match refused {
            ConsumeOutcome::Consumed(_) | ConsumeOutcome::CredentialLimitReached => {
                ValidationFailure::Credential(InvalidReason::UsageLimitReached)
            }
            ConsumeOutcome::CredentialInactive => {
                // State changed between the read and the increment.
                let reason = match self.store.find_by_id(claim.credential_id).await? {
                    Some(fresh) => validity(&fresh.credential, now).err(),
                    None => None,
                };
                ValidationFailure::Credential(reason.unwrap_or(InvalidReason::Suspended))
            }
            ConsumeOutcome::DailyLimitReached => {
                ValidationFailure::Access(DenialReason::DailyLimitReached)
            }
            ConsumeOutcome::TotalLimitReached => {
                ValidationFailure::Access(DenialReason::TotalLimitReached)
            }
            ConsumeOutcome::GrantInactive => ValidationFailure::Access(DenialReason::GrantInactive),
        };
        Ok(failure)
    }

    /// Score the attempt against the credential's recent history, the attempt
    /// itself included. Reuse is judged on the token's total count.
    async fn assess(
        &self,
        credential: &Credential,
        fingerprint: &str,
        context: &CheckpointContext,
        now: DateTime<Utc>,
    ) -> Result<(RiskAssessment, Vec<FraudIndicator>), ServiceError> {
        let since = now - self.scorer.lookback().max(self.detector.lookback());
        let recent = self
            .store
            .history_for_credential(credential.credential_id, Some(since))
            .await?;
        let prior_uses = self
            .store
            .count_token_uses(credential.credential_id, fingerprint)
            .await?;

        let mut samples: Vec<AttemptSample> = recent.iter().map(AttemptSample::from).collect();
        samples.push(AttemptSample {
            attempted_utc: now,
            token_fingerprint: fingerprint.to_string(),
            ip_address: context.ip_address.clone(),
        });

        let total_uses = usize::try_from(prior_uses).unwrap_or(0) + 1;
        let assessment = self.scorer.score(credential, &samples, now);
        let indicators = self
            .detector
            .detect_token(fingerprint, &samples, total_uses, now);

        Ok((assessment, indicators))
    }

    /// Re-run fraud detection over a credential's full history and annotate
    /// its latest log entry. Never changes credential state.
    #[instrument(skip(self))]
    pub async fn review_credential(
        &self,
        credential_id: Uuid,
    ) -> Result<Vec<FraudIndicator>, ServiceError> {
        self.store
            .find_by_id(credential_id)
            .await?
            .ok_or(ServiceError::CredentialNotFound)?;

        let history = self
            .store
            .history_for_credential(credential_id, None)
            .await?;
        let Some(latest) = history.last() else {
            return Ok(Vec::new());
        };

        let samples: Vec<AttemptSample> = history.iter().map(AttemptSample::from).collect();
        let indicators = self.detector.detect(&samples, Utc::now());

        if !indicators.is_empty() {
            self.store
                .append_fraud_indicators(latest.log_id, &indicators)
                .await?;
            for indicator in &indicators {
                metrics::record_fraud_indicator(indicator.kind.as_str());
            }
            warn!(
                credential_id = %credential_id,
                log_id = %latest.log_id,
                count = indicators.len(),
                "Fraud indicators flagged for review"
            );
        }

        Ok(indicators)
    }
}

fn record_failed(e: AppError, fingerprint: &str, started: Instant) -> ServiceError {
    error!(
        error = %e,
        token_fingerprint = %fingerprint,
        "Failed to record validation attempt"
    );
    metrics::record_validation("log_failed", started.elapsed().as_secs_f64());
    ServiceError::Store(e)
}
