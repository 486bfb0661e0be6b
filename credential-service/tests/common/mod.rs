//! Common test utilities for credential-service integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use credential_service::models::{
    Credential, CredentialState, CredentialType, NewAccessGrant, PolicyRegistry, QrPayload,
    PAYLOAD_VERSION,
};
use credential_service::services::{
    token_fingerprint, CodecConfig, CredentialRecord, CredentialStore, FraudConfig,
    FraudDetector, GrantEvaluator, InMemoryStore, IssuanceService, KdfParams, LifecycleManager,
    PayloadCodec, RiskScorer, ValidationService,
};
use secrecy::Secret;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

pub const TEST_KEY: &str = "integration-test-key-0123456789abcdef";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,credential_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Argon2 costs low enough for tests; production defaults are far higher.
pub fn cheap_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    }
}

pub fn codec_with_key(key: &str) -> PayloadCodec {
    let config = CodecConfig::new(Secret::new(key.to_string()))
        .and_then(|c| c.with_kdf(cheap_kdf()))
        .expect("test codec config");
    PayloadCodec::new(config)
}

pub fn test_codec() -> PayloadCodec {
    codec_with_key(TEST_KEY)
}

/// A credential to place directly in the store, bypassing issuance so tests
/// can pin the token's issue time.
pub struct Seed {
    pub credential_type: CredentialType,
    pub state: CredentialState,
    pub usage_limit: Option<i32>,
    pub activation_utc: Option<DateTime<Utc>>,
    pub expiration_utc: Option<DateTime<Utc>>,
    pub grants: Vec<NewAccessGrant>,
    pub issued_utc: DateTime<Utc>,
    pub event_id: Uuid,
}

impl Default for Seed {
    fn default() -> Self {
        let issued_utc = Utc::now();
        Self {
            credential_type: CredentialType::Staff,
            state: CredentialState::Active,
            usage_limit: None,
            activation_utc: None,
            expiration_utc: Some(issued_utc + Duration::days(7)),
            grants: Vec::new(),
            issued_utc,
            event_id: Uuid::new_v4(),
        }
    }
}

/// Services wired over one in-memory store.
pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub codec: Arc<PayloadCodec>,
    pub policies: Arc<PolicyRegistry>,
    pub lifecycle: LifecycleManager,
    pub issuance: IssuanceService,
    pub validation: ValidationService,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_fraud(FraudConfig::default())
    }

    pub fn with_fraud(fraud: FraudConfig) -> Self {
        init_tracing();

        let store = Arc::new(InMemoryStore::new());
        let codec = Arc::new(test_codec());
        let policies = Arc::new(PolicyRegistry::default());

        let lifecycle = LifecycleManager::new(store.clone());
        let issuance = IssuanceService::new(store.clone(), codec.clone(), policies.clone());
        let validation = ValidationService::new(
            codec.clone(),
            store.clone(),
            GrantEvaluator::new(policies.clone()),
        )
        .with_risk(RiskScorer::default(), FraudDetector::new(fraud));

        Self {
            store,
            codec,
            policies,
            lifecycle,
            issuance,
            validation,
        }
    }

    /// Insert a credential with a token issued at `seed.issued_utc`.
    pub async fn seed(&self, seed: Seed) -> (CredentialRecord, String) {
        let credential_id = Uuid::new_v4();
        let credential_code = format!(
            "{}-{}",
            seed.credential_type.code_prefix(),
            &credential_id.simple().to_string()[..8].to_uppercase()
        );

        let token = self
            .codec
            .encode(&QrPayload {
                id: credential_id,
                cred: credential_code.clone(),
                evt: seed.event_id,
                exp: seed.expiration_utc.map(|e| e.timestamp()),
                ts: seed.issued_utc.timestamp(),
                v: PAYLOAD_VERSION,
                pd: None,
            })
            .expect("encode seed token");

        let record = CredentialRecord {
            credential: Credential {
                credential_id,
                event_id: seed.event_id,
                credential_code,
                credential_type: seed.credential_type,
                holder_ref: None,
                personal_data: None,
                qr_payload: token.clone(),
                qr_hash: token_fingerprint(&token),
                state: seed.state,
                activation_utc: seed.activation_utc,
                expiration_utc: seed.expiration_utc,
                usage_count: 0,
                usage_limit: seed.usage_limit,
                last_used_utc: None,
                reprint_count: 0,
                created_utc: seed.issued_utc,
            },
            grants: seed
                .grants
                .into_iter()
                .map(|g| g.into_grant(credential_id, seed.issued_utc))
                .collect(),
        };

        self.store
            .insert_credential(&record)
            .await
            .expect("insert seed credential");
        (record, token)
    }
}
