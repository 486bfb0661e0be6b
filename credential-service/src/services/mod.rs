//! Services module for credential-service.

pub mod codec;
pub mod database;
pub mod error;
pub mod grants;
pub mod issuance;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod risk;
pub mod store;
pub mod validation;

pub use codec::{token_fingerprint, CodecConfig, CodecError, KdfParams, PayloadCodec};
pub use database::Database;
pub use error::ServiceError;
pub use grants::{DenialReason, GrantDecision, GrantEvaluator};
pub use issuance::{IssuanceService, IssueRequest};
pub use lifecycle::{InvalidReason, LifecycleCommand, LifecycleManager};
pub use memory::InMemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_fraud_indicator, record_transition, record_validation,
};
pub use risk::{FraudConfig, FraudDetector, RiskAssessment, RiskConfig, RiskScorer};
pub use store::{
    ConsumeOutcome, CredentialRecord, CredentialStore, UsageClaim, ValidationLogStore,
    ValidationStore,
};
pub use validation::{CheckpointContext, ValidationFailure, ValidationResult, ValidationService};
