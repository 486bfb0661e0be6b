//! Domain models for credential-service.

mod access_grant;
mod credential;
mod credential_type;
mod payload;
mod validation_log;

pub use access_grant::{AccessGrant, GrantDeactivation, NewAccessGrant, WeekdayMask};
pub use credential::{Credential, CredentialState, LifecycleEvent};
pub use credential_type::{
    AccessLevel, CredentialType, CredentialTypePolicy, PolicyRegistry, UnknownCredentialType,
};
pub use payload::{PAYLOAD_VERSION, PersonalDataFlags, QrPayload};
pub use validation_log::{
    FraudIndicator, FraudIndicatorKind, FraudSeverity, PassageDirection, RiskLevel,
    ValidationLogEntry, ValidationOutcome,
};
