//! Credential model and its lifecycle audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CredentialType, PersonalDataFlags};

/// Lifecycle state of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialState {
    Pending,
    Active,
    Suspended,
    Revoked,
    Expired,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "revoked" => Some(Self::Revoked),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired)
    }
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event-access credential.
///
/// `qr_hash` is the SHA-256 of `qr_payload` and is unique across credentials.
/// Credentials are never deleted; revocation is a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub credential_id: Uuid,
    pub event_id: Uuid,
    pub credential_code: String,
    pub credential_type: CredentialType,
    /// Opaque reference to the holder record owned by the issuing system.
    pub holder_ref: Option<String>,
    /// Personal data printed on the credential, sealed into every token.
    pub personal_data: Option<PersonalDataFlags>,
    pub qr_payload: String,
    pub qr_hash: String,
    pub state: CredentialState,
    pub activation_utc: Option<DateTime<Utc>>,
    pub expiration_utc: Option<DateTime<Utc>>,
    pub usage_count: i32,
    pub usage_limit: Option<i32>,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub reprint_count: i32,
    pub created_utc: DateTime<Utc>,
}

impl Credential {
    pub fn has_usage_remaining(&self) -> bool {
        self.usage_limit.is_none_or(|limit| self.usage_count < limit)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_utc.is_some_and(|exp| now > exp)
    }

    pub fn is_not_yet_active_at(&self, now: DateTime<Utc>) -> bool {
        self.activation_utc.is_some_and(|act| now < act)
    }
}

/// Administrative action recorded against a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub credential_id: Uuid,
    pub action_code: String,
    pub from_state: CredentialState,
    pub to_state: CredentialState,
    pub actor: String,
    pub reason: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        credential_id: Uuid,
        action_code: &str,
        from_state: CredentialState,
        to_state: CredentialState,
        actor: &str,
        reason: Option<&str>,
        created_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            credential_id,
            action_code: action_code.to_string(),
            from_state,
            to_state,
            actor: actor.to_string(),
            reason: reason.map(str::to_string),
            created_utc,
        }
    }
}
