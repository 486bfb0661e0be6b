use service_core::error::AppError;
use thiserror::Error;

use crate::models::UnknownCredentialType;
use crate::services::codec::CodecError;
use crate::services::grants::DenialReason;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Invalid state transition: {0}")]
    State(String),

    #[error("Usage limit reached: {0}")]
    RateExceeded(String),

    #[error("Access denied: {0}")]
    AccessDenied(DenialReason),

    #[error("Credential not found")]
    CredentialNotFound,

    #[error("Access grant not found")]
    GrantNotFound,

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] AppError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<UnknownCredentialType> for ServiceError {
    fn from(err: UnknownCredentialType) -> Self {
        ServiceError::Policy(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Codec(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::State(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::RateExceeded(e) => AppError::TooManyRequests(e, None),
            ServiceError::AccessDenied(reason) => {
                AppError::Forbidden(anyhow::anyhow!("Access denied: {}", reason))
            }
            ServiceError::CredentialNotFound => {
                AppError::NotFound(anyhow::anyhow!("Credential not found"))
            }
            ServiceError::GrantNotFound => {
                AppError::NotFound(anyhow::anyhow!("Access grant not found"))
            }
            ServiceError::Policy(e) => AppError::Forbidden(anyhow::anyhow!(e)),
            ServiceError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::Store(e) => e,
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_onto_app_error_kinds() {
        let cases: Vec<(ServiceError, &str)> = vec![
            (ServiceError::State("revoked".into()), "conflict"),
            (ServiceError::RateExceeded("limit".into()), "too_many_requests"),
            (
                ServiceError::AccessDenied(DenialReason::DayNotAllowed),
                "forbidden",
            ),
            (ServiceError::CredentialNotFound, "not_found"),
            (ServiceError::Codec(CodecError::Integrity), "bad_request"),
            (
                ServiceError::Store(AppError::DatabaseError(anyhow::anyhow!("down"))),
                "database_error",
            ),
        ];

        for (err, kind) in cases {
            assert_eq!(AppError::from(err).kind(), kind);
        }
    }

    #[test]
    fn unknown_type_is_policy_error() {
        let err: ServiceError = UnknownCredentialType("speaker".into()).into();
        assert!(matches!(err, ServiceError::Policy(_)));
    }
}
