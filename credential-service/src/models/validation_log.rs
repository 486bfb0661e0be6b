//! Validation log model - one immutable record per checkpoint attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome recorded for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationOutcome {
    Success,
    Failure,
    Blocked,
    Suspicious,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
            Self::Suspicious => "suspicious",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "blocked" => Some(Self::Blocked),
            "suspicious" => Some(Self::Suspicious),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Advisory risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the holder is passing in or out of the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassageDirection {
    Entry,
    Exit,
}

impl PassageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudIndicatorKind {
    /// One token validated more times in total than the reuse threshold.
    ExcessiveReuse,
    /// Burst of validations of one token inside a short window.
    RapidValidation,
    /// Consecutive validations of one token less than a second apart.
    RapidRepeat,
}

impl FraudIndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExcessiveReuse => "excessive_reuse",
            Self::RapidValidation => "rapid_validation",
            Self::RapidRepeat => "rapid_repeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FraudSeverity {
    Medium,
    High,
}

/// Advisory pattern flagged for human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudIndicator {
    pub kind: FraudIndicatorKind,
    pub severity: FraudSeverity,
    pub token_fingerprint: String,
    /// Count that tripped the pattern (total uses, burst size or repeats).
    pub observed: i64,
    pub description: String,
    pub detected_utc: DateTime<Utc>,
}

/// Immutable record of one validation attempt.
///
/// Only `fraud_indicators` may grow after the entry is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLogEntry {
    pub log_id: Uuid,
    /// Absent when the token could not be tied to a credential.
    pub credential_id: Option<Uuid>,
    pub access_type_code: Option<String>,
    /// SHA-256 of the scanned token text.
    pub token_fingerprint: String,
    pub attempted_utc: DateTime<Utc>,
    pub outcome: ValidationOutcome,
    pub failure_reason: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub location: Option<String>,
    pub direction: Option<PassageDirection>,
    /// For an exit, the log id of the entry passage it closes.
    pub entry_log_id: Option<Uuid>,
    pub risk_level: RiskLevel,
    pub risk_score: i32,
    pub fraud_indicators: Vec<FraudIndicator>,
}
