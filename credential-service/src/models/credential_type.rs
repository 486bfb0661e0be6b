//! Credential types and the per-type policy documents supplied by configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Closed set of credential types issued for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Staff,
    Exhibitor,
    Visitor,
    Press,
    Vip,
    Contractor,
    /// Used when the issuer names no type.
    General,
}

impl CredentialType {
    pub const ALL: [CredentialType; 7] = [
        CredentialType::Staff,
        CredentialType::Exhibitor,
        CredentialType::Visitor,
        CredentialType::Press,
        CredentialType::Vip,
        CredentialType::Contractor,
        CredentialType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staff => "staff",
            Self::Exhibitor => "exhibitor",
            Self::Visitor => "visitor",
            Self::Press => "press",
            Self::Vip => "vip",
            Self::Contractor => "contractor",
            Self::General => "general",
        }
    }

    /// Prefix for human-readable credential codes.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            Self::Staff => "STF",
            Self::Exhibitor => "EXH",
            Self::Visitor => "VIS",
            Self::Press => "PRS",
            Self::Vip => "VIP",
            Self::Contractor => "CTR",
            Self::General => "GEN",
        }
    }

    /// Resolve an optional type name; `None` means [`CredentialType::General`].
    pub fn resolve(name: Option<&str>) -> Result<Self, UnknownCredentialType> {
        match name {
            None => Ok(Self::General),
            Some(name) => name.parse(),
        }
    }
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown credential type '{0}'")]
pub struct UnknownCredentialType(pub String);

impl FromStr for CredentialType {
    type Err = UnknownCredentialType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staff" => Ok(Self::Staff),
            "exhibitor" => Ok(Self::Exhibitor),
            "visitor" => Ok(Self::Visitor),
            "press" => Ok(Self::Press),
            "vip" => Ok(Self::Vip),
            "contractor" => Ok(Self::Contractor),
            "general" => Ok(Self::General),
            other => Err(UnknownCredentialType(other.to_string())),
        }
    }
}

/// Coarse access tier attached to a credential type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Basic,
    Standard,
    Extended,
    Full,
}

/// Policy for one credential type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialTypePolicy {
    pub access_level: AccessLevel,
    /// Days of validity applied at issuance when no expiration is given.
    #[serde(default)]
    pub default_validity_days: Option<i64>,
    /// Maximum number of reprints; `None` means unlimited.
    #[serde(default)]
    pub max_reprints: Option<i32>,
    /// Areas any grant of this type may be used in when the grant itself
    /// carries no allow-list.
    #[serde(default)]
    pub allowed_areas: Vec<String>,
}

impl CredentialTypePolicy {
    /// Built-in policy for a type, used when configuration supplies none.
    pub fn default_for(credential_type: CredentialType) -> Self {
        let (access_level, default_validity_days, max_reprints) = match credential_type {
            CredentialType::Staff => (AccessLevel::Full, Some(30), Some(5)),
            CredentialType::Exhibitor => (AccessLevel::Extended, Some(7), Some(3)),
            CredentialType::Visitor => (AccessLevel::Basic, Some(3), Some(1)),
            CredentialType::Press => (AccessLevel::Standard, Some(7), Some(2)),
            CredentialType::Vip => (AccessLevel::Extended, Some(7), None),
            CredentialType::Contractor => (AccessLevel::Standard, Some(14), Some(2)),
            CredentialType::General => (AccessLevel::Basic, Some(1), Some(0)),
        };

        Self {
            access_level,
            default_validity_days,
            max_reprints,
            allowed_areas: Vec::new(),
        }
    }

    pub fn reprint_allowed(&self, reprint_count: i32) -> bool {
        self.max_reprints.is_none_or(|max| reprint_count < max)
    }
}

/// Policies for every credential type.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<CredentialType, CredentialTypePolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_overrides(HashMap::new())
    }
}

impl PolicyRegistry {
    /// Built-in defaults, with configured policies replacing them per type.
    pub fn with_overrides(overrides: HashMap<CredentialType, CredentialTypePolicy>) -> Self {
        let mut policies: HashMap<CredentialType, CredentialTypePolicy> = CredentialType::ALL
            .iter()
            .map(|t| (*t, CredentialTypePolicy::default_for(*t)))
            .collect();
        policies.extend(overrides);
        Self { policies }
    }

    pub fn policy(&self, credential_type: CredentialType) -> &CredentialTypePolicy {
        // Every variant is inserted in `with_overrides`.
        &self.policies[&credential_type]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_type_falls_back_to_general() {
        assert_eq!(CredentialType::resolve(None).unwrap(), CredentialType::General);
    }

    #[test]
    fn unknown_type_fails_loudly() {
        let err = CredentialType::resolve(Some("Speaker")).unwrap_err();
        assert_eq!(err, UnknownCredentialType("Speaker".to_string()));
        // Case is significant; lowercase names only.
        assert!("Staff".parse::<CredentialType>().is_err());
    }

    #[test]
    fn every_type_has_distinct_prefix() {
        let mut prefixes: Vec<_> = CredentialType::ALL.iter().map(|t| t.code_prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), CredentialType::ALL.len());
    }

    #[test]
    fn overrides_replace_defaults_per_type() {
        let mut overrides = HashMap::new();
        overrides.insert(
            CredentialType::Press,
            CredentialTypePolicy {
                access_level: AccessLevel::Full,
                default_validity_days: None,
                max_reprints: None,
                allowed_areas: vec!["press-room".to_string()],
            },
        );

        let registry = PolicyRegistry::with_overrides(overrides);
        assert_eq!(registry.policy(CredentialType::Press).access_level, AccessLevel::Full);
        assert_eq!(
            registry.policy(CredentialType::Visitor),
            &CredentialTypePolicy::default_for(CredentialType::Visitor)
        );
    }

    #[test]
    fn reprint_policy_limits() {
        let policy = CredentialTypePolicy::default_for(CredentialType::Visitor);
        assert!(policy.reprint_allowed(0));
        assert!(!policy.reprint_allowed(1));

        let unlimited = CredentialTypePolicy::default_for(CredentialType::Vip);
        assert!(unlimited.reprint_allowed(1_000));
    }
}
