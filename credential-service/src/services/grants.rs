//! Access grant evaluation.
//!
//! Evaluation is pure: given a grant, the instant and the checkpoint location
//! it returns a decision without touching any counters. Checks run in a fixed
//! order and the first failing one is reported. All calendar checks use UTC.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{AccessGrant, CredentialType, PolicyRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    GrantInactive,
    OutsideValidityWindow,
    DayNotAllowed,
    OutsideTimeWindow,
    DailyLimitReached,
    TotalLimitReached,
    LocationNotAllowed,
    LocationDenied,
    /// The credential holds no grant for the requested access type.
    NoGrant,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GrantInactive => "grant_inactive",
            Self::OutsideValidityWindow => "outside_validity_window",
            Self::DayNotAllowed => "day_not_allowed",
            Self::OutsideTimeWindow => "outside_time_window",
            Self::DailyLimitReached => "daily_limit_reached",
            Self::TotalLimitReached => "total_limit_reached",
            Self::LocationNotAllowed => "location_not_allowed",
            Self::LocationDenied => "location_denied",
            Self::NoGrant => "no_grant",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantDecision {
    Authorized {
        grant_id: Uuid,
        access_type_code: String,
        requires_escort: bool,
        allows_guests: bool,
    },
    Denied(DenialReason),
}

impl GrantDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, GrantDecision::Authorized { .. })
    }

    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            GrantDecision::Denied(reason) => Some(*reason),
            GrantDecision::Authorized { .. } => None,
        }
    }
}

/// Evaluate a single grant using only its own location lists.
pub fn evaluate(grant: &AccessGrant, now: DateTime<Utc>, location: Option<&str>) -> GrantDecision {
    evaluate_with_areas(grant, now, location, &[])
}

/// Inclusive daily window; `start > end` wraps past midnight.
pub fn within_daily_window(
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    time: NaiveTime,
) -> bool {
    match (start, end) {
        (None, None) => true,
        (Some(start), None) => time >= start,
        (None, Some(end)) => time <= end,
        (Some(start), Some(end)) if start <= end => time >= start && time <= end,
        (Some(start), Some(end)) => time >= start || time <= end,
    }
}

fn evaluate_with_areas(
    grant: &AccessGrant,
    now: DateTime<Utc>,
    location: Option<&str>,
    fallback_areas: &[String],
) -> GrantDecision {
    if !grant.is_active {
        return GrantDecision::Denied(DenialReason::GrantInactive);
    }

    let before_start = grant.valid_from_utc.is_some_and(|from| now < from);
    let after_end = grant.valid_until_utc.is_some_and(|until| now > until);
    if before_start || after_end {
        return GrantDecision::Denied(DenialReason::OutsideValidityWindow);
    }

    if !grant.weekday_mask.contains(now.weekday()) {
        return GrantDecision::Denied(DenialReason::DayNotAllowed);
    }

    if !within_daily_window(grant.daily_start, grant.daily_end, now.time()) {
        return GrantDecision::Denied(DenialReason::OutsideTimeWindow);
    }

    let used_today = grant.daily_usage_on(now.date_naive());
    if grant.daily_limit.is_some_and(|limit| used_today >= limit) {
        return GrantDecision::Denied(DenialReason::DailyLimitReached);
    }
    if grant
        .total_limit
        .is_some_and(|limit| grant.total_usage_count >= limit)
    {
        return GrantDecision::Denied(DenialReason::TotalLimitReached);
    }

    let allowed = if grant.allowed_locations.is_empty() {
        fallback_areas
    } else {
        grant.allowed_locations.as_slice()
    };
    if !allowed.is_empty() {
        let permitted = location.is_some_and(|loc| allowed.iter().any(|a| a == loc));
        if !permitted {
            return GrantDecision::Denied(DenialReason::LocationNotAllowed);
        }
    }
    if let Some(loc) = location {
        if grant.denied_locations.iter().any(|d| d == loc) {
            return GrantDecision::Denied(DenialReason::LocationDenied);
        }
    }

    GrantDecision::Authorized {
        grant_id: grant.grant_id,
        access_type_code: grant.access_type_code.clone(),
        requires_escort: grant.requires_escort,
        allows_guests: grant.allows_guests,
    }
}

/// Evaluates grants with the credential type's policy applied.
#[derive(Debug, Clone)]
pub struct GrantEvaluator {
    policies: Arc<PolicyRegistry>,
}

impl GrantEvaluator {
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self { policies }
    }

    /// Evaluate one grant. The type's allowed areas apply when the grant
    /// carries no allow-list of its own.
    pub fn evaluate(
        &self,
        credential_type: CredentialType,
        grant: &AccessGrant,
        now: DateTime<Utc>,
        location: Option<&str>,
    ) -> GrantDecision {
        let areas = &self.policies.policy(credential_type).allowed_areas;
        evaluate_with_areas(grant, now, location, areas)
    }

    /// Decide access for a credential at a checkpoint.
    ///
    /// With an access type, only grants of that type are considered. Without
    /// one, any active grant may authorize. The first authorizing grant wins;
    /// otherwise the first denial among active grants is returned.
    pub fn authorize(
        &self,
        credential_type: CredentialType,
        grants: &[AccessGrant],
        access_type: Option<&str>,
        now: DateTime<Utc>,
        location: Option<&str>,
    ) -> GrantDecision {
        let candidates: Vec<&AccessGrant> = grants
            .iter()
            .filter(|g| access_type.is_none_or(|code| g.access_type_code == code))
            .collect();

        if candidates.is_empty() {
            return GrantDecision::Denied(DenialReason::NoGrant);
        }

        let mut first_denial = None;
        for grant in candidates.iter().filter(|g| g.is_active) {
            match self.evaluate(credential_type, grant, now, location) {
                decision @ GrantDecision::Authorized { .. } => return decision,
                GrantDecision::Denied(reason) => {
                    first_denial.get_or_insert(reason);
                }
            }
        }

        GrantDecision::Denied(first_denial.unwrap_or(DenialReason::GrantInactive))
    }
}
