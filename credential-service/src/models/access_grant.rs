//! Access grant model - per access-type authorization attached to a credential.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Days of the week a grant may be used on. Bit 0 is Monday, bit 6 Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekdayMask(u8);

impl WeekdayMask {
    pub const ALL: WeekdayMask = WeekdayMask(0b0111_1111);
    pub const WEEKDAYS: WeekdayMask = WeekdayMask(0b0001_1111);
    pub const WEEKEND: WeekdayMask = WeekdayMask(0b0110_0000);

    /// Build from raw bits; bits above Sunday are dropped.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        Self(
            days.iter()
                .fold(0u8, |mask, day| mask | (1 << day.num_days_from_monday())),
        )
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }
}

impl Default for WeekdayMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Why a grant was switched off. Grants are deactivated, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantDeactivation {
    CredentialSuspended,
    CredentialRevoked,
    Superseded,
}

impl GrantDeactivation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialSuspended => "credential_suspended",
            Self::CredentialRevoked => "credential_revoked",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential_suspended" => Some(Self::CredentialSuspended),
            "credential_revoked" => Some(Self::CredentialRevoked),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

/// Time- and location-bounded authorization for one access type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub grant_id: Uuid,
    pub credential_id: Uuid,
    pub access_type_code: String,
    pub is_active: bool,
    pub deactivation: Option<GrantDeactivation>,
    pub valid_from_utc: Option<DateTime<Utc>>,
    pub valid_until_utc: Option<DateTime<Utc>>,
    pub weekday_mask: WeekdayMask,
    /// Daily window, evaluated against UTC time of day. A start later than
    /// the end describes a window that wraps past midnight.
    pub daily_start: Option<NaiveTime>,
    pub daily_end: Option<NaiveTime>,
    pub daily_limit: Option<i32>,
    pub daily_usage_count: i32,
    /// UTC date `daily_usage_count` refers to.
    pub usage_date: Option<NaiveDate>,
    pub total_limit: Option<i32>,
    pub total_usage_count: i32,
    pub allowed_locations: Vec<String>,
    pub denied_locations: Vec<String>,
    pub requires_escort: bool,
    pub allows_guests: bool,
    pub created_utc: DateTime<Utc>,
}

impl AccessGrant {
    /// Uses counted against the daily cap on `date`; a stale counter reads as 0.
    pub fn daily_usage_on(&self, date: NaiveDate) -> i32 {
        match self.usage_date {
            Some(d) if d == date => self.daily_usage_count,
            _ => 0,
        }
    }
}

/// Input for attaching a grant to a credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAccessGrant {
    pub access_type_code: String,
    #[serde(default)]
    pub valid_from_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weekday_mask: WeekdayMask,
    #[serde(default)]
    pub daily_start: Option<NaiveTime>,
    #[serde(default)]
    pub daily_end: Option<NaiveTime>,
    #[serde(default)]
    pub daily_limit: Option<i32>,
    #[serde(default)]
    pub total_limit: Option<i32>,
    #[serde(default)]
    pub allowed_locations: Vec<String>,
    #[serde(default)]
    pub denied_locations: Vec<String>,
    #[serde(default)]
    pub requires_escort: bool,
    #[serde(default)]
    pub allows_guests: bool,
}

impl NewAccessGrant {
    pub fn for_access_type(access_type_code: impl Into<String>) -> Self {
        Self {
            access_type_code: access_type_code.into(),
            ..Self::default()
        }
    }

    pub fn into_grant(self, credential_id: Uuid, now: DateTime<Utc>) -> AccessGrant {
        AccessGrant {
            grant_id: Uuid::new_v4(),
            credential_id,
            access_type_code: self.access_type_code,
            is_active: true,
            deactivation: None,
            valid_from_utc: self.valid_from_utc,
            valid_until_utc: self.valid_until_utc,
            weekday_mask: self.weekday_mask,
            daily_start: self.daily_start,
            daily_end: self.daily_end,
            daily_limit: self.daily_limit,
            daily_usage_count: 0,
            usage_date: None,
            total_limit: self.total_limit,
            total_usage_count: 0,
            allowed_locations: self.allowed_locations,
            denied_locations: self.denied_locations,
            requires_escort: self.requires_escort,
            allows_guests: self.allows_guests,
            created_utc: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekday_mask_bits_follow_monday_first() {
        let mask = WeekdayMask::from_days(&[Weekday::Mon, Weekday::Sun]);
        assert_eq!(mask.bits(), 0b0100_0001);
        assert!(mask.contains(Weekday::Mon));
        assert!(mask.contains(Weekday::Sun));
        assert!(!mask.contains(Weekday::Wed));
    }

    #[test]
    fn weekday_presets() {
        assert!(WeekdayMask::WEEKDAYS.contains(Weekday::Fri));
        assert!(!WeekdayMask::WEEKDAYS.contains(Weekday::Sat));
        assert!(WeekdayMask::WEEKEND.contains(Weekday::Sat));
        assert_eq!(WeekdayMask::from_bits(0xFF), WeekdayMask::ALL);
    }

    #[test]
    fn stale_daily_counter_reads_as_zero() {
        let now = Utc::now();
        let mut grant = NewAccessGrant::for_access_type("hall-a").into_grant(Uuid::new_v4(), now);
        let today = now.date_naive();
        grant.usage_date = Some(today);
        grant.daily_usage_count = 3;

        assert_eq!(grant.daily_usage_on(today), 3);
        assert_eq!(grant.daily_usage_on(today.succ_opt().unwrap()), 0);
    }
}
