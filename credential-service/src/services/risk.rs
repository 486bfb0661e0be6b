//! Advisory risk scoring and fraud pattern detection.
//!
//! Both are pure functions of validation history at query time. Neither
//! authorizes, denies or changes credential state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{
    Credential, FraudIndicator, FraudIndicatorKind, FraudSeverity, RiskLevel, ValidationLogEntry,
};

/// The part of a validation attempt the heuristics look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSample {
    pub attempted_utc: DateTime<Utc>,
    pub token_fingerprint: String,
    pub ip_address: Option<String>,
}

impl From<&ValidationLogEntry> for AttemptSample {
    fn from(entry: &ValidationLogEntry) -> Self {
        Self {
            attempted_utc: entry.attempted_utc,
            token_fingerprint: entry.token_fingerprint.clone(),
            ip_address: entry.ip_address.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    NewCredential,
    HighVelocity,
    MultipleOrigins,
    RapidRepeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    pub score: i32,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub new_credential_age: Duration,
    pub new_credential_weight: i32,
    pub velocity_window: Duration,
    /// Attempts in the window above which velocity counts.
    pub velocity_threshold: usize,
    pub velocity_weight: i32,
    pub multiple_origins_weight: i32,
    pub rapid_repeat_interval: Duration,
    pub rapid_repeat_weight: i32,
    pub critical_threshold: i32,
    pub high_threshold: i32,
    pub medium_threshold: i32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            new_credential_age: Duration::hours(1),
            new_credential_weight: 10,
            velocity_window: Duration::minutes(60),
            velocity_threshold: 5,
            velocity_weight: 20,
            multiple_origins_weight: 20,
            rapid_repeat_interval: Duration::seconds(1),
            rapid_repeat_weight: 30,
            critical_threshold: 50,
            high_threshold: 30,
            medium_threshold: 15,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn level_for(&self, score: i32) -> RiskLevel {
        if score >= self.config.critical_threshold {
            RiskLevel::Critical
        } else if score >= self.config.high_threshold {
            RiskLevel::High
        } else if score >= self.config.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// How far back `score` looks from `now`.
    pub fn lookback(&self) -> Duration {
        self.config.velocity_window.max(self.config.rapid_repeat_interval)
    }

    /// Score `credential` against its history. The history should include
    /// the attempt being scored.
    pub fn score(
        &self,
        credential: &Credential,
        history: &[AttemptSample],
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let cfg = &self.config;
        let window_start = now - cfg.velocity_window;
        let mut recent: Vec<&AttemptSample> = history
            .iter()
            .filter(|a| a.attempted_utc > window_start && a.attempted_utc <= now)
            .collect();
        recent.sort_by_key(|a| a.attempted_utc);

        let mut score = 0;
        let mut factors = Vec::new();

        if now - credential.created_utc < cfg.new_credential_age {
            score += cfg.new_credential_weight;
            factors.push(RiskFactor::NewCredential);
        }

        if recent.len() > cfg.velocity_threshold {
            score += cfg.velocity_weight;
            factors.push(RiskFactor::HighVelocity);
        }

        let origins: HashSet<&str> = recent
            .iter()
            .filter_map(|a| a.ip_address.as_deref())
            .collect();
        if origins.len() > 1 {
            score += cfg.multiple_origins_weight;
            factors.push(RiskFactor::MultipleOrigins);
        }

        let mut by_token: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
        for attempt in &recent {
            by_token
                .entry(attempt.token_fingerprint.as_str())
                .or_default()
                .push(attempt.attempted_utc);
        }
        let rapid_repeat = by_token.values().any(|times| {
            times
                .windows(2)
                .any(|pair| pair[1] - pair[0] < cfg.rapid_repeat_interval)
        });
        if rapid_repeat {
            score += cfg.rapid_repeat_weight;
            factors.push(RiskFactor::RapidRepeat);
        }

        RiskAssessment {
            score,
            level: self.level_for(score),
            factors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FraudConfig {
    /// Total validations of one token above which reuse is flagged.
    pub reuse_threshold: usize,
    /// Validations of one token inside `burst_window` above which a burst is flagged.
    pub burst_threshold: usize,
    pub burst_window: Duration,
    pub repeat_interval: Duration,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            reuse_threshold: 100,
            burst_threshold: 10,
            burst_window: Duration::seconds(60),
            repeat_interval: Duration::seconds(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FraudDetector {
    config: FraudConfig,
}

impl FraudDetector {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    /// How much history a single-token check needs besides the total count.
    pub fn lookback(&self) -> Duration {
        self.config.burst_window.max(self.config.repeat_interval)
    }

    /// Flag suspicious patterns per token. Output is ordered by token
    /// fingerprint, then by indicator kind.
    pub fn detect(&self, history: &[AttemptSample], now: DateTime<Utc>) -> Vec<FraudIndicator> {
        let mut by_token: BTreeMap<&str, Vec<DateTime<Utc>>> = BTreeMap::new();
        for attempt in history {
            by_token
                .entry(attempt.token_fingerprint.as_str())
                .or_default()
                .push(attempt.attempted_utc);
        }

        by_token
            .into_iter()
            .flat_map(|(fingerprint, times)| {
                let total = times.len();
                self.token_indicators(fingerprint, times, total, now)
            })
            .collect()
    }

    /// Flag one token from its recent attempts and its all-time count.
    /// Attempts older than `lookback` may be left out of `recent`.
    pub fn detect_token(
        &self,
        fingerprint: &str,
        recent: &[AttemptSample],
        total_uses: usize,
        now: DateTime<Utc>,
    ) -> Vec<FraudIndicator> {
        let times = recent
            .iter()
            .filter(|a| a.token_fingerprint == fingerprint)
            .map(|a| a.attempted_utc)
            .collect();
        self.token_indicators(fingerprint, times, total_uses, now)
    }

    fn token_indicators(
        &self,
        fingerprint: &str,
        mut times: Vec<DateTime<Utc>>,
        total_uses: usize,
        now: DateTime<Utc>,
    ) -> Vec<FraudIndicator> {
        times.sort();
        let indicator = |kind, severity, observed: usize, description: String| FraudIndicator {
            kind,
            severity,
            token_fingerprint: fingerprint.to_string(),
            observed: observed as i64,
            description,
            detected_utc: now,
        };

        let mut indicators = Vec::new();
        if total_uses > self.config.reuse_threshold {
            indicators.push(indicator(
                FraudIndicatorKind::ExcessiveReuse,
                FraudSeverity::High,
                total_uses,
                format!(
                    "token validated {} times, threshold {}",
                    total_uses, self.config.reuse_threshold
                ),
            ));
        }

        let burst = self.largest_burst(&times);
        if burst > self.config.burst_threshold {
            indicators.push(indicator(
                FraudIndicatorKind::RapidValidation,
                FraudSeverity::Medium,
                burst,
                format!(
                    "{} validations within {}s",
                    burst,
                    self.config.burst_window.num_seconds()
                ),
            ));
        }

        let repeats = times
            .windows(2)
            .filter(|pair| pair[1] - pair[0] < self.config.repeat_interval)
            .count();
        if repeats > 0 {
            indicators.push(indicator(
                FraudIndicatorKind::RapidRepeat,
                FraudSeverity::Medium,
                repeats,
                format!(
                    "{} consecutive validations under {}ms apart",
                    repeats,
                    self.config.repeat_interval.num_milliseconds()
                ),
            ));
        }

        indicators
    }

    /// Most attempts in any window of `burst_window` length; `times` sorted.
    fn largest_burst(&self, times: &[DateTime<Utc>]) -> usize {
        let mut start = 0;
        let mut largest = 0;
        for end in 0..times.len() {
            while times[end] - times[start] > self.config.burst_window {
                start += 1;
            }
            largest = largest.max(end - start + 1);
        }
        largest
    }
}
