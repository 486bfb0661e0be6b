//! Integration tests for risk scoring and fraud pattern detection.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{Seed, TestApp};
use credential_service::models::{
    CredentialState, FraudIndicatorKind, FraudSeverity, RiskLevel,
};
use credential_service::services::{
    CheckpointContext, CredentialStore, FraudConfig, ServiceError, ValidationLogStore,
};
use uuid::Uuid;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 16, 9, 0, 0).unwrap()
}

fn seed_at(issued: DateTime<Utc>) -> Seed {
    Seed {
        issued_utc: issued,
        expiration_utc: Some(issued + Duration::days(7)),
        ..Seed::default()
    }
}

#[tokio::test]
async fn burst_of_validations_is_flagged() {
    let app = TestApp::new();
    let (record, token) = app.seed(seed_at(base() - Duration::hours(2))).await;
    let context = CheckpointContext::default();

    let mut last = None;
    for i in 0..11 {
        let result = app
            .validation
            .validate_at(&token, &context, base() + Duration::seconds(i * 5))
            .await
            .unwrap();
        assert!(result.valid);
        if i < 10 {
            assert!(result
                .fraud_indicators
                .iter()
                .all(|f| f.kind != FraudIndicatorKind::RapidValidation));
        }
        last = Some(result);
    }

    let last = last.unwrap();
    let burst = last
        .fraud_indicators
        .iter()
        .find(|f| f.kind == FraudIndicatorKind::RapidValidation)
        .expect("rapid validation indicator");
    assert!(burst.severity >= FraudSeverity::Medium);
    assert_eq!(burst.observed, 11);
    assert!(last.risk_level >= RiskLevel::Medium);

    // Advisory only: the credential stays usable.
    let stored = app
        .store
        .find_by_id(record.credential.credential_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.credential.state, CredentialState::Active);
}

#[tokio::test]
async fn scans_under_a_second_apart_are_rapid_repeats() {
    let app = TestApp::new();
    let (_, token) = app.seed(seed_at(base() - Duration::hours(2))).await;
    let context = CheckpointContext::default();

    app.validation
        .validate_at(&token, &context, base())
        .await
        .unwrap();
    let second = app
        .validation
        .validate_at(&token, &context, base() + Duration::milliseconds(400))
        .await
        .unwrap();

    assert!(second
        .fraud_indicators
        .iter()
        .any(|f| f.kind == FraudIndicatorKind::RapidRepeat));
    assert!(second.risk_score >= 30);
}

#[tokio::test]
async fn reuse_threshold_is_configurable() {
    let app = TestApp::with_fraud(FraudConfig {
        reuse_threshold: 3,
        ..FraudConfig::default()
    });
    let (_, token) = app.seed(seed_at(base() - Duration::hours(2))).await;
    let context = CheckpointContext::default();

    let mut results = Vec::new();
    for i in 0..4 {
        results.push(
            app.validation
                .validate_at(&token, &context, base() + Duration::minutes(i * 10))
                .await
                .unwrap(),
        );
    }

    assert!(results[2].fraud_indicators.is_empty());
    let reuse = results[3]
        .fraud_indicators
        .iter()
        .find(|f| f.kind == FraudIndicatorKind::ExcessiveReuse)
        .expect("excessive reuse indicator");
    assert_eq!(reuse.severity, FraudSeverity::High);
    assert_eq!(reuse.observed, 4);
}

#[tokio::test]
async fn reuse_counts_scans_outside_the_recent_window() {
    let app = TestApp::with_fraud(FraudConfig {
        reuse_threshold: 3,
        ..FraudConfig::default()
    });
    let (_, token) = app.seed(seed_at(base() - Duration::days(1))).await;
    let from = |ip: &str| CheckpointContext {
        ip_address: Some(ip.to_string()),
        ..CheckpointContext::default()
    };

    // Hours apart: only the latest scan falls inside the risk window.
    let mut results = Vec::new();
    for (i, ip) in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"].into_iter().enumerate() {
        results.push(
            app.validation
                .validate_at(&token, &from(ip), base() + Duration::hours(3 * i as i64))
                .await
                .unwrap(),
        );
    }

    let last = &results[3];
    let reuse = last
        .fraud_indicators
        .iter()
        .find(|f| f.kind == FraudIndicatorKind::ExcessiveReuse)
        .expect("excessive reuse indicator");
    assert_eq!(reuse.observed, 4);
    assert_eq!(last.fraud_indicators.len(), 1);
    // Earlier origins are outside the velocity window.
    assert_eq!(last.risk_score, 0);
    assert_eq!(last.risk_level, RiskLevel::Low);
}

#[tokio::test]
async fn scans_from_several_origins_raise_risk() {
    let app = TestApp::new();
    let (_, token) = app.seed(seed_at(base() - Duration::hours(2))).await;

    let from = |ip: &str| CheckpointContext {
        ip_address: Some(ip.to_string()),
        ..CheckpointContext::default()
    };

    let first = app
        .validation
        .validate_at(&token, &from("10.0.0.1"), base())
        .await
        .unwrap();
    assert_eq!(first.risk_level, RiskLevel::Low);

    let second = app
        .validation
        .validate_at(&token, &from("10.0.9.9"), base() + Duration::minutes(5))
        .await
        .unwrap();
    assert!(second.risk_score >= 20);
    assert!(second.risk_level >= RiskLevel::Medium);
}

#[tokio::test]
async fn review_annotates_latest_entry_without_touching_state() {
    let app = TestApp::new();
    let now = Utc::now();
    let (record, token) = app.seed(seed_at(now - Duration::hours(2))).await;
    let credential_id = record.credential.credential_id;
    let context = CheckpointContext::default();

    for i in 0..12 {
        app.validation
            .validate_at(&token, &context, now - Duration::seconds(60 - i * 4))
            .await
            .unwrap();
    }

    let indicators = app.validation.review_credential(credential_id).await.unwrap();
    assert!(indicators
        .iter()
        .any(|f| f.kind == FraudIndicatorKind::RapidValidation));

    let history = app
        .store
        .history_for_credential(credential_id, None)
        .await
        .unwrap();
    let latest = history.last().unwrap();
    assert!(latest.fraud_indicators.len() >= indicators.len());
    assert!(latest
        .fraud_indicators
        .ends_with(&indicators));

    let stored = app.store.find_by_id(credential_id).await.unwrap().unwrap();
    assert_eq!(stored.credential.state, CredentialState::Active);
}

#[tokio::test]
async fn review_of_unknown_credential_fails() {
    let app = TestApp::new();

    assert!(matches!(
        app.validation.review_credential(Uuid::new_v4()).await,
        Err(ServiceError::CredentialNotFound)
    ));
}

#[tokio::test]
async fn review_of_quiet_credential_finds_nothing() {
    let app = TestApp::new();
    let (record, token) = app.seed(Seed::default()).await;

    app.validation
        .validate(&token, &CheckpointContext::default())
        .await
        .unwrap();

    let indicators = app
        .validation
        .review_credential(record.credential.credential_id)
        .await
        .unwrap();
    assert!(indicators.is_empty());
}
