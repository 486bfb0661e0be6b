//! Integration tests for credential lifecycle transitions and usage limits.

mod common;

use chrono::{Duration, Utc};
use common::{Seed, TestApp};
use credential_service::models::{AccessGrant, CredentialState, GrantDeactivation, NewAccessGrant};
use credential_service::services::{
    CheckpointContext, CredentialStore, ServiceError, ValidationLogStore, ValidationResult,
};
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uses_never_exceed_limit() {
    let app = TestApp::new();
    let (record, _) = app
        .seed(Seed {
            usage_limit: Some(5),
            ..Seed::default()
        })
        .await;
    let credential_id = record.credential.credential_id;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let lifecycle = app.lifecycle.clone();
            tokio::spawn(async move { lifecycle.register_use(credential_id).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert!(matches!(e, ServiceError::RateExceeded(_)), "{e}"),
        }
    }

    assert_eq!(succeeded, 5);
    let stored = app.store.find_by_id(credential_id).await.unwrap().unwrap();
    assert_eq!(stored.credential.usage_count, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_gates_race_for_the_last_use() {
    let app = Arc::new(TestApp::new());
    let (record, token) = app
        .seed(Seed {
            usage_limit: Some(1),
            ..Seed::default()
        })
        .await;

    let scan = |gate: &'static str| {
        let app = app.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let context = CheckpointContext {
                device_id: Some(gate.to_string()),
                ..CheckpointContext::default()
            };
            app.validation.validate(&token, &context).await.unwrap()
        })
    };
    let (a, b) = tokio::join!(scan("gate-a"), scan("gate-b"));
    let results = [a.unwrap(), b.unwrap()];

    assert_eq!(results.iter().filter(|r| r.valid).count(), 1);
    let loser = results.iter().find(|r| !r.valid).unwrap();
    assert_eq!(loser.reason.as_deref(), Some("usage_limit_reached"));

    let stored = app
        .store
        .find_by_id(record.credential.credential_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.credential.usage_count, 1);
}

/// Runs `gates` concurrent hall-a scans of one token at one instant and
/// returns the results with the stored grant.
async fn race_hall_a(grant: NewAccessGrant, gates: usize) -> (Vec<ValidationResult>, AccessGrant) {
    let app = Arc::new(TestApp::new());
    let (record, token) = app
        .seed(Seed {
            grants: vec![grant],
            ..Seed::default()
        })
        .await;
    let credential_id = record.credential.credential_id;
    let now = Utc::now();

    let handles: Vec<_> = (0..gates)
        .map(|gate| {
            let app = app.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let context = CheckpointContext {
                    device_id: Some(format!("gate-{gate}")),
                    access_type: Some("hall-a".to_string()),
                    ..CheckpointContext::default()
                };
                app.validation.validate_at(&token, &context, now).await.unwrap()
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let stored = app.store.find_by_id(credential_id).await.unwrap().unwrap();
    assert_eq!(
        stored.credential.usage_count as usize,
        results.iter().filter(|r| r.valid).count()
    );
    let history = app
        .store
        .history_for_credential(credential_id, None)
        .await
        .unwrap();
    assert_eq!(history.len(), gates);

    (results, stored.grants[0].clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gates_racing_on_a_daily_limit_admit_exactly_the_limit() {
    let (results, grant) = race_hall_a(
        NewAccessGrant {
            daily_limit: Some(3),
            ..NewAccessGrant::for_access_type("hall-a")
        },
        12,
    )
    .await;

    assert_eq!(results.iter().filter(|r| r.valid).count(), 3);
    for loser in results.iter().filter(|r| !r.valid) {
        assert_eq!(loser.reason.as_deref(), Some("daily_limit_reached"));
    }
    assert_eq!(grant.daily_usage_count, 3);
    assert_eq!(grant.total_usage_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gates_racing_on_a_total_limit_admit_exactly_the_limit() {
    let (results, grant) = race_hall_a(
        NewAccessGrant {
            total_limit: Some(4),
            ..NewAccessGrant::for_access_type("hall-a")
        },
        12,
    )
    .await;

    assert_eq!(results.iter().filter(|r| r.valid).count(), 4);
    for loser in results.iter().filter(|r| !r.valid) {
        assert_eq!(loser.reason.as_deref(), Some("total_limit_reached"));
    }
    assert_eq!(grant.daily_usage_count, 4);
    assert_eq!(grant.total_usage_count, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fewer_gates_than_the_limit_all_pass() {
    let (results, grant) = race_hall_a(
        NewAccessGrant {
            daily_limit: Some(10),
            total_limit: Some(10),
            ..NewAccessGrant::for_access_type("hall-a")
        },
        6,
    )
    .await;

    assert!(results.iter().all(|r| r.valid));
    assert_eq!(grant.daily_usage_count, 6);
    assert_eq!(grant.total_usage_count, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_suspends_apply_once() {
    let app = TestApp::new();
    let (record, _) = app.seed(Seed::default()).await;
    let credential_id = record.credential.credential_id;

    let first = app.lifecycle.clone();
    let second = app.lifecycle.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.suspend(credential_id, "ops-1", Some("lost")).await }),
        tokio::spawn(async move { second.suspend(credential_id, "ops-2", Some("lost")).await }),
    );

    assert_eq!(a.unwrap().unwrap().state, CredentialState::Suspended);
    assert_eq!(b.unwrap().unwrap().state, CredentialState::Suspended);

    let events = app.lifecycle.audit_trail(credential_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action_code, "suspend");
}

#[tokio::test]
async fn suspension_holds_grants_until_reactivation() {
    let app = TestApp::new();
    let (record, _) = app
        .seed(Seed {
            grants: vec![
                NewAccessGrant::for_access_type("hall-a"),
                NewAccessGrant::for_access_type("vip-lounge"),
            ],
            ..Seed::default()
        })
        .await;
    let credential_id = record.credential.credential_id;

    app.lifecycle
        .suspend(credential_id, "security", Some("under review"))
        .await
        .unwrap();
    let suspended = app.store.find_by_id(credential_id).await.unwrap().unwrap();
    assert!(suspended.grants.iter().all(|g| !g.is_active
        && g.deactivation == Some(GrantDeactivation::CredentialSuspended)));

    app.lifecycle
        .reactivate(credential_id, "security", None)
        .await
        .unwrap();
    let restored = app.store.find_by_id(credential_id).await.unwrap().unwrap();
    assert_eq!(restored.credential.state, CredentialState::Active);
    assert!(restored
        .grants
        .iter()
        .all(|g| g.is_active && g.deactivation.is_none()));
}

#[tokio::test]
async fn revocation_is_terminal() {
    let app = TestApp::new();
    let (record, _) = app
        .seed(Seed {
            grants: vec![NewAccessGrant::for_access_type("hall-a")],
            ..Seed::default()
        })
        .await;
    let credential_id = record.credential.credential_id;

    app.lifecycle
        .revoke(credential_id, "security", Some("fraud confirmed"))
        .await
        .unwrap();

    // Repeating the revoke is a no-op, everything else is refused.
    let again = app
        .lifecycle
        .revoke(credential_id, "security", Some("fraud confirmed"))
        .await
        .unwrap();
    assert_eq!(again.state, CredentialState::Revoked);
    assert!(matches!(
        app.lifecycle.reactivate(credential_id, "security", None).await,
        Err(ServiceError::State(_))
    ));
    assert!(matches!(
        app.lifecycle.activate(credential_id, "security", None).await,
        Err(ServiceError::State(_))
    ));
    assert!(matches!(
        app.lifecycle.register_use(credential_id).await,
        Err(ServiceError::State(_))
    ));

    let stored = app.store.find_by_id(credential_id).await.unwrap().unwrap();
    assert_eq!(
        stored.grants[0].deactivation,
        Some(GrantDeactivation::CredentialRevoked)
    );
    assert_eq!(app.lifecycle.audit_trail(credential_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn suspend_and_revoke_require_reason_and_actor() {
    let app = TestApp::new();
    let (record, _) = app.seed(Seed::default()).await;
    let credential_id = record.credential.credential_id;

    assert!(matches!(
        app.lifecycle.suspend(credential_id, "ops", None).await,
        Err(ServiceError::Validation(_))
    ));
    assert!(matches!(
        app.lifecycle.revoke(credential_id, "ops", Some("   ")).await,
        Err(ServiceError::Validation(_))
    ));
    assert!(matches!(
        app.lifecycle.suspend(credential_id, "", Some("lost")).await,
        Err(ServiceError::Validation(_))
    ));
    assert!(matches!(
        app.lifecycle.suspend(Uuid::new_v4(), "ops", Some("lost")).await,
        Err(ServiceError::CredentialNotFound)
    ));
}

#[tokio::test]
async fn audit_trail_records_each_applied_transition() {
    let app = TestApp::new();
    let (record, _) = app
        .seed(Seed {
            state: CredentialState::Pending,
            ..Seed::default()
        })
        .await;
    let credential_id = record.credential.credential_id;

    app.lifecycle.activate(credential_id, "desk", None).await.unwrap();
    app.lifecycle
        .suspend(credential_id, "security", Some("tailgating"))
        .await
        .unwrap();
    app.lifecycle
        .reactivate(credential_id, "security", Some("cleared"))
        .await
        .unwrap();
    app.lifecycle
        .revoke(credential_id, "security", Some("repeat offence"))
        .await
        .unwrap();

    let events = app.lifecycle.audit_trail(credential_id).await.unwrap();
    let actions: Vec<&str> = events.iter().map(|e| e.action_code.as_str()).collect();
    assert_eq!(actions, ["activate", "suspend", "reactivate", "revoke"]);
    assert_eq!(events[1].from_state, CredentialState::Active);
    assert_eq!(events[1].to_state, CredentialState::Suspended);
    assert_eq!(events[1].reason.as_deref(), Some("tailgating"));
    assert_eq!(events[3].actor, "security");
}

#[tokio::test]
async fn expiry_sweep_persists_passed_expirations() {
    let app = TestApp::new();
    let now = Utc::now();
    let (overdue, _) = app
        .seed(Seed {
            issued_utc: now - Duration::days(10),
            expiration_utc: Some(now - Duration::days(1)),
            ..Seed::default()
        })
        .await;
    let (current, _) = app.seed(Seed::default()).await;

    let expired = app.lifecycle.expire_overdue(now).await.unwrap();
    assert_eq!(expired, vec![overdue.credential.credential_id]);

    let stored = app
        .store
        .find_by_id(overdue.credential.credential_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.credential.state, CredentialState::Expired);
    let events = app
        .lifecycle
        .audit_trail(overdue.credential.credential_id)
        .await
        .unwrap();
    assert_eq!(events[0].actor, "system");

    let untouched = app
        .store
        .find_by_id(current.credential.credential_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.credential.state, CredentialState::Active);

    assert!(app.lifecycle.expire_overdue(now).await.unwrap().is_empty());
}
