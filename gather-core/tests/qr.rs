mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use gather_client::ScanOutcome;
use gather_core::settings::KEY_ADMIN_GROUPS;
use gather_core::{CoreError, QrConfig, QrManager, QrStatus, Registry};
use gather_store::{SessionRole, SessionStatus, Store};

use support::{FakeFactory, FakeHandle, temp_dirs};

// ─── Harness ──────────────────────────────────────────────────────────────────

fn manager(config: QrConfig) -> (Arc<Store>, Arc<FakeFactory>, Arc<Registry>, Arc<QrManager>) {
    let store = Arc::new(Store::in_memory().unwrap());
    let factory = Arc::new(FakeFactory::default());
    let registry = Arc::new(Registry::new(
        Arc::clone(&store),
        Arc::clone(&factory) as Arc<dyn gather_client::ClientFactory>,
        temp_dirs("qr"),
    ));
    let mgr = Arc::new(QrManager::new(
        Arc::clone(&store),
        Arc::clone(&factory) as Arc<dyn gather_client::ClientFactory>,
        Arc::clone(&registry),
        config,
    ));
    (store, factory, registry, mgr)
}

/// Poll until the attempt leaves `waiting`.
async fn settle(mgr: &Arc<QrManager>, name: &str) -> QrStatus {
    for _ in 0..400 {
        match mgr.status(name).await.unwrap() {
            QrStatus::Waiting => sleep(Duration::from_millis(5)).await,
            status            => return status,
        }
    }
    panic!("attempt {name} never left waiting");
}

// ─── Happy path & duplicates ──────────────────────────────────────────────────

#[tokio::test]
async fn scan_persists_exactly_one_session_per_identity() {
    let (store, factory, _registry, mgr) = manager(QrConfig::default());

    factory.push_ephemeral(Arc::new(
        FakeHandle::new(42).with_scan(Ok(ScanOutcome::Authorized)),
    ));
    let first = mgr.issue(SessionRole::User).await.unwrap();
    assert!(first.url.starts_with("tg://login"));
    assert_eq!(settle(&mgr, &first.name).await, QrStatus::Success);

    let row = store.session(&first.name).unwrap().expect("session row");
    assert_eq!(row.status, SessionStatus::Active);
    assert_eq!(row.user_id, Some(42));

    // Same identity scans again: terminal duplicate, still one row.
    factory.push_ephemeral(Arc::new(
        FakeHandle::new(42).with_scan(Ok(ScanOutcome::Authorized)),
    ));
    let second = mgr.issue(SessionRole::User).await.unwrap();
    assert_ne!(second.name, first.name);
    assert_eq!(settle(&mgr, &second.name).await, QrStatus::Duplicate);

    assert!(store.session(&second.name).unwrap().is_none());
    assert_eq!(store.sessions(SessionRole::User).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn instant_scan_outcome_is_not_overwritten_by_issuance() {
    let (store, factory, _registry, mgr) = manager(QrConfig::default());
    factory.push_ephemeral(Arc::new(
        FakeHandle::new(21).with_scan(Ok(ScanOutcome::Authorized)),
    ));

    // The scan resolves as soon as the waiter task runs, possibly before
    // issue() returns; the attempt must never revert to waiting.
    let issued = mgr.issue(SessionRole::User).await.unwrap();
    assert_eq!(settle(&mgr, &issued.name).await, QrStatus::Success);
    for _ in 0..5 {
        assert_eq!(mgr.status(&issued.name).await.unwrap(), QrStatus::Success);
    }
    assert!(store.session(&issued.name).unwrap().is_some());
}

#[tokio::test]
async fn persisted_success_survives_repeated_status_queries() {
    let (_store, factory, _registry, mgr) = manager(QrConfig::default());
    factory.push_ephemeral(Arc::new(
        FakeHandle::new(7).with_scan(Ok(ScanOutcome::Authorized)),
    ));
    let issued = mgr.issue(SessionRole::User).await.unwrap();
    assert_eq!(settle(&mgr, &issued.name).await, QrStatus::Success);

    // The attempt record is gone, but the session's existence still answers.
    assert_eq!(mgr.status(&issued.name).await.unwrap(), QrStatus::Success);
}

// ─── Expiry ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unscanned_challenge_expires_and_never_sticks_in_waiting() {
    let config = QrConfig {
        scan_timeout: Duration::from_millis(50),
        ..QrConfig::default()
    };
    let (store, factory, _registry, mgr) = manager(config);

    // No scripted scan: the challenge never resolves.
    factory.push_ephemeral(Arc::new(FakeHandle::new(9)));
    let issued = mgr.issue(SessionRole::User).await.unwrap();

    assert_eq!(settle(&mgr, &issued.name).await, QrStatus::Expired);
    assert!(store.session(&issued.name).unwrap().is_none());
    // Terminal state was consumed by the observation above.
    assert_eq!(mgr.status(&issued.name).await.unwrap(), QrStatus::NotFound);
}

// ─── Second factor ────────────────────────────────────────────────────────────

#[tokio::test]
async fn password_flow_completes_login() {
    let (store, factory, _registry, mgr) = manager(QrConfig::default());
    factory.push_ephemeral(Arc::new(
        FakeHandle::new(11).with_scan(Ok(ScanOutcome::PasswordRequired)),
    ));
    let issued = mgr.issue(SessionRole::User).await.unwrap();
    assert_eq!(settle(&mgr, &issued.name).await, QrStatus::PasswordRequired);

    let status = mgr.submit_password(&issued.name, "correct horse").await.unwrap();
    assert_eq!(status, QrStatus::Success);
    assert!(store.session(&issued.name).unwrap().is_some());
}

#[tokio::test]
async fn wrong_password_ends_the_attempt() {
    let (store, factory, _registry, mgr) = manager(QrConfig::default());
    factory.push_ephemeral(Arc::new(
        FakeHandle::new(12).with_scan(Ok(ScanOutcome::PasswordRequired)),
    ));
    let issued = mgr.issue(SessionRole::User).await.unwrap();
    assert_eq!(settle(&mgr, &issued.name).await, QrStatus::PasswordRequired);

    let status = mgr.submit_password(&issued.name, "nope").await.unwrap();
    assert_eq!(status, QrStatus::Error);
    assert!(store.session(&issued.name).unwrap().is_none());

    // The handle was discarded; a second submission has nothing to act on.
    let err = mgr.submit_password(&issued.name, "correct horse").await;
    assert!(matches!(err, Err(CoreError::AttemptNotFound(_))));
}

// ─── Admin attempts ───────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_login_caches_dialog_groups() {
    let (store, factory, _registry, mgr) = manager(QrConfig::default());
    factory.push_ephemeral(Arc::new(
        FakeHandle::new(77).with_scan(Ok(ScanOutcome::Authorized)),
    ));
    let issued = mgr.issue(SessionRole::Admin).await.unwrap();
    assert!(issued.name.starts_with("Admin_"));
    assert_eq!(settle(&mgr, &issued.name).await, QrStatus::Success);

    let cached = store.get_setting(KEY_ADMIN_GROUPS).unwrap().expect("groups cached");
    let groups = cached.as_array().expect("array");
    assert!(groups.iter().any(|g| g["id"] == 1000));
}

#[tokio::test]
async fn second_admin_attempt_is_refused() {
    let (store, factory, _registry, mgr) = manager(QrConfig::default());
    store
        .create_session("Admin_existing", SessionRole::Admin, SessionStatus::Active, Some(77))
        .unwrap();

    factory.push_ephemeral(Arc::new(
        FakeHandle::new(78).with_scan(Ok(ScanOutcome::Authorized)),
    ));
    let err = mgr.issue(SessionRole::Admin).await;
    assert!(matches!(err, Err(CoreError::AdminAttemptRefused(_))));
}

// ─── Issuance failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_generation_leaves_no_attempt_behind() {
    let (_store, _factory, _registry, mgr) = manager(QrConfig::default());

    // Factory has nothing scripted, so the ephemeral open fails.
    let err = mgr.issue(SessionRole::User).await;
    assert!(err.is_err());
}

// ─── Janitor ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn janitor_reaps_stale_attempts() {
    let config = QrConfig {
        scan_timeout: Duration::from_secs(300),
        attempt_ttl:  Duration::from_millis(20),
    };
    let (_store, factory, _registry, mgr) = manager(config);

    factory.push_ephemeral(Arc::new(FakeHandle::new(13)));
    let issued = mgr.issue(SessionRole::User).await.unwrap();

    sleep(Duration::from_millis(40)).await;
    assert_eq!(mgr.janitor_sweep().await, 1);
    assert_eq!(mgr.status(&issued.name).await.unwrap(), QrStatus::NotFound);
}
