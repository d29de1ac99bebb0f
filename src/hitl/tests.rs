use super::*;
use serde_json::json;

fn coordinator() -> Arc<HitlCoordinator> {
    let db = Arc::new(Database::open_in_memory().expect("open db"));
    Arc::new(HitlCoordinator::new(db, 300, 3600).expect("coordinator"))
}

async fn create_request(coordinator: &HitlCoordinator, ttl: Option<u64>) -> HitlRequest {
    coordinator
        .create(
            "shell",
            "execute",
            json!({"command": "rm -rf /tmp/x"}),
            json!({"protocol": "openapi"}),
            "Tool requires approval by policy",
            ttl,
        )
        .await
        .expect("create request")
}

#[tokio::test]
async fn test_create_persists_pending() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, None).await;

    assert_eq!(request.status, HitlStatus::Pending);
    assert_eq!(request.ttl_seconds, 300);
    assert_eq!(
        coordinator
            .persisted_status(&request.id)
            .expect("query")
            .as_deref(),
        Some("pending")
    );
    assert_eq!(coordinator.pending().len(), 1);
}

#[tokio::test]
async fn test_approve_unblocks_waiter() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, Some(10)).await;

    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        let id = request.id.clone();
        tokio::spawn(async move { coordinator.wait(&id, None).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    coordinator
        .approve(&request.id, "admin", Some("ok".to_string()))
        .await
        .expect("approve");

    let decision = waiter.await.expect("join").expect("wait");
    assert_eq!(decision, HitlDecision::Approved);

    let updated = coordinator.get(&request.id).expect("in memory");
    assert_eq!(updated.status, HitlStatus::Approved);
    assert_eq!(updated.reviewed_by.as_deref(), Some("admin"));
    assert!(updated.reviewed_at.is_some());
    assert_eq!(
        coordinator
            .persisted_status(&request.id)
            .expect("query")
            .as_deref(),
        Some("approved")
    );
}

#[tokio::test]
async fn test_reject_unblocks_waiter() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, Some(10)).await;

    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        let id = request.id.clone();
        tokio::spawn(async move { coordinator.wait(&id, None).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    coordinator
        .reject(&request.id, "admin", None)
        .await
        .expect("reject");

    assert_eq!(
        waiter.await.expect("join").expect("wait"),
        HitlDecision::Rejected
    );
}

#[tokio::test]
async fn test_wait_expires_after_ttl() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, Some(1)).await;

    let start = std::time::Instant::now();
    let decision = coordinator.wait(&request.id, None).await.expect("wait");
    assert_eq!(decision, HitlDecision::Expired);
    assert!(start.elapsed() <= std::time::Duration::from_millis(1300));

    let updated = coordinator.get(&request.id).expect("in memory");
    assert_eq!(updated.status, HitlStatus::Expired);
    // Expiry leaves reviewer fields untouched.
    assert!(updated.reviewed_by.is_none());
    assert!(updated.reviewed_at.is_none());
    assert_eq!(
        coordinator
            .persisted_status(&request.id)
            .expect("query")
            .as_deref(),
        Some("expired")
    );
}

#[tokio::test]
async fn test_wait_explicit_timeout_overrides_ttl() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, Some(300)).await;

    let decision = coordinator
        .wait(&request.id, Some(std::time::Duration::from_millis(50)))
        .await
        .expect("wait");
    assert_eq!(decision, HitlDecision::Expired);
}

#[tokio::test]
async fn test_wait_unknown_id_fails() {
    let coordinator = coordinator();
    let err = coordinator.wait("no-such-id", None).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_parameter");
}

#[tokio::test]
async fn test_double_decision_rejected() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, Some(10)).await;

    coordinator
        .approve(&request.id, "admin", None)
        .await
        .expect("approve");
    let err = coordinator
        .reject(&request.id, "admin", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_parameter");
    assert!(err.to_string().contains("not pending"));
}

#[tokio::test]
async fn test_decision_wins_race_with_expiry() {
    let coordinator = coordinator();
    let request = create_request(&coordinator, Some(10)).await;

    // Decide first, then drive the expiry path directly; the earlier
    // decision must win.
    coordinator
        .approve(&request.id, "admin", None)
        .await
        .expect("approve");
    let raced = coordinator.expire(&request.id).await.expect("expire");
    assert_eq!(raced, Some(HitlDecision::Approved));
    assert_eq!(
        coordinator.get(&request.id).expect("in memory").status,
        HitlStatus::Approved
    );
}

#[tokio::test]
async fn test_watchers_receive_request_and_update() {
    let coordinator = coordinator();
    let events: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&events);
    coordinator.register_watcher(Arc::new(move |kind, payload| {
        let sink = Arc::clone(&sink);
        let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
            let status = payload["status"].as_str().unwrap_or_default().to_string();
            sink.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((kind.as_str().to_string(), status));
            Ok(())
        });
        fut
    }));

    let request = create_request(&coordinator, Some(10)).await;
    coordinator
        .approve(&request.id, "admin", None)
        .await
        .expect("approve");

    let seen = events
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(
        seen,
        vec![
            ("hitl_request".to_string(), "pending".to_string()),
            ("hitl_update".to_string(), "approved".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_failing_watcher_does_not_block_transition() {
    let coordinator = coordinator();
    coordinator.register_watcher(Arc::new(|_, _| {
        let fut: BoxFuture<'static, anyhow::Result<()>> =
            Box::pin(async { Err(anyhow::anyhow!("sink broke")) });
        fut
    }));

    let request = create_request(&coordinator, Some(10)).await;
    let approved = coordinator
        .approve(&request.id, "admin", None)
        .await
        .expect("approve despite broken watcher");
    assert_eq!(approved.status, HitlStatus::Approved);
}

#[tokio::test]
async fn test_sweep_expires_overdue_and_evicts_old() {
    let db = Arc::new(Database::open_in_memory().expect("open db"));
    // Zero retention so terminal records evict on the first sweep.
    let coordinator = Arc::new(HitlCoordinator::new(db, 300, 0).expect("coordinator"));

    let overdue = coordinator
        .create("fs", "write", json!({}), json!({}), "rule", Some(0))
        .await
        .expect("create");
    coordinator.sweep().await;

    assert_eq!(
        coordinator
            .persisted_status(&overdue.id)
            .expect("query")
            .as_deref(),
        Some("expired")
    );

    // Second sweep evicts the now-terminal record from memory; the
    // persistent row remains.
    coordinator.sweep().await;
    assert!(coordinator.get(&overdue.id).is_none());
    assert!(coordinator.persisted_status(&overdue.id).expect("query").is_some());
}
