mod common;

use common::test_gateway;
use serde_json::json;
use std::sync::Arc;
use toolgate::config::{PolicyDecision, ToolPolicyConfig};
use toolgate::tools::InvocationContext;

fn ctx() -> InvocationContext {
    InvocationContext::new("openapi")
}

fn hitl_everything(config: &mut toolgate::config::Config) {
    config.tools.defaults = ToolPolicyConfig {
        policy: PolicyDecision::Hitl,
        ..Default::default()
    };
}

#[tokio::test]
async fn test_approved_dispatch_executes_and_audits() {
    let (_tmp, gateway) = test_gateway("", hitl_everything);

    let hitl = Arc::clone(&gateway.hitl);
    let approver = tokio::spawn(async move {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(request) = hitl.pending().first() {
                assert_eq!(request.status.as_str(), "pending");
                hitl.approve(&request.id, "admin", Some("ok".to_string()))
                    .await
                    .expect("approve");
                return;
            }
        }
        panic!("no pending request appeared");
    });

    let result = gateway
        .dispatcher
        .dispatch("workspace", "info", json!({}), &ctx(), false, None)
        .await
        .expect("dispatch");
    approver.await.expect("approver");
    assert!(result["default_workspace"].is_string());

    let rows = gateway.audit.recent(10).expect("audit rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "hitl_approved");
    let request_id = rows[0].hitl_request_id.as_deref().expect("request id");
    assert_eq!(
        gateway
            .hitl
            .persisted_status(request_id)
            .expect("status")
            .as_deref(),
        Some("approved")
    );
}

#[tokio::test]
async fn test_unattended_dispatch_expires() {
    let (_tmp, gateway) = test_gateway("", |config| {
        hitl_everything(config);
        config.hitl.default_ttl_seconds = 1;
    });

    let started = std::time::Instant::now();
    let err = gateway
        .dispatcher
        .dispatch("workspace", "info", json!({}), &ctx(), false, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
    assert!(started.elapsed() <= std::time::Duration::from_millis(1500));

    let rows = gateway.audit.recent(10).expect("audit rows");
    assert_eq!(rows[0].status, "hitl_expired");
    let request_id = rows[0].hitl_request_id.as_deref().expect("request id");
    assert_eq!(
        gateway
            .hitl
            .persisted_status(request_id)
            .expect("status")
            .as_deref(),
        Some("expired")
    );
}

#[tokio::test]
async fn test_rejected_dispatch_is_security_error() {
    let (_tmp, gateway) = test_gateway("", hitl_everything);

    let hitl = Arc::clone(&gateway.hitl);
    let rejecter = tokio::spawn(async move {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(request) = hitl.pending().first() {
                hitl.reject(&request.id, "admin", Some("not today".to_string()))
                    .await
                    .expect("reject");
                return;
            }
        }
        panic!("no pending request appeared");
    });

    let err = gateway
        .dispatcher
        .dispatch("workspace", "info", json!({}), &ctx(), false, None)
        .await
        .unwrap_err();
    rejecter.await.expect("rejecter");
    assert_eq!(err.kind(), "security_error");
    assert_eq!(gateway.audit.recent(1).expect("rows")[0].status, "hitl_rejected");
}

#[tokio::test]
async fn test_hitl_request_params_masked_for_reviewers() {
    let (_tmp, gateway) = test_gateway("TOKEN=supersecret\n", hitl_everything);

    let hitl = Arc::clone(&gateway.hitl);
    let checker = tokio::spawn(async move {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(request) = hitl.pending().first() {
                let params = request.request_params.to_string();
                // Templates pass through; any literal value would be masked.
                assert!(params.contains("{{secret:TOKEN}}"));
                assert!(!params.contains("supersecret"));
                hitl.approve(&request.id, "admin", None).await.expect("approve");
                return;
            }
        }
        panic!("no pending request appeared");
    });

    gateway
        .dispatcher
        .dispatch(
            "fs",
            "write",
            json!({"path": "t.txt", "content": "{{secret:TOKEN}}"}),
            &ctx(),
            false,
            None,
        )
        .await
        .expect("dispatch");
    checker.await.expect("checker");
}
