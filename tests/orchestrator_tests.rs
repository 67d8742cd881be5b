//! End-to-end orchestration over in-memory collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use common::{
    always, envelope, envelope_with_save, invocation, thrown, FailingAuditSink, FakeBackend, Fixture, Responder,
};
use endpoint_sandbox_rs::collaborators::{CollectionSchema, MockCollection};
use endpoint_sandbox_rs::orchestrator::rate_limit::RateLimiter;
use endpoint_sandbox_rs::orchestrator::ServiceStatus;
use endpoint_sandbox_rs::prelude::*;

/// Heavy responder: saves the array literal the code passes to `saveData`.
fn saving_backend() -> FakeBackend {
    FakeBackend::new(Arc::new(|view| {
        let items = if view.code.contains("'b'") {
            json!([{ "writer": "b" }])
        } else if view.code.contains("'a'") {
            json!([{ "writer": "a" }])
        } else {
            json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }])
        };
        envelope_with_save(view, json!({ "saved": true }), items)
    }))
}

fn fixture_with(config: SandboxConfig, light: Responder, backend: FakeBackend) -> Fixture {
    Fixture::new(config, light, backend)
}

fn fixture() -> Fixture {
    fixture_with(
        SandboxConfig::default(),
        always(json!({ "message": "ok" })),
        saving_backend(),
    )
}

#[tokio::test]
async fn test_pure_read_returns_data_and_logs_once() {
    let fx = fixture();
    fx.endpoint("hello", r#"return { message: "ok" };"#);

    let response = assert_ok!(fx.orchestrator.execute(invocation("hello", "alice", None)).await);

    assert!(response.success);
    assert_eq!(response.data, json!({ "message": "ok" }));
    assert!(response.error.is_none());
    assert!(response.saved_data.is_none());

    let records = fx.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, 200);
    assert_eq!(records[0].strategy, Some(Strategy::Light));
    assert_eq!(records[0].request_body.as_deref(), Some("{\"name\":\"grace\"}"));
    assert_eq!(fx.backend.provisioned.load(Ordering::SeqCst), 0);

    let endpoint = fx.endpoints.get("hello").unwrap();
    assert_eq!(endpoint.call_count, 1);
    assert!(endpoint.last_called_at.is_some());
}

#[tokio::test]
async fn test_context_is_bound_into_harness() {
    let light: Responder = Arc::new(|view| {
        envelope(json!({
            "count": view.bindings["mockData"].as_array().map(|a| a.len()),
            "api": view.bindings["env"]["API_URL"],
            "method": view.bindings["req"]["method"],
        }))
    });
    let fx = fixture_with(SandboxConfig::default(), light, saving_backend());
    fx.endpoint("ctx", "return { count: mockData.length, api: env.API_URL, method: req.method };");

    let response = assert_ok!(fx.orchestrator.execute(invocation("ctx", "alice", Some("users"))).await);
    assert_eq!(
        response.data,
        json!({ "count": 1, "api": "https://api.example.test", "method": "POST" })
    );
}

#[tokio::test]
async fn test_save_persists_items_and_bumps_version() {
    let fx = fixture();
    fx.endpoint(
        "save",
        "await saveData([{ id: 1 }, { id: 2 }, { id: 3 }]); return { saved: true };",
    );

    let response = assert_ok!(fx.orchestrator.execute(invocation("save", "alice", Some("users"))).await);

    assert!(response.success);
    let saved = response.saved_data.expect("save results");
    assert_eq!(saved.count, 1);
    assert_eq!(saved.results[0].version, Some(2));
    assert_eq!(saved.results[0].item_count, Some(3));

    let users = fx.mock_data.get("users").unwrap();
    assert_eq!(users.version, 2);
    assert_eq!(users.items.len(), 3);
    assert_eq!(fx.mock_data.backups("users").len(), 1);
    assert_eq!(fx.mock_data.backups("users")[0].execution_id, response.execution_id);

    // Heavy ran, and its environment is gone.
    assert_eq!(fx.backend.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(fx.manager.active_count(), 0);
}

#[tokio::test]
async fn test_failing_log_store_does_not_change_result() {
    let sink = Arc::new(FailingAuditSink::default());
    let fx = Fixture::with_audit_sink(
        SandboxConfig::default(),
        always(json!({ "message": "ok" })),
        saving_backend(),
        sink.clone(),
    );
    fx.endpoint("hello", r#"return { message: "ok" };"#);

    let response = assert_ok!(fx.orchestrator.execute(invocation("hello", "alice", None)).await);

    assert!(response.success);
    assert_eq!(response.data, json!({ "message": "ok" }));
    assert!(response.error.is_none());
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    assert!(fx.audit.records().is_empty());
}

#[tokio::test]
async fn test_failing_log_store_keeps_rejection_error() {
    let sink = Arc::new(FailingAuditSink::default());
    let fx = Fixture::with_audit_sink(
        SandboxConfig::default(),
        always(json!(null)),
        saving_backend(),
        sink.clone(),
    );
    fx.endpoint("fs", "const fs = require('fs'); return 1;");

    let err = assert_err!(fx.orchestrator.execute(invocation("fs", "alice", None)).await);

    assert!(err.is_validation());
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_save_failure_does_not_retract_result() {
    let fx = fixture();
    fx.mock_data.insert(MockCollection {
        id: "strict".into(),
        project_id: "proj-1".into(),
        name: "Strict".into(),
        items: vec![],
        schema: Some(CollectionSchema {
            required: vec!["email".into()],
        }),
        version: 7,
    });
    fx.endpoint("save", "await saveData([{ id: 1 }, { id: 2 }, { id: 3 }]); return { saved: true };");

    let response = assert_ok!(fx.orchestrator.execute(invocation("save", "alice", Some("strict"))).await);

    assert!(response.success);
    assert_eq!(response.data, json!({ "saved": true }));
    let saved = response.saved_data.unwrap();
    assert_eq!(saved.count, 0);
    assert!(!saved.results[0].success);
    assert!(saved.results[0].error.as_deref().unwrap().contains("email"));
    assert_eq!(fx.mock_data.get("strict").unwrap().version, 7);
}

#[tokio::test]
async fn test_save_without_any_target_is_reported() {
    let fx = fixture();
    fx.endpoint("save", "await saveData([{ id: 1 }]); return 1;");

    let response = assert_ok!(fx.orchestrator.execute(invocation("save", "alice", None)).await);
    let saved = response.saved_data.unwrap();
    assert_eq!(saved.count, 0);
    assert!(saved.results[0].collection_id.is_none());
}

#[tokio::test]
async fn test_sandbox_chosen_collection_is_access_checked() {
    let backend = FakeBackend::new(Arc::new(|view| {
        let mut out = envelope_with_save(view, json!(null), json!([{ "x": 1 }]));
        out.stdout = out.stdout.replace("\"collectionId\":null", "\"collectionId\":\"payroll\"");
        out
    }));
    let fx = fixture_with(SandboxConfig::default(), always(json!(null)), backend);
    fx.mock_data.insert(MockCollection {
        id: "payroll".into(),
        project_id: "proj-other".into(),
        name: "Payroll".into(),
        items: vec![json!({ "salary": 1 })],
        schema: None,
        version: 3,
    });
    fx.endpoint("sneaky", "await saveData('payroll', [{ x: 1 }]);");

    let response = assert_ok!(fx.orchestrator.execute(invocation("sneaky", "alice", None)).await);

    let saved = response.saved_data.unwrap();
    assert_eq!(saved.count, 0);
    assert!(saved.results[0].error.as_deref().unwrap().contains("access denied"));
    assert_eq!(fx.mock_data.get("payroll").unwrap().version, 3);
}

#[tokio::test]
async fn test_oversized_code_is_rejected_without_environment() {
    let fx = fixture();
    let code = format!("return '{}';", "x".repeat(60_000));
    fx.endpoint("big", &code);

    let err = assert_err!(fx.orchestrator.execute(invocation("big", "alice", None)).await);

    assert!(err.is_validation());
    assert_eq!(err.code(), "CODE_VALIDATION_FAILED");
    assert_eq!(fx.backend.provisioned.load(Ordering::SeqCst), 0);
    assert_eq!(fx.manager.stats().provisioned, 0);
    assert_eq!(fx.light_runs(), 0);

    let records = fx.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, 400);
    assert!(records[0].execution_id.is_none());
}

#[tokio::test]
async fn test_denied_code_is_rejected() {
    let fx = fixture();
    fx.endpoint("fs", "const fs = require('fs'); return fs.readFileSync('/etc/passwd');");

    let err = assert_err!(fx.orchestrator.execute(invocation("fs", "alice", None)).await);
    assert!(err.is_validation());
    assert_eq!(fx.light_runs(), 0);
}

#[tokio::test]
async fn test_access_denied_has_no_side_effects() {
    let fx = fixture();
    fx.endpoint("hello", "return 1;");

    let err = assert_err!(fx.orchestrator.execute(invocation("hello", "mallory", None)).await);
    assert_eq!(err.code(), "ACCESS_DENIED");
    assert_eq!(fx.light_runs(), 0);
    assert_eq!(fx.orchestrator.total_executions(), 0);
    assert_eq!(fx.audit.records()[0].status_code, 403);
    assert_eq!(fx.endpoints.get("hello").unwrap().call_count, 0);
}

#[tokio::test]
async fn test_collection_in_foreign_project_is_denied() {
    let fx = fixture();
    fx.mock_data.insert(MockCollection {
        id: "foreign".into(),
        project_id: "proj-2".into(),
        name: "Foreign".into(),
        items: vec![],
        schema: None,
        version: 1,
    });
    fx.endpoint("hello", "return 1;");

    let err = assert_err!(fx.orchestrator.execute(invocation("hello", "alice", Some("foreign"))).await);
    assert_eq!(err.code(), "ACCESS_DENIED");
    assert_eq!(fx.light_runs(), 0);
}

#[tokio::test]
async fn test_unknown_endpoint() {
    let fx = fixture();
    let err = assert_err!(fx.orchestrator.execute(invocation("missing", "alice", None)).await);
    assert_eq!(err.status_code(), 404);
    assert_eq!(fx.audit.records().len(), 1);
}

#[tokio::test]
async fn test_rate_limit_rejects_before_execution() {
    let fx = fixture();
    let fx = Fixture {
        orchestrator: fx.orchestrator.with_rate_limiter(RateLimiter::per_hour(2)),
        ..fx
    };
    fx.endpoint("hello", "return 1;");

    assert_ok!(fx.orchestrator.execute(invocation("hello", "alice", None)).await);
    assert_ok!(fx.orchestrator.execute(invocation("hello", "alice", None)).await);
    let err = assert_err!(fx.orchestrator.execute(invocation("hello", "alice", None)).await);

    assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    assert_eq!(fx.orchestrator.total_executions(), 2);
    assert_eq!(fx.audit.records().last().unwrap().status_code, 429);
}

#[tokio::test]
async fn test_runtime_error_is_a_result_not_an_error() {
    let fx = fixture_with(
        SandboxConfig::default(),
        Arc::new(|_| thrown("TypeError: mockData.nope is not a function")),
        saving_backend(),
    );
    fx.endpoint("broken", "return mockData.nope();");

    let response = assert_ok!(fx.orchestrator.execute(invocation("broken", "alice", None)).await);

    assert!(!response.success);
    assert_eq!(response.data, Value::Null);
    assert!(response.error.as_deref().unwrap().starts_with("TypeError"));
    assert_eq!(fx.audit.records()[0].status_code, 500);
    assert_eq!(fx.audit.records()[0].error_code.as_deref(), Some("RUNTIME_ERROR"));
    assert_eq!(fx.endpoints.get("broken").unwrap().call_count, 0);
}

#[tokio::test]
async fn test_response_helper_status_is_logged() {
    let fx = fixture_with(
        SandboxConfig::default(),
        always(json!({ "statusCode": 201, "body": { "id": 9 } })),
        saving_backend(),
    );
    fx.endpoint("create", "return res.status(201).json({ id: 9 });");

    let response = assert_ok!(fx.orchestrator.execute(invocation("create", "alice", None)).await);
    assert!(response.success);
    assert_eq!(fx.audit.records()[0].status_code, 201);
}

#[tokio::test]
async fn test_timeout_is_logged_and_environment_destroyed() {
    let config = SandboxConfig::builder()
        .timeout(Duration::from_millis(50))
        .build();
    let fx = fixture_with(
        config,
        always(json!(null)),
        FakeBackend::new(always(json!(null))).with_delay(Duration::from_secs(10)),
    );
    fx.endpoint("slow", "await new Promise(() => {});");

    let err = assert_err!(fx.orchestrator.execute(invocation("slow", "alice", None)).await);

    assert!(err.is_timeout());
    assert_eq!(fx.manager.active_count(), 0);
    assert_eq!(fx.backend.killed.load(Ordering::SeqCst), 1);
    assert_eq!(fx.audit.records()[0].status_code, 504);
}

#[tokio::test]
async fn test_concurrent_saves_last_writer_wins() {
    let fx = fixture_with(
        SandboxConfig::default(),
        always(json!(null)),
        saving_backend().with_delay(Duration::from_millis(10)),
    );
    fx.endpoint("writer-a", "await saveData([{ writer: 'a' }]);");
    fx.endpoint("writer-b", "await saveData([{ writer: 'b' }]);");

    let (a, b) = tokio::join!(
        fx.orchestrator.execute(invocation("writer-a", "alice", Some("users"))),
        fx.orchestrator.execute(invocation("writer-b", "alice", Some("users"))),
    );
    let a = assert_ok!(a).saved_data.unwrap();
    let b = assert_ok!(b).saved_data.unwrap();

    let mut versions = vec![a.results[0].version.unwrap(), b.results[0].version.unwrap()];
    versions.sort_unstable();
    assert_eq!(versions, vec![2, 3]);

    let last_writer = if a.results[0].version == Some(3) { "a" } else { "b" };
    let users = fx.mock_data.get("users").unwrap();
    assert_eq!(users.version, 3);
    assert_eq!(users.items, vec![json!({ "writer": last_writer })]);
}

#[tokio::test]
async fn test_unhealthy_backend_downgrades() {
    let fx = fixture();
    fx.backend.healthy.store(false, Ordering::SeqCst);
    fx.endpoint("async", "return await Promise.resolve(1);");

    let response = assert_ok!(fx.orchestrator.execute(invocation("async", "alice", None)).await);

    assert!(response.success);
    assert_eq!(fx.light_runs(), 1);
    assert_eq!(fx.backend.provisioned.load(Ordering::SeqCst), 0);
    let record = &fx.audit.records()[0];
    assert_eq!(record.strategy, Some(Strategy::Light));
    assert!(record.downgraded);
}

#[tokio::test]
async fn test_strict_mode_refuses_downgrade() {
    let fx = fixture_with(
        SandboxConfig::builder().strict_isolation(true).build(),
        always(json!(1)),
        saving_backend(),
    );
    fx.backend.healthy.store(false, Ordering::SeqCst);
    fx.endpoint("async", "return await Promise.resolve(1);");

    let err = assert_err!(fx.orchestrator.execute(invocation("async", "alice", None)).await);

    assert_eq!(err.code(), "ISOLATION_UNAVAILABLE");
    assert_eq!(fx.light_runs(), 0);
    assert_eq!(fx.audit.records()[0].status_code, 503);
}

#[tokio::test]
async fn test_health_surface() {
    let fx = fixture();
    fx.endpoint("hello", "return 1;");
    assert_ok!(fx.orchestrator.execute(invocation("hello", "alice", None)).await);

    let health = fx.orchestrator.health().await;
    assert_eq!(health.status, ServiceStatus::Healthy);
    assert_eq!(health.active_environments, 0);
    assert_eq!(health.max_environments, 20);
    assert_eq!(health.total_executions, 1);
    assert_eq!(health.rate_limit_ceiling, 100);

    fx.backend.healthy.store(false, Ordering::SeqCst);
    assert_eq!(fx.orchestrator.health().await.status, ServiceStatus::Degraded);

    let json = serde_json::to_value(health).unwrap();
    assert_eq!(json["activeEnvironments"], 0);
    assert_eq!(json["rateLimitCeiling"], 100);
}
