//! REST API tests for mvirt-ostack.

mod common;

use common::TestServer;
use reqwest::StatusCode;
use serde_json::{Value, json};

#[tokio::test]
async fn test_version_and_openapi() {
    let server = TestServer::spawn().await;

    let resp = server.get("/version").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    let resp = server
        .client
        .get(format!("http://{}/api-docs/openapi.json", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let doc: Value = resp.json().await.unwrap();
    assert!(doc["paths"]["/api/v1/resources/{id}/cancel"].is_object());

    server.shutdown().await;
}

#[tokio::test]
async fn test_resource_lifecycle() {
    let server = TestServer::spawn().await;

    let resp = server
        .post_json(
            "/resources",
            &json!({
                "kind": "instance",
                "scope_id": "project-1",
                "spec": {"name": "web", "vcpu": 2, "ram": 512}
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "CREATION_SCHEDULED");
    let id = body["id"].as_str().unwrap().to_string();

    server.harness.settle().await;

    let resp = server.get(&format!("/resources/{}", id)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resource: Value = resp.json().await.unwrap();
    assert_eq!(resource["state"], "OK");
    assert_eq!(resource["kind"], "instance");
    assert_eq!(resource["attributes"]["status"], "available");
    assert!(resource["backend_id"].is_string());
    assert!(resource["error_message"].is_null());

    let resp = server
        .patch_json(
            &format!("/resources/{}", id),
            &json!({"spec": {"name": "web-1"}}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "UPDATING");
    server.harness.settle().await;

    let resource: Value = server
        .get(&format!("/resources/{}", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(resource["attributes"]["name"], "web-1");

    let resp = server.delete(&format!("/resources/{}", id)).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["state"], "DELETION_SCHEDULED");
    server.harness.settle().await;

    let resource: Value = server
        .get(&format!("/resources/{}", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(resource["state"], "DELETED");

    // Deleting again is a state conflict
    let resp = server.delete(&format!("/resources/{}", id)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 409);

    server.shutdown().await;
}

#[tokio::test]
async fn test_list_filters() {
    let server = TestServer::spawn().await;

    for (kind, scope) in [
        ("volume", "project-1"),
        ("volume", "project-2"),
        ("network", "project-1"),
    ] {
        let resp = server
            .post_json(
                "/resources",
                &json!({"kind": kind, "scope_id": scope, "spec": {"size": 1}}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
    server.harness.settle().await;

    let all: Vec<Value> = server.get("/resources").await.json().await.unwrap();
    assert_eq!(all.len(), 3);

    let volumes: Vec<Value> = server
        .get("/resources?kind=volume")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(volumes.len(), 2);

    let scoped: Vec<Value> = server
        .get("/resources?scope=project-1&kind=network&state=ok")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0]["scope_id"], "project-1");

    let resp = server.get("/resources?kind=server").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = server.get("/resources?state=sleeping").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_create_requests() {
    let server = TestServer::spawn().await;

    let resp = server
        .post_json("/resources", &json!({"kind": "server", "scope_id": "project-1"}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .post_json("/resources", &json!({"kind": "volume", "scope_id": "tenant-1"}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .post_json("/resources", &json!({"kind": "volume", "scope_id": "nowhere"}))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server.get("/resources/does-not-exist").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 404);

    server.shutdown().await;
}

#[tokio::test]
async fn test_request_id_returns_first_response() {
    let server = TestServer::spawn().await;
    let body = json!({
        "kind": "floating_ip",
        "scope_id": "project-2",
        "request_id": "client-token-1"
    });

    let first: Value = server
        .post_json("/resources", &body)
        .await
        .json()
        .await
        .unwrap();
    let second: Value = server
        .post_json("/resources", &body)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["id"], second["id"]);
    server.harness.settle().await;

    let listed: Vec<Value> = server
        .get("/resources?scope=project-2")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_quota_limits() {
    let server = TestServer::spawn().await;

    let resp = server
        .put_json("/scopes/project-1/quota/vcpu", &json!({"limit": 4}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let entry: Value = resp.json().await.unwrap();
    assert_eq!(entry["metric"], "vcpu");
    assert_eq!(entry["limit"], 4);

    let resp = server
        .post_json(
            "/resources",
            &json!({"kind": "instance", "scope_id": "project-1", "spec": {"vcpu": 3}}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = server
        .post_json(
            "/resources",
            &json!({"kind": "instance", "scope_id": "project-1", "spec": {"vcpu": 2}}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("quota exceeded"));
    server.harness.settle().await;

    let quota: Value = server
        .get("/scopes/customer-1/quota")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(quota["scope_id"], "customer-1");
    let vcpu = quota["entries"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["metric"] == "vcpu")
        .unwrap();
    assert_eq!(vcpu["usage"], 3);
    assert!(vcpu["limit"].is_null());

    // Removing the limit
    let resp = server
        .put_json("/scopes/project-1/quota/vcpu", &json!({"limit": null}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .put_json("/scopes/project-1/quota/cores", &json!({"limit": 1}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = server
        .put_json("/scopes/project-1/quota/vcpu", &json!({"limit": -5}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let resp = server.get("/scopes/nowhere/quota").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn test_scopes_and_reconcile() {
    let server = TestServer::spawn().await;

    let scopes: Vec<Value> = server.get("/scopes").await.json().await.unwrap();
    assert_eq!(scopes.len(), 4);
    let tenant = scopes.iter().find(|s| s["id"] == "tenant-1").unwrap();
    assert_eq!(tenant["level"], "tenant");
    assert_eq!(tenant["parent_id"], "customer-1");

    server.harness.cloud.insert_external(
        mvirt_ostack::ResourceKind::Volume,
        "project-1",
        json!({"size": 7}),
    );
    let resp = server.post("/scopes/project-1/reconcile").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary: Value = resp.json().await.unwrap();
    assert_eq!(summary["imported"].as_array().unwrap().len(), 1);
    assert!(summary["errors"].as_array().unwrap().is_empty());

    let drift: Vec<Value> = server
        .get("/scopes/project-1/drift")
        .await
        .json()
        .await
        .unwrap();
    assert!(drift.is_empty());

    let resp = server.post("/scopes/nowhere/reconcile").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn test_cancel_and_recover_conflicts() {
    let server = TestServer::spawn().await;

    let body: Value = server
        .post_json(
            "/resources",
            &json!({"kind": "network", "scope_id": "project-1"}),
        )
        .await
        .json()
        .await
        .unwrap();
    let id = body["id"].as_str().unwrap().to_string();
    server.harness.settle().await;

    // Already OK: nothing to cancel, nothing to recover
    let resp = server.post(&format!("/resources/{}/cancel", id)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let resp = server.post(&format!("/resources/{}/recover", id)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = server.post("/resources/missing/cancel").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}
