//! Webhook ingress: signature verification, fan-out over shared
//! subscriptions, and cursor write-back.

use reqwest::StatusCode;
use serde_json::json;

use ingest_hub::model::{SourceData, SourceResult};

use crate::common::{
    CountingProvider, drive_notification, drive_webhook_task, empty_source_result,
    git_webhook_task, signed_push, spawn_app, spawn_app_with,
};

const REPO: &str = "https://github.com/ex/r";

#[tokio::test]
async fn test_github_push_with_valid_signature_runs_task() {
    let app = spawn_app().await;
    app.schedule(&git_webhook_task("g1", REPO)).await;

    let secret = app.task_secret("g1").await;
    let (headers, body) = signed_push(&secret, "ex/r", false);

    let response = app.post_webhook("gh", &headers, body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reply["status"], json!("processed"));
    assert_eq!(reply["fannedOut"], json!(1));
    assert_eq!(reply["firstStatus"]["success"], json!(true));

    let payloads = app.captured.lock();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].external_resource_id.as_deref(), Some(REPO));
    assert!(payloads[0].webhook_payload.is_some());
}

#[tokio::test]
async fn test_github_push_with_bad_signature_401() {
    let app = spawn_app().await;
    app.schedule(&git_webhook_task("g1", REPO)).await;

    let (headers, body) = signed_push("not-the-secret", "ex/r", false);
    let response = app.post_webhook("gh", &headers, body).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let reply: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reply["error"], json!("Invalid webhook signature"));
    assert!(app.captured.lock().is_empty(), "orchestrator must not run");
}

#[tokio::test]
async fn test_unknown_endpoint_404() {
    let app = spawn_app().await;

    let (headers, body) = signed_push("s", "ex/r", false);
    let response = app.post_webhook("nope", &headers, body).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_body_400() {
    let app = spawn_app().await;
    app.schedule(&git_webhook_task("g1", REPO)).await;

    let response = app
        .post_webhook("gh", &[("x-github-event", "push".to_string())], "not json")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_event_for_unsubscribed_repo_is_200_ignored() {
    let app = spawn_app().await;
    app.schedule(&git_webhook_task("g1", REPO)).await;

    let (headers, body) = signed_push("whatever", "other/repo", false);
    let response = app.post_webhook("gh", &headers, body).await;

    assert_eq!(response.status(), StatusCode::OK);
    let reply: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reply["status"], json!("ignored"));
    assert!(app.captured.lock().is_empty());
}

#[tokio::test]
async fn test_shared_subscription_fan_out_lifecycle() {
    let app = spawn_app().await;

    // Two tasks on the same repository: one provider registration.
    app.schedule(&git_webhook_task("a", REPO)).await;
    app.schedule(&git_webhook_task("b", REPO)).await;
    assert_eq!(app.provider.register_count(), 1);

    // Both tasks carry the same secret.
    assert_eq!(app.task_secret("a").await, app.task_secret("b").await);

    // One event fans out to both.
    let secret = app.task_secret("a").await;
    let (headers, body) = signed_push(&secret, "ex/r", false);
    let response = app.post_webhook("gh", &headers, body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reply["fannedOut"], json!(2));
    assert_eq!(app.captured.lock().len(), 2);

    // Deleting the first task keeps the external subscription alive.
    app.client
        .delete(app.url("/tasks/a"))
        .send()
        .await
        .unwrap();
    assert_eq!(app.provider.deregister_count(), 0);
    let entry = app.registration(REPO).await.unwrap();
    assert!(!entry.registered_tasks.contains("a"));
    assert!(entry.registered_tasks.contains("b"));

    // Deleting the last task tears it down.
    app.client
        .delete(app.url("/tasks/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(app.provider.deregister_count(), 1);
    assert!(app.registration(REPO).await.is_none());
}

#[tokio::test]
async fn test_cursor_write_back_across_dispatches() {
    let app = spawn_app_with(
        CountingProvider::new(),
        SourceResult::ok(SourceData {
            data: Some(json!([])),
            next_page_token: Some("n9".to_string()),
            ..Default::default()
        }),
    )
    .await;
    app.schedule(&git_webhook_task("g1", REPO)).await;

    let secret = app.task_secret("g1").await;
    let (headers, body) = signed_push(&secret, "ex/r", false);

    app.post_webhook("gh", &headers, body.clone()).await;
    let entry = app.registration(REPO).await.unwrap();
    assert_eq!(entry.next_page_token.as_deref(), Some("n9"));

    // The next event carries the stored cursor into the run payload.
    app.post_webhook("gh", &headers, body).await;
    let payloads = app.captured.lock();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1].next_page_token.as_deref(), Some("n9"));
}

#[tokio::test]
async fn test_drive_first_time_token_acquisition() {
    let app = spawn_app_with(
        CountingProvider::with_start_page_token("42"),
        empty_source_result(),
    )
    .await;

    // First call: registration creates the entry with the provider's
    // startPageToken and a fresh channel secret.
    app.schedule(&drive_webhook_task("d1", "FOLDER123")).await;
    let entry = app.registration("FOLDER123").await.unwrap();
    assert_eq!(entry.start_page_token.as_deref(), Some("42"));

    // A notification on the live channel delivers that token to the source.
    let secret = app.task_secret("d1").await;
    let headers = drive_notification(&secret, "update", "FOLDER123");
    let response = app.post_webhook("drive", &headers, "").await;
    assert_eq!(response.status(), StatusCode::OK);

    let payloads = app.captured.lock();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].start_page_token.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_drive_channel_token_mismatch_401() {
    let app = spawn_app().await;
    app.schedule(&drive_webhook_task("d1", "FOLDER123")).await;

    let headers = drive_notification("wrong-token", "update", "FOLDER123");
    let response = app.post_webhook("drive", &headers, "").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.captured.lock().is_empty());
}

#[tokio::test]
async fn test_push_delete_classifies_change_type() {
    let app = spawn_app().await;
    app.schedule(&git_webhook_task("g1", REPO)).await;

    let secret = app.task_secret("g1").await;
    let (headers, body) = signed_push(&secret, "ex/r", true);
    app.post_webhook("gh", &headers, body).await;

    let payloads = app.captured.lock();
    assert_eq!(
        payloads[0].change_type,
        Some(ingest_hub::model::ChangeType::Delete)
    );
}
