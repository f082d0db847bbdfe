//! Task CRUD and manual trigger behavior over the HTTP surface.

use reqwest::StatusCode;
use serde_json::json;

use crate::common::{manual_task, spawn_app};

#[tokio::test]
async fn test_schedule_and_get_round_trip() {
    let app = spawn_app().await;

    let definition = manual_task("m1");
    let response = app.schedule(&definition).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let task = app.get_task("m1").await;
    assert_eq!(task["name"], definition["name"]);
    assert_eq!(task["source"], definition["source"]);
    assert_eq!(task["trigger"], definition["trigger"]);
    assert_eq!(task["enabled"], json!(true));
    // currentStatus is machine-owned and always starts out scheduled.
    assert_eq!(task["currentStatus"], json!("scheduled"));
}

#[tokio::test]
async fn test_schedule_duplicate_id_conflicts() {
    let app = spawn_app().await;

    assert_eq!(app.schedule(&manual_task("m1")).await.status(), StatusCode::CREATED);
    assert_eq!(app.schedule(&manual_task("m1")).await.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_get_unknown_task_404() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(app.url("/tasks/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_patch_updates_user_fields_only() {
    let app = spawn_app().await;
    app.schedule(&manual_task("m1")).await;

    let response = app
        .client
        .patch(app.url("/tasks/m1"))
        .json(&json!({"name": "renamed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.get_task("m1").await["name"], json!("renamed"));

    // Machine-owned fields are rejected outright.
    let response = app
        .client
        .patch(app.url("/tasks/m1"))
        .json(&json!({"currentStatus": "completed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_enable_disable_cycle() {
    let app = spawn_app().await;
    app.schedule(&manual_task("m1")).await;

    let response = app
        .client
        .post(app.url("/tasks/m1/disable"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.get_task("m1").await["enabled"], json!(false));

    let response = app
        .client
        .post(app.url("/tasks/m1/enable"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.get_task("m1").await["enabled"], json!(true));
}

#[tokio::test]
async fn test_delete_task_removes_it() {
    let app = spawn_app().await;
    app.schedule(&manual_task("m1")).await;

    let response = app
        .client
        .delete(app.url("/tasks/m1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .client
        .get(app.url("/tasks/m1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_run_executes_and_records_status() {
    let app = spawn_app().await;
    app.schedule(&manual_task("m1")).await;

    let response = app
        .client
        .post(app.url("/tasks/m1/run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["success"], json!(true));

    assert_eq!(app.captured.lock().len(), 1);

    let task = app.get_task("m1").await;
    assert_eq!(task["currentStatus"], json!("completed"));
    assert!(task["lastRun"].is_string());
    assert_eq!(task["lastRunStatus"]["success"], json!(true));
}

#[tokio::test]
async fn test_manual_run_on_disabled_task_403() {
    let app = spawn_app().await;
    app.schedule(&manual_task("m1")).await;
    app.client
        .post(app.url("/tasks/m1/disable"))
        .send()
        .await
        .unwrap();

    let response = app
        .client
        .post(app.url("/tasks/m1/run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(app.captured.lock().is_empty());
}

#[tokio::test]
async fn test_health_counts_tasks() {
    let app = spawn_app().await;
    app.schedule(&manual_task("m1")).await;

    let body: serde_json::Value = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["tasks"], json!(1));
    assert_eq!(body["enabledTasks"], json!(1));
}
