//! Externally ticked cron dispatch: due-window evaluation and slot
//! idempotence.

use reqwest::StatusCode;
use serde_json::json;

use crate::common::{cron_task, spawn_app};

#[tokio::test]
async fn test_cron_task_fires_once_per_slot() {
    let app = spawn_app().await;
    app.schedule(&cron_task("c1", "*/1 * * * *")).await;

    // First tick just after the minute boundary: due.
    let response = app.cron_tick("2026-07-01T12:00:30Z").await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: serde_json::Value = response.json().await.unwrap();
    assert_eq!(reply["fired"].as_array().unwrap().len(), 1);
    assert_eq!(reply["fired"][0]["taskId"], json!("c1"));

    // The consumed slot is recorded as lastRun.
    let task = app.get_task("c1").await;
    assert_eq!(task["lastRun"], json!("2026-07-01T12:00:00Z"));

    // Second tick inside the same slot: nothing fires.
    let reply: serde_json::Value = app
        .cron_tick("2026-07-01T12:00:45Z")
        .await
        .json()
        .await
        .unwrap();
    assert!(reply["fired"].as_array().unwrap().is_empty());
    assert_eq!(app.captured.lock().len(), 1);

    // The next slot fires again.
    let reply: serde_json::Value = app
        .cron_tick("2026-07-01T12:01:02Z")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(reply["fired"].as_array().unwrap().len(), 1);
    assert_eq!(app.captured.lock().len(), 2);
}

#[tokio::test]
async fn test_stale_slot_outside_window_does_not_fire() {
    let app = spawn_app().await;
    // Hourly schedule, ticked mid-hour: the last slot is stale.
    app.schedule(&cron_task("c1", "0 * * * *")).await;

    let reply: serde_json::Value = app
        .cron_tick("2026-07-01T12:30:00Z")
        .await
        .json()
        .await
        .unwrap();
    assert!(reply["fired"].as_array().unwrap().is_empty());
    assert!(app.captured.lock().is_empty());
}

#[tokio::test]
async fn test_disabled_cron_task_does_not_fire() {
    let app = spawn_app().await;
    app.schedule(&cron_task("c1", "*/1 * * * *")).await;
    app.client
        .post(app.url("/tasks/c1/disable"))
        .send()
        .await
        .unwrap();

    let reply: serde_json::Value = app
        .cron_tick("2026-07-01T12:00:30Z")
        .await
        .json()
        .await
        .unwrap();
    assert!(reply["fired"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_and_cron_triggers_coexist() {
    let app = spawn_app().await;
    app.schedule(&cron_task("c1", "*/1 * * * *")).await;

    // Cron consumes the 12:00 slot.
    app.cron_tick("2026-07-01T12:00:10Z").await;
    assert_eq!(app.captured.lock().len(), 1);

    // A manual run in between is always allowed.
    let response = app
        .client
        .post(app.url("/tasks/c1/run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.captured.lock().len(), 2);
}
