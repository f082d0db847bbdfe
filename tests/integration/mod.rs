//! Integration tests for ingest-hub
//!
//! Each test spawns the full HTTP server in-process with an in-memory store,
//! capturing sources, and a counting provider double.
//! Run with: cargo test --test integration

mod common;
mod test_cron_dispatch;
mod test_task_lifecycle;
mod test_webhook_dispatch;
