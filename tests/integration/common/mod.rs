//! Common utilities for integration tests: an in-process server with an
//! in-memory store, a counting provider double, and capturing sources.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use ingest_hub::error::HubError;
use ingest_hub::events::EventBus;
use ingest_hub::manager::IngestionManager;
use ingest_hub::model::{RunPayload, SourceData, SourceResult, WebhookRegistration};
use ingest_hub::plugin::{PluginRegistry, Source, SourceError, stock_transformer};
use ingest_hub::provider::{ProviderRegistration, WebhookProvider};
use ingest_hub::routes::{self, AppState};
use ingest_hub::store::{MemoryStore, Store};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Provider double that counts external calls and hands out sequential ids.
pub struct CountingProvider {
    register_calls: Mutex<usize>,
    deregister_calls: Mutex<usize>,
    start_page_token: Option<String>,
}

impl CountingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            register_calls: Mutex::new(0),
            deregister_calls: Mutex::new(0),
            start_page_token: None,
        })
    }

    pub fn with_start_page_token(token: &str) -> Arc<Self> {
        Arc::new(Self {
            register_calls: Mutex::new(0),
            deregister_calls: Mutex::new(0),
            start_page_token: Some(token.to_string()),
        })
    }

    pub fn register_count(&self) -> usize {
        *self.register_calls.lock()
    }

    pub fn deregister_count(&self) -> usize {
        *self.deregister_calls.lock()
    }
}

#[async_trait]
impl WebhookProvider for CountingProvider {
    async fn register(
        &self,
        _plugin_type: &str,
        _source_identifier: &str,
        _callback_url: &str,
        _secret: &str,
        _credentials: &Value,
    ) -> Result<ProviderRegistration, HubError> {
        let mut calls = self.register_calls.lock();
        *calls += 1;
        Ok(ProviderRegistration {
            external_id: format!("ext-{}", *calls),
            start_page_token: self.start_page_token.clone(),
        })
    }

    async fn deregister(
        &self,
        _plugin_type: &str,
        _external_id: &str,
        _resource_id: &str,
        _credentials: &Value,
    ) -> Result<(), HubError> {
        *self.deregister_calls.lock() += 1;
        Ok(())
    }

    async fn verify_credentials(
        &self,
        _plugin_type: &str,
        _credentials: &Value,
    ) -> Result<bool, HubError> {
        Ok(true)
    }
}

/// Source double that records every payload and returns a fixed result.
struct CapturingSource {
    sink: Arc<Mutex<Vec<RunPayload>>>,
    result: SourceResult,
}

#[async_trait]
impl Source for CapturingSource {
    async fn init(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn execute(&mut self, payload: &RunPayload) -> Result<SourceResult, SourceError> {
        self.sink.lock().push(payload.clone());
        Ok(self.result.clone())
    }
}

/// A running in-process server plus handles for assertions.
pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub provider: Arc<CountingProvider>,
    pub store: Arc<MemoryStore>,
    /// Payloads seen by the capturing sources, in execution order.
    pub captured: Arc<Mutex<Vec<RunPayload>>>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn schedule(&self, task: &Value) -> reqwest::Response {
        self.client
            .post(self.url("/tasks"))
            .json(task)
            .send()
            .await
            .expect("schedule request failed")
    }

    pub async fn get_task(&self, id: &str) -> Value {
        self.client
            .get(self.url(&format!("/tasks/{id}")))
            .send()
            .await
            .expect("get request failed")
            .json()
            .await
            .expect("task body not JSON")
    }

    /// The generated webhook secret for a task, read through the API.
    pub async fn task_secret(&self, id: &str) -> String {
        self.get_task(id).await["trigger"]["secret"]
            .as_str()
            .expect("task has no webhook secret")
            .to_string()
    }

    pub async fn registration(&self, source_identifier: &str) -> Option<WebhookRegistration> {
        self.store
            .get_webhook_registration(source_identifier)
            .await
            .expect("store read failed")
    }

    pub async fn post_webhook(
        &self,
        endpoint: &str,
        headers: &[(&str, String)],
        body: impl Into<reqwest::Body>,
    ) -> reqwest::Response {
        let mut request = self.client.post(self.url(&format!("/hooks/{endpoint}")));
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        request
            .body(body)
            .send()
            .await
            .expect("webhook request failed")
    }

    pub async fn cron_tick(&self, time: &str) -> reqwest::Response {
        self.client
            .post(self.url("/cron/tick"))
            .json(&json!({ "time": time }))
            .send()
            .await
            .expect("cron tick request failed")
    }
}

/// Spawn the app with capturing git and drive sources that return `result`.
pub async fn spawn_app_with(
    provider: Arc<CountingProvider>,
    result: SourceResult,
) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(PluginRegistry::new());
    let events = Arc::new(EventBus::new());

    let captured: Arc<Mutex<Vec<RunPayload>>> = Arc::new(Mutex::new(Vec::new()));
    for plugin_type in ["git-crawler", "googledrive-crawler"] {
        let sink = captured.clone();
        let fixed = result.clone();
        registry.register_source(
            plugin_type,
            Arc::new(move |_config| {
                Ok(Box::new(CapturingSource {
                    sink: sink.clone(),
                    result: fixed.clone(),
                }) as Box<dyn Source>)
            }),
            stock_transformer(),
        );
    }

    let manager = IngestionManager::new(
        store.clone() as Arc<dyn Store>,
        provider.clone(),
        registry,
        events,
    );
    let app = routes::router(Arc::new(AppState { manager }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let address = listener.local_addr().expect("listener has no address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server died");
    });

    TestApp {
        base_url: format!("http://{address}"),
        client: reqwest::Client::new(),
        provider,
        store,
        captured,
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(CountingProvider::new(), empty_source_result()).await
}

pub fn empty_source_result() -> SourceResult {
    SourceResult::ok(SourceData {
        data: Some(json!([])),
        ..Default::default()
    })
}

// ── Task definition builders (wire format) ──────────────────────────────

pub fn git_webhook_task(id: &str, repo_url: &str) -> Value {
    json!({
        "id": id,
        "name": format!("sync {id}"),
        "enabled": true,
        "source": {
            "pluginType": "git-crawler",
            "config": {"repoUrl": repo_url}
        },
        "trigger": {
            "type": "webhook",
            "endpointId": "gh",
            "callbackUrl": "https://hub.example/hooks/gh",
            "credentials": {"token": "t"}
        }
    })
}

pub fn drive_webhook_task(id: &str, folder_id: &str) -> Value {
    json!({
        "id": id,
        "name": format!("drive {id}"),
        "enabled": true,
        "source": {
            "pluginType": "googledrive-crawler",
            "config": {"folderId": folder_id}
        },
        "trigger": {
            "type": "webhook",
            "endpointId": "drive",
            "callbackUrl": "https://hub.example/hooks/drive",
            "credentials": {"accessToken": "t"}
        }
    })
}

pub fn manual_task(id: &str) -> Value {
    json!({
        "id": id,
        "name": format!("manual {id}"),
        "enabled": true,
        "source": {
            "pluginType": "git-crawler",
            "config": {"repoUrl": "https://github.com/ex/r"}
        },
        "trigger": {"type": "manual"}
    })
}

pub fn cron_task(id: &str, expression: &str) -> Value {
    json!({
        "id": id,
        "name": format!("cron {id}"),
        "enabled": true,
        "source": {
            "pluginType": "git-crawler",
            "config": {"repoUrl": "https://github.com/ex/r"}
        },
        "trigger": {"type": "cron", "expression": expression}
    })
}

// ── Request builders ────────────────────────────────────────────────────

/// A GitHub push request body plus signed headers.
pub fn signed_push(secret: &str, full_name: &str, deleted: bool) -> (Vec<(&'static str, String)>, String) {
    let body = json!({
        "repository": {"full_name": full_name},
        "deleted": deleted
    })
    .to_string();

    let signature = hmac_sha256_header(secret, body.as_bytes());
    let headers = vec![
        ("x-github-event", "push".to_string()),
        ("x-hub-signature-256", signature),
    ];
    (headers, body)
}

/// Drive notification headers (the body of Drive callbacks is empty).
pub fn drive_notification(channel_id: &str, state: &str, folder_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("x-goog-channel-id", channel_id.to_string()),
        ("x-goog-resource-state", state.to_string()),
        (
            "x-goog-resource-uri",
            format!("https://www.googleapis.com/drive/v3/files/{folder_id}?alt=json"),
        ),
    ]
}

/// GitHub-style `sha256=<hex>` signature over `body`.
pub fn hmac_sha256_header(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
