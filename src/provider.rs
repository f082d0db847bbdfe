//! External webhook subscription management.
//!
//! [`WebhookProvider`] is the contract the manager consumes;
//! [`HttpWebhookProvider`] is the shipped implementation, talking to the
//! GitHub hooks API and the Drive changes/channels API over one shared
//! reqwest client. All three operations are idempotent from the manager's
//! view; the manager guarantees it never registers the same source
//! identifier twice.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::HubError;

/// What the provider hands back from a successful registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderRegistration {
    /// Provider-issued id, required for deregistration.
    pub external_id: String,

    /// Drive-style initial continuation cursor, when the service has one.
    pub start_page_token: Option<String>,
}

#[async_trait]
pub trait WebhookProvider: Send + Sync {
    /// Create an external subscription delivering callbacks for
    /// `source_identifier` to `callback_url`, authenticated with `secret`.
    async fn register(
        &self,
        plugin_type: &str,
        source_identifier: &str,
        callback_url: &str,
        secret: &str,
        credentials: &Value,
    ) -> Result<ProviderRegistration, HubError>;

    /// Tear down a subscription. `external_id` is always the provider-issued
    /// webhook identity; `resource_id` is always the source identifier.
    async fn deregister(
        &self,
        plugin_type: &str,
        external_id: &str,
        resource_id: &str,
        credentials: &Value,
    ) -> Result<(), HubError>;

    async fn verify_credentials(
        &self,
        plugin_type: &str,
        credentials: &Value,
    ) -> Result<bool, HubError>;
}

pub struct HttpWebhookProvider {
    client: Client,
    github_api_url: String,
    drive_api_url: String,
}

impl HttpWebhookProvider {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new(
        github_api_url: impl Into<String>,
        drive_api_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HubError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            github_api_url: trim_base(github_api_url.into()),
            drive_api_url: trim_base(drive_api_url.into()),
        })
    }

    // ── GitHub hooks API ────────────────────────────────────────────────

    async fn register_github(
        &self,
        source_identifier: &str,
        callback_url: &str,
        secret: &str,
        credentials: &Value,
    ) -> Result<ProviderRegistration, HubError> {
        let (owner, repo) = github_repo_path(source_identifier)?;
        let url = format!("{}/repos/{owner}/{repo}/hooks", self.github_api_url);

        let body = json!({
            "name": "web",
            "active": true,
            "events": ["push", "pull_request"],
            "config": {
                "url": callback_url,
                "content_type": "json",
                "secret": secret,
            }
        });

        let response = self
            .authorized(self.client.post(&url), credentials)
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::Upstream(format!("GitHub hook registration failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::Upstream(format!(
                "GitHub hook registration returned {status}: {text}"
            )));
        }

        let hook: Value = response
            .json()
            .await
            .map_err(|e| HubError::Upstream(format!("GitHub hook response unreadable: {e}")))?;
        let external_id = hook
            .get("id")
            .map(id_to_string)
            .ok_or_else(|| HubError::Upstream("GitHub hook response carries no id".to_string()))?;

        info!(
            owner = %owner,
            repo = %repo,
            external_id = %external_id,
            "registered GitHub webhook"
        );
        Ok(ProviderRegistration {
            external_id,
            start_page_token: None,
        })
    }

    async fn deregister_github(
        &self,
        external_id: &str,
        resource_id: &str,
        credentials: &Value,
    ) -> Result<(), HubError> {
        let (owner, repo) = github_repo_path(resource_id)?;
        let url = format!(
            "{}/repos/{owner}/{repo}/hooks/{external_id}",
            self.github_api_url
        );

        let response = self
            .authorized(self.client.delete(&url), credentials)
            .send()
            .await
            .map_err(|e| HubError::Upstream(format!("GitHub hook deletion failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Already gone upstream; deletion is idempotent.
            debug!(external_id = %external_id, "GitHub hook already absent");
            return Ok(());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::Upstream(format!(
                "GitHub hook deletion returned {status}: {text}"
            )));
        }

        info!(owner = %owner, repo = %repo, external_id = %external_id, "deregistered GitHub webhook");
        Ok(())
    }

    // ── Drive changes/channels API ──────────────────────────────────────

    async fn register_drive(
        &self,
        callback_url: &str,
        secret: &str,
        credentials: &Value,
    ) -> Result<ProviderRegistration, HubError> {
        let token_url = format!("{}/drive/v3/changes/startPageToken", self.drive_api_url);
        let response = self
            .authorized(self.client.get(&token_url), credentials)
            .send()
            .await
            .map_err(|e| HubError::Upstream(format!("Drive startPageToken fetch failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::Upstream(format!(
                "Drive startPageToken fetch returned {status}: {text}"
            )));
        }
        let token_body: Value = response.json().await.map_err(|e| {
            HubError::Upstream(format!("Drive startPageToken response unreadable: {e}"))
        })?;
        let start_page_token = token_body
            .get("startPageToken")
            .and_then(Value::as_str)
            .map(str::to_string);

        let watch_url = format!("{}/drive/v3/changes/watch", self.drive_api_url);
        let mut request = self.authorized(self.client.post(&watch_url), credentials);
        if let Some(token) = &start_page_token {
            request = request.query(&[("pageToken", token.as_str())]);
        }

        // The channel id doubles as the shared secret: inbound notifications
        // echo it in X-Goog-Channel-Id, which is what the verifier checks.
        let body = json!({
            "id": secret,
            "type": "web_hook",
            "address": callback_url,
            "token": secret,
        });

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::Upstream(format!("Drive watch registration failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::Upstream(format!(
                "Drive watch registration returned {status}: {text}"
            )));
        }

        let channel: Value = response
            .json()
            .await
            .map_err(|e| HubError::Upstream(format!("Drive watch response unreadable: {e}")))?;
        let external_id = channel
            .get("resourceId")
            .or_else(|| channel.get("id"))
            .map(id_to_string)
            .ok_or_else(|| {
                HubError::Upstream("Drive watch response carries no resource id".to_string())
            })?;

        info!(external_id = %external_id, "registered Drive change watch");
        Ok(ProviderRegistration {
            external_id,
            start_page_token,
        })
    }

    async fn deregister_drive(
        &self,
        external_id: &str,
        resource_id: &str,
        credentials: &Value,
    ) -> Result<(), HubError> {
        let url = format!("{}/drive/v3/channels/stop", self.drive_api_url);
        let body = json!({
            "id": external_id,
            "resourceId": resource_id,
        });

        let response = self
            .authorized(self.client.post(&url), credentials)
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::Upstream(format!("Drive channel stop failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(external_id = %external_id, "Drive channel already absent");
            return Ok(());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HubError::Upstream(format!(
                "Drive channel stop returned {status}: {text}"
            )));
        }

        info!(external_id = %external_id, "stopped Drive change watch");
        Ok(())
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
        credentials: &Value,
    ) -> reqwest::RequestBuilder {
        match bearer_token(credentials) {
            Some(token) => request.bearer_auth(token),
            None => {
                warn!("provider call without credentials token");
                request
            }
        }
    }
}

#[async_trait]
impl WebhookProvider for HttpWebhookProvider {
    async fn register(
        &self,
        plugin_type: &str,
        source_identifier: &str,
        callback_url: &str,
        secret: &str,
        credentials: &Value,
    ) -> Result<ProviderRegistration, HubError> {
        match plugin_type {
            "git-crawler" => {
                self.register_github(source_identifier, callback_url, secret, credentials)
                    .await
            }
            "googledrive-crawler" => self.register_drive(callback_url, secret, credentials).await,
            other => Err(HubError::UnsupportedSource(other.to_string())),
        }
    }

    async fn deregister(
        &self,
        plugin_type: &str,
        external_id: &str,
        resource_id: &str,
        credentials: &Value,
    ) -> Result<(), HubError> {
        match plugin_type {
            "git-crawler" => {
                self.deregister_github(external_id, resource_id, credentials)
                    .await
            }
            "googledrive-crawler" => {
                self.deregister_drive(external_id, resource_id, credentials)
                    .await
            }
            other => Err(HubError::UnsupportedSource(other.to_string())),
        }
    }

    async fn verify_credentials(
        &self,
        plugin_type: &str,
        credentials: &Value,
    ) -> Result<bool, HubError> {
        let url = match plugin_type {
            "git-crawler" => format!("{}/user", self.github_api_url),
            "googledrive-crawler" => {
                format!("{}/drive/v3/about?fields=user", self.drive_api_url)
            }
            other => return Err(HubError::UnsupportedSource(other.to_string())),
        };

        let response = self
            .authorized(self.client.get(&url), credentials)
            .send()
            .await
            .map_err(|e| HubError::Upstream(format!("credential verification failed: {e}")))?;
        Ok(response.status().is_success())
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// GitHub hook ids arrive as numbers, Drive resource ids as strings.
fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bearer_token(credentials: &Value) -> Option<&str> {
    credentials
        .get("token")
        .or_else(|| credentials.get("accessToken"))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
}

/// Split `https://github.com/{owner}/{repo}` into its two path segments.
fn github_repo_path(source_identifier: &str) -> Result<(String, String), HubError> {
    let rest = source_identifier
        .strip_prefix("https://github.com/")
        .ok_or_else(|| {
            HubError::MissingConfig(format!(
                "repoUrl '{source_identifier}' is not a GitHub repository URL"
            ))
        })?;

    let mut segments = rest.trim_end_matches('/').splitn(2, '/');
    let owner = segments.next().unwrap_or_default();
    let repo = segments
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");

    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(HubError::MissingConfig(format!(
            "repoUrl '{source_identifier}' does not name owner/repo"
        )));
    }
    Ok((owner.to_string(), repo.to_string()))
}
