use serde::Deserialize;

/// Configuration for the ingest-hub control plane.
/// All values are loaded from environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address to bind the HTTP server (default: "0.0.0.0:3000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path to the SQLite database. Empty (the default) selects the
    /// in-memory store; use ":memory:" for SQLite without a file.
    #[serde(default)]
    pub database_path: String,

    /// Base URL of the GitHub API used for webhook registration
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    /// Base URL of the Google APIs used for Drive change watches
    #[serde(default = "default_drive_api_url")]
    pub drive_api_url: String,

    /// Timeout for provider register/deregister calls, in seconds
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Tolerance window for cron due-time evaluation, in seconds.
    /// Covers the jitter of the external tick source relative to the
    /// schedule; the last-run check keeps each slot idempotent.
    #[serde(default = "default_cron_window_secs")]
    pub cron_window_secs: u64,

    /// Log lifecycle events at info level (default: true)
    #[serde(default = "default_event_log")]
    pub event_log: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_drive_api_url() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    15
}

fn default_cron_window_secs() -> u64 {
    65
}

fn default_event_log() -> bool {
    true
}

impl Config {
    /// Load configuration from environment variables
    /// (e.g. LISTEN_ADDR, DATABASE_PATH).
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<Config>()
    }
}
