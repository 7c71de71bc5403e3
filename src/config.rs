use serde::{Deserialize, Serialize};

/// Application configuration, loaded from a YAML file with per-field
/// defaults so a minimal config only needs the instance URL and tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the instance, e.g. `https://mastodon.example`.
    pub instance_base: String,
    /// Admin-scoped API token used for account listings and moderation.
    pub admin_token: String,
    /// Bot-scoped API token used for filing reports.
    pub bot_token: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// When true the full pipeline runs (scoring, audit rows, scheduling
    /// decisions) but no external moderation call is made.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Cooperative kill switch checked at the start of every job. Can also
    /// be set at runtime through the config table.
    #[serde(default)]
    pub panic_stop: bool,

    #[serde(default = "default_policy_version")]
    pub policy_version: String,

    #[serde(default = "default_max_pages")]
    pub max_pages_per_poll: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_statuses")]
    pub max_statuses_to_fetch: u32,

    /// Fallback when the config table has no `report_threshold` row.
    #[serde(default = "default_report_threshold")]
    pub report_threshold: f64,
    /// Content scans older than this are flagged for rescan by the
    /// time-driven invalidation sweep.
    #[serde(default = "default_cache_ttl_days")]
    pub scan_cache_ttl_days: i64,
    #[serde(default = "default_defederation_threshold")]
    pub defederation_threshold: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_expiry_interval")]
    pub expiry_sweep_interval_seconds: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_report_category")]
    pub report_category: String,
    #[serde(default)]
    pub forward_remote_reports: bool,

    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_db_path() -> String {
    "fedimod.db".to_string()
}
fn default_true() -> bool {
    true
}
fn default_policy_version() -> String {
    "v1".to_string()
}
fn default_max_pages() -> u32 {
    3
}
fn default_batch_size() -> u32 {
    20
}
fn default_max_statuses() -> u32 {
    5
}
fn default_report_threshold() -> f64 {
    1.0
}
fn default_cache_ttl_days() -> i64 {
    7
}
fn default_defederation_threshold() -> u32 {
    10
}
fn default_poll_interval() -> u64 {
    300
}
fn default_expiry_interval() -> u64 {
    60
}
fn default_workers() -> usize {
    4
}
fn default_report_category() -> String {
    "spam".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_base: "https://mastodon.example".to_string(),
            admin_token: String::new(),
            bot_token: String::new(),
            db_path: default_db_path(),
            dry_run: true,
            panic_stop: false,
            policy_version: default_policy_version(),
            max_pages_per_poll: default_max_pages(),
            batch_size: default_batch_size(),
            max_statuses_to_fetch: default_max_statuses(),
            report_threshold: default_report_threshold(),
            scan_cache_ttl_days: default_cache_ttl_days(),
            defederation_threshold: default_defederation_threshold(),
            poll_interval_seconds: default_poll_interval(),
            expiry_sweep_interval_seconds: default_expiry_interval(),
            workers: default_workers(),
            report_category: default_report_category(),
            forward_remote_reports: false,
            user_agent: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.clone().unwrap_or_else(|| {
            format!(
                "{}/{} (+moderation-sidecar)",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )
        })
    }
}
