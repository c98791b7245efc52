use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOCK_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300; // must exceed worst-case processing time
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_ENHANCE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LINE_BASE_URL: &str = "https://api.line.me";

/// Top-level config (chime.toml + CHIME_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub line: Option<LineConfig>,
    pub email: Option<EmailConfig>,
    pub enhancer: Option<EnhancerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Timing knobs for the reminder loop and the lock janitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poll period of the reminder loop.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often stale lock rows are swept.
    #[serde(default = "default_lock_sweep_interval_secs")]
    pub lock_sweep_interval_secs: u64,
    /// Age after which a lock row is considered abandoned.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Upper bound on one channel's delivery (all of a room's email
    /// addresses together count as one channel).
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Upper bound on the enhancement call before the raw text is sent.
    #[serde(default = "default_enhance_timeout_secs")]
    pub enhance_timeout_secs: u64,
    /// Due reminders processed in parallel within one tick (1 = serial).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Lock owner id. A UUIDv7 is generated at startup when unset.
    pub instance_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            lock_sweep_interval_secs: DEFAULT_LOCK_SWEEP_INTERVAL_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            enhance_timeout_secs: DEFAULT_ENHANCE_TIMEOUT_SECS,
            max_concurrent: default_max_concurrent(),
            instance_id: None,
        }
    }
}

impl SchedulerConfig {
    /// Longest time one reminder can hold its lock: enhancement, then the
    /// channels, which run concurrently for BOTH.
    pub fn processing_budget_secs(&self) -> u64 {
        self.enhance_timeout_secs.saturating_add(self.send_timeout_secs)
    }

    /// Return the configured instance id or mint a fresh one.
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// LINE Messaging API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    pub channel_access_token: String,
    #[serde(default = "default_line_base_url")]
    pub base_url: String,
}

/// SMTP relay used for reminder emails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// RFC 5322 mailbox, e.g. `"Chime <noreply@example.com>"`.
    pub from: String,
    /// Public base URL of this gateway; confirm links are built from it.
    pub confirm_base_url: Option<String>,
}

/// OpenAI-compatible chat endpoint used to polish reminder text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancerConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_lock_sweep_interval_secs() -> u64 {
    DEFAULT_LOCK_SWEEP_INTERVAL_SECS
}
fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_send_timeout_secs() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}
fn default_enhance_timeout_secs() -> u64 {
    DEFAULT_ENHANCE_TIMEOUT_SECS
}
fn default_max_concurrent() -> usize {
    1
}
fn default_line_base_url() -> String {
    DEFAULT_LINE_BASE_URL.to_string()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.db", home)
}

impl ChimeConfig {
    /// Load config from a TOML file with CHIME_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chime/chime.toml
    ///
    /// Nested keys use a double underscore: `CHIME_SCHEDULER__LOCK_TTL_SECS=600`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::ChimeError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CHIME_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chime/chime.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scheduler_contract() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.tick_interval_ms, 1_000);
        assert_eq!(cfg.lock_ttl_secs, 300);
        assert!(cfg.send_timeout_secs < cfg.lock_ttl_secs);
        assert_eq!(cfg.enhance_timeout_secs, 30);
        assert_eq!(cfg.processing_budget_secs(), 90);
        assert!(cfg.processing_budget_secs() < cfg.lock_ttl_secs);
        assert_eq!(cfg.max_concurrent, 1);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            [scheduler]
            lock_ttl_secs = 600

            [line]
            channel_access_token = "tok"
        "#;
        let cfg: ChimeConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .expect("config should parse");
        assert_eq!(cfg.scheduler.lock_ttl_secs, 600);
        assert_eq!(cfg.scheduler.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(cfg.line.expect("line").base_url, DEFAULT_LINE_BASE_URL);
        assert!(cfg.email.is_none());
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
    }

    #[test]
    fn configured_instance_id_wins() {
        let cfg = SchedulerConfig {
            instance_id: Some("node-a".into()),
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.resolve_instance_id(), "node-a");
        assert_ne!(
            SchedulerConfig::default().resolve_instance_id(),
            SchedulerConfig::default().resolve_instance_id()
        );
    }
}
