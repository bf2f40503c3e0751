//! Layered server configuration: `.env`, then a TOML file, then environment
//! overrides.

pub mod loader;
pub mod sources;

use std::path::PathBuf;

use serde::Serialize;

use clearscan_core::OrchestratorConfig;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};

pub const DEFAULT_QUEUE_EVENTS_CHANNEL: &str = "clearscan:queue-events";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Effective configuration after every source has been merged.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(skip)]
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    /// Without a URL the server runs on the in-memory store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisConfig {
    pub url: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    /// Copy safe to print: credentials in URLs and the scanner token are
    /// masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.database.url = copy.database.url.as_deref().map(redact_url);
        if let Some(redis) = copy.redis.as_mut() {
            redis.url = redact_url(&redis.url);
        }
        if copy.orchestrator.worker.token.is_some() {
            copy.orchestrator.worker.token = Some("***".to_string());
        }
        copy
    }
}

fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_passwords_only() {
        assert_eq!(
            redact_url("postgres://scan:hunter2@db:5432/clearscan"),
            "postgres://scan:***@db:5432/clearscan"
        );
        assert_eq!(redact_url("redis://cache:6379"), "redis://cache:6379");
        assert_eq!(redact_url("not a url"), "<unparseable>");
    }
}
