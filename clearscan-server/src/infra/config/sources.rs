use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use clearscan_core::OrchestratorConfig;

use super::loader::ConfigLoadError;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

/// Overrides read from the process environment (after `.env` is applied).
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub queue_events_channel: Option<String>,
    pub scanner_url: Option<String>,
    pub scanner_token: Option<String>,
    pub scanner_timeout: Option<Duration>,
    pub object_store_root: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub sweep_interval: Option<Duration>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Ok(Self {
            config_path: std::env::var("CLEARSCAN_CONFIG")
                .ok()
                .map(PathBuf::from),
            database_url: std::env::var("DATABASE_URL").ok(),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok()),
            redis_url: std::env::var("REDIS_URL").ok(),
            queue_events_channel: std::env::var("QUEUE_EVENTS_CHANNEL").ok(),
            scanner_url: std::env::var("SCANNER_URL").ok(),
            scanner_token: std::env::var("SCANNER_TOKEN").ok(),
            scanner_timeout: parse_duration_var("SCANNER_TIMEOUT")?,
            object_store_root: std::env::var("OBJECT_STORE_ROOT")
                .ok()
                .map(PathBuf::from),
            work_dir: std::env::var("CLEARSCAN_WORK_DIR").ok().map(PathBuf::from),
            sweep_interval: parse_duration_var("SWEEP_INTERVAL")?,
        })
    }
}

fn parse_duration_var(var: &'static str) -> Result<Option<Duration>, ConfigLoadError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|source| ConfigLoadError::InvalidDuration { var, source }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_orchestrator_defaults() {
        let raw = r#"
            [database]
            url = "postgres://clearscan@localhost/clearscan"

            [redis]
            url = "redis://localhost:6379"

            [orchestrator.sweeper]
            interval_secs = 600

            [orchestrator.worker]
            base_url = "http://scancode:5000"
        "#;
        let file: FileConfig = toml::from_str(raw).unwrap();
        assert_eq!(
            file.database.url.as_deref(),
            Some("postgres://clearscan@localhost/clearscan")
        );
        assert!(file.redis.as_ref().unwrap().channel.is_none());
        assert!(file.storage.root.is_none());
        assert_eq!(file.orchestrator.sweeper.interval_secs, 600);
        assert_eq!(file.orchestrator.sweeper.drift_threshold, 2);
        assert_eq!(file.orchestrator.worker.base_url, "http://scancode:5000");
        assert_eq!(file.orchestrator.merge.batch_size, 1_000);
    }

    #[test]
    fn empty_toml_is_valid() {
        let file: FileConfig = toml::from_str("").unwrap();
        assert!(file.redis.is_none());
        assert_eq!(file.orchestrator.dispatch.max_attempts, 3);
    }
}
