use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use super::{
    Config, ConfigMetadata, ConfigWarnings, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_QUEUE_EVENTS_CHANNEL, DatabaseConfig, RedisConfig, StorageConfig,
    sources::{EnvConfig, FileConfig},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("clearscan.toml"),
        PathBuf::from("config/clearscan.toml"),
    ]
});

const DEFAULT_OBJECT_STORE_ROOT: &str = "data/objects";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env_config = EnvConfig::gather()?;
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };
        let (config, warnings) = compose_config(file_config, env_config, metadata);
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env_config.config_path) {
            (Some(path), _) | (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(found) => (found.clone(), false),
                None => return Ok((None, None)),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Environment wins over the file, the file wins over built-in defaults.
pub fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> (Config, ConfigWarnings) {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No clearscan.toml detected; falling back to environment variables",
            "Pass --config or set CLEARSCAN_CONFIG to use a configuration file",
        );
    }

    let FileConfig {
        database: file_database,
        redis: file_redis,
        storage: file_storage,
        orchestrator: mut orchestrator,
    } = file_config.unwrap_or_default();

    let database = DatabaseConfig {
        url: env.database_url.or(file_database.url),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS),
    };
    if database.url.is_none() {
        warnings.push_with_hint(
            "No database URL configured; scan state is kept in memory only",
            "Set DATABASE_URL or [database].url for a persistent store",
        );
    }

    let file_channel = file_redis.as_ref().and_then(|r| r.channel.clone());
    let redis = env
        .redis_url
        .or(file_redis.map(|r| r.url))
        .map(|url| RedisConfig {
            url,
            channel: env
                .queue_events_channel
                .clone()
                .or(file_channel)
                .unwrap_or_else(|| DEFAULT_QUEUE_EVENTS_CHANNEL.to_string()),
        });
    if redis.is_none() {
        warnings.push(
            "No Redis URL configured; queue events are only reconciled by the sweeper",
        );
    }

    let storage = StorageConfig {
        root: env
            .object_store_root
            .or(file_storage.root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OBJECT_STORE_ROOT)),
    };

    if let Some(url) = env.scanner_url {
        orchestrator.worker.base_url = url;
    }
    if let Some(token) = env.scanner_token {
        orchestrator.worker.token = Some(token);
    }
    if let Some(timeout) = env.scanner_timeout {
        orchestrator.worker.request_timeout_secs = timeout.as_secs().max(1);
    }
    if let Some(interval) = env.sweep_interval {
        orchestrator.sweeper.interval_secs = interval.as_secs().max(1);
    }
    if let Some(work_dir) = env.work_dir {
        orchestrator.ingest.work_dir = Some(work_dir);
    }

    let config = Config {
        database,
        redis,
        storage,
        orchestrator,
        metadata,
    };
    (config, warnings)
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration in {var}")]
    InvalidDuration {
        var: &'static str,
        #[source]
        source: humantime::DurationError,
    },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use super::super::sources::{FileDatabaseConfig, FileRedisConfig};

    fn file_with_database(url: &str) -> FileConfig {
        FileConfig {
            database: FileDatabaseConfig {
                url: Some(url.to_string()),
                max_connections: Some(4),
            },
            redis: Some(FileRedisConfig {
                url: "redis://file:6379".to_string(),
                channel: Some("file-events".to_string()),
            }),
            ..FileConfig::default()
        }
    }

    #[test]
    fn environment_overrides_file_values() {
        let env = EnvConfig {
            database_url: Some("postgres://env/clearscan".to_string()),
            scanner_url: Some("http://scanner.internal:5000".to_string()),
            sweep_interval: Some(Duration::from_secs(15 * 60)),
            ..EnvConfig::default()
        };
        let (config, warnings) = compose_config(
            Some(file_with_database("postgres://file/clearscan")),
            env,
            ConfigMetadata::default(),
        );

        assert_eq!(config.database.url.as_deref(), Some("postgres://env/clearscan"));
        assert_eq!(config.database.max_connections, 4);
        let redis = config.redis.unwrap();
        assert_eq!(redis.url, "redis://file:6379");
        assert_eq!(redis.channel, "file-events");
        assert_eq!(config.orchestrator.worker.base_url, "http://scanner.internal:5000");
        assert_eq!(config.orchestrator.sweeper.interval_secs, 900);
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_sources_fall_back_to_defaults_with_warnings() {
        let (config, warnings) =
            compose_config(None, EnvConfig::default(), ConfigMetadata::default());
        assert!(config.database.url.is_none());
        assert_eq!(config.database.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.redis.is_none());
        assert_eq!(config.storage.root, PathBuf::from(DEFAULT_OBJECT_STORE_ROOT));
        assert_eq!(config.orchestrator.sweeper.interval_secs, 3_600);
        assert_eq!(warnings.items.len(), 3);
        assert!(warnings.items[0].hint.is_some());
    }

    #[test]
    fn redis_from_env_uses_default_channel() {
        let env = EnvConfig {
            redis_url: Some("redis://env:6379".to_string()),
            ..EnvConfig::default()
        };
        let (config, _) = compose_config(None, env, ConfigMetadata::default());
        assert_eq!(config.redis.unwrap().channel, DEFAULT_QUEUE_EVENTS_CHANNEL);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::new()
            .with_env_file(dir.path().join("absent.env"))
            .with_config_path(dir.path().join("nope.toml"))
            .load();
        assert!(matches!(result, Err(ConfigLoadError::MissingConfig { .. })));
    }

    #[test]
    fn explicit_config_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clearscan.toml");
        fs::write(
            &path,
            "[orchestrator.merge]\nbatch_size = 250\n\n[orchestrator.dispatch]\nmax_attempts = 5\n",
        )
        .unwrap();

        let ConfigLoad { config, .. } = ConfigLoader::new()
            .with_env_file(dir.path().join("absent.env"))
            .with_config_path(&path)
            .load()
            .unwrap();
        assert_eq!(config.orchestrator.merge.batch_size, 250);
        assert_eq!(config.orchestrator.dispatch.max_attempts, 5);
        assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
        assert!(!config.metadata.env_file_loaded);
    }

    #[test]
    fn malformed_config_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[orchestrator\nbatch_size = ").unwrap();
        match read_file_config(&path) {
            Err(ConfigLoadError::Parse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
