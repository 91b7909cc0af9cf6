use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tessera_core::EngineConfig;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/tessera.db?mode=rwc".into(),
            max_connections: default_max_connections(),
        }
    }
}

/// Optional shared volatile backend. When no URL is configured the engine
/// runs on its in-process store, which is fine for a single instance.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BatchingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_flush_concurrency")]
    pub flush_concurrency: usize,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Minimum age before an unbatched message is swept into a batch.
    /// Defaults to `batch_timeout_ms + lock_ttl_ms` when unset.
    pub reconcile_grace_ms: Option<u64>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            flush_concurrency: default_flush_concurrency(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            reconcile_grace_ms: None,
        }
    }
}

impl BatchingConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size.max(1),
            batch_timeout: Duration::from_millis(self.batch_timeout_ms.max(10)),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms.max(100)),
            flush_concurrency: self.flush_concurrency.max(1),
            reconcile_interval: Duration::from_millis(self.reconcile_interval_ms.max(1000)),
            reconcile_grace: self.reconcile_grace_ms.map(Duration::from_millis),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}
fn default_batch_size() -> usize {
    64
}
fn default_batch_timeout_ms() -> u64 {
    300
}
fn default_lock_ttl_ms() -> u64 {
    5_000
}
fn default_flush_concurrency() -> usize {
    32
}
fn default_reconcile_interval_ms() -> u64 {
    30_000
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Tessera Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[database]
# sqlite://... or postgres://...
url = "{db_url}"
max_connections = {max_connections}

[redis]
# Shared queue/lock/cache backend. Leave unset to run on the in-process
# store (single instance only).
# url = "redis://127.0.0.1:6379/0"

[batching]
# Maximum leaves per batch; also the size trigger threshold.
batch_size = {batch_size}
# Maximum staleness before an idle chat is flushed.
batch_timeout_ms = {batch_timeout_ms}
# Flush lease expiry; must exceed the worst-case flush duration.
lock_ttl_ms = {lock_ttl_ms}
# Concurrent size-triggered flush tasks.
flush_concurrency = {flush_concurrency}
# Orphan sweep cadence.
reconcile_interval_ms = {reconcile_interval_ms}
# Minimum orphan age before the sweep claims it.
# reconcile_grace_ms = 5300
"#,
        bind_address = config.server.bind_address,
        db_url = config.database.url,
        max_connections = config.database.max_connections,
        batch_size = config.batching.batch_size,
        batch_timeout_ms = config.batching.batch_timeout_ms,
        lock_ttl_ms = config.batching.lock_ttl_ms,
        flush_concurrency = config.batching.flush_concurrency,
        reconcile_interval_ms = config.batching.reconcile_interval_ms,
    )
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("TESSERA_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("TESSERA_DATABASE_URL") {
            config.database.url = value;
        }
        if let Ok(value) = std::env::var("TESSERA_DATABASE_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<u32>() {
                config.database.max_connections = parsed;
            }
        }
        if let Ok(value) = std::env::var("TESSERA_REDIS_URL") {
            config.redis.url = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }
        if let Ok(value) = std::env::var("TESSERA_BATCH_SIZE") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.batching.batch_size = parsed.clamp(1, 10_000);
            }
        }
        if let Ok(value) = std::env::var("TESSERA_BATCH_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.batching.batch_timeout_ms = parsed.max(10);
            }
        }
        if let Ok(value) = std::env::var("TESSERA_LOCK_TTL_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.batching.lock_ttl_ms = parsed.max(100);
            }
        }
        if let Ok(value) = std::env::var("TESSERA_FLUSH_CONCURRENCY") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.batching.flush_concurrency = parsed.clamp(1, 1_024);
            }
        }
        if let Ok(value) = std::env::var("TESSERA_RECONCILE_INTERVAL_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.batching.reconcile_interval_ms = parsed.max(1_000);
            }
        }
        if let Ok(value) = std::env::var("TESSERA_RECONCILE_GRACE_MS") {
            config.batching.reconcile_grace_ms = value.parse::<u64>().ok();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchingConfig, Config};

    #[test]
    fn batching_defaults_match_engine_defaults() {
        let batching = BatchingConfig::default();
        assert_eq!(batching.batch_size, 64);
        assert_eq!(batching.batch_timeout_ms, 300);
        assert_eq!(batching.lock_ttl_ms, 5_000);

        let engine = batching.engine_config();
        assert_eq!(engine.batch_size, 64);
        assert_eq!(engine.batch_timeout.as_millis(), 300);
        assert_eq!(engine.lock_ttl.as_millis(), 5_000);
        assert_eq!(engine.reconcile_grace, None);
    }

    #[test]
    fn first_run_generates_a_loadable_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("tessera-test.toml");
        let path = config_path.to_str().expect("config path utf8");

        let generated = Config::load(path).expect("generate config");
        assert!(config_path.exists());

        let reloaded = Config::load(path).expect("reload config");
        assert_eq!(
            generated.server.bind_address,
            reloaded.server.bind_address
        );
        assert_eq!(generated.batching.batch_size, reloaded.batching.batch_size);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("tessera-env.toml");
        std::env::set_var("TESSERA_BATCH_SIZE", "2");
        std::env::set_var("TESSERA_DATABASE_URL", "sqlite::memory:");
        let config =
            Config::load(config_path.to_str().expect("config path utf8")).expect("load config");
        std::env::remove_var("TESSERA_BATCH_SIZE");
        std::env::remove_var("TESSERA_DATABASE_URL");
        assert_eq!(config.batching.batch_size, 2);
        assert_eq!(config.database.url, "sqlite::memory:");
    }
}
