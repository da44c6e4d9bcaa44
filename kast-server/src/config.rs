use anyhow::{Context, bail};
use kast_core::config::EngineConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Key used when `KAST_DEV_MODE` is set and no token key is configured.
const DEV_TOKEN_KEY: &str = "kast-development-token-key";

/// Server configuration loaded from environment variables, with the engine
/// section optionally overridden by a TOML or JSON file.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,

    pub database_url: Option<String>,
    pub database_max_connections: u32,

    pub cors_allowed_origins: Vec<String>,
    pub dev_mode: bool,

    /// HMAC key for share tokens and API keys.
    pub token_key: String,

    pub audit_retention: chrono::Duration,
    pub audit_prune_interval: Duration,

    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev_mode = lookup("KAST_DEV_MODE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let mut engine = load_engine_config(&lookup)?;
        if let Some(path) = lookup("KAST_CLI_PATH") {
            engine.executor.cli_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("KAST_RESULTS_DIR") {
            engine.artifacts.results_root = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "KAST_SCAN_TIMEOUT_SECS")? {
            engine.executor.timeout = Duration::from_secs(secs);
        }
        if let Some(workers) = parse_var::<usize, _>(&lookup, "KAST_WORKERS")? {
            engine.dispatcher.workers = workers;
        }
        if engine.dispatcher.workers == 0 {
            bail!("KAST_WORKERS must be at least 1");
        }

        let token_key = match lookup("KAST_TOKEN_KEY").filter(|k| !k.is_empty()) {
            Some(key) => key,
            None if dev_mode => {
                warn!("KAST_TOKEN_KEY not set; using the development key");
                DEV_TOKEN_KEY.to_string()
            }
            None => bail!("KAST_TOKEN_KEY must be set outside development mode"),
        };

        let retention_days = parse_var::<i64, _>(&lookup, "AUDIT_RETENTION_DAYS")?.unwrap_or(90);
        if retention_days < 1 {
            bail!("AUDIT_RETENTION_DAYS must be at least 1");
        }
        let prune_secs = parse_var::<u64, _>(&lookup, "AUDIT_PRUNE_INTERVAL_SECS")?.unwrap_or(3600);

        Ok(Self {
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port: parse_var(&lookup, "SERVER_PORT")?.unwrap_or(8000),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(10),
            cors_allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            dev_mode,
            token_key,
            audit_retention: chrono::Duration::days(retention_days),
            audit_prune_interval: Duration::from_secs(prune_secs.max(1)),
            engine,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key} '{raw}': {e}")),
        _ => Ok(None),
    }
}

/// `KAST_ENGINE_CONFIG_JSON` wins over `KAST_ENGINE_CONFIG_PATH`, which wins
/// over `kast.toml` / `config/kast.toml` in the working directory.
fn load_engine_config<F>(lookup: &F) -> anyhow::Result<EngineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(json) = lookup("KAST_ENGINE_CONFIG_JSON").filter(|j| !j.trim().is_empty()) {
        return serde_json::from_str(&json).context("failed to parse KAST_ENGINE_CONFIG_JSON");
    }
    if let Some(path) = lookup("KAST_ENGINE_CONFIG_PATH") {
        return read_engine_file(Path::new(&path));
    }
    for candidate in ["kast.toml", "config/kast.toml"] {
        let path = Path::new(candidate);
        if path.is_file() {
            return read_engine_file(path);
        }
    }
    Ok(EngineConfig::default())
}

fn read_engine_file(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read engine config {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse engine config {}", path.display()))
    } else {
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse engine config {}", path.display()))
    }
}
