//! Service configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use creditline_core::PlanCatalog;
use creditline_engine::RetryPolicy;

/// Default Paddle API base URL.
pub const DEFAULT_PADDLE_API_URL: &str = "https://api.paddle.com";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds an unusable value.
    #[error("invalid value for {var}: {value}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// The plan catalog file could not be loaded.
    #[error("cannot load plan catalog from {path}: {message}")]
    Catalog {
        /// File path.
        path: String,
        /// Underlying error.
        message: String,
    },
}

/// Where balances and the ledger live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// RocksDB under `data_dir`.
    RocksDb,
    /// Process memory; everything is lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "memory" | "mem" => Ok(Self::Memory),
            _ => Err(ConfigError::Invalid {
                var: "STORAGE_BACKEND",
                value: s.to_string(),
            }),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/creditline").
    pub data_dir: String,

    /// Storage backend (default: `RocksDB`).
    pub storage_backend: StorageBackend,

    /// HS256 secret for end-user JWTs. Without it only test tokens work.
    pub jwt_secret: Option<String>,

    /// Service API key for job executors.
    pub service_api_key: Option<String>,

    /// Admin API key for privileged endpoints.
    pub admin_api_key: Option<String>,

    /// Paddle API base URL.
    pub paddle_api_url: String,

    /// Paddle API key (optional; reconciliation is off without it).
    pub paddle_api_key: Option<String>,

    /// Paddle webhook secret (optional).
    pub paddle_webhook_secret: Option<String>,

    /// Maximum age of a webhook signature timestamp, in seconds.
    pub webhook_tolerance_seconds: u64,

    /// Endpoint for job status notifications (optional).
    pub notify_url: Option<String>,

    /// Which provider prices grant which credits.
    pub plan_catalog: PlanCatalog,

    /// How long a verified balance stays fresh before the next sweep.
    pub sync_stale_after_seconds: u64,

    /// Attempts per storage operation (including the first).
    pub retry_max_attempts: u32,

    /// Delay before the first storage retry, in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Backoff cap, in milliseconds.
    pub retry_max_delay_ms: u64,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

/// Paddle secrets file structure.
#[derive(Debug, Deserialize)]
struct PaddleSecrets {
    api_key: String,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse, the storage
    /// backend is unknown, or `PLAN_CATALOG_PATH` points at an unreadable or
    /// malformed catalog.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load Paddle secrets from file first, then fall back to env vars
        let paddle = load_paddle_secrets();

        let plan_catalog = match std::env::var("PLAN_CATALOG_PATH") {
            Ok(path) => load_plan_catalog(&path)?,
            Err(_) => PlanCatalog::default(),
        };

        let storage_backend = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StorageBackend::RocksDb,
        };

        Ok(Self {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8080"),
            data_dir: env_or("DATA_DIR", "/data/creditline"),
            storage_backend,
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            paddle_api_url: paddle.api_url,
            paddle_api_key: paddle.api_key,
            paddle_webhook_secret: paddle.webhook_secret,
            webhook_tolerance_seconds: env_parse("WEBHOOK_TOLERANCE_SECONDS", 300)?,
            notify_url: std::env::var("NOTIFY_URL").ok(),
            plan_catalog,
            sync_stale_after_seconds: env_parse("SYNC_STALE_AFTER_SECONDS", 3600)?,
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", 50)?,
            retry_max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", 1000)?,
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 1024 * 1024)?, // 1MB
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", 30)?,
        })
    }

    /// Retry policy for storage operations.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Freshness window of a verified balance.
    #[must_use]
    pub fn sync_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.sync_stale_after_seconds).unwrap_or(i64::MAX))
    }
}

struct PaddleSettings {
    api_url: String,
    api_key: Option<String>,
    webhook_secret: Option<String>,
}

/// Load Paddle secrets from file or environment.
fn load_paddle_secrets() -> PaddleSettings {
    let secret_paths = [
        ".secrets/paddle.json",
        "creditline/.secrets/paddle.json",
        "../.secrets/paddle.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<PaddleSecrets>(path) {
            tracing::info!(path = %path, "Loaded Paddle secrets from file");
            return PaddleSettings {
                api_url: secrets
                    .api_url
                    .unwrap_or_else(|| env_or("PADDLE_API_URL", DEFAULT_PADDLE_API_URL)),
                api_key: Some(secrets.api_key),
                webhook_secret: secrets
                    .webhook_secret
                    .or_else(|| std::env::var("PADDLE_WEBHOOK_SECRET").ok()),
            };
        }
    }

    // Fall back to environment variables
    tracing::debug!("Paddle secrets file not found, using environment variables");
    PaddleSettings {
        api_url: env_or("PADDLE_API_URL", DEFAULT_PADDLE_API_URL),
        api_key: std::env::var("PADDLE_API_KEY").ok(),
        webhook_secret: std::env::var("PADDLE_WEBHOOK_SECRET").ok(),
    }
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Load a plan catalog from a JSON file.
///
/// # Errors
///
/// Returns [`ConfigError::Catalog`] if the file cannot be read or parsed.
pub fn load_plan_catalog(path: &str) -> Result<PlanCatalog, ConfigError> {
    let catalog_err = |message: String| ConfigError::Catalog {
        path: path.to_string(),
        message,
    };
    let contents = std::fs::read_to_string(path).map_err(|e| catalog_err(e.to_string()))?;
    let catalog: PlanCatalog =
        serde_json::from_str(&contents).map_err(|e| catalog_err(e.to_string()))?;
    tracing::info!(path = %path, prices = catalog.prices.len(), "Loaded plan catalog");
    Ok(catalog)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/creditline".into(),
            storage_backend: StorageBackend::RocksDb,
            jwt_secret: None,
            service_api_key: None,
            admin_api_key: None,
            paddle_api_url: DEFAULT_PADDLE_API_URL.into(),
            paddle_api_key: None,
            paddle_webhook_secret: None,
            webhook_tolerance_seconds: 300,
            notify_url: None,
            plan_catalog: PlanCatalog::default(),
            sync_stale_after_seconds: 3600,
            retry_max_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1000,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn storage_backend_names() {
        assert_eq!("rocksdb".parse::<StorageBackend>().unwrap(), StorageBackend::RocksDb);
        assert_eq!(" Memory ".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("postgres".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn plan_catalog_file_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"prices": {{
                "pri_a": {{"kind": "subscription", "plan": "pro", "billing_cycle": "annual"}},
                "pri_b": {{"kind": "addon", "credits": 750}}
            }}}}"#
        )
        .unwrap();

        let catalog = load_plan_catalog(file.path().to_str().unwrap()).unwrap();
        assert_eq!(catalog.prices.len(), 2);
        assert!(matches!(
            catalog.lookup("pri_b"),
            Some(creditline_core::PriceKind::Addon { credits: 750 })
        ));
    }

    #[test]
    fn malformed_catalog_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            load_plan_catalog(file.path().to_str().unwrap()),
            Err(ConfigError::Catalog { .. })
        ));
    }
}
