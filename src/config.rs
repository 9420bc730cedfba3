//! Configuration for ingestd
//!
//! Environment-driven with compiled defaults; CLI arguments override the
//! environment. Resolution priority: CLI arg → environment variable →
//! compiled default.

use crate::error::{Error, Result};
use crate::types::DigestAlgorithm;
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy knobs for the RecoveryController
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First-attempt delay (`RETRY_BASE_MS`, default 1000ms)
    pub base_delay: Duration,
    /// Backoff cap (`RETRY_MAX_MS`, default 30000ms)
    pub max_delay: Duration,
    /// Retry budget per file (`RETRY_MAX_ATTEMPTS`, default 3)
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 3,
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`INGESTD_PORT`, default 5731)
    pub port: u16,
    /// Root directory for assembled files and temp chunks (`UPLOADS_PATH`, default ./uploads)
    pub uploads_path: PathBuf,
    /// Route prefix for the chunked upload API (`INGESTD_PATH_PREFIX`, default /chunked)
    pub path_prefix: String,
    /// Chunk size in bytes (`CHUNK_SIZE`, default 1 MiB)
    pub chunk_size: u64,
    /// Maximum chunks per file (`MAX_CHUNKS`, default 1000)
    pub max_chunks: u32,
    /// Inactivity window before a session is failed (`CHUNK_TIMEOUT_MS`, default 30 min)
    pub chunk_timeout: Duration,
    /// Absolute session lifetime (24h)
    pub session_ttl: Duration,
    /// Retry policy
    pub retry: RetryConfig,
    /// Chunk digest algorithm (`CHUNK_DIGEST`, default md5)
    pub digest: DigestAlgorithm,
    /// Shared secret handed to the token verifier (`JWT_SECRET`)
    pub jwt_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5731,
            uploads_path: PathBuf::from("./uploads"),
            path_prefix: "/chunked".to_string(),
            chunk_size: 1_048_576,
            max_chunks: 1000,
            chunk_timeout: Duration::from_millis(1_800_000),
            session_ttl: Duration::from_secs(24 * 3600),
            retry: RetryConfig::default(),
            digest: DigestAlgorithm::Md5,
            jwt_secret: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(port) = env_parse::<u16>("INGESTD_PORT")? {
            config.port = port;
        }
        if let Ok(path) = std::env::var("UPLOADS_PATH") {
            config.uploads_path = PathBuf::from(path);
        }
        if let Ok(prefix) = std::env::var("INGESTD_PATH_PREFIX") {
            config.path_prefix = normalize_prefix(&prefix);
        }
        if let Some(size) = env_parse::<u64>("CHUNK_SIZE")? {
            if size == 0 {
                return Err(Error::BadRequest("CHUNK_SIZE must be non-zero".into()));
            }
            config.chunk_size = size;
        }
        if let Some(max) = env_parse::<u32>("MAX_CHUNKS")? {
            config.max_chunks = max;
        }
        if let Some(ms) = env_parse::<u64>("CHUNK_TIMEOUT_MS")? {
            config.chunk_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Ok(algo) = std::env::var("CHUNK_DIGEST") {
            config.digest = algo
                .parse()
                .map_err(Error::BadRequest)?;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.jwt_secret = secret;
        }

        Ok(config)
    }

    /// Maximum file size acceptable at `init`.
    pub fn max_file_size(&self) -> u64 {
        self.chunk_size * self.max_chunks as u64
    }
}

/// Parse an optional environment variable, surfacing parse failures.
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::BadRequest(format!("invalid value for {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}

/// Ensure the route prefix starts with `/` and has no trailing slash.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 1_048_576);
        assert_eq!(config.max_chunks, 1000);
        assert_eq!(config.chunk_timeout, Duration::from_secs(1800));
        assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
        assert_eq!(config.retry.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.path_prefix, "/chunked");
        assert_eq!(config.digest, DigestAlgorithm::Md5);
    }

    #[test]
    fn max_file_size_is_chunk_size_times_max_chunks() {
        let config = Config::default();
        assert_eq!(config.max_file_size(), 1_048_576 * 1000);
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("chunked"), "/chunked");
        assert_eq!(normalize_prefix("/chunked/"), "/chunked");
        assert_eq!(normalize_prefix("/uploads/v2"), "/uploads/v2");
    }
}
