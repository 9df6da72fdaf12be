//! Pipeline configuration from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    /// Root directory for fetched media (`photos/`, `videos/` underneath)
    pub media_dir: String,

    /// Directory local (`file://` or bare path) media may be copied from
    /// (None = only http(s) media is fetched)
    pub local_media_root: Option<String>,

    /// JSONL file to tail for inbound signals (None = stdin)
    pub source_path: Option<String>,

    /// Channel buffer size between the source and the router (events)
    pub channel_buffer: usize,

    /// Album debounce window in milliseconds, measured from the first part
    pub album_timeout_ms: u64,

    /// Minimum seconds between two counted views of one subject by one actor
    pub min_view_interval_secs: i64,

    /// Retries after the first failed store write when materializing a post
    pub materialize_max_retries: u32,

    /// First retry delay in milliseconds (doubles per attempt)
    pub backoff_initial_ms: u64,

    /// Upper bound on a single retry delay in milliseconds
    pub backoff_max_ms: u64,

    /// Title length in characters
    pub title_max_chars: usize,

    /// How many recent event ids are remembered for redelivery detection
    pub redelivery_window: usize,

    /// Per-request timeout for remote media downloads
    pub media_fetch_timeout_secs: u64,

    /// View writes allowed in flight before the source waits for one to finish
    pub max_inflight_views: usize,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "postflow.db".to_string(),
            schema_dir: "sql".to_string(),
            media_dir: "media".to_string(),
            local_media_root: None,
            source_path: None,
            channel_buffer: 1_000,
            album_timeout_ms: 2_000,
            min_view_interval_secs: 30,
            materialize_max_retries: 3,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
            title_max_chars: 50,
            redelivery_window: 10_000,
            media_fetch_timeout_secs: 30,
            max_inflight_views: 64,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `POSTFLOW_DB_PATH` (default: postflow.db)
    /// - `POSTFLOW_SCHEMA_DIR` (default: sql)
    /// - `POSTFLOW_MEDIA_DIR` (default: media)
    /// - `POSTFLOW_LOCAL_MEDIA_ROOT` (default: unset, local media rejected)
    /// - `POSTFLOW_SOURCE_PATH` (default: unset, read stdin)
    /// - `INGEST_CHANNEL_BUFFER` (default: 1000)
    /// - `ALBUM_TIMEOUT_MS` (default: 2000)
    /// - `MIN_VIEW_INTERVAL_SECS` (default: 30)
    /// - `MATERIALIZE_MAX_RETRIES` (default: 3)
    /// - `MATERIALIZE_BACKOFF_INITIAL_MS` (default: 200)
    /// - `MATERIALIZE_BACKOFF_MAX_MS` (default: 5000)
    /// - `TITLE_MAX_CHARS` (default: 50)
    /// - `REDELIVERY_WINDOW` (default: 10000)
    /// - `MEDIA_FETCH_TIMEOUT_SECS` (default: 30)
    /// - `MAX_INFLIGHT_VIEWS` (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_path: env::var("POSTFLOW_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: env::var("POSTFLOW_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            media_dir: env::var("POSTFLOW_MEDIA_DIR").unwrap_or(defaults.media_dir),
            local_media_root: env::var("POSTFLOW_LOCAL_MEDIA_ROOT")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            source_path: env::var("POSTFLOW_SOURCE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            channel_buffer: env_or("INGEST_CHANNEL_BUFFER", defaults.channel_buffer),
            album_timeout_ms: env_or("ALBUM_TIMEOUT_MS", defaults.album_timeout_ms),
            min_view_interval_secs: env_or("MIN_VIEW_INTERVAL_SECS", defaults.min_view_interval_secs),
            materialize_max_retries: env_or(
                "MATERIALIZE_MAX_RETRIES",
                defaults.materialize_max_retries,
            ),
            backoff_initial_ms: env_or("MATERIALIZE_BACKOFF_INITIAL_MS", defaults.backoff_initial_ms),
            backoff_max_ms: env_or("MATERIALIZE_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            title_max_chars: env_or("TITLE_MAX_CHARS", defaults.title_max_chars),
            redelivery_window: env_or("REDELIVERY_WINDOW", defaults.redelivery_window),
            media_fetch_timeout_secs: env_or(
                "MEDIA_FETCH_TIMEOUT_SECS",
                defaults.media_fetch_timeout_secs,
            ),
            max_inflight_views: env_or("MAX_INFLIGHT_VIEWS", defaults.max_inflight_views),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.album_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "ALBUM_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "INGEST_CHANNEL_BUFFER must be greater than 0".to_string(),
            ));
        }

        if self.max_inflight_views == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_INFLIGHT_VIEWS must be greater than 0".to_string(),
            ));
        }

        if self.title_max_chars == 0 {
            return Err(ConfigError::InvalidValue(
                "TITLE_MAX_CHARS must be greater than 0".to_string(),
            ));
        }

        if self.min_view_interval_secs < 0 {
            return Err(ConfigError::InvalidValue(format!(
                "MIN_VIEW_INTERVAL_SECS cannot be negative, got {}",
                self.min_view_interval_secs
            )));
        }

        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidValue(format!(
                "MATERIALIZE_BACKOFF_INITIAL_MS ({}) exceeds MATERIALIZE_BACKOFF_MAX_MS ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }

        Ok(())
    }

    pub fn album_timeout(&self) -> Duration {
        Duration::from_millis(self.album_timeout_ms)
    }

    pub fn min_view_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_view_interval_secs)
    }

    pub fn media_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.media_fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; keep every env-touching assertion in one test
    #[test]
    fn test_env_config() {
        for key in [
            "POSTFLOW_DB_PATH",
            "POSTFLOW_SOURCE_PATH",
            "POSTFLOW_LOCAL_MEDIA_ROOT",
            "MAX_INFLIGHT_VIEWS",
            "INGEST_CHANNEL_BUFFER",
            "ALBUM_TIMEOUT_MS",
            "MIN_VIEW_INTERVAL_SECS",
            "MATERIALIZE_MAX_RETRIES",
        ] {
            env::remove_var(key);
        }

        let config = PipelineConfig::from_env();
        assert_eq!(config.db_path, "postflow.db");
        assert_eq!(config.source_path, None);
        assert_eq!(config.local_media_root, None);
        assert_eq!(config.max_inflight_views, 64);
        assert_eq!(config.channel_buffer, 1_000);
        assert_eq!(config.album_timeout(), Duration::from_secs(2));
        assert_eq!(config.min_view_interval(), chrono::Duration::seconds(30));
        assert_eq!(config.materialize_max_retries, 3);
        assert_eq!(config.title_max_chars, 50);

        env::set_var("POSTFLOW_DB_PATH", "/tmp/test.db");
        env::set_var("POSTFLOW_SOURCE_PATH", "/tmp/events.jsonl");
        env::set_var("ALBUM_TIMEOUT_MS", "500");
        env::set_var("MIN_VIEW_INTERVAL_SECS", "10");
        env::set_var("MATERIALIZE_MAX_RETRIES", "not-a-number");

        let config = PipelineConfig::from_env();
        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.source_path.as_deref(), Some("/tmp/events.jsonl"));
        assert_eq!(config.album_timeout_ms, 500);
        assert_eq!(config.min_view_interval_secs, 10);
        // Unparseable values fall back to the default
        assert_eq!(config.materialize_max_retries, 3);

        for key in [
            "POSTFLOW_DB_PATH",
            "POSTFLOW_SOURCE_PATH",
            "ALBUM_TIMEOUT_MS",
            "MIN_VIEW_INTERVAL_SECS",
            "MATERIALIZE_MAX_RETRIES",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PipelineConfig::default().validate().is_ok());

        let config = PipelineConfig {
            album_timeout_ms: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            channel_buffer: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            max_inflight_views: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            backoff_initial_ms: 10_000,
            backoff_max_ms: 100,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MATERIALIZE_BACKOFF_INITIAL_MS"));
    }
}
