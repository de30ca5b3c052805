use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::GatewayPolicy;
use crate::sync::{LockSettings, SyncSettings};

/// Application configuration.
///
/// Every knob of the sync core is exposed here; the defaults match the
/// values the fleet has been tuned for.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the controller whose `/hosts` seeds the directory.
    pub entry_host: String,
    /// Our controller id for lock coordination.
    pub controller_id: Option<String>,
    /// WebSocket URL for push-driven directory updates.
    pub push_url: Option<String>,
    /// Hard deadline per request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Retry budget per request.
    pub max_retries: u32,
    /// First backoff delay; retry `n` waits `2^n` times this.
    pub retry_base_delay_ms: u64,
    /// Pause between hosts during a sync cycle.
    pub host_throttle_ms: u64,
    /// Per-host deadline during collection.
    pub collect_timeout_ms: u64,
    /// Age after which a sync lock counts as abandoned.
    pub stale_lock_ms: i64,
    /// Soft minimum of verified lock acquisitions.
    pub min_required_locks: usize,
    /// Lock read-back attempts per host.
    pub verify_retries: u32,
    /// Base wait between lock read-backs.
    pub verify_delay_ms: u64,
    /// Guard sync cycles with the advisory lock.
    pub use_sync_lock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_host: "localhost".to_string(),
            controller_id: None,
            push_url: None,
            request_timeout_ms: 10_000,
            max_retries: 10,
            retry_base_delay_ms: 500,
            host_throttle_ms: 500,
            collect_timeout_ms: 8_000,
            stale_lock_ms: 5 * 60 * 1000,
            min_required_locks: 1,
            verify_retries: 3,
            verify_delay_ms: 150,
            use_sync_lock: false,
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        // Apply environment variable overrides
        if let Ok(entry_host) = std::env::var("LUMISYNC_ENTRY_HOST") {
            config.entry_host = entry_host;
        }
        if let Ok(controller_id) = std::env::var("LUMISYNC_CONTROLLER_ID") {
            config.controller_id = Some(controller_id);
        }
        if let Ok(push_url) = std::env::var("LUMISYNC_PUSH_URL") {
            config.push_url = Some(push_url);
        }
        if let Ok(use_lock) = std::env::var("LUMISYNC_USE_SYNC_LOCK") {
            config.use_sync_lock = matches!(use_lock.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Default config file path: `<config dir>/lumisync/config.yaml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lumisync")
            .join("config.yaml")
    }

    pub fn gateway_policy(&self) -> GatewayPolicy {
        GatewayPolicy {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            stale_lock_ms: self.stale_lock_ms,
            min_required_locks: self.min_required_locks,
            verify_retries: self.verify_retries,
            verify_delay_ms: self.verify_delay_ms,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            collect_timeout: Duration::from_millis(self.collect_timeout_ms),
            host_throttle: Duration::from_millis(self.host_throttle_ms),
            use_sync_lock: self.use_sync_lock,
            self_id: self.controller_id.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.retry_base_delay_ms, 500);
        assert_eq!(config.stale_lock_ms, 300_000);
        assert_eq!(config.min_required_locks, 1);
        assert!(!config.use_sync_lock);
    }

    #[test]
    fn test_load_no_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.collect_timeout_ms, 8_000);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "entry_host: 192.168.4.21").unwrap();
        writeln!(file, "controller_id: ctrl-7").unwrap();
        writeln!(file, "host_throttle_ms: 250").unwrap();
        writeln!(file, "use_sync_lock: true").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.entry_host, "192.168.4.21");
        assert_eq!(config.controller_id.as_deref(), Some("ctrl-7"));
        assert_eq!(config.host_throttle_ms, 250);
        assert!(config.use_sync_lock);
        // unspecified keys keep their defaults
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "entry_host: [unclosed").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_, _)));
    }

    #[test]
    fn test_settings_conversions() {
        let config = Config::default();
        let policy = config.gateway_policy();
        assert_eq!(policy.request_timeout, Duration::from_secs(10));
        assert_eq!(policy.max_retries, 10);

        let lock = config.lock_settings();
        assert_eq!(lock.verify_retries, 3);
        assert_eq!(lock.verify_delay_ms, 150);

        let sync = config.sync_settings();
        assert_eq!(sync.host_throttle, Duration::from_millis(500));
        assert!(!sync.use_sync_lock);
    }
}
