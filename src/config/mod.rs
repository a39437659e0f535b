use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::reload::FileWatcher;

/// Observer invoked after a successful configuration reload.
pub type ConfigObserver = Arc<dyn Fn(&SystemConfig) + Send + Sync>;

/// Errors from loading or validating the system configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(String),

    #[error("invalid {section}.{field}: {reason}")]
    Validation {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

fn invalid(
    section: &'static str,
    field: &'static str,
    reason: impl Into<String>,
) -> ConfigError {
    ConfigError::Validation {
        section,
        field,
        reason: reason.into(),
    }
}

/// HTTP server section. The transport itself lives outside this crate;
/// the bounds are enforced here so the collaborator can trust them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub threads: u32,
    pub keep_alive_timeout: u32,
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            threads: 8,
            keep_alive_timeout: 60,
            max_connections: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(invalid("server", "host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("server", "port", "must be in 1..=65535"));
        }
        if !(1..=64).contains(&self.threads) {
            return Err(invalid("server", "threads", "must be in 1..=64"));
        }
        if !(1..=3600).contains(&self.keep_alive_timeout) {
            return Err(invalid("server", "keep_alive_timeout", "must be in 1..=3600"));
        }
        if !(1..=100_000).contains(&self.max_connections) {
            return Err(invalid("server", "max_connections", "must be in 1..=100000"));
        }
        Ok(())
    }
}

/// Service-level performance targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub target_p99_ms: f64,
    pub target_qps: u32,
    pub max_memory_gb: u32,
    pub max_cpu_percent: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            target_p99_ms: 50.0,
            target_qps: 10_000,
            max_memory_gb: 4,
            max_cpu_percent: 80,
        }
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.target_p99_ms > 0.0 && self.target_p99_ms <= 10_000.0) {
            return Err(invalid("performance", "target_p99_ms", "must be in (0, 10000]"));
        }
        if !(1..=1_000_000).contains(&self.target_qps) {
            return Err(invalid("performance", "target_qps", "must be in 1..=1000000"));
        }
        if !(1..=128).contains(&self.max_memory_gb) {
            return Err(invalid("performance", "max_memory_gb", "must be in 1..=128"));
        }
        if !(1..=100).contains(&self.max_cpu_percent) {
            return Err(invalid("performance", "max_cpu_percent", "must be in 1..=100"));
        }
        Ok(())
    }
}

/// Feature extraction and cache tiers. The caches themselves are
/// external collaborators; only their sizing is validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub enable_cache: bool,
    pub cache_size_mb: u32,
    pub cache_ttl_seconds: u32,
    pub l1_size_mb: u32,
    pub l1_ttl_seconds: u32,
    pub l2_size_mb: u32,
    pub l2_ttl_seconds: u32,
    pub l3_size_mb: u32,
    pub l3_ttl_seconds: u32,
    pub enable_redis: bool,
    pub redis_host: String,
    pub redis_port: u16,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            enable_cache: true,
            cache_size_mb: 512,
            cache_ttl_seconds: 300,
            l1_size_mb: 16,
            l1_ttl_seconds: 60,
            l2_size_mb: 256,
            l2_ttl_seconds: 300,
            l3_size_mb: 1024,
            l3_ttl_seconds: 3600,
            enable_redis: false,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=16_384).contains(&self.cache_size_mb) {
            return Err(invalid("features", "cache_size_mb", "must be in 1..=16384"));
        }
        if !(1..=86_400).contains(&self.cache_ttl_seconds) {
            return Err(invalid("features", "cache_ttl_seconds", "must be in 1..=86400"));
        }
        if !(1..=1024).contains(&self.l1_size_mb) {
            return Err(invalid("features", "l1_size_mb", "must be in 1..=1024"));
        }
        if !(1..=3600).contains(&self.l1_ttl_seconds) {
            return Err(invalid("features", "l1_ttl_seconds", "must be in 1..=3600"));
        }
        if !(1..=4096).contains(&self.l2_size_mb) {
            return Err(invalid("features", "l2_size_mb", "must be in 1..=4096"));
        }
        if !(1..=7200).contains(&self.l2_ttl_seconds) {
            return Err(invalid("features", "l2_ttl_seconds", "must be in 1..=7200"));
        }
        if !(1..=32_768).contains(&self.l3_size_mb) {
            return Err(invalid("features", "l3_size_mb", "must be in 1..=32768"));
        }
        if !(1..=86_400).contains(&self.l3_ttl_seconds) {
            return Err(invalid("features", "l3_ttl_seconds", "must be in 1..=86400"));
        }
        if self.enable_redis && self.redis_port == 0 {
            return Err(invalid("features", "redis_port", "must be in 1..=65535"));
        }
        Ok(())
    }
}

const VALID_LOG_LEVELS: [&str; 7] = ["trace", "debug", "info", "warn", "error", "critical", "off"];

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(rename = "file")]
    pub file_path: String,
    pub max_size_mb: u32,
    pub max_files: u32,
    pub enable_console: bool,
    pub enable_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file_path: "/var/log/riskgate/server.log".to_string(),
            max_size_mb: 100,
            max_files: 10,
            enable_console: true,
            enable_file: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.level.as_str()) {
            return Err(invalid(
                "logging",
                "level",
                format!("unknown level {:?}", self.level),
            ));
        }
        if self.file_path.is_empty() {
            return Err(invalid("logging", "file", "must not be empty"));
        }
        if !(1..=1024).contains(&self.max_size_mb) {
            return Err(invalid("logging", "max_size_mb", "must be in 1..=1024"));
        }
        if !(1..=100).contains(&self.max_files) {
            return Err(invalid("logging", "max_files", "must be in 1..=100"));
        }
        Ok(())
    }
}

/// Monitoring / metrics exposition section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_prometheus: bool,
    pub prometheus_port: u16,
    pub metrics_interval_seconds: u32,
    pub metrics_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            enable_prometheus: true,
            prometheus_port: 9090,
            metrics_interval_seconds: 1,
            metrics_path: "/metrics".to_string(),
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prometheus_port == 0 {
            return Err(invalid("monitoring", "prometheus_port", "must be in 1..=65535"));
        }
        if !(1..=3600).contains(&self.metrics_interval_seconds) {
            return Err(invalid(
                "monitoring",
                "metrics_interval_seconds",
                "must be in 1..=3600",
            ));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(invalid("monitoring", "metrics_path", "must begin with '/'"));
        }
        Ok(())
    }
}

/// Complete typed system configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub performance: PerformanceConfig,
    pub features: FeatureConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
}

impl SystemConfig {
    /// Parse and validate from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.performance.validate()?;
        self.features.validate()?;
        self.logging.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }
}

/// Shared store over the active [`SystemConfig`].
///
/// Callers take [`snapshot`](Self::snapshot)s, `Arc` clones valid for
/// their lexical scope; reload swaps the `Arc` atomically so a running
/// decision never observes a half-loaded configuration. A failed reload
/// keeps the previous snapshot and records the error.
pub struct ConfigStore {
    current: RwLock<Arc<SystemConfig>>,
    path: Option<PathBuf>,
    observer: Mutex<Option<ConfigObserver>>,
    watcher: Mutex<Option<FileWatcher>>,
    last_error: Mutex<Option<String>>,
}

impl ConfigStore {
    /// Load the store from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = SystemConfig::from_file(&path)?;
        info!(path = %path.display(), "configuration loaded");

        Ok(Arc::new(ConfigStore {
            current: RwLock::new(Arc::new(config)),
            path: Some(path),
            observer: Mutex::new(None),
            watcher: Mutex::new(None),
            last_error: Mutex::new(None),
        }))
    }

    /// Build a store around an in-memory configuration (tests, embedding).
    pub fn from_config(config: SystemConfig) -> Arc<Self> {
        Arc::new(ConfigStore {
            current: RwLock::new(Arc::new(config)),
            path: None,
            observer: Mutex::new(None),
            watcher: Mutex::new(None),
            last_error: Mutex::new(None),
        })
    }

    /// Immutable snapshot of the active configuration.
    pub fn snapshot(&self) -> Arc<SystemConfig> {
        self.current.read().clone()
    }

    pub fn server(&self) -> ServerConfig {
        self.snapshot().server.clone()
    }

    pub fn performance(&self) -> PerformanceConfig {
        self.snapshot().performance.clone()
    }

    pub fn features(&self) -> FeatureConfig {
        self.snapshot().features.clone()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.snapshot().logging.clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.snapshot().monitoring.clone()
    }

    /// Re-read the backing file; swap only on successful validation.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or_else(|| {
            ConfigError::Parse("no configuration file backing this store".to_string())
        })?;

        match SystemConfig::from_file(path) {
            Ok(config) => {
                let config = Arc::new(config);
                *self.current.write() = config.clone();
                *self.last_error.lock() = None;
                info!(path = %path.display(), "configuration reloaded");

                if let Some(observer) = self.observer.lock().clone() {
                    observer(&config);
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "configuration reload failed, keeping previous snapshot");
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Start watching the backing file. Idempotent.
    pub fn enable_hot_reload(
        self: &Arc<Self>,
        interval: Duration,
        observer: Option<ConfigObserver>,
    ) {
        let Some(path) = self.path.clone() else {
            return;
        };

        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }

        *self.observer.lock() = observer;

        // Weak reference: the watcher must not keep the store alive
        let store = Arc::downgrade(self);
        *watcher = Some(FileWatcher::spawn(vec![path], interval, move || {
            if let Some(store) = store.upgrade() {
                let _ = store.reload();
            }
        }));
    }

    /// Stop the watcher. Idempotent.
    pub fn disable_hot_reload(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }

    /// Message from the most recent failed reload, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        self.disable_hot_reload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SystemConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000
threads = 16

[performance]
target_p99_ms = 25.0
target_qps = 20000

[features]
enable_cache = true
cache_size_mb = 256

[logging]
level = "debug"
file = "/tmp/riskgate.log"

[monitoring]
enable_prometheus = true
prometheus_port = 9100
metrics_path = "/metrics"
"#;

        let config = SystemConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.threads, 16);
        // Unspecified fields fall back to defaults
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.performance.target_p99_ms, 25.0);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.monitoring.prometheus_port, 9100);
    }

    #[test]
    fn test_validation_errors_name_the_field() {
        let toml = r#"
[server]
threads = 200
"#;
        let err = SystemConfig::from_toml_str(toml).unwrap_err();
        match err {
            ConfigError::Validation { section, field, .. } => {
                assert_eq!(section, "server");
                assert_eq!(field, "threads");
            }
            other => panic!("unexpected error: {other}"),
        }

        let toml = r#"
[monitoring]
metrics_path = "metrics"
"#;
        assert!(matches!(
            SystemConfig::from_toml_str(toml),
            Err(ConfigError::Validation {
                section: "monitoring",
                field: "metrics_path",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let toml = r#"
[logging]
level = "verbose"
"#;
        assert!(SystemConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SystemConfig::from_file("/nonexistent/server.toml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_store_reload_keeps_previous_on_failure() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8081").unwrap();
        file.flush().unwrap();

        let store = ConfigStore::load(file.path()).unwrap();
        assert_eq!(store.server().port, 8081);

        // Corrupt the file; reload must fail but keep the old snapshot
        std::fs::write(file.path(), "[server]\nport = 0\n").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.server().port, 8081);
        assert!(store.last_error().is_some());

        // Fix it; reload succeeds and swaps
        std::fs::write(file.path(), "[server]\nport = 8082\n").unwrap();
        store.reload().unwrap();
        assert_eq!(store.server().port, 8082);
        assert!(store.last_error().is_none());
    }

    #[test]
    fn test_hot_reload_applies_change() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8081").unwrap();
        file.flush().unwrap();

        let store = ConfigStore::load(file.path()).unwrap();

        let observed = Arc::new(std::sync::atomic::AtomicU16::new(0));
        let observed_clone = observed.clone();
        store.enable_hot_reload(
            Duration::from_millis(20),
            Some(Arc::new(move |config: &SystemConfig| {
                observed_clone.store(config.server.port, std::sync::atomic::Ordering::SeqCst);
            })),
        );

        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(file.path(), "[server]\nport = 9001\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.server().port != 9001 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        store.disable_hot_reload();
        assert_eq!(store.server().port, 9001);
        assert_eq!(observed.load(std::sync::atomic::Ordering::SeqCst), 9001);
    }
}
