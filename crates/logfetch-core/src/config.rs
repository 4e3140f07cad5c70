use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default FTP port of the vehicle log servers
pub const DEFAULT_PORT: u16 = 30021;

/// Top-level configuration (loaded from logfetch.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFetchConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub download: DownloadConfig,
    pub listing: ListingConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Where downloaded logs land: `{base_dir}/{label}/{remote path}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
    /// Vehicle or system label used as the per-source subdirectory
    pub label: String,
}

/// One logical log server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Short registry key ("main", "cam", ...)
    pub key: String,
    /// Explicit host; takes precedence over `derive_from`
    pub host: Option<String>,
    /// Derive the host from another endpoint's IPv4 address
    pub derive_from: Option<String>,
    /// Added to the last octet of the source host when deriving
    pub octet_offset: u8,
    pub port: u16,
    /// Whether listing should contact this endpoint
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Admission queue capacity (concurrent downloads)
    pub max_concurrent: usize,
    /// Gate transfers through the admission queue
    pub admission_control: bool,
    /// Resume partially downloaded files
    pub resume: bool,
    /// Delay before a timed-out transfer retries
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// Bytes requested per remote read
    pub chunk_size: usize,
    /// Cooldown before a finished task is dropped
    pub cleanup_done_secs: u64,
    /// Cooldown before a failed or stopped task is dropped
    pub cleanup_idle_secs: u64,
    /// Moving-average window for throughput
    pub progress_window: usize,
    /// ETA horizon; longer estimates are shown as "+<cap>"
    pub max_eta_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Skip the lexicographically last folder (the one still being written)
    pub ignore_active_log: bool,
    /// On reset, wait until no transfer is working or queued
    pub wait_for_all_to_stop: bool,
    /// Remote nesting depth below the endpoint root (2 = folder/file/child)
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub disk_space_interval_ms: u64,
    pub disk_space_initial_delay_ms: u64,
}

impl Default for LogFetchConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            storage: StorageConfig::default(),
            endpoints: vec![
                EndpointConfig::default(),
                EndpointConfig {
                    key: "cam".into(),
                    host: None,
                    derive_from: Some("main".into()),
                    octet_offset: 3,
                    port: DEFAULT_PORT,
                    available: false,
                },
            ],
            download: DownloadConfig::default(),
            listing: ListingConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("log/downloaded"),
            label: "unknown".into(),
        }
    }
}

impl StorageConfig {
    /// Directory that mirrors the remote endpoint roots
    pub fn local_root(&self) -> PathBuf {
        self.base_dir.join(&self.label)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            key: "main".into(),
            host: Some("127.0.0.1".into()),
            derive_from: None,
            octet_offset: 0,
            port: DEFAULT_PORT,
            available: true,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            admission_control: true,
            resume: true,
            retry_delay_ms: 8000,
            connect_timeout_secs: 10,
            io_timeout_secs: 30,
            chunk_size: 64 * 1024,
            cleanup_done_secs: 5,
            cleanup_idle_secs: 45,
            progress_window: 25,
            max_eta_minutes: 180,
        }
    }
}

impl DownloadConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn cleanup_done(&self) -> Duration {
        Duration::from_secs(self.cleanup_done_secs)
    }

    pub fn cleanup_idle(&self) -> Duration {
        Duration::from_secs(self.cleanup_idle_secs)
    }

    pub fn max_eta(&self) -> Duration {
        Duration::from_secs(self.max_eta_minutes * 60)
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            ignore_active_log: true,
            wait_for_all_to_stop: true,
            max_depth: 2,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            disk_space_interval_ms: 5000,
            disk_space_initial_delay_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[log]
level = "debug"
format = "json"

[storage]
base_dir = "/data/logs"
label = "lauv-xplore-1"

[[endpoints]]
key = "main"
host = "10.0.10.120"
port = 21

[[endpoints]]
key = "cam"
derive_from = "main"
octet_offset = 3
port = 21
available = false

[download]
max_concurrent = 2
resume = false
retry_delay_ms = 2000

[listing]
ignore_active_log = false
max_depth = 3
"#;
        let config: LogFetchConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
        assert_eq!(
            config.storage.local_root(),
            PathBuf::from("/data/logs/lauv-xplore-1")
        );
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].host.as_deref(), Some("10.0.10.120"));
        assert_eq!(config.endpoints[0].port, 21);
        assert!(config.endpoints[0].available);
        assert_eq!(config.endpoints[1].derive_from.as_deref(), Some("main"));
        assert!(!config.endpoints[1].available);
        assert_eq!(config.download.max_concurrent, 2);
        assert!(!config.download.resume);
        assert_eq!(config.download.retry_delay(), Duration::from_secs(2));
        assert!(!config.listing.ignore_active_log);
        assert_eq!(config.listing.max_depth, 3);
    }

    #[test]
    fn test_parse_defaults() {
        let config: LogFetchConfig = toml::from_str("").unwrap();

        assert_eq!(config.log.level, "info");
        assert_eq!(config.storage.base_dir, PathBuf::from("log/downloaded"));
        assert_eq!(config.storage.label, "unknown");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].key, "main");
        assert_eq!(config.endpoints[0].port, DEFAULT_PORT);
        assert_eq!(config.endpoints[1].key, "cam");
        assert_eq!(config.endpoints[1].octet_offset, 3);
        assert_eq!(config.download.max_concurrent, 1);
        assert!(config.download.admission_control);
        assert!(config.download.resume);
        assert_eq!(config.download.retry_delay(), Duration::from_millis(8000));
        assert_eq!(config.download.cleanup_done(), Duration::from_secs(5));
        assert_eq!(config.download.cleanup_idle(), Duration::from_secs(45));
        assert_eq!(config.download.progress_window, 25);
        assert_eq!(config.download.max_eta(), Duration::from_secs(180 * 60));
        assert!(config.listing.ignore_active_log);
        assert!(config.listing.wait_for_all_to_stop);
        assert_eq!(config.listing.max_depth, 2);
        assert_eq!(config.monitor.disk_space_interval_ms, 5000);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
label = "noptilus-2"

[[endpoints]]
key = "main"
host = "192.168.1.100"
"#;
        let config: LogFetchConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.storage.label, "noptilus-2");
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].host.as_deref(), Some("192.168.1.100"));
        // Defaults
        assert_eq!(config.storage.base_dir, PathBuf::from("log/downloaded"));
        assert_eq!(config.endpoints[0].port, DEFAULT_PORT);
        assert!(config.endpoints[0].available);
        assert_eq!(config.download.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = LogFetchConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: LogFetchConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.base_dir, parsed.storage.base_dir);
        assert_eq!(config.endpoints.len(), parsed.endpoints.len());
        assert_eq!(config.endpoints[1].derive_from, parsed.endpoints[1].derive_from);
        assert_eq!(config.download.retry_delay_ms, parsed.download.retry_delay_ms);
    }
}
