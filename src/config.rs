//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `WRPHUB_API_KEY`, `WRPHUB_LISTEN`,
//!    `WRPHUB_DEVICE_HEADER`
//! 2. **Config file** — path via `--config <path>`, or `wrphub.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_connections = 4096
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [device]
//! max_devices = 0                    # 0 = unbounded
//! queue_size = 100
//! duplicate_policy = "displace"      # or "reject"
//! device_name_header = "X-Webpa-Device-Name"
//! ping_interval_secs = 45
//! idle_timeout_secs = 135
//! max_frame_bytes = 262144
//! default_format = "msgpack"         # or "json"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::devices::device::Key;
use crate::devices::registry::DuplicatePolicy;
use crate::devices::{DeviceOptions, KeyFunc};
use crate::id::DEFAULT_DEVICE_NAME_HEADER;
use crate::wrp::WireFormat;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent in-flight requests and upgrades (default 4096).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Authentication settings for the REST control surface.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `WRPHUB_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Device connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Total device cap; 0 means effectively unbounded (default 0).
    #[serde(default)]
    pub max_devices: u32,
    /// Capacity of each device's send queue (default 100).
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// `"displace"` (new connection wins, default) or `"reject"`.
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: String,
    /// Header carrying the device name on connect (default
    /// `X-Webpa-Device-Name`). Override with `WRPHUB_DEVICE_HEADER`.
    #[serde(default = "default_device_name_header")]
    pub device_name_header: String,
    /// Keep-alive ping cadence in seconds (default 45).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Seconds without a pong before a device is disconnected for inactivity
    /// (default 135; 0 disables the sweep).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Largest accepted frame in bytes (default 256 KiB; 0 = unlimited).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Frame format when callers don't specify one: `"msgpack"` (default) or
    /// `"json"`.
    #[serde(default = "default_format")]
    pub default_format: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_connections() -> usize {
    4096
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_queue_size() -> usize {
    100
}
fn default_duplicate_policy() -> String {
    "displace".to_string()
}
fn default_device_name_header() -> String {
    DEFAULT_DEVICE_NAME_HEADER.to_string()
}
fn default_ping_interval_secs() -> u64 {
    45
}
fn default_idle_timeout_secs() -> u64 {
    135
}
fn default_max_frame_bytes() -> usize {
    256 * 1024
}
fn default_format() -> String {
    "msgpack".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_devices: 0,
            queue_size: default_queue_size(),
            duplicate_policy: default_duplicate_policy(),
            device_name_header: default_device_name_header(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            default_format: default_format(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `wrphub.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("wrphub.toml").exists() {
            let content =
                std::fs::read_to_string("wrphub.toml").expect("Failed to read wrphub.toml");
            toml::from_str(&content).expect("Failed to parse wrphub.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("WRPHUB_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("WRPHUB_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(header) = std::env::var("WRPHUB_DEVICE_HEADER") {
            config.device.device_name_header = header;
        }

        config
    }

    /// Validate field values that serde can't check. Returns human-readable
    /// problems; empty means the config is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if DuplicatePolicy::from_str_opt(&self.device.duplicate_policy).is_none() {
            errors.push(format!(
                "device.duplicate_policy must be \"displace\" or \"reject\", got {:?}",
                self.device.duplicate_policy
            ));
        }
        if WireFormat::from_str_opt(&self.device.default_format).is_none() {
            errors.push(format!(
                "device.default_format must be \"json\" or \"msgpack\", got {:?}",
                self.device.default_format
            ));
        }
        if self.device.queue_size == 0 {
            errors.push("device.queue_size must be at least 1".to_string());
        }
        if self.server.max_connections == 0 {
            errors.push("server.max_connections must be at least 1".to_string());
        }
        errors
    }

    /// Build the manager options this config describes. Call only after
    /// [`Config::validate`] came back clean.
    #[must_use]
    pub fn device_options(&self) -> DeviceOptions {
        let key_func: KeyFunc = Arc::new(|_, _, _| Ok(Key::random()));
        DeviceOptions {
            queue_size: self.device.queue_size,
            max_devices: self.device.max_devices,
            duplicate_policy: DuplicatePolicy::from_str_opt(&self.device.duplicate_policy)
                .unwrap_or_default(),
            ping_interval: Duration::from_secs(self.device.ping_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(self.device.idle_timeout_secs),
            max_frame_bytes: self.device.max_frame_bytes,
            default_format: WireFormat::from_str_opt(&self.device.default_format)
                .unwrap_or(WireFormat::Msgpack),
            key_func,
            filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
        let options = config.device_options();
        assert_eq!(options.queue_size, 100);
        assert_eq!(options.duplicate_policy, DuplicatePolicy::Displace);
        assert_eq!(options.default_format, WireFormat::Msgpack);
        assert_eq!(options.ping_interval, Duration::from_secs(45));
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9090"

            [device]
            max_devices = 2
            queue_size = 8
            duplicate_policy = "reject"
            default_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9090");
        assert_eq!(config.device.max_devices, 2);
        assert!(config.validate().is_empty());

        let options = config.device_options();
        assert_eq!(options.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(options.default_format, WireFormat::Json);
        assert_eq!(options.max_devices, 2);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let config: Config = toml::from_str(
            r#"
            [device]
            duplicate_policy = "both"
            default_format = "xml"
            queue_size = 0
            "#,
        )
        .unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
    }
}
