//! Configuration overlays
//!
//! The effective daemon configuration is built by laying a caller-supplied
//! [`ConfigOverlay`] over the defaults. The merge is shallow: a top-level key
//! from the overlay replaces the default value entirely, nested tables included.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the default data directory
pub const DATA_DIR_ENV: &str = "IPFS_PATH";

/// Data directory used when `IPFS_PATH` is not set
pub const DEFAULT_DATA_DIR: &str = "./ipfs";

/// Default directory for the supervisor log file
pub const DEFAULT_LOG_DIRECTORY: &str = "/tmp";

/// Default API bind address
pub const DEFAULT_API_ADDRESS: &str = "/ip4/127.0.0.1/tcp/5001";

/// Default swarm bind address
pub const DEFAULT_SWARM_ADDRESS: &str = "/ip4/0.0.0.0/tcp/4001";

/// Default gateway bind address
pub const DEFAULT_GATEWAY_ADDRESS: &str = "/ip4/0.0.0.0/tcp/8080";

/// Default `ipfs daemon` flags
pub const DEFAULT_FLAGS: &[&str] = &["--enable-pubsub-experiment"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Network bind addresses handed to the daemon
///
/// Every field is optional because an overlay replaces the whole table:
/// `Addresses { API }` on its own leaves `Swarm` and `Gateway` unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    #[serde(rename = "API", default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    #[serde(rename = "Swarm", default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<Vec<String>>,

    #[serde(rename = "Gateway", default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl Addresses {
    fn defaults() -> Self {
        Self {
            api: Some(DEFAULT_API_ADDRESS.to_string()),
            swarm: Some(vec![DEFAULT_SWARM_ADDRESS.to_string()]),
            gateway: Some(DEFAULT_GATEWAY_ADDRESS.to_string()),
        }
    }
}

/// Effective supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Repository directory
    pub ipfs_data_dir: PathBuf,

    /// Directory receiving `ipfs-daemon.log`
    pub log_directory: PathBuf,

    /// Bind addresses
    pub addresses: Addresses,

    /// Flags passed to `ipfs daemon`, in order
    pub flags: Vec<String>,

    /// Unrecognized keys, passed through to the controller untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Config {
    /// Defaults, honoring `IPFS_PATH` for the data directory
    pub fn defaults() -> Self {
        Self::defaults_with_data_dir(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
    }

    /// Defaults with an explicit data directory override
    pub fn defaults_with_data_dir(data_dir: Option<PathBuf>) -> Self {
        Self {
            ipfs_data_dir: data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            log_directory: PathBuf::from(DEFAULT_LOG_DIRECTORY),
            addresses: Addresses::defaults(),
            flags: DEFAULT_FLAGS.iter().map(|f| f.to_string()).collect(),
            extra: Map::new(),
        }
    }

    /// Replace every top-level key present in the overlay
    pub fn overlay(mut self, overlay: ConfigOverlay) -> Self {
        if let Some(dir) = overlay.ipfs_data_dir {
            self.ipfs_data_dir = dir;
        }
        if let Some(dir) = overlay.log_directory {
            self.log_directory = dir;
        }
        if let Some(addresses) = overlay.addresses {
            self.addresses = addresses;
        }
        if let Some(flags) = overlay.flags {
            self.flags = flags;
        }
        self.extra.extend(overlay.extra);
        self
    }

    /// JSON view using the daemon's key names
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Caller-supplied overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs_data_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_directory: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Addresses>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigOverlay {
    /// Load an overlay from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse an overlay from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let overlay: ConfigOverlay = toml::from_str(content)?;
        overlay.validate()?;
        Ok(overlay)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ipfs_data_dir = Some(dir.into());
        self
    }

    pub fn with_log_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_directory = Some(dir.into());
        self
    }

    pub fn with_addresses(mut self, addresses: Addresses) -> Self {
        self.addresses = Some(addresses);
        self
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = Some(flags.into_iter().map(Into::into).collect());
        self
    }

    /// Add an opaque key for the controller
    pub fn with_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Validate the overlay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(flags) = &self.flags {
            for flag in flags {
                if !flag.starts_with('-') {
                    return Err(ConfigError::Invalid(format!(
                        "daemon flag must start with '-': {:?}",
                        flag
                    )));
                }
            }
        }

        if let Some(dir) = &self.ipfs_data_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("IpfsDataDir is empty".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::defaults_with_data_dir(None)
    }

    #[test]
    fn test_defaults() {
        let config = defaults();
        assert_eq!(config.ipfs_data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.log_directory, PathBuf::from("/tmp"));
        assert_eq!(config.addresses.api.as_deref(), Some("/ip4/127.0.0.1/tcp/5001"));
        assert_eq!(config.flags, vec!["--enable-pubsub-experiment".to_string()]);
        assert!(config.extra.is_empty());
    }

    #[test]
    fn test_overlay_data_dir_keeps_other_defaults() {
        let overlay = ConfigOverlay::default().with_data_dir("/tmp/x");
        let config = defaults().overlay(overlay);

        assert_eq!(config.ipfs_data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.addresses.api.as_deref(), Some("/ip4/127.0.0.1/tcp/5001"));
        assert_eq!(config.addresses, defaults().addresses);
        assert_eq!(config.flags, defaults().flags);
    }

    #[test]
    fn test_overlay_replaces_addresses_wholesale() {
        let overlay = ConfigOverlay::default().with_addresses(Addresses {
            api: Some("/ip4/127.0.0.1/tcp/5002".to_string()),
            ..Default::default()
        });
        let config = defaults().overlay(overlay);

        assert_eq!(config.addresses.api.as_deref(), Some("/ip4/127.0.0.1/tcp/5002"));
        assert_eq!(config.addresses.swarm, None);
        assert_eq!(config.addresses.gateway, None);
        assert_eq!(config.ipfs_data_dir, defaults().ipfs_data_dir);
    }

    #[test]
    fn test_overlay_replaces_flags() {
        let overlay = ConfigOverlay::default().with_flags(["--offline"]);
        let config = defaults().overlay(overlay);
        assert_eq!(config.flags, vec!["--offline".to_string()]);
    }

    #[test]
    fn test_parse_overlay_with_opaque_keys() {
        let overlay = ConfigOverlay::parse(
            r#"
IpfsDataDir = "/data/ipfs"
Flags = ["--enable-gc"]

[Addresses]
API = "/ip4/127.0.0.1/tcp/5005"
Swarm = ["/ip4/0.0.0.0/tcp/4005"]

[Discovery.MDNS]
Enabled = false
"#,
        )
        .unwrap();

        assert_eq!(overlay.ipfs_data_dir, Some(PathBuf::from("/data/ipfs")));
        assert_eq!(overlay.log_directory, None);
        assert_eq!(overlay.flags, Some(vec!["--enable-gc".to_string()]));
        assert_eq!(
            overlay.extra.get("Discovery"),
            Some(&serde_json::json!({ "MDNS": { "Enabled": false } }))
        );

        let config = defaults().overlay(overlay);
        assert_eq!(config.addresses.gateway, None);
        assert_eq!(config.log_directory, PathBuf::from(DEFAULT_LOG_DIRECTORY));
        assert!(config.extra.contains_key("Discovery"));
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let result = ConfigOverlay::parse(r#"Flags = ["offline"]"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_json_uses_daemon_key_names() {
        let config = defaults().overlay(
            ConfigOverlay::default().with_key("Datastore", serde_json::json!({ "GCPeriod": "1h" })),
        );
        let json = config.to_json().unwrap();

        assert_eq!(json["Addresses"]["API"], "/ip4/127.0.0.1/tcp/5001");
        assert_eq!(json["IpfsDataDir"], "./ipfs");
        assert_eq!(json["Datastore"]["GCPeriod"], "1h");
    }
}
