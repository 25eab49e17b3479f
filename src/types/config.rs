//! Configuration structures.
//!
//! Configuration is loaded from a TOML file, then overridden by environment
//! variables and finally by command-line flags (see `main.rs`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{Error, Result};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cec-controller.toml";

/// Environment variable carrying the queue directory across a self-restart.
pub const QUEUE_DIR_ENV: &str = "CEC_QUEUE_DIR";

/// Environment variable carrying the remaining restart budget.
pub const RESTART_BUDGET_ENV: &str = "CEC_RESTART_RETRIES";

/// Global controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Adapter connection settings.
    #[serde(default)]
    pub cec: CecConfig,

    /// Power event handling.
    #[serde(default)]
    pub power: PowerConfig,

    /// Durable queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Self-restart settings.
    #[serde(default)]
    pub restart: RestartConfig,

    /// Key translation settings.
    #[serde(default)]
    pub keymap: KeymapConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Adapter connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CecConfig {
    /// Adapter path; empty means autodetect.
    pub adapter: String,

    /// OSD name announced on the bus. Defaults to the host name.
    pub device_name: String,

    /// Reopen attempts per reconnect. Zero falls back to the default.
    pub connection_retries: u32,

    /// Pause between reopen attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// `cec-client` executable used by the production connector.
    pub client_binary: PathBuf,
}

impl CecConfig {
    pub const DEFAULT_RETRIES: u32 = 5;

    /// Effective retry budget (zero means "use the default").
    pub fn retries(&self) -> u32 {
        if self.connection_retries == 0 {
            Self::DEFAULT_RETRIES
        } else {
            self.connection_retries
        }
    }
}

impl Default for CecConfig {
    fn default() -> Self {
        Self {
            adapter: String::new(),
            device_name: String::new(),
            connection_retries: Self::DEFAULT_RETRIES,
            reconnect_delay: Duration::from_millis(500),
            client_binary: PathBuf::from("cec-client"),
        }
    }
}

/// Power event handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Listen for logind sleep/shutdown signals.
    pub enabled: bool,

    /// Logical addresses that receive power on / standby, in order.
    pub devices: Vec<u8>,

    /// Wake the devices when a fresh (non-restarted) process starts.
    pub startup_power_on: bool,
}

impl PowerConfig {
    /// Power handling is active only with at least one device.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.devices.is_empty()
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            devices: vec![0],
            startup_power_on: true,
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue directory. A fresh temp directory is used when unset.
    pub dir: Option<PathBuf>,

    /// Capacity of each in-memory egress queue.
    pub capacity: usize,

    /// Upper bound on how long the drain task sleeps on an empty log.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl QueueConfig {
    /// Configured directory, or a new unique one under the temp dir.
    pub fn resolve_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("cec-queue-{}", uuid::Uuid::new_v4()))
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: None,
            capacity: 10,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Self-restart settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Restarts allowed for a fresh lineage.
    pub budget: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self { budget: 3 }
    }
}

/// Which virtual input backend receives translated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectorKind {
    /// `ydotool` when it is on `PATH`, otherwise log only (with a warning).
    #[default]
    Auto,
    /// Log the key codes only.
    Log,
    /// Send keys through `ydotool key`.
    Ydotool,
}

/// Key translation settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeymapConfig {
    /// CEC key name -> Linux input key codes pressed together.
    pub overrides: BTreeMap<String, Vec<u16>>,

    pub injector: InjectorKind,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Load the config file and apply environment overrides.
    ///
    /// `path = None` reads [`DEFAULT_CONFIG_PATH`] if it exists; an explicit
    /// path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.fill_defaults();
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `CEC_QUEUE_DIR` and `CEC_RESTART_RETRIES` overrides.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(QUEUE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.queue.dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup(RESTART_BUDGET_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(budget) => self.restart.budget = budget,
                Err(e) => tracing::warn!(value = %raw, error = %e, "Invalid restart budget in environment"),
            }
        }
    }

    /// Fill values that depend on the host.
    pub fn fill_defaults(&mut self) {
        if self.cec.device_name.is_empty() {
            self.cec.device_name = host_name().unwrap_or_else(|| "cec-controller".to_string());
        }
        if self.power.devices.is_empty() {
            self.power.enabled = false;
        }
    }
}

/// Parse `--devices` style entries: each entry may hold several comma-separated
/// addresses. Invalid addresses are logged and skipped.
pub fn parse_devices<S: AsRef<str>>(entries: &[S]) -> Vec<u8> {
    let mut devices = Vec::new();
    for entry in entries {
        for part in entry.as_ref().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.parse::<u8>() {
                Ok(dev) => devices.push(dev),
                Err(e) => tracing::warn!(device = part, error = %e, "Invalid device address"),
            }
        }
    }
    devices
}

/// Parse `--keymap name:code[+code...]` entries. Malformed entries and codes
/// are logged and skipped.
pub fn parse_keymap_entries<S: AsRef<str>>(entries: &[S]) -> BTreeMap<String, Vec<u16>> {
    let mut overrides = BTreeMap::new();
    for entry in entries {
        let entry = entry.as_ref();
        let Some((name, codes)) = entry.split_once(':') else {
            tracing::warn!(entry, "Invalid keymap entry");
            continue;
        };
        if codes.contains(':') {
            tracing::warn!(entry, "Invalid keymap entry");
            continue;
        }
        let mut linux_codes = Vec::new();
        for code in codes.split('+') {
            match code.trim().parse::<u16>() {
                Ok(code) => linux_codes.push(code),
                Err(e) => tracing::warn!(code, error = %e, "Invalid linux key code"),
            }
        }
        overrides.insert(name.trim().to_string(), linux_codes);
    }
    overrides
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cec.retries(), 5);
        assert_eq!(config.power.devices, vec![0]);
        assert!(config.power.is_active());
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.restart.budget, 3);
        assert_eq!(config.keymap.injector, InjectorKind::Auto);
    }

    #[test]
    fn test_zero_retries_falls_back_to_default() {
        let mut config = CecConfig::default();
        config.connection_retries = 0;
        assert_eq!(config.retries(), CecConfig::DEFAULT_RETRIES);
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            [cec]
            adapter = "/dev/ttyACM0"
            connection_retries = 2
            reconnect_delay = "250ms"

            [power]
            devices = [0, 5]

            [queue]
            dir = "/var/lib/cec-queue"
            poll_interval = "10ms"

            [keymap]
            injector = "ydotool"

            [keymap.overrides]
            "F1" = [29, 46]
            "#,
        )
        .unwrap();

        assert_eq!(config.cec.adapter, "/dev/ttyACM0");
        assert_eq!(config.cec.retries(), 2);
        assert_eq!(config.cec.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.power.devices, vec![0, 5]);
        assert_eq!(config.queue.dir, Some(PathBuf::from("/var/lib/cec-queue")));
        assert_eq!(config.queue.poll_interval, Duration::from_millis(10));
        assert_eq!(config.keymap.injector, InjectorKind::Ydotool);
        assert_eq!(config.keymap.overrides.get("F1"), Some(&vec![29, 46]));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        assert!(Config::from_toml("[volume]\nstep = 5\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            QUEUE_DIR_ENV => Some("/tmp/q".to_string()),
            RESTART_BUDGET_ENV => Some("1".to_string()),
            _ => None,
        });
        assert_eq!(config.queue.dir, Some(PathBuf::from("/tmp/q")));
        assert_eq!(config.restart.budget, 1);
    }

    #[test]
    fn test_invalid_budget_env_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|key| (key == RESTART_BUDGET_ENV).then(|| "many".to_string()));
        assert_eq!(config.restart.budget, 3);
    }

    #[test]
    fn test_empty_devices_disable_power_handling() {
        let mut config = Config::default();
        config.power.devices.clear();
        config.fill_defaults();
        assert!(!config.power.enabled);
        assert!(!config.cec.device_name.is_empty());
    }

    #[test]
    fn test_parse_devices() {
        assert_eq!(parse_devices(&["0,1", " 4 ", "x", ""]), vec![0, 1, 4]);
        assert!(parse_devices::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_parse_keymap_entries() {
        let parsed = parse_keymap_entries(&["Select:28", "F1:29+46", "bad", "Up:x+103", "a:b:c"]);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["Select"], vec![28]);
        assert_eq!(parsed["F1"], vec![29, 46]);
        assert_eq!(parsed["Up"], vec![103]);
    }

    #[test]
    fn test_resolve_dir_is_unique_without_config() {
        let queue = QueueConfig::default();
        assert_ne!(queue.resolve_dir(), queue.resolve_dir());
    }
}
