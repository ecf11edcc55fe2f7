//! Node configuration: a TOML file with environment overrides.
//!
//! Lookup order is `~/.config/palaver/config.toml`, then
//! `/etc/palaver/config.toml`, then built-in defaults. `PALAVER_LISTEN_PORT`,
//! `PALAVER_LISTEN_HOST` and `PALAVER_DIAL_TIMEOUT_MS` override whatever the
//! file said.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 4009;
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port to listen on. 0 asks the OS for one.
    #[serde(default = "default_port")]
    pub listen_port: u16,
    /// Address to bind and advertise. Autodetected when absent.
    #[serde(default)]
    pub listen_host: Option<IpAddr>,
    /// How long an outbound dial keeps retrying its hello.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            listen_host: None,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".config/palaver/config.toml"));
    }
    paths.push(PathBuf::from("/etc/palaver/config.toml"));
    paths
}

/// Load the configuration, falling back to defaults when no file exists
/// or a file fails to parse.
pub fn load() -> Config {
    let mut config = Config::default();
    for path in config_paths() {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match toml::from_str(&text) {
            Ok(parsed) => {
                config = parsed;
                break;
            }
            Err(e) => warn!("ignoring {}: {e}", path.display()),
        }
    }
    apply_env(&mut config);
    config
}

fn apply_env(config: &mut Config) {
    if let Ok(port) = std::env::var("PALAVER_LISTEN_PORT") {
        match port.parse() {
            Ok(port) => config.listen_port = port,
            Err(_) => warn!("ignoring PALAVER_LISTEN_PORT={port}"),
        }
    }
    if let Ok(host) = std::env::var("PALAVER_LISTEN_HOST") {
        match host.parse() {
            Ok(host) => config.listen_host = Some(host),
            Err(_) => warn!("ignoring PALAVER_LISTEN_HOST={host}"),
        }
    }
    if let Ok(ms) = std::env::var("PALAVER_DIAL_TIMEOUT_MS") {
        match ms.parse() {
            Ok(ms) => config.dial_timeout_ms = ms,
            Err(_) => warn!("ignoring PALAVER_DIAL_TIMEOUT_MS={ms}"),
        }
    }
}
