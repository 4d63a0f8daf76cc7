//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use watchlink_core::wire::DEFAULT_MAX_PAYLOAD_LEN;
use watchlink_core::{HardwarePlatform, LinkConfig};

/// Daemon configuration. File: ~/.config/watchlink/config.toml or /etc/watchlink/config.toml.
/// Env overrides: WATCHLINK_DEVICE, WATCHLINK_TCP_ADDR, WATCHLINK_PLATFORM,
/// WATCHLINK_ACK_TIMEOUT_SECS, WATCHLINK_RECONNECT_DELAY_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Serial device bound to the watch (default /dev/rfcomm0).
    #[serde(default = "default_device")]
    pub device: PathBuf,
    /// host:port of a TCP bridge; used instead of `device` when set.
    #[serde(default)]
    pub tcp_addr: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: HardwarePlatform,
    /// Seconds to wait for a BlobDB ack; 0 disables the watchdog.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,
    #[serde(default = "default_max_malformed_frames")]
    pub max_malformed_frames: u32,
    /// Default tracing directive; RUST_LOG wins when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/rfcomm0")
}
fn default_platform() -> HardwarePlatform {
    HardwarePlatform::Basalt
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_max_frame_payload() -> usize {
    DEFAULT_MAX_PAYLOAD_LEN
}
fn default_max_malformed_frames() -> u32 {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            tcp_addr: None,
            platform: default_platform(),
            ack_timeout_secs: default_ack_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_frame_payload: default_max_frame_payload(),
            max_malformed_frames: default_max_malformed_frames(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Protocol knobs for the core. The link task ticks once a second.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            max_frame_payload: self.max_frame_payload,
            max_malformed_frames: self.max_malformed_frames,
            ack_timeout_ticks: self.ack_timeout_secs,
            platform: self.platform,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("WATCHLINK_DEVICE") {
        c.device = PathBuf::from(s);
    }
    if let Some(s) = var("WATCHLINK_TCP_ADDR") {
        c.tcp_addr = if s.is_empty() { None } else { Some(s) };
    }
    if let Some(s) = var("WATCHLINK_PLATFORM") {
        match s.parse::<HardwarePlatform>() {
            Ok(p) => c.platform = p,
            Err(e) => tracing::warn!("ignoring WATCHLINK_PLATFORM: {e}"),
        }
    }
    if let Some(s) = var("WATCHLINK_ACK_TIMEOUT_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.ack_timeout_secs = v;
        }
    }
    if let Some(s) = var("WATCHLINK_RECONNECT_DELAY_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.reconnect_delay_secs = v;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/watchlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/watchlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), "bad config: {e}"),
                Err(e) => tracing::warn!(path = %p.display(), "unreadable config: {e}"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("tcp_addr = \"127.0.0.1:9000\"\nplatform = \"chalk\"\n").unwrap();
        assert_eq!(c.tcp_addr.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(c.platform, HardwarePlatform::Chalk);
        assert_eq!(c.device, PathBuf::from("/dev/rfcomm0"));
        assert_eq!(c.ack_timeout_secs, 10);
        assert_eq!(c.link_config().max_frame_payload, 8192);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("WATCHLINK_DEVICE", "/dev/rfcomm3"),
            ("WATCHLINK_PLATFORM", "emery"),
            ("WATCHLINK_ACK_TIMEOUT_SECS", "0"),
            ("WATCHLINK_RECONNECT_DELAY_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.device, PathBuf::from("/dev/rfcomm3"));
        assert_eq!(c.platform, HardwarePlatform::Emery);
        assert_eq!(c.link_config().ack_timeout_ticks, 0);
        assert_eq!(c.reconnect_delay(), Duration::from_secs(5));
    }
}
