//! Configuration for the connector proxy and the CLI tools.
//!
//! Everything is read from a single optional JSON file. Every field is
//! optional; the `effective_*` accessors supply the defaults, and the CLI
//! may override individual values afterwards.
//!
//! # Example
//!
//! ```json
//! {
//!   "logging":   { "level": "info", "dir": "/var/log/txc" },
//!   "connector": { "lib_path": "C:\\txc\\txmlconnector64.dll",
//!                  "session_dir": "sessions", "log_level": 1,
//!                  "logfile_lifetime": 7 },
//!   "proxy":     { "bind": "127.0.0.1", "control_port": 5555,
//!                  "isolation": "process", "data_write_timeout_ms": 10000,
//!                  "forward_cpu_core": 3 }
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::LogLevel;

/// Default control port of the proxy.
pub const DEFAULT_CONTROL_PORT: u16 = 5555;

/// Top-level application config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Process logging (not the connector's own log files).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (e.g. `"info"`).
    pub level: Option<String>,
    /// Directory for daily-rotating log files.
    pub dir: Option<String>,
}

/// Where the connector library lives and how it logs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorConfig {
    /// Library file, or the directory holding it. Defaults to the working
    /// directory.
    pub lib_path: Option<PathBuf>,

    /// Root for per-session connector logs (`<session_dir>/<data_port>`).
    pub session_dir: Option<PathBuf>,

    /// Connector log depth.
    pub log_level: Option<LogLevel>,

    /// Days to keep connector log files; enables `InitializeEx`.
    pub logfile_lifetime: Option<u32>,
}

impl ConnectorConfig {
    pub fn effective_lib_path(&self) -> PathBuf {
        self.lib_path.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn effective_session_dir(&self) -> PathBuf {
        self.session_dir.clone().unwrap_or_else(|| PathBuf::from("sessions"))
    }

    pub fn effective_log_level(&self) -> LogLevel {
        self.log_level.unwrap_or(LogLevel::Minimum)
    }
}

/// How client connections are isolated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One child process per connection. The connector keeps process-global
    /// state, so this is the only mode serving clients concurrently.
    #[default]
    Process,
    /// Sessions are served one after another inside the server process.
    InProcess,
}

/// Proxy server settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// Address for both the control and the data listeners.
    pub bind: Option<IpAddr>,

    /// Control port (default: 5555).
    pub control_port: Option<u16>,

    pub isolation: Option<Isolation>,

    /// How long a session waits for the client to open the data socket.
    pub data_accept_timeout_ms: Option<u64>,

    /// Longest a single write to the data socket may block before the
    /// session stops forwarding to a client that does not read.
    pub data_write_timeout_ms: Option<u64>,

    /// Longest accepted command, terminator included.
    pub max_command_len: Option<usize>,

    /// Capacity of the callback → data socket queue (messages).
    pub forward_queue: Option<usize>,

    /// CPU core for the data forwarding thread.
    pub forward_cpu_core: Option<i32>,
}

impl ProxyConfig {
    pub fn effective_bind(&self) -> IpAddr {
        self.bind.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn effective_control_port(&self) -> u16 {
        self.control_port.unwrap_or(DEFAULT_CONTROL_PORT)
    }

    pub fn effective_isolation(&self) -> Isolation {
        self.isolation.unwrap_or_default()
    }

    pub fn effective_data_accept_timeout(&self) -> Duration {
        Duration::from_millis(self.data_accept_timeout_ms.unwrap_or(30_000))
    }

    /// Never zero, since sockets reject a zero timeout.
    pub fn effective_data_write_timeout(&self) -> Duration {
        Duration::from_millis(self.data_write_timeout_ms.unwrap_or(10_000).max(1))
    }

    pub fn effective_max_command_len(&self) -> usize {
        self.max_command_len.unwrap_or(1 << 20)
    }

    pub fn effective_forward_queue(&self) -> usize {
        self.forward_queue.unwrap_or(1 << 14).max(1)
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.proxy.effective_control_port(), DEFAULT_CONTROL_PORT);
        assert_eq!(cfg.proxy.effective_isolation(), Isolation::Process);
        assert_eq!(cfg.proxy.effective_bind(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.connector.effective_session_dir(), PathBuf::from("sessions"));
        assert_eq!(cfg.connector.effective_log_level(), LogLevel::Minimum);
        assert_eq!(cfg.proxy.effective_data_write_timeout(), Duration::from_secs(10));
        assert!(cfg.logging.is_none());
    }

    #[test]
    fn full_config() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{
                "logging": { "level": "debug" },
                "connector": { "lib_path": "/opt/txc", "log_level": "maximum",
                               "logfile_lifetime": 3 },
                "proxy": { "control_port": 6000, "isolation": "in_process",
                           "data_accept_timeout_ms": 500, "data_write_timeout_ms": 0,
                           "forward_queue": 0 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.logging.unwrap().level.as_deref(), Some("debug"));
        assert_eq!(cfg.connector.effective_lib_path(), PathBuf::from("/opt/txc"));
        assert_eq!(cfg.connector.effective_log_level(), LogLevel::Maximum);
        assert_eq!(cfg.connector.logfile_lifetime, Some(3));
        assert_eq!(cfg.proxy.effective_control_port(), 6000);
        assert_eq!(cfg.proxy.effective_isolation(), Isolation::InProcess);
        assert_eq!(cfg.proxy.effective_data_accept_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.proxy.effective_data_write_timeout(), Duration::from_millis(1));
        assert_eq!(cfg.proxy.effective_forward_queue(), 1);
    }

    #[test]
    fn rejects_unknown_isolation() {
        let res = serde_json::from_str::<AppConfig>(r#"{ "proxy": { "isolation": "thread" } }"#);
        assert!(res.is_err());
    }
}
