use serde::Deserialize;
use shared::errors::ConfigError;
use std::{env, fs, path::Path, path::PathBuf};

/// Optional monitor configuration, loaded from TOML. Every field has a CLI
/// counterpart; command-line values win over file values.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Debug-backend connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Session behaviour settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// `[connection]` section.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectionConfig {
    /// Debug-server host
    pub host: Option<String>,
    /// Debug-server TCP port
    pub port: Option<u16>,
    /// Channel address in target memory, e.g. "0x20000000"
    pub addr: Option<String>,
    /// Use the GDB remote-serial backend instead of the telnet interpreter
    pub gdb: Option<bool>,
}

/// `[session]` section.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SessionConfig {
    /// Snapshot polling mode
    pub snapshot: Option<bool>,
    /// Take the busy flag around reads
    pub blocking: Option<bool>,
    /// Prefix drained lines with wall-clock timestamps
    pub time: Option<bool>,
    /// Poll interval in seconds
    pub interval: Option<f64>,
    /// One of error/warn/info/verbose
    pub trace_level: Option<String>,
}

const TRACE_LEVELS: [&str; 4] = ["error", "warn", "info", "verbose"];

impl Config {
    /// Load, parse, and validate a `Config` from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: Config = toml::from_str(&s).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.port == Some(0) {
            return Err(ConfigError::Validation(
                "connection.port must be > 0".into(),
            ));
        }
        if let Some(addr) = &self.connection.addr {
            parse_addr(addr).map_err(|()| {
                ConfigError::Validation(format!("connection.addr `{addr}` is not an address"))
            })?;
        }
        if let Some(interval) = self.session.interval {
            if !(interval > 0.0) {
                return Err(ConfigError::Validation(
                    "session.interval must be > 0".into(),
                ));
            }
        }
        if let Some(level) = &self.session.trace_level {
            if !TRACE_LEVELS.contains(&level.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "session.trace_level must be one of {}",
                    TRACE_LEVELS.join("/")
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn from_str(toml: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(toml).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Parses a target address: `0x`-prefixed hex or plain decimal.
pub fn parse_addr(s: &str) -> Result<u64, ()> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| ())
    } else {
        s.parse::<u64>().map_err(|_| ())
    }
}

/// Find the config path from an override environment variable; the CLI
/// `--config` flag takes precedence at the call site. Returns `None` when
/// nothing is configured, which is the common case.
pub fn find_config_file() -> Option<PathBuf> {
    env::var_os("MEMLOG_MONITOR_CONFIG").map(PathBuf::from)
}
