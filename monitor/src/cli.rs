use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use shared::errors::ConfigError;

use crate::backend::BackendKind;
use crate::config::{self, Config};

/// Command-line interface of the monitor binary.
#[derive(Parser, Debug)]
#[command(
    name = "monitor",
    version,
    about = "Attach to a memlog channel in target RAM via OpenOCD or a GDB server"
)]
pub struct Cli {
    /// Debug-server host
    #[arg(long)]
    pub host: Option<String>,

    /// Debug-server TCP port (default: 4444 telnet, 3333 gdb)
    #[arg(long)]
    pub port: Option<u16>,

    /// Channel address in target memory (hex with 0x prefix, or decimal)
    #[arg(long)]
    pub addr: Option<String>,

    /// Talk to a GDB remote-serial server instead of the OpenOCD telnet port
    #[arg(long)]
    pub gdb: bool,

    /// Read the whole channel region in one transaction per poll
    #[arg(long)]
    pub snapshot: bool,

    /// Hold the busy flag while reading log data
    #[arg(long)]
    pub blocking: bool,

    /// Prefix each log line with the local wall-clock time
    #[arg(long)]
    pub time: bool,

    /// Trace verbosity of the monitor itself (target output is unaffected)
    #[arg(long, value_enum)]
    pub trace_level: Option<TraceLevel>,

    /// Shorthand for --trace-level verbose
    #[arg(long)]
    pub verbose: bool,

    /// Read input answers from this file; exit when it ends
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Read input answers from this file, then fall back to stdin
    #[arg(long)]
    pub init_script: Option<PathBuf>,

    /// TOML config file (CLI flags override file values)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Poll interval in seconds
    #[arg(long)]
    pub interval: Option<f64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceLevel {
    Error,
    Warn,
    Info,
    Verbose,
}

impl TraceLevel {
    fn as_spec(self) -> &'static str {
        match self {
            TraceLevel::Error => "error",
            TraceLevel::Warn => "warn",
            TraceLevel::Info => "info",
            TraceLevel::Verbose => "trace",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(TraceLevel::Error),
            "warn" => Some(TraceLevel::Warn),
            "info" => Some(TraceLevel::Info),
            "verbose" => Some(TraceLevel::Verbose),
            _ => None,
        }
    }
}

/// Fully resolved settings: CLI over config file over defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kind: BackendKind,
    pub host: String,
    pub port: u16,
    pub addr: u64,
    pub snapshot: bool,
    pub blocking: bool,
    pub show_time: bool,
    pub interval: Duration,
    pub log_spec: String,
    pub input_file: Option<PathBuf>,
    pub init_script: Option<PathBuf>,
}

pub const DEFAULT_RING_ADDR: u64 = 0x2000_0000;

impl Settings {
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let cfg = match cli.config.clone().or_else(config::find_config_file) {
            Some(path) => Config::load(&path)?,
            None => Config::default(),
        };

        let kind = if cli.gdb || cfg.connection.gdb.unwrap_or(false) {
            BackendKind::Gdb
        } else {
            BackendKind::Openocd
        };

        let addr = match cli.addr.as_deref().or(cfg.connection.addr.as_deref()) {
            Some(s) => config::parse_addr(s).map_err(|()| {
                ConfigError::Validation(format!("`{s}` is not a target address"))
            })?,
            None => DEFAULT_RING_ADDR,
        };

        let level = cli
            .trace_level
            .or(if cli.verbose {
                Some(TraceLevel::Verbose)
            } else {
                None
            })
            .or_else(|| {
                cfg.session
                    .trace_level
                    .as_deref()
                    .and_then(TraceLevel::from_name)
            })
            .unwrap_or(TraceLevel::Info);

        let interval = cli
            .interval
            .or(cfg.session.interval)
            .unwrap_or(0.1)
            .max(0.001);

        Ok(Settings {
            kind,
            host: cli
                .host
                .or(cfg.connection.host)
                .unwrap_or_else(|| "localhost".into()),
            port: cli
                .port
                .or(cfg.connection.port)
                .unwrap_or_else(|| kind.default_port()),
            addr,
            snapshot: cli.snapshot || cfg.session.snapshot.unwrap_or(false),
            blocking: cli.blocking || cfg.session.blocking.unwrap_or(false),
            show_time: cli.time || cfg.session.time.unwrap_or(false),
            interval: Duration::from_secs_f64(interval),
            log_spec: level.as_spec().to_string(),
            input_file: cli.input_file,
            init_script: cli.init_script,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("monitor").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_select_the_telnet_backend() {
        let s = Settings::resolve(parse(&[])).unwrap();
        assert_eq!(s.kind, BackendKind::Openocd);
        assert_eq!(s.host, "localhost");
        assert_eq!(s.port, 4444);
        assert_eq!(s.addr, DEFAULT_RING_ADDR);
        assert_eq!(s.log_spec, "info");
        assert_eq!(s.interval, Duration::from_millis(100));
    }

    #[test]
    fn gdb_flag_switches_backend_and_port() {
        let s = Settings::resolve(parse(&["--gdb"])).unwrap();
        assert_eq!(s.kind, BackendKind::Gdb);
        assert_eq!(s.port, 3333);
    }

    #[test]
    fn explicit_port_beats_the_backend_default() {
        let s = Settings::resolve(parse(&["--gdb", "--port", "9000"])).unwrap();
        assert_eq!(s.port, 9000);
    }

    #[test]
    fn addr_accepts_hex() {
        let s = Settings::resolve(parse(&["--addr", "0x10008000"])).unwrap();
        assert_eq!(s.addr, 0x1000_8000);
        assert!(Settings::resolve(parse(&["--addr", "zzz"])).is_err());
    }

    #[test]
    fn verbose_is_a_level_shorthand() {
        let s = Settings::resolve(parse(&["--verbose"])).unwrap();
        assert_eq!(s.log_spec, "trace");
        let s = Settings::resolve(parse(&["--trace-level", "warn"])).unwrap();
        assert_eq!(s.log_spec, "warn");
    }

    #[test]
    fn interval_is_clamped_to_something_sane() {
        let s = Settings::resolve(parse(&["--interval", "0.0"])).unwrap();
        assert_eq!(s.interval, Duration::from_millis(1));
    }
}
