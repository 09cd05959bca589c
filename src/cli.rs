//! Command-line interface for the `helm` operator surface (spec.md §6).
use crate::ipc::StartMode;
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// `--mode development|production`, mirroring `DEV_MODE` (spec.md §6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModeArg {
    Development,
    #[default]
    Production,
}

impl From<ModeArg> for StartMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Development => StartMode::Development,
            ModeArg::Production => StartMode::Production,
        }
    }
}

impl FromStr for ModeArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(ModeArg::Development),
            "production" | "prod" => Ok(ModeArg::Production),
            other => Err(format!("invalid mode '{other}' (expected development|production)")),
        }
    }
}

/// Command-line interface for the Helm orchestrator.
#[derive(Parser)]
#[command(name = "helm", version, author)]
#[command(about = "Orchestrator core: service discovery, supervision, and control API", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Override the install root this invocation operates against
    /// (defaults to `$HELM_INSTALL_ROOT` or `/opt/hivematrix`).
    #[arg(long, value_name = "PATH", global = true)]
    pub install_root: Option<String>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for `helm`.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the resident orchestrator: boots every subsystem, serves the
    /// control API, and runs the health-monitor loop until terminated.
    Serve {
        /// Address the control API binds to.
        #[arg(long, default_value = "127.0.0.1:8800")]
        bind: String,
    },

    /// Start one named service, or every service (ascending install-order
    /// bands) when no name is given.
    Start {
        /// Name of the service to start. Omit to start the full catalog.
        name: Option<String>,

        /// Process-invocation mode (default: production, or `DEV_MODE`'s
        /// setting when no explicit mode is given).
        #[arg(long)]
        mode: Option<ModeArg>,
    },

    /// Stop one named service, or every service (descending install-order
    /// bands) when no name is given.
    Stop {
        /// Name of the service to stop. Omit to stop the full catalog.
        name: Option<String>,
    },

    /// Stop then start a service (or the whole catalog).
    Restart {
        /// Name of the service to restart. Omit to restart the full catalog.
        name: Option<String>,

        #[arg(long)]
        mode: Option<ModeArg>,
    },

    /// Print one line per service: `name status health pid port`.
    Status {
        /// Restrict output to a single service.
        name: Option<String>,

        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the full service catalog.
    List,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
