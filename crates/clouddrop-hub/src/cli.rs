//! Hub CLI implementation.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for clouddrop_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => clouddrop_core::LogFormat::Text,
            CliLogFormat::Json => clouddrop_core::LogFormat::Json,
        }
    }
}

/// CloudDrop signaling hub.
#[derive(Debug, Parser)]
#[command(
    name = "clouddrop-hub",
    version,
    about = "CloudDrop signaling hub - room membership and frame relay"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8787")]
    pub port: u16,

    /// JSON file with the ICE server list served at /api/ice-servers
    #[arg(long = "ice-servers", value_name = "FILE")]
    pub ice_servers_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = CliLogFormat::Text)]
    pub log_format: CliLogFormat,

    /// Write logs to a file instead of stderr
    #[arg(long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["clouddrop-hub"]);
        assert_eq!(cli.port, 8787);
        assert_eq!(cli.bind_addr.to_string(), "0.0.0.0");
        assert_eq!(cli.verbose, 0);
        assert!(cli.ice_servers_file.is_none());
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["clouddrop-hub", "-vvv"]);
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn log_format_parses() {
        let cli = Cli::parse_from(["clouddrop-hub", "--log-format", "json"]);
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }
}
