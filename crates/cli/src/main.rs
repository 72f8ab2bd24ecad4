//! Main entry point for the SBC sidecar runtime CLI
//!
//! Talks to a running sidecar over its control socket to drain feature
//! servers and to read or change runtime configuration.

mod client;
mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use tracing::debug;

use sbc_sidecar_core::config::DEFAULT_SOCKET_PATH;

use crate::client::ControlClient;
use crate::commands::Command;

const EXAMPLES: &str = "Examples:
  sbc-cli fs drain 192.168.1.10
  sbc-cli fs active
  sbc-cli set log_level debug";

#[derive(Debug, Parser)]
#[command(name = "sbc-cli", version, about = "SBC Runtime CLI", after_help = EXAMPLES)]
struct Cli {
    /// Control socket of the running sidecar
    #[arg(long, short = 's', env = "SBC_SOCKET_PATH", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Seconds to wait for the sidecar to answer
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Log socket traffic to stderr
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    async fn execute(self) -> anyhow::Result<()> {
        let Some(command) = self.command else {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        };

        let request = command.request()?;
        debug!(socket = %self.socket.display(), action = request.action(), "Sending command");

        let client = ControlClient::new(self.socket, Duration::from_secs(self.timeout));
        let response = client.send(&request).await?;
        for line in command.render(&response)? {
            println!("{}", line);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return;
        }
        Err(e) => exit_with_error(&usage_error(&e)),
    };

    if cli.verbose {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }

    if let Err(e) = cli.execute().await {
        exit_with_error(&e.to_string());
    }
}

/// One-line message for an argument the parser refused
fn usage_error(err: &clap::Error) -> String {
    if err.kind() == ErrorKind::InvalidSubcommand {
        if let Some(ContextValue::String(name)) = err.get(ContextKind::InvalidSubcommand) {
            return format!("Unknown command: {}. Run without arguments for help.", name);
        }
    }
    let rendered = err.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.trim_start_matches("error: ").to_string()
}

fn exit_with_error(message: &str) -> ! {
    eprintln!("{} {}", "Error:".red(), message);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_arguments_means_help() {
        let cli = Cli::try_parse_from(["sbc-cli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn unknown_command_message() {
        let err = Cli::try_parse_from(["sbc-cli", "reboot"]).unwrap_err();
        assert_eq!(
            usage_error(&err),
            "Unknown command: reboot. Run without arguments for help."
        );
    }

    #[test]
    fn socket_flag_overrides_default() {
        let cli = Cli::try_parse_from(["sbc-cli", "--socket", "/run/sbc.sock", "list"]).unwrap();
        assert_eq!(cli.socket, PathBuf::from("/run/sbc.sock"));
        assert!(matches!(cli.command, Some(Command::List)));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
