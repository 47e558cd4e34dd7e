//! A write-behind caching file tree over a host directory.
use std::io::IsTerminal as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Caching file tree with write-behind and invalidations.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a zx-cfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the tree and read commands from stdin.
    Shell,

    /// Run one control command and print the resulting report.
    Ctl {
        /// The command, for example `debug on` or `sync`.
        #[arg(trailing_var_arg = true)]
        cmd: Vec<String>,
    },
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if let Err(e) = Trc::default().plain(!std::io::stderr().is_terminal()).init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }
    debug!(config = ?config, "Loaded configuration.");

    let res = match args.command.unwrap_or(Command::Shell) {
        Command::Shell => daemon::spawn(daemon::run(config)),
        Command::Ctl { cmd } => daemon::spawn(daemon::ctl(config, &cmd.join(" "))),
    };
    if let Err(e) = res {
        error!("{e}");
        std::process::exit(1);
    }
}
