// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use nscage_daemon::setup::{bring_up, BringUp};
use nscage_daemon::{DaemonConfig, Server};
use tracing_subscriber::EnvFilter;

/// Linux namespace container daemon. Runs as PID 1 in the container and
/// executes commands received over the control channel. Normally launched
/// by the orchestrator, not by hand.
#[derive(Parser, Debug)]
#[command(name = "nscaged", version)]
struct Cli {
    /// Establish this control channel for receiving commands
    #[arg(short = 'c', long = "control", value_name = "PATH")]
    control: PathBuf,

    /// Change to this directory before serving
    #[arg(short = 'C', long = "chdir", value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Log output to this file
    #[arg(short = 'l', long = "logfile", value_name = "PATH")]
    logfile: Option<PathBuf>,

    /// Write the container pid to this file
    #[arg(short = 'p', long = "pidfile", value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// Stay in the host namespaces (for debugging)
    #[arg(short = 'n', long = "no-namespaces")]
    no_namespaces: bool,

    /// Raise log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // fd 2 follows the logfile redirect performed during bring-up
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = DaemonConfig::new(cli.control);
    config.working_dir = cli.chdir;
    config.log_file = cli.logfile;
    config.pid_file = cli.pidfile;
    config.namespaces = !cli.no_namespaces;

    let (listener, endpoint) = match bring_up(&config)? {
        BringUp::Parent => return Ok(()),
        BringUp::Serve { listener, endpoint } => (listener, endpoint),
    };

    let _ = prctl::set_name("nscaged");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async { Server::new(listener, endpoint)?.run().await })
}
