// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod config;
mod control;
mod exec;
mod manager;
mod mount;
mod timers;
mod unit_name;
mod units;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "mountd")]
#[command(about = "A mount point manager", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// The path to a config file. By default, /etc/mountd/mountd.toml is
    /// used (if present).
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Run as a per-user manager: every mount on the system is treated as
    /// extrinsic.
    #[arg(long)]
    user: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let version = format!("mountd {}", env!("CARGO_PKG_VERSION"));
    if args.version {
        println!("{}", version);
        return Ok(());
    }

    init_logging()?;
    debug!(version, "starting up");

    let cfg = config::Config::new(args.config.as_ref(), args.user)
        .context("failed to read config")?;

    let mut mgr = manager::Manager::new(cfg).context("failed to initialize")?;

    let shutdown = mgr.shutdown_handle();
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        shutdown.request();
    })?;

    info!("managing mounts");
    mgr.run().context("manager exited")?;

    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("mountd=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}
