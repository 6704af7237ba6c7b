// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! # Flatcached server binary
//!
//! ## Usage
//!
//! ```sh
//! # defaults: binary TCP on 11212, 64 MiB arena
//! flatcached
//!
//! # bound memory, explicit ports, more workers
//! flatcached --maxbytes 268435456 --binary-port 11212 --binary-udpport 11213 --threads 8
//!
//! # load a config file, then override pieces of it
//! flatcached --config /etc/flatcached.toml --verbose 2
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use flatcached::core::settings::Settings;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Flatcached - in-memory cache server (memcached binary protocol)
#[derive(Parser)]
#[command(name = "flatcached")]
#[command(about = "In-memory key/value cache server speaking the memcached binary protocol", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML config file; CLI flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage arena cap in bytes
    #[arg(long)]
    maxbytes: Option<usize>,

    /// Soft cap on concurrent connections
    #[arg(long)]
    maxconns: Option<usize>,

    /// Binary-protocol TCP port (0 disables)
    #[arg(long)]
    binary_port: Option<u16>,

    /// Binary-protocol UDP port (0 disables)
    #[arg(long)]
    binary_udpport: Option<u16>,

    /// Interface to bind
    #[arg(long)]
    interf: Option<Ipv4Addr>,

    /// Worker thread count
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity 0..2
    #[arg(long, short)]
    verbose: Option<u8>,

    /// Fail stores instead of evicting when memory is exhausted
    #[arg(long)]
    no_evict: bool,

    /// Connection-buffer pool resident ceiling in bytes
    #[arg(long)]
    max_conn_buffer_bytes: Option<usize>,
}

fn build_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let mut settings = Settings::default();
            settings.apply_env();
            settings
        }
    };

    if let Some(maxbytes) = cli.maxbytes {
        settings.maxbytes = maxbytes;
    }
    if let Some(maxconns) = cli.maxconns {
        settings.maxconns = maxconns;
    }
    if let Some(port) = cli.binary_port {
        settings.binary_port = port;
    }
    if let Some(port) = cli.binary_udpport {
        settings.binary_udpport = port;
    }
    if let Some(interf) = cli.interf {
        settings.interf = interf;
    }
    if let Some(threads) = cli.threads {
        settings.num_threads = threads;
    }
    if let Some(verbose) = cli.verbose {
        settings.verbose = verbose;
    }
    if cli.no_evict {
        settings.evict_to_free = false;
    }
    if let Some(bytes) = cli.max_conn_buffer_bytes {
        settings.max_conn_buffer_bytes = bytes;
    }

    settings.validate().context("invalid configuration")?;
    Ok(settings)
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = build_settings(&cli)?;

    init_tracing(settings.verbose);
    flatcached::server::install_signal_handlers();

    flatcached::server::run(settings).context("server failed")?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
