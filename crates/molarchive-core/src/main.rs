#![warn(missing_docs)]

//! `molarc`: inspect, reindex and convert molecule archives.

use anyhow::Result;
use clap::Parser;
use molarchive_core::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Cli::parse().run()
}
