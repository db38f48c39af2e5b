#![warn(missing_docs)]

//! fairqctl entry point.

use std::process::ExitCode;

use clap::Parser;
use fairq_ctl::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    ExitCode::from(cli.run().await)
}
