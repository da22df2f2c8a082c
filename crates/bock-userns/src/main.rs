//! Bock user namespace helper entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use miette::Diagnostic;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use bock_userns::cli::{Cli, EXIT_SETUP_FAILURE};

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_SETUP_FAILURE } else { 0 };
            err.print()?;
            std::process::exit(code);
        }
    };

    // Initialize tracing
    let level = if cli.debug { "bock_userns=debug" } else { "bock_userns=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    // Execute command
    if let Err(err) = cli.execute() {
        eprintln!("Error: {err}");
        if let Some(help) = err.help() {
            eprintln!("Help: {help}");
        }
        std::process::exit(EXIT_SETUP_FAILURE);
    }
    Ok(())
}
