//! Skiff CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use skiff::cli::{Cli, EXIT_MANAGER_ERROR};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments; usage errors are manager errors, not guest exits
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            std::process::exit(EXIT_MANAGER_ERROR);
        }
        Err(err) => err.exit(),
    };

    // Initialize tracing
    let directive = if cli.debug { "skiff=debug" } else { "skiff=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    // Execute command
    let code = cli.execute().await?;
    std::process::exit(code);
}
