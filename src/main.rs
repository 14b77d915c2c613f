use anyhow::Result;
use clap::Parser;
use devshell::cli::Cli;
use devshell::commands;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for activation scripts and reports
    let default_filter = if cli.verbose {
        "devshell=debug"
    } else {
        "devshell=warn"
    };
    let env_filter = EnvFilter::try_from_env("DEVSHELL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    // Execute command
    commands::execute(cli)
}
