use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use punch_cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panicking if tracing is already initialized.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    punch_cli::run(cli, &mut std::io::stdout())
}
