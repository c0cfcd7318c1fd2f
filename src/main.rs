use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // Parse CLI first to check the verbose flag.
    let cli = cli::Cli::parse();

    // Log to stderr to keep stdout clean for structured output.
    // --verbose sets debug level, otherwise use RUST_LOG or a sane default.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli).await
}
