mod cli;
mod clickup;
mod config;
mod error;
mod model;
mod source;
mod sync;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr so --json output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("beansync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("sync") => cli::handle_sync(&args[1..]).await,
        Some("unlink") => cli::handle_unlink(&args[1..]).await,
        Some("help") | Some("--help") | Some("-h") | None => {
            cli::print_help();
            Ok(())
        }
        Some(other) => {
            cli::print_help();
            anyhow::bail!("Unknown command: {other}");
        }
    }
}
