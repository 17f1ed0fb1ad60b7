mod app;
mod cli;
mod commands;
mod config;
mod error;
mod quota;
mod routing;
mod server;
mod signature;
mod stream;
mod toast;
mod transform;
mod upstream;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = cli::Cli::parse();
    let app = app::App::new(cli)?;
    app.run().await
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Some chat clients spawn the proxy and read its stdout; keep tracing on stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
