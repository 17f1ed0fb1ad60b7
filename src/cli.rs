use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the local Pollinations proxy.
#[derive(Debug, Parser)]
#[command(author, version, about = "Local routing proxy for the Pollinations chat API", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to the user config directory).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Listen address override, e.g. 127.0.0.1:10001.
    #[arg(long, value_name = "ADDR")]
    pub listen_addr: Option<String>,
}
