//! Backup server: listens on a metadata port and a data port, each backed
//! by its own dedup engine over a shared on-disk layout.

use anyhow::Result;
use clap::Parser;
use scatterstore::config::SecurityProfile;
use scatterstore::Server;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scatter-server", about = "Multi-cloud deduplicating backup server")]
struct Cli {
    /// Port for metadata-chunk traffic and recipe operations
    meta_port: u16,

    /// Port for data-share traffic
    data_port: u16,

    /// Directory holding the meta/ storage tree
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Fingerprint profile, must match the clients
    #[arg(long, default_value = "HIGH", value_parser = parse_profile)]
    profile: SecurityProfile,
}

fn parse_profile(s: &str) -> std::result::Result<SecurityProfile, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let server = Server::bind(
        ("0.0.0.0", cli.meta_port),
        ("0.0.0.0", cli.data_port),
        &cli.root,
        cli.profile,
    )?;
    server.run()?;
    Ok(())
}
