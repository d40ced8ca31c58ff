//! Backup client: chunk, disperse, and upload a file to N clouds, or
//! restore it from any m of them.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use scatterstore::chunker::Chunker;
use scatterstore::config::{DispersalParams, Endpoints, SecurityProfile};
use scatterstore::downloader::Downloader;
use scatterstore::encoder::{Encoder, Secret, SecretItem};
use scatterstore::uploader::Uploader;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "scatter-client",
    about = "Multi-cloud deduplicating backup client",
    group(ArgGroup::new("action").required(true).args(["upload", "download", "all"]))
)]
struct Cli {
    /// Full path of the file
    filepath: String,

    /// Numeric user id of this client
    user_id: i32,

    /// Upload the file
    #[arg(short = 'u')]
    upload: bool,

    /// Download the file into <filepath>.d
    #[arg(short = 'd')]
    download: bool,

    /// Upload, then download
    #[arg(short = 'a')]
    all: bool,

    /// HIGH = AES-256 & SHA-256, LOW = AES-128 & SHA-1
    #[arg(value_parser = parse_profile)]
    security: SecurityProfile,

    /// Total number of shares per secret
    #[arg(long, default_value_t = 4)]
    n: u8,

    /// Reconstruction threshold
    #[arg(long, default_value_t = 3)]
    m: u8,

    /// Confidentiality degree
    #[arg(long, default_value_t = 1)]
    r: u8,

    /// Key-recipe passphrase (falls back to SCATTERSTORE_PASS)
    #[arg(long)]
    pass: Option<String>,
}

fn parse_profile(s: &str) -> std::result::Result<SecurityProfile, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let params = DispersalParams::new(cli.n, cli.m, cli.r)?;
    let passphrase = cli
        .pass
        .clone()
        .or_else(|| std::env::var("SCATTERSTORE_PASS").ok())
        .unwrap_or_else(|| "test".to_owned());

    let started = Instant::now();

    if cli.upload || cli.all {
        upload(&cli, params, &passphrase)?;
    }
    if cli.download || cli.all {
        download(&cli, params, &passphrase)?;
    }

    info!(elapsed = ?started.elapsed(), "done");
    Ok(())
}

fn upload(cli: &Cli, params: DispersalParams, passphrase: &str) -> Result<()> {
    let endpoints = Endpoints::load(Path::new("./config-u"), params.n as usize)
        .context("loading ./config-u")?;

    let file = File::open(&cli.filepath)
        .with_context(|| format!("opening {}", cli.filepath))?;
    let file_size = file.metadata()?.len() as i64;
    if file_size == 0 {
        bail!("refusing to upload an empty file");
    }

    let uploader = Uploader::new(&endpoints, cli.user_id, &cli.filepath)?;
    let mut encoder = Encoder::new(params, cli.security, passphrase, uploader.sinks())?;

    encoder.submit(SecretItem::FileHeader {
        path: cli.filepath.clone().into_bytes(),
        file_size,
    })?;

    let mut id = 0i32;
    let mut pending: Option<Vec<u8>> = None;
    for chunk in Chunker::new(BufReader::new(file)) {
        let chunk = chunk?;
        if let Some(data) = pending.replace(chunk) {
            encoder.submit(SecretItem::Secret(Secret {
                id,
                data,
                end: false,
            }))?;
            id += 1;
        }
    }
    let last = pending.context("chunker produced no secrets")?;
    encoder.submit(SecretItem::Secret(Secret {
        id,
        data: last,
        end: true,
    }))?;

    encoder.join()?;
    let (total, unique) = uploader.join()?;
    info!(
        secrets = id + 1,
        total_bytes = total,
        unique_bytes = unique,
        "upload finished"
    );
    Ok(())
}

fn download(cli: &Cli, params: DispersalParams, passphrase: &str) -> Result<()> {
    let k = params.m as usize;
    let endpoints =
        Endpoints::load(Path::new("./config-d"), k).context("loading ./config-d")?;

    let downloader = Downloader::new(
        params,
        cli.security,
        endpoints,
        (0..k).collect(),
        cli.user_id,
        &cli.filepath,
        passphrase,
    )?;

    downloader.pre_download()?;
    let output = format!("{}.d", cli.filepath);
    let written = downloader.download(Path::new(&output))?;
    info!(output, written, "download finished");
    Ok(())
}
