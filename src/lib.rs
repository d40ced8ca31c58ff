// Copyright 2025 Scatterstore Developers
// SPDX-License-Identifier: AGPL-3.0-or-later

//! # Scatterstore - Multi-Cloud Deduplicating Backup
//!
//! This crate implements a backup engine that chunks a file into secrets,
//! transforms each secret into `n` shares with a convergent dispersal code,
//! and routes the i-th share to the i-th remote storage server. Servers
//! deduplicate shares within and across users, pack accepted shares into
//! append-only containers backed by a persistent index, and stream shares
//! back for reconstruction from any `m` of `n` survivors.
//!
//! ## Features
//! - Convergent AONT-RS dispersal (deterministic shares, any-m recovery)
//! - Two-stage intra-user / inter-user server deduplication
//! - Metadata chunks deduplicated like data, unlocked by a key recipe
//! - Parallel encode/decode pipelines with order-preserving collectors

use thiserror::Error;

pub mod chunker;
pub mod config;
pub mod crypto;
pub mod decoder;
pub mod dedup;
pub mod dispersal;
pub mod downloader;
pub mod encoder;
pub mod net;
pub mod protocol;
pub mod transport;
pub mod uploader;

pub use config::{DispersalParams, Endpoints, SecurityProfile};
pub use dedup::{DedupEngine, EngineConfig};
pub use dispersal::DispersalCodec;
pub use transport::Server;

/// Errors that can occur across the client pipeline and the dedup engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Index error: {0}")]
    Kv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        EngineError::Kv(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
