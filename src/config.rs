//! Configuration for the dispersal pipeline and the cloud endpoints
//!
//! This module provides the dispersal parameters, the security profile
//! selection, the pipeline tunables, and the loader for the line-per-cloud
//! endpoint files (`config-u` for upload, `config-d` for download).

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// Maximum secret size produced by the chunker
pub const SECRET_MAX: usize = 16 * 1024;

/// Minimum / average chunk sizes for content-defined chunking
pub const SECRET_MIN: usize = 2 * 1024;
pub const SECRET_AVG: usize = 8 * 1024;

/// Upload batch buffer capacity (metadata and data alike)
pub const UPLOAD_MAX: usize = 4 * 1024 * 1024;

/// Server-side container capacity
pub const CONTAINER_MAX: usize = 4 * 1024 * 1024;

/// Restore-path share file buffer capacity
pub const SHARE_FILE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Number of full containers kept in memory on the restore path
pub const NUM_OF_CACHED_CONTAINERS: usize = 4;

/// Metadata-chunk segmentation constants. The divisor/pattern pair drives
/// the content-defined cut decision on share fingerprints; the size bound
/// is compared against accumulated encoded share bytes.
pub const AVG_SEGMENT_SIZE: u64 = 1 << 20;
pub const MIN_SEGMENT_SIZE: u64 = 1 << 19;
pub const MAX_SEGMENT_SIZE: u64 = 1 << 21;
pub const SEGMENT_DIVISOR: u32 = ((AVG_SEGMENT_SIZE - MIN_SEGMENT_SIZE) / (8 * 2048)) as u32;
pub const SEGMENT_PATTERN: u32 = SEGMENT_DIVISOR - 1;

/// Worker counts for the encode/decode pipelines
pub const ENCODER_WORKERS: usize = 2;
pub const DECODER_WORKERS: usize = 2;

/// Bounded channel depth between pipeline stages
pub const QUEUE_DEPTH: usize = 1024;

/// Dispersal parameters: `n` total shares, any `m` reconstruct, and fewer
/// than `r` shares reveal nothing about the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispersalParams {
    /// Total number of shares per secret
    pub n: u8,
    /// Reconstruction threshold
    pub m: u8,
    /// Confidentiality degree
    pub r: u8,
}

impl DispersalParams {
    /// Create and validate dispersal parameters
    pub fn new(n: u8, m: u8, r: u8) -> Result<Self> {
        let params = Self { n, m, r };
        params.validate()?;
        Ok(params)
    }

    /// Validate the (n, m, r) relationship
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.n == 0 {
            return Err(EngineError::Config(format!(
                "invalid dispersal parameters: n={}, m={}",
                self.n, self.m
            )));
        }
        if self.m > self.n {
            return Err(EngineError::Config(format!(
                "reconstruction threshold m={} exceeds total shares n={}",
                self.m, self.n
            )));
        }
        if self.r >= self.m {
            return Err(EngineError::Config(format!(
                "confidentiality degree r={} must be below m={}",
                self.r, self.m
            )));
        }
        Ok(())
    }

    /// Number of parity shares generated on top of the `m` data shares
    pub fn parity(&self) -> u8 {
        self.n - self.m
    }
}

impl Default for DispersalParams {
    fn default() -> Self {
        Self { n: 4, m: 3, r: 1 }
    }
}

/// Hash and cipher strength selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProfile {
    /// AES-256-GCM + SHA-256
    High,
    /// AES-128-GCM + SHA-1
    Low,
}

impl FromStr for SecurityProfile {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HIGH" => Ok(SecurityProfile::High),
            "LOW" => Ok(SecurityProfile::Low),
            other => Err(EngineError::Config(format!(
                "unknown security profile '{other}' (expected HIGH or LOW)"
            ))),
        }
    }
}

/// Resolved endpoints for one client session: `n` metadata services and
/// `n` data services, in cloud order.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub meta: Vec<SocketAddr>,
    pub data: Vec<SocketAddr>,
}

impl Endpoints {
    /// Build from already-resolved addresses
    pub fn new(meta: Vec<SocketAddr>, data: Vec<SocketAddr>) -> Result<Self> {
        if meta.len() != data.len() || meta.is_empty() {
            return Err(EngineError::Config(format!(
                "endpoint counts mismatch: {} metadata vs {} data",
                meta.len(),
                data.len()
            )));
        }
        Ok(Self { meta, data })
    }

    /// Load a `config-u` / `config-d` style file: one `host:port` per line,
    /// the first `n` lines are metadata endpoints, the next `n` data.
    pub fn load(path: &Path, n: usize) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read endpoint file {}: {e}", path.display()))
        })?;
        let mut addrs = Vec::with_capacity(2 * n);
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let addr: SocketAddr = line.parse().map_err(|_| {
                EngineError::Config(format!(
                    "{}:{}: malformed endpoint '{line}'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            addrs.push(addr);
        }
        if addrs.len() < 2 * n {
            return Err(EngineError::Config(format!(
                "{}: expected {} endpoint lines, found {}",
                path.display(),
                2 * n,
                addrs.len()
            )));
        }
        let data = addrs.split_off(n);
        Endpoints::new(addrs, data.into_iter().take(n).collect())
    }

    /// Number of clouds
    pub fn clouds(&self) -> usize {
        self.meta.len()
    }

    /// Restrict to the first `k` clouds for a download session
    pub fn take(&self, k: usize) -> Result<Self> {
        if k > self.clouds() {
            return Err(EngineError::Config(format!(
                "requested {k} clouds but only {} configured",
                self.clouds()
            )));
        }
        Ok(Self {
            meta: self.meta[..k].to_vec(),
            data: self.data[..k].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_params_validation() {
        assert!(DispersalParams::new(4, 3, 1).is_ok());
        assert!(DispersalParams::new(8, 5, 3).is_ok());
        assert!(DispersalParams::new(3, 4, 1).is_err());
        assert!(DispersalParams::new(4, 0, 0).is_err());
        assert!(DispersalParams::new(4, 3, 3).is_err());
    }

    #[test]
    fn test_segment_constants() {
        // divisor must stay a power of two so the cut test can mask
        assert_eq!(SEGMENT_DIVISOR & (SEGMENT_DIVISOR - 1), 0);
        assert_eq!(SEGMENT_DIVISOR, 32);
        assert_eq!(SEGMENT_PATTERN, 31);
    }

    #[test]
    fn test_endpoint_file_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for port in [9001, 9002, 9101, 9102] {
            writeln!(f, "127.0.0.1:{port}").unwrap();
        }
        let eps = Endpoints::load(f.path(), 2).unwrap();
        assert_eq!(eps.clouds(), 2);
        assert_eq!(eps.meta[0].port(), 9001);
        assert_eq!(eps.data[1].port(), 9102);

        let one = eps.take(1).unwrap();
        assert_eq!(one.clouds(), 1);
        assert!(eps.take(3).is_err());
    }

    #[test]
    fn test_endpoint_file_truncated() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "127.0.0.1:9001").unwrap();
        assert!(Endpoints::load(f.path(), 2).is_err());
    }
}
