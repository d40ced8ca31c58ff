// Copyright 2025 Scatterstore Developers
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Convergent AONT-RS dispersal codec
//!
//! A secret is packaged with an all-or-nothing transform keyed by its own
//! content hash, then Reed-Solomon coded into `n` equal shares of which any
//! `m` reconstruct. The same secret always produces the same shares, which
//! is what makes server-side deduplication possible.
//!
//! Package layout before coding: `AEAD(secret, key) || (key XOR H(ct))`,
//! zero-padded to `m` aligned shards. Without `m` shares neither the
//! ciphertext nor the masked key can be recovered.

use crate::config::DispersalParams;
use crate::crypto::{CryptoEngine, EncryptionKey, KEY_SIZE};
use crate::{EngineError, Result};
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

/// AES-GCM authentication tag width
const TAG_SIZE: usize = 16;

/// Shard alignment required by the Reed-Solomon backend
const SHARD_ALIGN: usize = 64;

/// Secret-to-shares codec, deterministic under the same secret
pub struct DispersalCodec {
    params: DispersalParams,
    crypto: CryptoEngine,
}

impl DispersalCodec {
    /// Create a codec for the given parameters and security profile
    pub fn new(params: DispersalParams, crypto: CryptoEngine) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, crypto })
    }

    /// Share length for a secret of `secret_size` bytes
    pub fn share_size(&self, secret_size: usize) -> usize {
        let package = secret_size + TAG_SIZE + KEY_SIZE;
        let per_shard = package.div_ceil(self.params.m as usize);
        per_shard.div_ceil(SHARD_ALIGN).max(1) * SHARD_ALIGN
    }

    /// Encode a secret into `n` equal-length shares
    pub fn encode(&self, secret: &[u8]) -> Result<Vec<Vec<u8>>> {
        let m = self.params.m as usize;
        let parity = self.params.parity() as usize;

        // All-or-nothing package: ciphertext followed by the masked key
        let key = self.crypto.derive_key(secret);
        let ct = self.crypto.encrypt(secret, &key)?;
        let mask = self.crypto.fingerprint(&ct);
        let mut package = ct;
        for i in 0..KEY_SIZE {
            package.push(key.as_bytes()[i] ^ mask[i]);
        }

        let shard_size = self.share_size(secret.len());
        package.resize(m * shard_size, 0);

        let mut shares: Vec<Vec<u8>> = package
            .chunks(shard_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        if parity > 0 {
            let mut encoder = ReedSolomonEncoder::new(m, parity, shard_size)
                .map_err(|e| EngineError::Crypto(format!("dispersal encoder: {e}")))?;
            for shard in &shares {
                encoder
                    .add_original_shard(shard)
                    .map_err(|e| EngineError::Crypto(format!("dispersal encoder: {e}")))?;
            }
            let result = encoder
                .encode()
                .map_err(|e| EngineError::Crypto(format!("dispersal encoder: {e}")))?;
            shares.extend(result.recovery_iter().map(|s| s.to_vec()));
        }

        Ok(shares)
    }

    /// Reconstruct a secret of `secret_size` bytes from at least `m` shares,
    /// given as `(share_id, bytes)` pairs with ids in `0..n`.
    pub fn decode(&self, shares: &[(usize, &[u8])], secret_size: usize) -> Result<Vec<u8>> {
        let m = self.params.m as usize;
        let n = self.params.n as usize;
        let parity = self.params.parity() as usize;

        if shares.len() < m {
            return Err(EngineError::Crypto(format!(
                "insufficient shares for reconstruction: have {}, need {m}",
                shares.len()
            )));
        }
        let shard_size = self.share_size(secret_size);
        for (id, share) in shares {
            if *id >= n {
                return Err(EngineError::Crypto(format!(
                    "share id {id} out of bounds for n={n}"
                )));
            }
            if share.len() != shard_size {
                return Err(EngineError::Integrity(format!(
                    "share {id} has {} bytes, expected {shard_size}",
                    share.len()
                )));
            }
        }

        // Collect the original shards, repairing through the decoder only
        // when some of the first m are missing.
        let mut originals: Vec<Option<Vec<u8>>> = vec![None; m];
        for (id, share) in shares {
            if *id < m {
                originals[*id] = Some(share.to_vec());
            }
        }

        if originals.iter().any(|s| s.is_none()) {
            let present = originals.iter().filter(|s| s.is_some()).count();
            let mut decoder = ReedSolomonDecoder::new(m, parity, shard_size)
                .map_err(|e| EngineError::Crypto(format!("dispersal decoder: {e}")))?;
            for (id, shard) in originals.iter().enumerate() {
                if let Some(shard) = shard {
                    decoder
                        .add_original_shard(id, shard)
                        .map_err(|e| EngineError::Crypto(format!("dispersal decoder: {e}")))?;
                }
            }
            let mut fed = present;
            let mut seen_recovery = vec![false; parity];
            for (id, share) in shares {
                if *id >= m && fed < m && !seen_recovery[*id - m] {
                    seen_recovery[*id - m] = true;
                    decoder
                        .add_recovery_shard(*id - m, share)
                        .map_err(|e| EngineError::Crypto(format!("dispersal decoder: {e}")))?;
                    fed += 1;
                }
            }
            let result = decoder
                .decode()
                .map_err(|e| EngineError::Crypto(format!("dispersal decoder: {e}")))?;
            for (idx, shard) in result.restored_original_iter() {
                originals[idx] = Some(shard.to_vec());
            }
        }

        let mut package = Vec::with_capacity(m * shard_size);
        for shard in originals {
            let shard = shard.ok_or_else(|| {
                EngineError::Crypto("reconstruction left an original shard missing".into())
            })?;
            package.extend_from_slice(&shard);
        }

        // Undo the all-or-nothing transform
        let ct_len = secret_size + TAG_SIZE;
        if package.len() < ct_len + KEY_SIZE {
            return Err(EngineError::Integrity(format!(
                "package of {} bytes cannot hold a {secret_size}-byte secret",
                package.len()
            )));
        }
        let (ct, rest) = package.split_at(ct_len);
        let mask = self.crypto.fingerprint(ct);
        let mut key_bytes = [0u8; KEY_SIZE];
        for i in 0..KEY_SIZE {
            key_bytes[i] = rest[i] ^ mask[i];
        }
        let key = EncryptionKey::new(key_bytes);

        let secret = self.crypto.decrypt(ct, &key)?;
        if secret.len() != secret_size {
            return Err(EngineError::Integrity(format!(
                "decoded secret has {} bytes, expected {secret_size}",
                secret.len()
            )));
        }
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProfile;

    fn codec(n: u8, m: u8, r: u8) -> DispersalCodec {
        DispersalCodec::new(
            DispersalParams::new(n, m, r).unwrap(),
            CryptoEngine::new(SecurityProfile::High),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_shape() {
        let codec = codec(4, 3, 1);
        let secret = vec![7u8; 5000];
        let shares = codec.encode(&secret).unwrap();
        assert_eq!(shares.len(), 4);
        let len = shares[0].len();
        assert!(shares.iter().all(|s| s.len() == len));
        assert_eq!(len % 64, 0);
        assert_eq!(len, codec.share_size(secret.len()));
    }

    #[test]
    fn test_roundtrip_all_shares() {
        let codec = codec(4, 3, 1);
        let secret: Vec<u8> = (0..9999u32).map(|i| (i % 251) as u8).collect();
        let shares = codec.encode(&secret).unwrap();
        let refs: Vec<(usize, &[u8])> = shares.iter().enumerate().map(|(i, s)| (i, &s[..])).collect();
        assert_eq!(codec.decode(&refs, secret.len()).unwrap(), secret);
    }

    #[test]
    fn test_roundtrip_every_m_subset() {
        let codec = codec(4, 3, 1);
        let secret = b"any m of n shares must reconstruct the secret".to_vec();
        let shares = codec.encode(&secret).unwrap();

        for skip in 0..4 {
            let subset: Vec<(usize, &[u8])> = shares
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(i, s)| (i, &s[..]))
                .collect();
            assert_eq!(
                codec.decode(&subset, secret.len()).unwrap(),
                secret,
                "failed with share {skip} missing"
            );
        }
    }

    #[test]
    fn test_deterministic_shares() {
        let codec = codec(5, 3, 2);
        let secret = vec![42u8; 1234];
        assert_eq!(codec.encode(&secret).unwrap(), codec.encode(&secret).unwrap());
    }

    #[test]
    fn test_tampered_share_detected() {
        let codec = codec(4, 3, 1);
        let secret = vec![9u8; 2048];
        let mut shares = codec.encode(&secret).unwrap();
        shares[0][10] ^= 0xff;
        let refs: Vec<(usize, &[u8])> = shares
            .iter()
            .enumerate()
            .take(3)
            .map(|(i, s)| (i, &s[..]))
            .collect();
        assert!(codec.decode(&refs, secret.len()).is_err());
    }

    #[test]
    fn test_insufficient_shares() {
        let codec = codec(4, 3, 1);
        let secret = vec![1u8; 100];
        let shares = codec.encode(&secret).unwrap();
        let refs: Vec<(usize, &[u8])> = shares.iter().enumerate().take(2).map(|(i, s)| (i, &s[..])).collect();
        assert!(codec.decode(&refs, secret.len()).is_err());
    }

    #[test]
    fn test_no_parity_configuration() {
        // n == m degenerates to plain splitting of the package
        let codec = codec(3, 3, 1);
        let secret = vec![5u8; 777];
        let shares = codec.encode(&secret).unwrap();
        assert_eq!(shares.len(), 3);
        let refs: Vec<(usize, &[u8])> = shares.iter().enumerate().map(|(i, s)| (i, &s[..])).collect();
        assert_eq!(codec.decode(&refs, secret.len()).unwrap(), secret);
    }
}
