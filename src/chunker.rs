//! Content-defined chunking of the input byte stream into secrets
//!
//! The chunker parameters must remain stable across versions, otherwise the
//! same content no longer produces the same secrets and deduplication
//! silently degrades.

use crate::config::{SECRET_AVG, SECRET_MAX, SECRET_MIN};
use crate::{EngineError, Result};
use fastcdc::v2020::{Normalization, StreamCDC};
use std::io::Read;

/// Variable-size content-defined chunker producing secrets of at most
/// [`SECRET_MAX`] bytes.
pub struct Chunker<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Chunker<R> {
    /// Wrap a reader with the pipeline's fixed chunking geometry
    pub fn new(reader: R) -> Self {
        Self {
            inner: StreamCDC::with_level(
                reader,
                SECRET_MIN as u32,
                SECRET_AVG as u32,
                SECRET_MAX as u32,
                Normalization::Level1,
            ),
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(chunk) => Some(Ok(chunk.data)),
            Err(e) => Some(Err(EngineError::Io(std::io::Error::other(e)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        use rand::{RngCore, SeedableRng};
        // fixed seed so boundaries are reproducible across runs
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x9e3779b97f4a7c15);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_chunks_reassemble() {
        let data = sample(200_000);
        let chunks: Vec<Vec<u8>> = Chunker::new(&data[..]).map(|c| c.unwrap()).collect();
        assert!(chunks.len() > 1);
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_chunk_bounds() {
        let data = sample(500_000);
        for chunk in Chunker::new(&data[..]) {
            let chunk = chunk.unwrap();
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= SECRET_MAX);
        }
    }

    #[test]
    fn test_deterministic_boundaries() {
        let data = sample(300_000);
        let a: Vec<usize> = Chunker::new(&data[..]).map(|c| c.unwrap().len()).collect();
        let b: Vec<usize> = Chunker::new(&data[..]).map(|c| c.unwrap().len()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_small_input_single_chunk() {
        let data = vec![1u8; 64];
        let chunks: Vec<Vec<u8>> = Chunker::new(&data[..]).map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], data);
    }
}
