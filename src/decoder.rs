//! Parallel share-to-secret decoding with an ordered file writer
//!
//! The mirror image of the encoder: the downloader submits grouped share
//! bundles round-robin across `T` worker queues, and the collector drains
//! the output queues in the same order, so plaintext reaches the output
//! file in secret-id order without a reordering buffer.

use crate::config::{DispersalParams, SecurityProfile, DECODER_WORKERS, QUEUE_DEPTH};
use crate::crypto::CryptoEngine;
use crate::dispersal::DispersalCodec;
use crate::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::thread::{self, JoinHandle};
use tracing::error;

/// The k shares of one secret, in the order of the session's cloud slots
pub struct DecodeTask {
    pub secret_id: i32,
    pub secret_size: i32,
    pub shares: Vec<Vec<u8>>,
}

/// The decode pipeline: worker threads plus the writing collector
pub struct Decoder {
    input_txs: Vec<Sender<DecodeTask>>,
    next_add: usize,
    workers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<Result<u64>>>,
}

impl Decoder {
    /// Start the pipeline. `share_ids[j]` is the dispersal share index held
    /// by cloud slot `j`; `total` is the number of secrets to expect.
    pub fn new(
        params: DispersalParams,
        profile: SecurityProfile,
        share_ids: Vec<usize>,
        total: usize,
        out: File,
    ) -> Result<Self> {
        let mut input_txs = Vec::with_capacity(DECODER_WORKERS);
        let mut output_rxs = Vec::with_capacity(DECODER_WORKERS);
        let mut workers = Vec::with_capacity(DECODER_WORKERS);

        for index in 0..DECODER_WORKERS {
            let (in_tx, in_rx) = bounded::<DecodeTask>(QUEUE_DEPTH);
            let (out_tx, out_rx) = bounded::<(i32, Vec<u8>)>(QUEUE_DEPTH);
            let codec = DispersalCodec::new(params, CryptoEngine::new(profile))?;
            let ids = share_ids.clone();
            workers.push(thread::spawn(move || {
                worker_loop(index, codec, ids, in_rx, out_tx)
            }));
            input_txs.push(in_tx);
            output_rxs.push(out_rx);
        }

        let collector = thread::spawn(move || collect_loop(total, output_rxs, out));

        Ok(Self {
            input_txs,
            next_add: 0,
            workers,
            collector: Some(collector),
        })
    }

    /// Enqueue the next grouped secret round-robin
    pub fn submit(&mut self, task: DecodeTask) -> Result<()> {
        self.input_txs[self.next_add]
            .send(task)
            .map_err(|_| EngineError::Transport("decoder queue closed".into()))?;
        self.next_add = (self.next_add + 1) % DECODER_WORKERS;
        Ok(())
    }

    /// Wait for the collector to write every secret; returns bytes written
    pub fn join(mut self) -> Result<u64> {
        self.input_txs.clear();
        for worker in self.workers.drain(..) {
            worker
                .join()
                .map_err(|_| EngineError::Transport("decoder worker panicked".into()))?;
        }
        match self.collector.take() {
            Some(collector) => collector
                .join()
                .map_err(|_| EngineError::Transport("decoder collector panicked".into()))?,
            None => Ok(0),
        }
    }
}

fn worker_loop(
    index: usize,
    codec: DispersalCodec,
    share_ids: Vec<usize>,
    in_rx: Receiver<DecodeTask>,
    out_tx: Sender<(i32, Vec<u8>)>,
) {
    while let Ok(task) = in_rx.recv() {
        let pairs: Vec<(usize, &[u8])> = share_ids
            .iter()
            .copied()
            .zip(task.shares.iter().map(|s| &s[..]))
            .collect();
        match codec.decode(&pairs, task.secret_size as usize) {
            Ok(secret) => {
                if out_tx.send((task.secret_id, secret)).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!(worker = index, secret = task.secret_id, "decoding failed: {e}");
                return;
            }
        }
    }
}

fn collect_loop(
    total: usize,
    output_rxs: Vec<Receiver<(i32, Vec<u8>)>>,
    out: File,
) -> Result<u64> {
    let mut writer = BufWriter::new(out);
    let mut written = 0u64;

    for count in 0..total {
        let (id, secret) = output_rxs[count % DECODER_WORKERS]
            .recv()
            .map_err(|_| EngineError::Transport("decoder worker queue closed early".into()))?;
        if id != count as i32 {
            return Err(EngineError::Integrity(format!(
                "secret {id} arrived out of order, expected {count}"
            )));
        }
        writer.write_all(&secret)?;
        written += secret.len() as u64;
    }

    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_decode_pipeline_roundtrip() {
        let params = DispersalParams::new(4, 3, 1).unwrap();
        let profile = SecurityProfile::High;
        let codec = DispersalCodec::new(params, CryptoEngine::new(profile)).unwrap();

        let secrets: Vec<Vec<u8>> = (0..17u8).map(|i| vec![i; 500 + i as usize]).collect();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let out = tmp.reopen().unwrap();

        // clouds 0, 1 and 3 survive
        let share_ids = vec![0usize, 1, 3];
        let mut decoder =
            Decoder::new(params, profile, share_ids.clone(), secrets.len(), out).unwrap();

        for (id, secret) in secrets.iter().enumerate() {
            let all = codec.encode(secret).unwrap();
            let shares = share_ids.iter().map(|i| all[*i].clone()).collect();
            decoder
                .submit(DecodeTask {
                    secret_id: id as i32,
                    secret_size: secret.len() as i32,
                    shares,
                })
                .unwrap();
        }
        let written = decoder.join().unwrap();

        let expected: Vec<u8> = secrets.concat();
        assert_eq!(written, expected.len() as u64);
        let mut actual = Vec::new();
        tmp.reopen().unwrap().read_to_end(&mut actual).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_out_of_order_submission_detected() {
        let params = DispersalParams::new(4, 3, 1).unwrap();
        let profile = SecurityProfile::High;
        let codec = DispersalCodec::new(params, CryptoEngine::new(profile)).unwrap();

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut decoder =
            Decoder::new(params, profile, vec![0, 1, 2], 2, tmp.reopen().unwrap()).unwrap();

        for id in [1i32, 0] {
            let secret = vec![id as u8; 64];
            let all = codec.encode(&secret).unwrap();
            decoder
                .submit(DecodeTask {
                    secret_id: id,
                    secret_size: secret.len() as i32,
                    shares: all.into_iter().take(3).collect(),
                })
                .unwrap();
        }
        assert!(decoder.join().is_err());
    }
}
