//! Per-cloud download streams: recipe reconstruction and file restore
//!
//! Restoring a file runs in two phases. Pre-download fetches each cloud's
//! encrypted key recipe, streams the file's metadata-chunk shares back,
//! decrypts them with the recovered keys, and re-uploads the rebuilt file
//! recipe so the data engines have something to restore against.
//! Download then pulls the k share streams in parallel, regroups the
//! shares of each secret in lockstep, and feeds the decoder.

use crate::config::{DispersalParams, Endpoints, SecurityProfile, QUEUE_DEPTH};
use crate::crypto::CryptoEngine;
use crate::decoder::{DecodeTask, Decoder};
use crate::dispersal::DispersalCodec;
use crate::net::Connection;
use crate::protocol::{
    FileRecipeEntry, FileRecipeHead, KeyRecipeEntry, MetaNode, ShareEntry, ShareFileHead,
};
use crate::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::path::Path;
use std::thread;
use tracing::{debug, info};

/// A download session against `k` chosen clouds
pub struct Downloader {
    params: DispersalParams,
    profile: SecurityProfile,
    endpoints: Endpoints,
    cloud_ids: Vec<usize>,
    user_id: i32,
    path: String,
    passphrase: String,
}

enum DownloadItem {
    Header(ShareFileHead),
    Share { entry: ShareEntry, data: Vec<u8> },
}

impl Downloader {
    /// `endpoints` must hold one metadata and one data endpoint per chosen
    /// cloud; `cloud_ids[j]` is the dispersal share index that cloud slot
    /// `j` stores.
    pub fn new(
        params: DispersalParams,
        profile: SecurityProfile,
        endpoints: Endpoints,
        cloud_ids: Vec<usize>,
        user_id: i32,
        path: &str,
        passphrase: &str,
    ) -> Result<Self> {
        if endpoints.clouds() != cloud_ids.len() {
            return Err(EngineError::Config(format!(
                "{} endpoints for {} cloud ids",
                endpoints.clouds(),
                cloud_ids.len()
            )));
        }
        if cloud_ids.len() < params.m as usize {
            return Err(EngineError::Config(format!(
                "{} clouds cannot reach the reconstruction threshold m={}",
                cloud_ids.len(),
                params.m
            )));
        }
        Ok(Self {
            params,
            profile,
            endpoints,
            cloud_ids,
            user_id,
            path: path.to_owned(),
            passphrase: passphrase.to_owned(),
        })
    }

    /// Phase one: rebuild the file recipe on every chosen cloud
    pub fn pre_download(&self) -> Result<()> {
        let crypto = CryptoEngine::new(self.profile);
        let codec = DispersalCodec::new(self.params, crypto)?;
        let name_shares = codec.encode(self.path.as_bytes())?;

        let mut handles = Vec::new();
        for (slot, &cloud_id) in self.cloud_ids.iter().enumerate() {
            let addr = self.endpoints.meta[slot];
            let user_id = self.user_id;
            let path = self.path.clone();
            let passphrase = self.passphrase.clone();
            let name_share = name_shares[cloud_id].clone();
            handles.push(thread::spawn(move || {
                rebuild_recipe(crypto, addr, user_id, &path, &passphrase, cloud_id, name_share)
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| EngineError::Transport("pre-download thread panicked".into()))??;
        }
        info!(path = %self.path, clouds = self.cloud_ids.len(), "pre-download complete");
        Ok(())
    }

    /// Phase two: stream the k share sets and decode into `output`
    pub fn download(&self, output: &Path) -> Result<u64> {
        let k = self.cloud_ids.len();
        let mut receivers = Vec::with_capacity(k);
        let mut handles = Vec::new();

        for (slot, &cloud_id) in self.cloud_ids.iter().enumerate() {
            let (tx, rx) = bounded(QUEUE_DEPTH);
            let addr = self.endpoints.data[slot];
            let user_id = self.user_id;
            let recipe_name = format!("{}-{}.recipe", self.path, cloud_id);
            handles.push(thread::spawn(move || {
                fetch_share_stream(addr, user_id, &recipe_name, tx)
            }));
            receivers.push(rx);
        }

        // every stream leads with the share file head
        let mut total = None;
        for rx in &receivers {
            match recv_item(rx)? {
                DownloadItem::Header(head) => {
                    if let Some(expected) = total {
                        if head.num_of_shares != expected {
                            return Err(EngineError::Integrity(format!(
                                "share streams disagree on count: {} vs {expected}",
                                head.num_of_shares
                            )));
                        }
                    }
                    total = Some(head.num_of_shares);
                }
                DownloadItem::Share { .. } => {
                    return Err(EngineError::Transport(
                        "share stream did not start with a header".into(),
                    ))
                }
            }
        }
        let total = total.unwrap_or(0).max(0) as usize;
        debug!(total, "share streams opened");

        let out = File::create(output)?;
        let mut decoder = Decoder::new(
            self.params,
            self.profile,
            self.cloud_ids.clone(),
            total,
            out,
        )?;

        for count in 0..total {
            let mut secret_size = 0i32;
            let mut shares = Vec::with_capacity(k);
            for rx in &receivers {
                match recv_item(rx)? {
                    DownloadItem::Share { entry, data } => {
                        if entry.secret_id != count as i32 {
                            return Err(EngineError::Integrity(format!(
                                "stream delivered secret {} while regrouping {count}",
                                entry.secret_id
                            )));
                        }
                        secret_size = entry.secret_size;
                        shares.push(data);
                    }
                    DownloadItem::Header(_) => {
                        return Err(EngineError::Transport("unexpected second header".into()))
                    }
                }
            }
            decoder.submit(DecodeTask {
                secret_id: count as i32,
                secret_size,
                shares,
            })?;
        }

        for handle in handles {
            handle
                .join()
                .map_err(|_| EngineError::Transport("download thread panicked".into()))??;
        }
        let written = decoder.join()?;
        info!(path = %self.path, written, "download complete");
        Ok(written)
    }
}

fn recv_item(rx: &Receiver<DownloadItem>) -> Result<DownloadItem> {
    rx.recv()
        .map_err(|_| EngineError::Transport("share stream ended early".into()))
}

/// Incremental parser over the framed restore stream
struct RestoreStream {
    conn: Connection,
    frame: Vec<u8>,
    offset: usize,
}

impl RestoreStream {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            frame: Vec::new(),
            offset: 0,
        }
    }

    fn refill(&mut self) -> Result<()> {
        if self.offset == self.frame.len() {
            self.frame = self.conn.recv_restore_chunk()?;
            self.offset = 0;
        }
        Ok(())
    }

    fn read_head(&mut self) -> Result<ShareFileHead> {
        self.refill()?;
        let mut cursor = &self.frame[self.offset..];
        let head = ShareFileHead::read_from(&mut cursor)
            .map_err(|e| EngineError::Transport(format!("malformed share file head: {e}")))?;
        self.offset += ShareFileHead::SIZE;
        Ok(head)
    }

    /// A share entry and its bytes never split across frames
    fn read_share(&mut self) -> Result<(ShareEntry, Vec<u8>)> {
        self.refill()?;
        let mut cursor = &self.frame[self.offset..];
        let entry = ShareEntry::read_from(&mut cursor)
            .map_err(|e| EngineError::Transport(format!("malformed share entry: {e}")))?;
        self.offset += ShareEntry::SIZE;
        let end = self.offset + entry.share_size as usize;
        let data = self
            .frame
            .get(self.offset..end)
            .ok_or_else(|| EngineError::Transport("share data overruns frame".into()))?
            .to_vec();
        self.offset = end;
        Ok((entry, data))
    }
}

/// Pre-download worker for one cloud: key recipe, metadata chunks, rebuilt
/// file recipe
fn rebuild_recipe(
    crypto: CryptoEngine,
    addr: std::net::SocketAddr,
    user_id: i32,
    path: &str,
    passphrase: &str,
    cloud_id: usize,
    name_share: Vec<u8>,
) -> Result<()> {
    let mut conn = Connection::connect(addr, user_id)?;

    // fetch and open the key recipe
    let blob = conn.fetch_key_recipe(&format!("{path}-share-{cloud_id}-enc.key"))?;
    let pass_key = crypto.passphrase_key(passphrase);
    let key_bytes = crypto.open(&blob, &pass_key)?;
    let mut key_entries = Vec::with_capacity(key_bytes.len() / KeyRecipeEntry::SIZE);
    let mut cursor = &key_bytes[..];
    while !cursor.is_empty() {
        key_entries.push(KeyRecipeEntry::read_from(&mut cursor).map_err(|e| {
            EngineError::Crypto(format!("malformed key recipe for cloud {cloud_id}: {e}"))
        })?);
    }

    // stream the metadata-chunk shares for this file
    conn.request_download(&name_share)?;
    let mut stream = RestoreStream::new(conn);
    let head = stream.read_head()?;

    let mut entries = Vec::new();
    let mut file_size = 0i64;
    for _ in 0..head.num_of_shares {
        let (entry, ciphertext) = stream.read_share()?;

        let recipe_key = key_entries
            .iter()
            .find(|k| k.secret_id == entry.secret_id)
            .ok_or_else(|| {
                EngineError::Integrity(format!(
                    "metadata chunk {} has no key recipe entry",
                    entry.secret_id
                ))
            })?;
        if crypto.fingerprint(&ciphertext) != recipe_key.share_fp {
            return Err(EngineError::Integrity(format!(
                "metadata chunk {} does not match its recorded fingerprint",
                entry.secret_id
            )));
        }

        let key = crate::crypto::EncryptionKey::new(recipe_key.key);
        let nodes = crypto.decrypt(&ciphertext, &key)?;
        if nodes.len() != entry.secret_size as usize {
            return Err(EngineError::Integrity(format!(
                "metadata chunk {} decrypted to {} bytes, expected {}",
                entry.secret_id,
                nodes.len(),
                entry.secret_size
            )));
        }

        let mut cursor = &nodes[..];
        while !cursor.is_empty() {
            let node = MetaNode::read_from(&mut cursor).map_err(|e| {
                EngineError::Integrity(format!("malformed metadata node: {e}"))
            })?;
            file_size += node.secret_size as i64;
            entries.push(FileRecipeEntry {
                share_fp: node.share_fp,
                secret_id: node.secret_id,
                secret_size: node.secret_size,
            });
        }
    }
    debug!(cloud_id, secrets = entries.len(), "recipe rebuilt");

    // hand the rebuilt recipe back for the data phase
    let recipe_head = FileRecipeHead {
        user_id,
        file_size,
        num_of_shares: entries.len() as i32,
    };
    let mut body = Vec::with_capacity(entries.len() * FileRecipeEntry::SIZE);
    for entry in &entries {
        entry.write_to(&mut body).map_err(EngineError::Io)?;
    }
    stream
        .conn
        .send_file_recipe(&format!("{path}-{cloud_id}.recipe"), &recipe_head, &body)
}

/// Download worker for one cloud: parse the restore stream into items
fn fetch_share_stream(
    addr: std::net::SocketAddr,
    user_id: i32,
    recipe_name: &str,
    tx: Sender<DownloadItem>,
) -> Result<()> {
    let mut conn = Connection::connect(addr, user_id)?;
    conn.request_download(recipe_name.as_bytes())?;
    let mut stream = RestoreStream::new(conn);

    let head = stream.read_head()?;
    let count = head.num_of_shares.max(0);
    tx.send(DownloadItem::Header(head))
        .map_err(|_| EngineError::Transport("download driver went away".into()))?;

    for _ in 0..count {
        let (entry, data) = stream.read_share()?;
        tx.send(DownloadItem::Share { entry, data })
            .map_err(|_| EngineError::Transport("download driver went away".into()))?;
    }
    Ok(())
}
