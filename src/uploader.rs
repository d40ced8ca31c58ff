//! Per-cloud upload streams with batch dedup negotiation
//!
//! Each cloud gets two cooperating streams, one for data shares and one
//! for metadata-chunk shares. A stream frames incoming shares into a
//! metadata batch and a data batch, asks its server which shares it
//! already owns, and sends only the unique payload. The wire cost of a
//! batch is therefore exactly its unique bytes.

use crate::config::{Endpoints, QUEUE_DEPTH, UPLOAD_MAX};
use crate::net::Connection;
use crate::protocol::{FileShareMetaHead, ShareMetaEntry};
use crate::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Items flowing from the encoder into an upload stream
pub enum UploadItem {
    /// Start of a file: header plus this cloud's share of the path
    FileHeader {
        head: FileShareMetaHead,
        name: Vec<u8>,
    },
    /// One share; `end` marks the last share of the file
    Share {
        entry: ShareMetaEntry,
        data: Vec<u8>,
        end: bool,
    },
    /// Encrypted key recipe, shipped after the final batch
    /// (metadata streams only)
    KeyRecipe(Vec<u8>),
}

/// Sender handles for the encoder side
#[derive(Clone)]
pub struct UploadSinks {
    pub meta: Vec<Sender<UploadItem>>,
    pub data: Vec<Sender<UploadItem>>,
}

/// The 2N stream threads of one upload session
pub struct Uploader {
    sinks: UploadSinks,
    handles: Vec<JoinHandle<Result<(u64, u64)>>>,
}

impl Uploader {
    /// Connect the 2N streams and start their threads. `file_name` is the
    /// plaintext path, used only to name the per-cloud key recipe blobs.
    pub fn new(endpoints: &Endpoints, user_id: i32, file_name: &str) -> Result<Self> {
        let n = endpoints.clouds();
        let mut meta_txs = Vec::with_capacity(n);
        let mut data_txs = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(2 * n);

        for (cloud, addr) in endpoints.meta.iter().enumerate() {
            let (tx, rx) = bounded(QUEUE_DEPTH);
            let conn = Connection::connect(*addr, user_id)?;
            let key_name = format!("{file_name}-share-{cloud}-enc.key");
            handles.push(thread::spawn(move || {
                stream_loop(conn, rx, cloud, Some(key_name))
            }));
            meta_txs.push(tx);
        }
        for (cloud, addr) in endpoints.data.iter().enumerate() {
            let (tx, rx) = bounded(QUEUE_DEPTH);
            let conn = Connection::connect(*addr, user_id)?;
            handles.push(thread::spawn(move || stream_loop(conn, rx, cloud, None)));
            data_txs.push(tx);
        }

        Ok(Self {
            sinks: UploadSinks {
                meta: meta_txs,
                data: data_txs,
            },
            handles,
        })
    }

    /// Clone the channel handles for the encoder
    pub fn sinks(&self) -> UploadSinks {
        self.sinks.clone()
    }

    /// Wait for every stream to drain. Returns `(total, unique)` bytes
    /// accumulated across all streams.
    pub fn join(self) -> Result<(u64, u64)> {
        drop(self.sinks);
        let mut total = 0;
        let mut unique = 0;
        for handle in self.handles {
            let (t, u) = handle
                .join()
                .map_err(|_| EngineError::Transport("upload stream panicked".into()))??;
            total += t;
            unique += u;
        }
        info!(total, unique, "upload complete");
        Ok((total, unique))
    }
}

/// Framing and accounting state of one stream
struct UploadStream {
    conn: Connection,
    cloud: usize,
    head: Option<FileShareMetaHead>,
    name: Vec<u8>,
    entries: Vec<u8>,
    data: Vec<u8>,
    share_sizes: Vec<usize>,
    accu_data: u64,
    accu_unique: u64,
}

fn stream_loop(
    conn: Connection,
    rx: Receiver<UploadItem>,
    cloud: usize,
    key_name: Option<String>,
) -> Result<(u64, u64)> {
    let mut stream = UploadStream {
        conn,
        cloud,
        head: None,
        name: Vec::new(),
        entries: Vec::new(),
        data: Vec::new(),
        share_sizes: Vec::new(),
        accu_data: 0,
        accu_unique: 0,
    };

    while let Ok(item) = rx.recv() {
        match item {
            UploadItem::FileHeader { head, name } => {
                stream.head = Some(head);
                stream.name = name;
            }
            UploadItem::Share { entry, data, end } => {
                stream.push_share(&entry, &data)?;
                if end {
                    stream.perform_upload()?;
                    if key_name.is_none() {
                        break;
                    }
                }
            }
            UploadItem::KeyRecipe(blob) => {
                let name = key_name.as_deref().ok_or_else(|| {
                    EngineError::Transport("key recipe routed to a data stream".into())
                })?;
                stream.conn.send_key_recipe(name, &blob)?;
                debug!(cloud, bytes = blob.len(), "key recipe shipped");
                break;
            }
        }
    }

    Ok((stream.accu_data, stream.accu_unique))
}

impl UploadStream {
    fn push_share(&mut self, entry: &ShareMetaEntry, data: &[u8]) -> Result<()> {
        if data.len() + self.data.len() > UPLOAD_MAX {
            self.perform_upload()?;
            self.update_header();
        }

        entry
            .write_to(&mut self.entries)
            .map_err(EngineError::Io)?;
        self.data.extend_from_slice(data);
        self.share_sizes.push(data.len());

        let head = self
            .head
            .as_mut()
            .ok_or_else(|| EngineError::Transport("share arrived before file header".into()))?;
        head.num_of_coming_secrets += 1;
        head.size_of_coming_secrets += entry.secret_size as i64;
        Ok(())
    }

    /// The four-step batch protocol: metadata out, status list in, in-place
    /// compaction, unique data out.
    fn perform_upload(&mut self) -> Result<()> {
        let head = self
            .head
            .ok_or_else(|| EngineError::Transport("upload without a file header".into()))?;

        let mut meta = Vec::with_capacity(FileShareMetaHead::SIZE + self.name.len() + self.entries.len());
        head.write_to(&mut meta).map_err(EngineError::Io)?;
        meta.extend_from_slice(&self.name);
        meta.extend_from_slice(&self.entries);

        self.conn.send_meta(&meta)?;
        let status = self.conn.recv_status()?;
        if status.len() != self.share_sizes.len() {
            return Err(EngineError::Transport(format!(
                "server answered {} statuses for {} shares",
                status.len(),
                self.share_sizes.len()
            )));
        }

        let mut kept = 0usize;
        let mut offset = 0usize;
        for (size, dup) in self.share_sizes.iter().zip(&status) {
            if !dup {
                self.data.copy_within(offset..offset + size, kept);
                kept += size;
            }
            offset += size;
        }
        self.accu_data += offset as u64;
        self.accu_unique += kept as u64;
        debug!(
            cloud = self.cloud,
            batch = offset,
            unique = kept,
            "batch negotiated"
        );

        self.conn.send_data(&self.data[..kept])?;
        Ok(())
    }

    /// Fold the negotiated batch into the header and restart the buffers
    fn update_header(&mut self) {
        if let Some(head) = self.head.as_mut() {
            head.num_of_past_secrets += head.num_of_coming_secrets;
            head.size_of_past_secrets += head.size_of_coming_secrets;
            head.num_of_coming_secrets = 0;
            head.size_of_coming_secrets = 0;
        } else {
            warn!(cloud = self.cloud, "header fold-over without a header");
        }
        self.entries.clear();
        self.data.clear();
        self.share_sizes.clear();
    }
}
