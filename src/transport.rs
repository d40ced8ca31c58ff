//! Server transport: two listening ports dispatching per-connection
//! handlers over the shared dedup engines
//!
//! The metadata port serves dedup for metadata-chunk shares plus the
//! keystore and recipe-file operations; the data port serves dedup and
//! restore for data shares. Every connection announces its user id first;
//! after that the handler loops on 4-byte indicators until the peer closes
//! the stream.

use crate::config::SecurityProfile;
use crate::crypto::CryptoEngine;
use crate::dedup::{DedupEngine, EngineConfig};
use crate::protocol::{
    sanitize_name, DATA, DOWNLOAD, FILE_RECIPE, GET_KEY_RECIPE, KEY_RECIPE, META, STAT,
};
use crate::{EngineError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Upper bound for any single request payload
const MAX_FRAME: i32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Metadata,
    Data,
}

/// Listening server wiring both dedup engines to their ports
pub struct Server {
    meta_listener: TcpListener,
    data_listener: TcpListener,
    meta_engine: Arc<DedupEngine>,
    data_engine: Arc<DedupEngine>,
    keystore_dir: PathBuf,
    recipe_dir: PathBuf,
    recipe_lock: Arc<Mutex<()>>,
}

impl Server {
    /// Bind both listeners and open both engines under `root`
    pub fn bind<A: ToSocketAddrs>(
        meta_addr: A,
        data_addr: A,
        root: &std::path::Path,
        profile: SecurityProfile,
    ) -> Result<Self> {
        let meta_listener = TcpListener::bind(meta_addr)
            .map_err(|e| EngineError::Transport(format!("bind metadata port: {e}")))?;
        let data_listener = TcpListener::bind(data_addr)
            .map_err(|e| EngineError::Transport(format!("bind data port: {e}")))?;

        let crypto = CryptoEngine::new(profile);
        let meta_engine = Arc::new(DedupEngine::open(EngineConfig::metadata(root), crypto)?);
        let data_engine = Arc::new(DedupEngine::open(EngineConfig::data(root), crypto)?);

        let keystore_dir = root.join("meta/keystore");
        let recipe_dir = root.join("meta/RecipeFiles");
        fs::create_dir_all(&keystore_dir)?;
        fs::create_dir_all(&recipe_dir)?;

        let meta_addr = meta_listener.local_addr()?;
        let data_addr = data_listener.local_addr()?;
        info!(meta = %meta_addr, data = %data_addr, "server listening");

        Ok(Self {
            meta_listener,
            data_listener,
            meta_engine,
            data_engine,
            keystore_dir,
            recipe_dir,
            recipe_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Bound addresses, useful when binding port 0
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((
            self.meta_listener.local_addr()?,
            self.data_listener.local_addr()?,
        ))
    }

    /// Spawn the accept loops and return immediately
    pub fn start(self) -> Result<()> {
        let Self {
            meta_listener,
            data_listener,
            meta_engine,
            data_engine,
            keystore_dir,
            recipe_dir,
            recipe_lock,
        } = self;

        spawn_accept_loop(
            meta_listener,
            Role::Metadata,
            meta_engine,
            keystore_dir.clone(),
            recipe_dir.clone(),
            recipe_lock.clone(),
        );
        spawn_accept_loop(
            data_listener,
            Role::Data,
            data_engine,
            keystore_dir,
            recipe_dir,
            recipe_lock,
        );
        Ok(())
    }

    /// Serve forever
    pub fn run(self) -> Result<()> {
        self.start()?;
        loop {
            thread::park();
        }
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    role: Role,
    engine: Arc<DedupEngine>,
    keystore_dir: PathBuf,
    recipe_dir: PathBuf,
    recipe_lock: Arc<Mutex<()>>,
) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let engine = engine.clone();
                    let keystore_dir = keystore_dir.clone();
                    let recipe_dir = recipe_dir.clone();
                    let recipe_lock = recipe_lock.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(
                            stream,
                            role,
                            engine,
                            keystore_dir,
                            recipe_dir,
                            recipe_lock,
                        ) {
                            warn!(?role, "handler terminated: {e}");
                        }
                    });
                }
                Err(e) => error!(?role, "accept failed: {e}"),
            }
        }
    });
}

fn read_payload(stream: &mut TcpStream, what: &str) -> Result<Vec<u8>> {
    let len = stream
        .read_i32::<LittleEndian>()
        .map_err(|e| EngineError::Transport(format!("recv {what} length: {e}")))?;
    if !(0..=MAX_FRAME).contains(&len) {
        return Err(EngineError::Transport(format!(
            "{what} length {len} out of bounds"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .map_err(|e| EngineError::Transport(format!("recv {what}: {e}")))?;
    Ok(buf)
}

fn handle_connection(
    mut stream: TcpStream,
    role: Role,
    engine: Arc<DedupEngine>,
    keystore_dir: PathBuf,
    recipe_dir: PathBuf,
    recipe_lock: Arc<Mutex<()>>,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let user_id = stream
        .read_u32::<BigEndian>()
        .map_err(|e| EngineError::Transport(format!("recv user id: {e}")))? as i32;
    info!(?role, user_id, peer = ?stream.peer_addr().ok(), "connection accepted");

    let mut last_meta: Vec<u8> = Vec::new();
    let mut last_status: Vec<bool> = Vec::new();

    loop {
        let indicator = match stream.read_i32::<LittleEndian>() {
            Ok(v) => v,
            // peer closed the stream, normal end of session
            Err(_) => return Ok(()),
        };

        match indicator {
            META => {
                last_meta = read_payload(&mut stream, "metadata batch")?;
                let (status, num, sent_size) = engine.first_stage_dedup(user_id, &last_meta)?;
                tracing::debug!(user_id, num, sent_size, "answering metadata batch");

                stream
                    .write_i32::<LittleEndian>(STAT)
                    .and_then(|_| stream.write_i32::<LittleEndian>(num as i32))
                    .and_then(|_| {
                        let raw: Vec<u8> = status.iter().map(|d| *d as u8).collect();
                        stream.write_all(&raw)
                    })
                    .map_err(|e| EngineError::Transport(format!("send status list: {e}")))?;
                last_status = status;
            }
            DATA => {
                let data_buf = read_payload(&mut stream, "data batch")?;
                engine.second_stage_dedup(user_id, &last_meta, &last_status, &data_buf)?;
            }
            DOWNLOAD => {
                let name = read_payload(&mut stream, "download request")?;
                let recipe_path = match role {
                    Role::Metadata => engine.ingest_recipe_path(user_id, &name),
                    Role::Data => {
                        recipe_dir.join(sanitize_name(&String::from_utf8_lossy(&name)))
                    }
                };
                engine.restore_share_file(&recipe_path, &mut stream)?;
            }
            KEY_RECIPE if role == Role::Metadata => {
                let blob_len = stream
                    .read_i32::<LittleEndian>()
                    .map_err(|e| EngineError::Transport(format!("recv key blob length: {e}")))?;
                let name = read_payload(&mut stream, "key recipe name")?;
                if !(0..=MAX_FRAME).contains(&blob_len) {
                    return Err(EngineError::Transport(format!(
                        "key blob length {blob_len} out of bounds"
                    )));
                }
                let mut blob = vec![0u8; blob_len as usize];
                stream
                    .read_exact(&mut blob)
                    .map_err(|e| EngineError::Transport(format!("recv key blob: {e}")))?;

                let path = keystore_dir.join(sanitize_name(&String::from_utf8_lossy(&name)));
                fs::write(&path, &blob)?;
                info!(user_id, path = %path.display(), "key recipe stored");
            }
            GET_KEY_RECIPE if role == Role::Metadata => {
                let name = read_payload(&mut stream, "key recipe name")?;
                let path = keystore_dir.join(sanitize_name(&String::from_utf8_lossy(&name)));
                match fs::read(&path) {
                    Ok(blob) => {
                        stream
                            .write_i32::<LittleEndian>(blob.len() as i32)
                            .and_then(|_| stream.write_all(&blob))
                            .map_err(|e| {
                                EngineError::Transport(format!("send key recipe: {e}"))
                            })?;
                    }
                    Err(e) => {
                        warn!(user_id, path = %path.display(), "key recipe lookup failed: {e}");
                        stream.write_i32::<LittleEndian>(-1).map_err(|e| {
                            EngineError::Transport(format!("send key recipe miss: {e}"))
                        })?;
                    }
                }
            }
            FILE_RECIPE if role == Role::Metadata => {
                let body_len = stream
                    .read_i32::<LittleEndian>()
                    .map_err(|e| EngineError::Transport(format!("recv recipe length: {e}")))?;
                let name = read_payload(&mut stream, "recipe name")?;
                if !(0..=MAX_FRAME).contains(&body_len) {
                    return Err(EngineError::Transport(format!(
                        "recipe length {body_len} out of bounds"
                    )));
                }
                let mut body = vec![0u8; body_len as usize];
                stream
                    .read_exact(&mut body)
                    .map_err(|e| EngineError::Transport(format!("recv recipe body: {e}")))?;

                let path = recipe_dir.join(sanitize_name(&String::from_utf8_lossy(&name)));
                let _guard = recipe_lock.lock();
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?;
                file.write_all(&body)?;
                info!(user_id, path = %path.display(), "file recipe stored");
            }
            other => {
                return Err(EngineError::Transport(format!(
                    "unknown indicator {other} from user {user_id}"
                )));
            }
        }
    }
}
