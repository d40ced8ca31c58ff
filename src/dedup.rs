// Copyright 2025 Scatterstore Developers
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Two-stage server deduplication engine
//!
//! The engine keeps a persistent share index in sled, per-user in-memory
//! container buffers, and append-only container files. Stage one answers a
//! metadata batch with a duplicate-status list and touches nothing but the
//! index; stage two verifies fingerprints, applies inter-user
//! deduplication, and packs genuinely new shares into containers.
//!
//! A server runs two engine instances: the metadata engine additionally
//! records per-file ingest recipes so metadata-chunk streams can be
//! restored before the client holds any recipe; the data engine restores
//! only against client-uploaded recipes and discards them after use.

use crate::config::{CONTAINER_MAX, NUM_OF_CACHED_CONTAINERS, SHARE_FILE_BUFFER_SIZE};
use crate::crypto::{CryptoEngine, FP_SIZE};
use crate::protocol::{
    FileRecipeEntry, FileRecipeHead, FileShareMetaHead, ShareEntry, ShareFileHead, ShareMetaEntry,
    RESTORE_CHUNK,
};
use crate::{EngineError, Result};
use byteorder::{BigEndian, WriteBytesExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Container file names are 12 base-26 characters plus this suffix
const CONTAINER_SUFFIX: &str = ".sc";
const CONTAINER_NAME_LEN: usize = 12;

/// Engine placement and behavior
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// sled database directory
    pub db_dir: PathBuf,
    /// container file directory
    pub container_dir: PathBuf,
    /// recipe file directory (shared between both engines)
    pub recipe_dir: PathBuf,
    /// record per-file ingest recipes (metadata engine only)
    pub record_recipes: bool,
    /// idle time before another user's buffer node is flushed
    pub buffer_wait: Duration,
}

impl EngineConfig {
    /// Layout for the metadata-side engine under a server root
    pub fn metadata(root: &Path) -> Self {
        Self {
            db_dir: root.join("meta/DedupDB"),
            container_dir: root.join("meta/ShareContainers"),
            recipe_dir: root.join("meta/RecipeFiles"),
            record_recipes: true,
            buffer_wait: Duration::from_secs(18),
        }
    }

    /// Layout for the data-side engine under a server root
    pub fn data(root: &Path) -> Self {
        Self {
            db_dir: root.join("meta/minDedupDB"),
            container_dir: root.join("meta/minShareContainers"),
            recipe_dir: root.join("meta/RecipeFiles"),
            record_recipes: false,
            buffer_wait: Duration::from_secs(18),
        }
    }
}

/// Value stored in the share index, addressed by `b'1' || shareFP`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShareIndexValue {
    container_name: String,
    container_offset: u32,
    share_size: u32,
    users: Vec<UserRef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct UserRef {
    user_id: i32,
    ref_cnt: u32,
}

/// Per-user in-memory write buffer for the current container
struct BufferNode {
    user_id: i32,
    container_name: String,
    buf: Vec<u8>,
    last_use: Instant,
}

type NodeRef = Arc<Mutex<BufferNode>>;

/// The dedup engine; lives for the whole server process
pub struct DedupEngine {
    cfg: EngineConfig,
    crypto: CryptoEngine,
    db: sled::Db,
    db_lock: Mutex<()>,
    buffers: Mutex<Vec<NodeRef>>,
    container_name: Mutex<String>,
    recipe_lock: Mutex<()>,
}

impl DedupEngine {
    /// Open or create an engine at the configured directories
    pub fn open(cfg: EngineConfig, crypto: CryptoEngine) -> Result<Self> {
        fs::create_dir_all(&cfg.db_dir)?;
        fs::create_dir_all(&cfg.container_dir)?;
        fs::create_dir_all(&cfg.recipe_dir)?;

        let db = sled::open(&cfg.db_dir)?;
        info!(db = %cfg.db_dir.display(), containers = %cfg.container_dir.display(),
              "dedup engine ready");

        Ok(Self {
            cfg,
            crypto,
            db,
            db_lock: Mutex::new(()),
            buffers: Mutex::new(Vec::new()),
            container_name: Mutex::new("a".repeat(CONTAINER_NAME_LEN)),
            recipe_lock: Mutex::new(()),
        })
    }

    fn index_key(share_fp: &[u8; FP_SIZE]) -> [u8; FP_SIZE + 1] {
        let mut key = [0u8; FP_SIZE + 1];
        key[0] = b'1';
        key[1..].copy_from_slice(share_fp);
        key
    }

    /// Hand out the next container name; names are globally unique
    fn next_container_name(&self) -> String {
        let mut current = self.container_name.lock();
        let name = format!("{current}{CONTAINER_SUFFIX}");
        // increment lexicographically over 'a'..'z'
        let mut bytes: Vec<u8> = current.bytes().collect();
        let mut i = CONTAINER_NAME_LEN;
        while i > 0 && bytes[i - 1] == b'z' {
            bytes[i - 1] = b'a';
            i -= 1;
        }
        if i > 0 {
            bytes[i - 1] += 1;
        }
        *current = bytes.iter().map(|b| *b as char).collect();
        name
    }

    /// Tag naming a user's ingest recipe for a (possibly binary) file name
    pub fn ingest_tag(user_id: i32, name: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&user_id.to_le_bytes());
        hasher.update(name);
        let digest = hasher.finalize();
        format!("meta-{}.recipe", hex::encode(&digest.as_bytes()[..16]))
    }

    /// Path of an ingest recipe file
    pub fn ingest_recipe_path(&self, user_id: i32, name: &[u8]) -> PathBuf {
        self.cfg.recipe_dir.join(Self::ingest_tag(user_id, name))
    }

    /// Perform the first-stage (intra-user) deduplication over a metadata
    /// batch. Returns the duplicate-status list, the number of shares seen,
    /// and the total size the client still has to send.
    pub fn first_stage_dedup(
        &self,
        user_id: i32,
        meta_buf: &[u8],
    ) -> Result<(Vec<bool>, usize, u64)> {
        let mut status = Vec::new();
        let mut sent_size = 0u64;
        // shares repeated inside one batch only need their bytes once
        let mut batch_seen: HashSet<[u8; FP_SIZE]> = HashSet::new();

        let mut cursor = meta_buf;
        while !cursor.is_empty() {
            let head = FileShareMetaHead::read_from(&mut cursor)
                .map_err(|e| EngineError::Transport(format!("malformed metadata head: {e}")))?;
            if head.full_name_size < 0 || head.full_name_size as usize > cursor.len() {
                return Err(EngineError::Transport(format!(
                    "metadata head claims name of {} bytes",
                    head.full_name_size
                )));
            }
            cursor = &cursor[head.full_name_size as usize..];

            for _ in 0..head.num_of_coming_secrets {
                let entry = ShareMetaEntry::read_from(&mut cursor).map_err(|e| {
                    EngineError::Transport(format!("malformed metadata entry: {e}"))
                })?;
                let dup =
                    self.intra_user_update(&entry.share_fp, user_id)? || !batch_seen.insert(entry.share_fp);
                if !dup {
                    sent_size += entry.share_size as u64;
                }
                status.push(dup);
            }
        }

        debug!(
            user_id,
            shares = status.len(),
            duplicates = status.iter().filter(|d| **d).count(),
            "first-stage dedup"
        );
        let num = status.len();
        Ok((status, num, sent_size))
    }

    /// If the user already owns the share, bump its reference count
    fn intra_user_update(&self, share_fp: &[u8; FP_SIZE], user_id: i32) -> Result<bool> {
        let key = Self::index_key(share_fp);
        let _guard = self.db_lock.lock();

        let Some(raw) = self.db.get(key)? else {
            return Ok(false);
        };
        let mut value: ShareIndexValue = bincode::deserialize(&raw)
            .map_err(|e| EngineError::Kv(format!("corrupt index value: {e}")))?;

        let Some(user) = value.users.iter_mut().find(|u| u.user_id == user_id) else {
            return Ok(false);
        };
        user.ref_cnt += 1;

        let encoded = bincode::serialize(&value)
            .map_err(|e| EngineError::Kv(format!("encode index value: {e}")))?;
        let mut batch = sled::Batch::default();
        batch.remove(&key[..]);
        batch.insert(&key[..], encoded);
        self.db.apply_batch(batch)?;
        Ok(true)
    }

    /// Perform the second-stage (inter-user) deduplication over the data
    /// batch matching the last metadata batch and its status list.
    pub fn second_stage_dedup(
        &self,
        user_id: i32,
        meta_buf: &[u8],
        status: &[bool],
        data_buf: &[u8],
    ) -> Result<()> {
        let node = self.find_or_create_buffer_node(user_id);

        let mut cursor = meta_buf;
        let mut share_idx = 0usize;
        let mut data_offset = 0usize;

        while !cursor.is_empty() {
            let head = FileShareMetaHead::read_from(&mut cursor)
                .map_err(|e| EngineError::Transport(format!("malformed metadata head: {e}")))?;
            let name = cursor
                .get(..head.full_name_size as usize)
                .ok_or_else(|| EngineError::Transport("metadata name overruns batch".into()))?
                .to_vec();
            cursor = &cursor[head.full_name_size as usize..];

            let mut recipe_entries = Vec::new();
            let mut batch_secret_size = 0i64;

            for i in 0..head.num_of_coming_secrets {
                let entry = ShareMetaEntry::read_from(&mut cursor).map_err(|e| {
                    EngineError::Transport(format!("malformed metadata entry: {e}"))
                })?;
                let dup = *status.get(share_idx).ok_or_else(|| {
                    EngineError::Transport("status list shorter than metadata batch".into())
                })?;
                share_idx += 1;

                if !dup {
                    let share_size = entry.share_size as usize;
                    let bytes = data_buf
                        .get(data_offset..data_offset + share_size)
                        .ok_or_else(|| {
                            EngineError::Transport("data batch shorter than metadata".into())
                        })?;

                    let fp = self.crypto.fingerprint(bytes);
                    if fp != entry.share_fp {
                        return Err(EngineError::Integrity(format!(
                            "share {i} from user {user_id} does not match its fingerprint"
                        )));
                    }

                    self.inter_user_update(&entry.share_fp, user_id, bytes, &node)?;
                    data_offset += share_size;
                }

                if self.cfg.record_recipes {
                    recipe_entries.push(FileRecipeEntry {
                        share_fp: entry.share_fp,
                        secret_id: entry.secret_id,
                        secret_size: entry.secret_size,
                    });
                    batch_secret_size += entry.secret_size as i64;
                }
            }

            if self.cfg.record_recipes && !recipe_entries.is_empty() {
                // a header with no past secrets starts a fresh upload
                // session, superseding any recipe from an earlier upload
                let fresh = head.num_of_past_secrets == 0;
                self.append_ingest_recipe(
                    &name,
                    user_id,
                    &recipe_entries,
                    batch_secret_size,
                    fresh,
                )?;
            }
        }

        Ok(())
    }

    /// Re-query the index and either extend the user-ref vector or append
    /// the share to the user's container
    fn inter_user_update(
        &self,
        share_fp: &[u8; FP_SIZE],
        user_id: i32,
        bytes: &[u8],
        node: &NodeRef,
    ) -> Result<()> {
        let key = Self::index_key(share_fp);

        {
            let _guard = self.db_lock.lock();
            if let Some(raw) = self.db.get(key)? {
                // raced with another writer, or the batch repeats a share
                let mut value: ShareIndexValue = bincode::deserialize(&raw)
                    .map_err(|e| EngineError::Kv(format!("corrupt index value: {e}")))?;
                match value.users.iter_mut().find(|u| u.user_id == user_id) {
                    Some(user) => user.ref_cnt += 1,
                    None => value.users.push(UserRef {
                        user_id,
                        ref_cnt: 1,
                    }),
                }
                let encoded = bincode::serialize(&value)
                    .map_err(|e| EngineError::Kv(format!("encode index value: {e}")))?;
                let mut batch = sled::Batch::default();
                batch.remove(&key[..]);
                batch.insert(&key[..], encoded);
                self.db.apply_batch(batch)?;
                return Ok(());
            }
        }

        let mut node = node.lock();
        if node.buf.len() + bytes.len() > CONTAINER_MAX {
            self.flush_node(&mut node, true)?;
        }

        let value = ShareIndexValue {
            container_name: node.container_name.clone(),
            container_offset: node.buf.len() as u32,
            share_size: bytes.len() as u32,
            users: vec![UserRef {
                user_id,
                ref_cnt: 1,
            }],
        };
        let encoded = bincode::serialize(&value)
            .map_err(|e| EngineError::Kv(format!("encode index value: {e}")))?;
        {
            let _guard = self.db_lock.lock();
            self.db.insert(key, encoded)?;
        }

        node.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a node's container buffer to disk; optionally rotate to a
    /// fresh container name for further appends
    fn flush_node(&self, node: &mut BufferNode, rotate: bool) -> Result<()> {
        if !node.buf.is_empty() {
            let path = self.cfg.container_dir.join(&node.container_name);
            fs::write(&path, &node.buf)?;
            debug!(container = %node.container_name, bytes = node.buf.len(), "container flushed");
        }
        if rotate {
            node.container_name = self.next_container_name();
            node.buf.clear();
        }
        Ok(())
    }

    /// Find the user's buffer node, sweeping out nodes idle longer than the
    /// configured wait on the way; create one if absent
    fn find_or_create_buffer_node(&self, user_id: i32) -> NodeRef {
        let mut buffers = self.buffers.lock();

        let mut target = None;
        buffers.retain(|node_ref| {
            let mut node = node_ref.lock();
            if node.user_id == user_id {
                node.last_use = Instant::now();
                target = Some(node_ref.clone());
                return true;
            }
            if node.last_use.elapsed() > self.cfg.buffer_wait {
                if let Err(e) = self.flush_node(&mut node, false) {
                    warn!(user_id = node.user_id, "failed to flush idle buffer node: {e}");
                }
                return false;
            }
            true
        });

        if let Some(found) = target {
            return found;
        }

        let node = Arc::new(Mutex::new(BufferNode {
            user_id,
            container_name: self.next_container_name(),
            buf: Vec::with_capacity(CONTAINER_MAX),
            last_use: Instant::now(),
        }));
        buffers.push(node.clone());
        node
    }

    /// Flush every buffer node to disk (shutdown path)
    pub fn flush_all(&self) -> Result<()> {
        let buffers = self.buffers.lock();
        for node_ref in buffers.iter() {
            let mut node = node_ref.lock();
            self.flush_node(&mut node, false)?;
        }
        Ok(())
    }

    /// Look a container up in the live buffer nodes
    fn read_container_from_buffers(&self, container_name: &str) -> Option<Vec<u8>> {
        let buffers = self.buffers.lock();
        for node_ref in buffers.iter() {
            let node = node_ref.lock();
            if node.container_name == container_name {
                return Some(node.buf.clone());
            }
        }
        None
    }

    /// Append a batch's entries to the per-file ingest recipe and fold the
    /// batch counts into its head
    fn append_ingest_recipe(
        &self,
        name: &[u8],
        user_id: i32,
        entries: &[FileRecipeEntry],
        batch_secret_size: i64,
        fresh: bool,
    ) -> Result<()> {
        let path = self.ingest_recipe_path(user_id, name);
        let _guard = self.recipe_lock.lock();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if fresh {
            file.set_len(0)?;
        }

        let mut head = if file.metadata()?.len() >= FileRecipeHead::SIZE as u64 {
            FileRecipeHead::read_from(&mut file)?
        } else {
            FileRecipeHead {
                user_id,
                file_size: 0,
                num_of_shares: 0,
            }
        };
        head.file_size += batch_secret_size;
        head.num_of_shares += entries.len() as i32;

        file.seek(SeekFrom::Start(0))?;
        head.write_to(&mut file)?;
        file.seek(SeekFrom::End(0))?;
        let mut body = Vec::with_capacity(entries.len() * FileRecipeEntry::SIZE);
        for entry in entries {
            entry.write_to(&mut body)?;
        }
        file.write_all(&body)?;
        Ok(())
    }

    /// Restore the share file described by a recipe, streaming framed
    /// chunks into `out`. Frames carry network-order `(indicator, length)`
    /// heads so the peer can buffer responses.
    pub fn restore_share_file(&self, recipe_path: &Path, out: &mut dyn Write) -> Result<()> {
        let mut recipe = File::open(recipe_path).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                e.kind(),
                format!("recipe {}: {e}", recipe_path.display()),
            ))
        })?;
        let head = FileRecipeHead::read_from(&mut recipe)?;
        info!(recipe = %recipe_path.display(), shares = head.num_of_shares, "restore started");

        let mut cache: LruCache<String, Vec<u8>> =
            LruCache::new(NonZeroUsize::new(NUM_OF_CACHED_CONTAINERS).unwrap());

        let mut frame = Vec::with_capacity(SHARE_FILE_BUFFER_SIZE);
        ShareFileHead {
            file_size: head.file_size,
            num_of_shares: head.num_of_shares,
        }
        .write_to(&mut frame)?;

        for _ in 0..head.num_of_shares {
            let entry = FileRecipeEntry::read_from(&mut recipe)?;
            let key = Self::index_key(&entry.share_fp);

            let raw = {
                let _guard = self.db_lock.lock();
                self.db.get(key)?
            }
            .ok_or_else(|| {
                EngineError::Kv(format!(
                    "no index entry for share {}",
                    hex::encode(&entry.share_fp[..8])
                ))
            })?;
            let value: ShareIndexValue = bincode::deserialize(&raw)
                .map_err(|e| EngineError::Kv(format!("corrupt index value: {e}")))?;

            if !cache.contains(&value.container_name) {
                let data = match self.read_container_from_buffers(&value.container_name) {
                    Some(data) => data,
                    None => fs::read(self.cfg.container_dir.join(&value.container_name))?,
                };
                cache.put(value.container_name.clone(), data);
            }
            let container = cache.get(&value.container_name).ok_or_else(|| {
                EngineError::Kv(format!("container {} fell out of cache", value.container_name))
            })?;

            let start = value.container_offset as usize;
            let end = start + value.share_size as usize;
            let bytes = container.get(start..end).ok_or_else(|| {
                EngineError::Kv(format!(
                    "share at {}+{} overruns container {}",
                    start, value.share_size, value.container_name
                ))
            })?;

            if frame.len() + ShareEntry::SIZE + bytes.len() > SHARE_FILE_BUFFER_SIZE {
                Self::send_frame(out, &frame)?;
                frame.clear();
            }
            ShareEntry {
                secret_id: entry.secret_id,
                secret_size: entry.secret_size,
                share_size: value.share_size as i32,
            }
            .write_to(&mut frame)?;
            frame.extend_from_slice(bytes);
        }

        if !frame.is_empty() {
            Self::send_frame(out, &frame)?;
        }

        // client-uploaded recipes are single-use
        if !self.cfg.record_recipes {
            let _guard = self.recipe_lock.lock();
            if let Err(e) = fs::remove_file(recipe_path) {
                warn!(recipe = %recipe_path.display(), "failed to remove used recipe: {e}");
            }
        }
        Ok(())
    }

    fn send_frame(out: &mut dyn Write, payload: &[u8]) -> Result<()> {
        out.write_i32::<BigEndian>(RESTORE_CHUNK)
            .and_then(|_| out.write_u32::<BigEndian>(payload.len() as u32))
            .and_then(|_| out.write_all(payload))
            .map_err(|e| EngineError::Transport(format!("send restore frame: {e}")))
    }

    /// Recipe directory, for the transport layer's name resolution
    pub fn recipe_dir(&self) -> &Path {
        &self.cfg.recipe_dir
    }

    /// Number of user references currently held for a share (tests and
    /// tooling)
    pub fn share_user_refs(&self, share_fp: &[u8; FP_SIZE]) -> Result<Vec<(i32, u32)>> {
        let key = Self::index_key(share_fp);
        let _guard = self.db_lock.lock();
        match self.db.get(key)? {
            Some(raw) => {
                let value: ShareIndexValue = bincode::deserialize(&raw)
                    .map_err(|e| EngineError::Kv(format!("corrupt index value: {e}")))?;
                Ok(value.users.iter().map(|u| (u.user_id, u.ref_cnt)).collect())
            }
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for DedupEngine {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!("failed to flush buffer nodes on shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProfile;
    use std::io::Read;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> DedupEngine {
        let cfg = EngineConfig {
            buffer_wait: Duration::from_millis(50),
            ..EngineConfig::metadata(dir.path())
        };
        DedupEngine::open(cfg, CryptoEngine::new(SecurityProfile::High)).unwrap()
    }

    /// Build a one-file metadata batch over the given shares
    fn batch(crypto: &CryptoEngine, name: &[u8], shares: &[(i32, &[u8])]) -> (Vec<u8>, Vec<u8>) {
        let mut head = FileShareMetaHead::new(name.len() as i32, 0);
        head.num_of_coming_secrets = shares.len() as i32;
        head.size_of_coming_secrets = shares.iter().map(|(_, s)| s.len() as i64).sum();

        let mut meta = Vec::new();
        head.write_to(&mut meta).unwrap();
        meta.extend_from_slice(name);
        let mut data = Vec::new();
        for (id, bytes) in shares {
            ShareMetaEntry {
                share_fp: crypto.fingerprint(bytes),
                secret_id: *id,
                secret_size: bytes.len() as i32,
                share_size: bytes.len() as i32,
            }
            .write_to(&mut meta)
            .unwrap();
            data.extend_from_slice(bytes);
        }
        (meta, data)
    }

    /// Compact a data batch the way the client does
    fn compact(data: &[u8], sizes: &[usize], status: &[bool]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = 0;
        for (size, dup) in sizes.iter().zip(status) {
            if !dup {
                out.extend_from_slice(&data[offset..offset + size]);
            }
            offset += size;
        }
        out
    }

    #[test]
    fn test_two_stage_flow_and_idempotence() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let crypto = CryptoEngine::new(SecurityProfile::High);

        let shares: Vec<(i32, &[u8])> = vec![(0, b"alpha"), (1, b"beta"), (2, b"gamma")];
        let (meta, data) = batch(&crypto, b"name-0", &shares);

        let (status, num, sent) = eng.first_stage_dedup(7, &meta).unwrap();
        assert_eq!(num, 3);
        assert!(status.iter().all(|d| !d));
        assert_eq!(sent, 14);
        eng.second_stage_dedup(7, &meta, &status, &data).unwrap();

        // same user again: everything is an intra-user duplicate
        let (status2, _, sent2) = eng.first_stage_dedup(7, &meta).unwrap();
        assert!(status2.iter().all(|d| *d));
        assert_eq!(sent2, 0);
        eng.second_stage_dedup(7, &meta, &status2, &[]).unwrap();

        let refs = eng.share_user_refs(&crypto.fingerprint(b"alpha")).unwrap();
        assert_eq!(refs, vec![(7, 2)]); // stage-1 bumped once on re-upload
    }

    #[test]
    fn test_cross_user_dedup() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let crypto = CryptoEngine::new(SecurityProfile::High);

        let shares: Vec<(i32, &[u8])> = vec![(0, b"common-bytes")];
        let (meta, data) = batch(&crypto, b"name-0", &shares);

        for user in [1, 2] {
            let (status, _, _) = eng.first_stage_dedup(user, &meta).unwrap();
            assert!(!status[0], "user {user} should not be an intra-user dup");
            let sized = [data.len()];
            let payload = compact(&data, &sized, &status);
            eng.second_stage_dedup(user, &meta, &status, &payload).unwrap();
        }

        let refs = eng
            .share_user_refs(&crypto.fingerprint(b"common-bytes"))
            .unwrap();
        assert_eq!(refs, vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn test_fingerprint_enforcement() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let crypto = CryptoEngine::new(SecurityProfile::High);

        let (meta, mut data) = batch(&crypto, b"name-0", &[(0, b"honest bytes")]);
        let (status, _, _) = eng.first_stage_dedup(1, &meta).unwrap();

        // tamper with the payload but keep the claimed fingerprint
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let err = eng.second_stage_dedup(1, &meta, &status, &data).unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));

        // nothing was committed for the tampered share
        let refs = eng.share_user_refs(&crypto.fingerprint(b"honest bytes")).unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn test_buffer_node_eviction() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let crypto = CryptoEngine::new(SecurityProfile::High);

        let (meta, data) = batch(&crypto, b"name-0", &[(0, b"payload-of-user-1")]);
        let (status, _, _) = eng.first_stage_dedup(1, &meta).unwrap();
        eng.second_stage_dedup(1, &meta, &status, &data).unwrap();

        let container = {
            let buffers = eng.buffers.lock();
            assert_eq!(buffers.len(), 1);
            let name = buffers[0].lock().container_name.clone();
            name
        };
        assert!(!eng.cfg.container_dir.join(&container).exists());

        // any other user's call after the idle window sweeps the node out
        std::thread::sleep(Duration::from_millis(80));
        let _ = eng.find_or_create_buffer_node(2);
        assert_eq!(eng.buffers.lock().len(), 1); // only user 2's node remains
        assert!(eng.cfg.container_dir.join(&container).exists());
    }

    #[test]
    fn test_container_rotation() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let crypto = CryptoEngine::new(SecurityProfile::High);

        // two shares that cannot share one container
        let big_a = vec![0xaa; CONTAINER_MAX - 10];
        let big_b = vec![0xbb; 100];
        let (meta, data) = batch(&crypto, b"name-0", &[(0, &big_a), (1, &big_b)]);
        let (status, _, _) = eng.first_stage_dedup(1, &meta).unwrap();
        eng.second_stage_dedup(1, &meta, &status, &data).unwrap();

        let first = eng.share_user_refs(&crypto.fingerprint(&big_a)).unwrap();
        assert_eq!(first, vec![(1, 1)]);
        // the first container was flushed to disk by the rotation
        assert!(fs::read_dir(&eng.cfg.container_dir).unwrap().count() >= 1);
    }

    #[test]
    fn test_container_name_sequence() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        assert_eq!(eng.next_container_name(), "aaaaaaaaaaaa.sc");
        assert_eq!(eng.next_container_name(), "aaaaaaaaaaab.sc");
        for _ in 0..24 {
            eng.next_container_name();
        }
        assert_eq!(eng.next_container_name(), "aaaaaaaaaaba.sc");
    }

    #[test]
    fn test_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let crypto = CryptoEngine::new(SecurityProfile::High);

        let shares: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 300]).collect();
        let refs: Vec<(i32, &[u8])> = shares.iter().enumerate().map(|(i, s)| (i as i32, &s[..])).collect();
        let (meta, data) = batch(&crypto, b"restore-me", &refs);
        let (status, _, _) = eng.first_stage_dedup(1, &meta).unwrap();
        eng.second_stage_dedup(1, &meta, &status, &data).unwrap();

        let mut out = Vec::new();
        let recipe = eng.ingest_recipe_path(1, b"restore-me");
        eng.restore_share_file(&recipe, &mut out).unwrap();

        // parse the single frame back
        let mut cursor = &out[..];
        use byteorder::ReadBytesExt;
        assert_eq!(cursor.read_i32::<BigEndian>().unwrap(), RESTORE_CHUNK);
        let len = cursor.read_u32::<BigEndian>().unwrap() as usize;
        assert_eq!(len, cursor.len());
        let head = ShareFileHead::read_from(&mut cursor).unwrap();
        assert_eq!(head.num_of_shares, 5);
        for i in 0..5 {
            let entry = ShareEntry::read_from(&mut cursor).unwrap();
            assert_eq!(entry.secret_id, i as i32);
            assert_eq!(entry.share_size, 300);
            let mut bytes = vec![0u8; 300];
            cursor.read_exact(&mut bytes).unwrap();
            assert_eq!(bytes, vec![i as u8; 300]);
        }
    }

    #[test]
    fn test_restore_missing_recipe() {
        let dir = TempDir::new().unwrap();
        let eng = engine(&dir);
        let mut out = Vec::new();
        let err = eng
            .restore_share_file(&eng.cfg.recipe_dir.join("absent.recipe"), &mut out)
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(out.is_empty());
    }
}
