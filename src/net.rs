//! Client-side TCP connection with the request framing the servers expect
//!
//! Every connection starts with the 4-byte user id in network order; after
//! that each request is a 4-byte little-endian indicator followed by its
//! payload. Restore streams come back framed with network-order
//! `(indicator, length)` heads.

use crate::protocol::{
    self, FileRecipeHead, DATA, DOWNLOAD, FILE_RECIPE, GET_KEY_RECIPE, KEY_RECIPE, META, STAT,
};
use crate::{EngineError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

fn transport<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> EngineError + '_ {
    move |e| EngineError::Transport(format!("{context}: {e}"))
}

/// One authenticated stream to a storage server
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Connect and announce the user id
    pub fn connect(addr: SocketAddr, user_id: i32) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).map_err(transport("connect"))?;
        stream.set_nodelay(true).ok();
        stream
            .write_u32::<BigEndian>(user_id as u32)
            .map_err(transport("send user id"))?;
        Ok(Self { stream, peer: addr })
    }

    /// Peer address, for log lines
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send a metadata batch
    pub fn send_meta(&mut self, buf: &[u8]) -> Result<()> {
        self.stream
            .write_i32::<LittleEndian>(META)
            .and_then(|_| self.stream.write_i32::<LittleEndian>(buf.len() as i32))
            .and_then(|_| self.stream.write_all(buf))
            .map_err(transport("send metadata batch"))
    }

    /// Receive the duplicate-status list answering a metadata batch
    pub fn recv_status(&mut self) -> Result<Vec<bool>> {
        let indicator = self
            .stream
            .read_i32::<LittleEndian>()
            .map_err(transport("recv status head"))?;
        if indicator != STAT {
            return Err(EngineError::Transport(format!(
                "expected STAT from {}, got indicator {indicator}",
                self.peer
            )));
        }
        let count = self
            .stream
            .read_i32::<LittleEndian>()
            .map_err(transport("recv status count"))?;
        if count < 0 {
            return Err(EngineError::Transport(format!(
                "negative status count {count} from {}",
                self.peer
            )));
        }
        let mut raw = vec![0u8; count as usize];
        self.stream
            .read_exact(&mut raw)
            .map_err(transport("recv status list"))?;
        Ok(raw.into_iter().map(|b| b != 0).collect())
    }

    /// Send the compacted data batch
    pub fn send_data(&mut self, buf: &[u8]) -> Result<()> {
        self.stream
            .write_i32::<LittleEndian>(DATA)
            .and_then(|_| self.stream.write_i32::<LittleEndian>(buf.len() as i32))
            .and_then(|_| self.stream.write_all(buf))
            .map_err(transport("send data batch"))
    }

    /// Ask the server to stream a restored share file
    pub fn request_download(&mut self, name: &[u8]) -> Result<()> {
        self.stream
            .write_i32::<LittleEndian>(DOWNLOAD)
            .and_then(|_| self.stream.write_i32::<LittleEndian>(name.len() as i32))
            .and_then(|_| self.stream.write_all(name))
            .map_err(transport("request download"))
    }

    /// Receive one restore frame. Frame heads travel in network order.
    pub fn recv_restore_chunk(&mut self) -> Result<Vec<u8>> {
        let indicator = self
            .stream
            .read_i32::<BigEndian>()
            .map_err(transport("recv restore head"))?;
        if indicator != protocol::RESTORE_CHUNK {
            return Err(EngineError::Transport(format!(
                "unexpected restore indicator {indicator} from {}",
                self.peer
            )));
        }
        let len = self
            .stream
            .read_u32::<BigEndian>()
            .map_err(transport("recv restore length"))?;
        let mut buf = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut buf)
            .map_err(transport("recv restore payload"))?;
        Ok(buf)
    }

    /// Upload an encrypted key recipe blob under the given name
    pub fn send_key_recipe(&mut self, name: &str, blob: &[u8]) -> Result<()> {
        self.stream
            .write_i32::<LittleEndian>(KEY_RECIPE)
            .and_then(|_| self.stream.write_i32::<LittleEndian>(blob.len() as i32))
            .and_then(|_| self.stream.write_i32::<LittleEndian>(name.len() as i32))
            .and_then(|_| self.stream.write_all(name.as_bytes()))
            .and_then(|_| self.stream.write_all(blob))
            .map_err(transport("send key recipe"))
    }

    /// Fetch an encrypted key recipe blob by name
    pub fn fetch_key_recipe(&mut self, name: &str) -> Result<Vec<u8>> {
        self.stream
            .write_i32::<LittleEndian>(GET_KEY_RECIPE)
            .and_then(|_| self.stream.write_i32::<LittleEndian>(name.len() as i32))
            .and_then(|_| self.stream.write_all(name.as_bytes()))
            .map_err(transport("request key recipe"))?;
        let len = self
            .stream
            .read_i32::<LittleEndian>()
            .map_err(transport("recv key recipe length"))?;
        if len < 0 {
            return Err(EngineError::Transport(format!(
                "server {} has no key recipe '{name}'",
                self.peer
            )));
        }
        let mut blob = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut blob)
            .map_err(transport("recv key recipe"))?;
        Ok(blob)
    }

    /// Upload a rebuilt file recipe so the data phase can restore against it
    pub fn send_file_recipe(
        &mut self,
        name: &str,
        head: &FileRecipeHead,
        body: &[u8],
    ) -> Result<()> {
        let total = (FileRecipeHead::SIZE + body.len()) as i32;
        self.stream
            .write_i32::<LittleEndian>(FILE_RECIPE)
            .and_then(|_| self.stream.write_i32::<LittleEndian>(total))
            .and_then(|_| self.stream.write_i32::<LittleEndian>(name.len() as i32))
            .and_then(|_| self.stream.write_all(name.as_bytes()))
            .and_then(|_| head.write_to(&mut self.stream))
            .and_then(|_| self.stream.write_all(body))
            .map_err(transport("send file recipe"))
    }
}
