//! Wire records shared by the client pipeline and the server
//!
//! Every record is serialized field-by-field in little-endian order, so the
//! layouts below are the protocol. Restore-stream frame heads are the one
//! exception: they travel in network byte order (see [`crate::net`] and
//! [`crate::dedup`]).
//!
//! Metadata batch layout:
//! `FileShareMetaHead + name bytes + ShareMetaEntry * num_of_coming_secrets`,
//! repeated. Restored share stream layout:
//! `ShareFileHead + (ShareEntry + share bytes) * num_of_shares`.

use crate::crypto::{FP_SIZE, KEY_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Request indicators, 4-byte little-endian on the wire
pub const META: i32 = -1;
pub const DATA: i32 = -2;
pub const STAT: i32 = -3;
pub const RESTORE_CHUNK: i32 = -5;
pub const DOWNLOAD: i32 = -7;
pub const KEY_RECIPE: i32 = -101;
pub const GET_KEY_RECIPE: i32 = -102;
pub const FILE_RECIPE: i32 = -103;

/// Per-file header carried at the front of every metadata batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileShareMetaHead {
    pub full_name_size: i32,
    pub file_size: i64,
    pub num_of_past_secrets: i32,
    pub size_of_past_secrets: i64,
    pub num_of_coming_secrets: i32,
    pub size_of_coming_secrets: i64,
}

impl FileShareMetaHead {
    pub const SIZE: usize = 36;

    pub fn new(full_name_size: i32, file_size: i64) -> Self {
        Self {
            full_name_size,
            file_size,
            num_of_past_secrets: 0,
            size_of_past_secrets: 0,
            num_of_coming_secrets: 0,
            size_of_coming_secrets: 0,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i32::<LittleEndian>(self.full_name_size)?;
        w.write_i64::<LittleEndian>(self.file_size)?;
        w.write_i32::<LittleEndian>(self.num_of_past_secrets)?;
        w.write_i64::<LittleEndian>(self.size_of_past_secrets)?;
        w.write_i32::<LittleEndian>(self.num_of_coming_secrets)?;
        w.write_i64::<LittleEndian>(self.size_of_coming_secrets)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            full_name_size: r.read_i32::<LittleEndian>()?,
            file_size: r.read_i64::<LittleEndian>()?,
            num_of_past_secrets: r.read_i32::<LittleEndian>()?,
            size_of_past_secrets: r.read_i64::<LittleEndian>()?,
            num_of_coming_secrets: r.read_i32::<LittleEndian>()?,
            size_of_coming_secrets: r.read_i64::<LittleEndian>()?,
        })
    }
}

/// Metadata entry describing one share inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareMetaEntry {
    pub share_fp: [u8; FP_SIZE],
    pub secret_id: i32,
    pub secret_size: i32,
    pub share_size: i32,
}

impl ShareMetaEntry {
    pub const SIZE: usize = FP_SIZE + 12;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.share_fp)?;
        w.write_i32::<LittleEndian>(self.secret_id)?;
        w.write_i32::<LittleEndian>(self.secret_size)?;
        w.write_i32::<LittleEndian>(self.share_size)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut share_fp = [0u8; FP_SIZE];
        r.read_exact(&mut share_fp)?;
        Ok(Self {
            share_fp,
            secret_id: r.read_i32::<LittleEndian>()?,
            secret_size: r.read_i32::<LittleEndian>()?,
            share_size: r.read_i32::<LittleEndian>()?,
        })
    }
}

/// A metadata chunk is a run of these nodes, one per described share.
/// The layout is identical to the batch entry.
pub type MetaNode = ShareMetaEntry;

/// One key-recipe record: which metadata chunk, its published
/// fingerprint, and the key that decrypts it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRecipeEntry {
    pub secret_id: i32,
    pub share_fp: [u8; FP_SIZE],
    pub key: [u8; KEY_SIZE],
}

impl KeyRecipeEntry {
    pub const SIZE: usize = 4 + FP_SIZE + KEY_SIZE;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i32::<LittleEndian>(self.secret_id)?;
        w.write_all(&self.share_fp)?;
        w.write_all(&self.key)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let secret_id = r.read_i32::<LittleEndian>()?;
        let mut share_fp = [0u8; FP_SIZE];
        r.read_exact(&mut share_fp)?;
        let mut key = [0u8; KEY_SIZE];
        r.read_exact(&mut key)?;
        Ok(Self {
            secret_id,
            share_fp,
            key,
        })
    }
}

/// Head of a file recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecipeHead {
    pub user_id: i32,
    pub file_size: i64,
    pub num_of_shares: i32,
}

impl FileRecipeHead {
    pub const SIZE: usize = 16;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i32::<LittleEndian>(self.user_id)?;
        w.write_i64::<LittleEndian>(self.file_size)?;
        w.write_i32::<LittleEndian>(self.num_of_shares)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            user_id: r.read_i32::<LittleEndian>()?,
            file_size: r.read_i64::<LittleEndian>()?,
            num_of_shares: r.read_i32::<LittleEndian>()?,
        })
    }
}

/// One file-recipe record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecipeEntry {
    pub share_fp: [u8; FP_SIZE],
    pub secret_id: i32,
    pub secret_size: i32,
}

impl FileRecipeEntry {
    pub const SIZE: usize = FP_SIZE + 8;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.share_fp)?;
        w.write_i32::<LittleEndian>(self.secret_id)?;
        w.write_i32::<LittleEndian>(self.secret_size)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut share_fp = [0u8; FP_SIZE];
        r.read_exact(&mut share_fp)?;
        Ok(Self {
            share_fp,
            secret_id: r.read_i32::<LittleEndian>()?,
            secret_size: r.read_i32::<LittleEndian>()?,
        })
    }
}

/// Head of a restored share stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareFileHead {
    pub file_size: i64,
    pub num_of_shares: i32,
}

impl ShareFileHead {
    pub const SIZE: usize = 12;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i64::<LittleEndian>(self.file_size)?;
        w.write_i32::<LittleEndian>(self.num_of_shares)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            file_size: r.read_i64::<LittleEndian>()?,
            num_of_shares: r.read_i32::<LittleEndian>()?,
        })
    }
}

/// Per-share record inside a restored share stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareEntry {
    pub secret_id: i32,
    pub secret_size: i32,
    pub share_size: i32,
}

impl ShareEntry {
    pub const SIZE: usize = 12;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_i32::<LittleEndian>(self.secret_id)?;
        w.write_i32::<LittleEndian>(self.secret_size)?;
        w.write_i32::<LittleEndian>(self.share_size)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            secret_id: r.read_i32::<LittleEndian>()?,
            secret_size: r.read_i32::<LittleEndian>()?,
            share_size: r.read_i32::<LittleEndian>()?,
        })
    }
}

/// Remap path separators so client-supplied names stay flat inside the
/// server's metadata directories
pub fn sanitize_name(name: &str) -> String {
    name.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(FileShareMetaHead::SIZE, 36);
        assert_eq!(ShareMetaEntry::SIZE, 44);
        assert_eq!(KeyRecipeEntry::SIZE, 68);
        assert_eq!(FileRecipeHead::SIZE, 16);
        assert_eq!(FileRecipeEntry::SIZE, 40);
        assert_eq!(ShareFileHead::SIZE, 12);
        assert_eq!(ShareEntry::SIZE, 12);
    }

    #[test]
    fn test_meta_head_roundtrip() {
        let head = FileShareMetaHead {
            full_name_size: 64,
            file_size: 1 << 30,
            num_of_past_secrets: 7,
            size_of_past_secrets: 12345,
            num_of_coming_secrets: 3,
            size_of_coming_secrets: 6789,
        };
        let mut buf = Vec::new();
        head.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FileShareMetaHead::SIZE);
        assert_eq!(FileShareMetaHead::read_from(&mut &buf[..]).unwrap(), head);
    }

    #[test]
    fn test_share_entry_roundtrip() {
        let entry = ShareMetaEntry {
            share_fp: [0xab; 32],
            secret_id: -2,
            secret_size: 880,
            share_size: 448,
        };
        let mut buf = Vec::new();
        entry.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), ShareMetaEntry::SIZE);
        assert_eq!(ShareMetaEntry::read_from(&mut &buf[..]).unwrap(), entry);
    }

    #[test]
    fn test_key_recipe_roundtrip() {
        let entry = KeyRecipeEntry {
            secret_id: -1,
            share_fp: [1; 32],
            key: [2; 32],
        };
        let mut buf = Vec::new();
        entry.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), KeyRecipeEntry::SIZE);
        assert_eq!(KeyRecipeEntry::read_from(&mut &buf[..]).unwrap(), entry);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("/etc/hostname-0.recipe"), "_etc_hostname-0.recipe");
        assert_eq!(sanitize_name("plain"), "plain");
    }
}
