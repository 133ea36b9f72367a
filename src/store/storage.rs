//! Binary storage for the local vector backend.
//!
//! File format:
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - collection_id: [u8; 32] (SHA256 of collection name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - id_len: u16, id: [u8; id_len] (UTF-8)
//! - payload_len: u32, payload: [u8; payload_len] (JSON)
//! - embedding: [f32; dimensions] (little-endian)

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::index::{VectorEntry, VectorIndex};
use super::{ImageRecord, RecordPayload};

const FORMAT_VERSION: u8 = 1;

/// version(1) + collection_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

pub fn collection_id(name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.finalize().into()
}

pub struct StoredCollection {
    pub collection_id: [u8; 32],
    pub index: VectorIndex,
}

pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the whole collection. The header's collection id and
    /// dimensionality are returned as stored; callers decide what a
    /// mismatch means.
    pub fn load(&self) -> Result<StoredCollection, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        let mut index =
            VectorIndex::with_capacity(header.dimensions as usize, header.entry_count as usize);

        for _ in 0..header.entry_count {
            let record = Self::read_entry(&mut reader, header.dimensions as usize)?;
            let id = record.id.clone();
            if let Err(e) = index.insert(record) {
                log::warn!("skipping stored vector {id}: {e}");
            }
        }

        Ok(StoredCollection {
            collection_id: header.collection_id,
            index,
        })
    }

    /// Atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        index: &VectorIndex,
        collection: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(e) = Self::write_to_file(&temp_path, index, collection) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        path: &Path,
        index: &VectorIndex,
        collection: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                return Err(VectorStorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("directory {} does not exist", parent.display()),
                )));
            }
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("{} dimensions", index.dimensions()))
        })?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1..33].copy_from_slice(collection);
        header_bytes[33..35].copy_from_slice(&dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header_bytes)?;

        for (id, entry) in index.iter() {
            Self::write_entry(&mut writer, id, entry)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(slice_array(&header_bytes[43..47]));
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(Header {
            collection_id: slice_array(&header_bytes[1..33]),
            dimensions: u16::from_le_bytes(slice_array(&header_bytes[33..35])),
            entry_count: u64::from_le_bytes(slice_array(&header_bytes[35..43])),
        })
    }

    fn read_entry(
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<ImageRecord, VectorStorageError> {
        let mut len_bytes = [0u8; 2];
        reader.read_exact(&mut len_bytes)?;
        let mut id_bytes = vec![0u8; u16::from_le_bytes(len_bytes) as usize];
        reader.read_exact(&mut id_bytes)?;
        let id = String::from_utf8(id_bytes)
            .map_err(|e| VectorStorageError::InvalidFormat(format!("record id: {e}")))?;

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let mut payload_bytes = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        reader.read_exact(&mut payload_bytes)?;
        let payload: RecordPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|e| VectorStorageError::InvalidFormat(format!("payload of {id}: {e}")))?;

        let mut vector = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            vector.push(f32::from_le_bytes(float_bytes));
        }

        Ok(ImageRecord {
            id,
            vector,
            payload,
        })
    }

    fn write_entry(
        writer: &mut impl Write,
        id: &str,
        entry: &VectorEntry,
    ) -> Result<(), VectorStorageError> {
        let id_len = u16::try_from(id.len())
            .map_err(|_| VectorStorageError::InvalidFormat(format!("record id too long: {id}")))?;
        writer.write_all(&id_len.to_le_bytes())?;
        writer.write_all(id.as_bytes())?;

        let payload = serde_json::to_vec(&entry.payload)
            .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;

        for &value in &entry.embedding {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }
}

fn slice_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[derive(Debug)]
struct Header {
    collection_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}
