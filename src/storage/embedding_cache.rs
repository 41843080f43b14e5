//! Reference embedding cache
//!
//! Durable store of reference embeddings keyed by
//! `(brand_id, source_image_path, model_version)`, with an in-memory layer.
//!
//! On-disk format (little-endian), one file per key:
//!   [4]   magic "PLEM"
//!   [u16] format version
//!   [u32 + bytes] brand id, source path, model version (UTF-8)
//!   [u32] dimensionality
//!   [f32 * dims] vector
//!   [32]  SHA-256 of everything above
//!
//! Concurrent misses for the same key are serialized by a per-key mutex: the
//! first caller computes and writes, later callers find the written entry.

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::brands::BrandId;
use crate::error::CacheError;

const MAGIC: &[u8; 4] = b"PLEM";
const FORMAT_VERSION: u16 = 1;
const CHECKSUM_LEN: usize = 32;

/// Identity of one cached reference embedding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub brand_id: BrandId,
    pub source_path: PathBuf,
    pub model_version: String,
}

impl CacheKey {
    pub fn new(brand_id: BrandId, source_path: impl Into<PathBuf>, model_version: &str) -> Self {
        Self {
            brand_id,
            source_path: source_path.into(),
            model_version: model_version.to_string(),
        }
    }

    /// Stable file name for this key
    fn file_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.brand_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.source_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.model_version.as_bytes());
        format!("{:x}.emb", hasher.finalize())
    }
}

/// A reference embedding for one brand logo image
#[derive(Debug, Clone)]
pub struct ReferenceEmbedding {
    pub brand_id: BrandId,
    pub source_image_path: PathBuf,
    pub model_version: String,
    pub vector: Arc<Vec<f32>>,
}

/// Embedding cache backed by a directory
pub struct EmbeddingCache {
    dir: PathBuf,
    memory: RwLock<HashMap<CacheKey, Arc<Vec<f32>>>>,
    key_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl EmbeddingCache {
    /// Open (creating if needed) a cache rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            memory: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Look up an entry, checking memory first and then disk
    ///
    /// Returns `Err(CacheError::Corrupt)` for an entry that exists but cannot
    /// be trusted for `expected_dims`.
    pub fn get(&self, key: &CacheKey, expected_dims: usize) -> Result<Option<Arc<Vec<f32>>>, CacheError> {
        if let Some(vector) = self.memory.read().get(key) {
            if vector.len() == expected_dims {
                return Ok(Some(vector.clone()));
            }
        }

        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let vector = Arc::new(decode_entry(&bytes, key, expected_dims)?);
        self.memory.write().insert(key.clone(), vector.clone());
        Ok(Some(vector))
    }

    /// Persist an entry and publish it to the memory layer
    pub fn put(&self, key: &CacheKey, vector: Vec<f32>) -> Result<Arc<Vec<f32>>, CacheError> {
        let bytes = encode_entry(key, &vector);
        super::write_atomic(&self.entry_path(key), &bytes)?;

        let vector = Arc::new(vector);
        self.memory.write().insert(key.clone(), vector.clone());
        Ok(vector)
    }

    /// Return the cached vector for `key`, computing and persisting it once on a miss
    ///
    /// Corrupt or mismatched entries count as misses. A failed write is logged
    /// and the freshly computed vector is still returned.
    pub fn get_or_compute<F, E>(&self, key: &CacheKey, expected_dims: usize, compute: F) -> Result<Arc<Vec<f32>>, E>
    where
        F: FnOnce() -> Result<Vec<f32>, E>,
    {
        if let Some(vector) = self.memory.read().get(key) {
            if vector.len() == expected_dims {
                return Ok(vector.clone());
            }
        }

        let key_lock = self.key_lock(key);
        let result = {
            let _guard = key_lock.lock();
            self.compute_locked(key, expected_dims, compute)
        };
        self.release_key_lock(key, &key_lock);
        result
    }

    /// Miss path of [`EmbeddingCache::get_or_compute`]; caller holds the key lock
    fn compute_locked<F, E>(&self, key: &CacheKey, expected_dims: usize, compute: F) -> Result<Arc<Vec<f32>>, E>
    where
        F: FnOnce() -> Result<Vec<f32>, E>,
    {
        match self.get(key, expected_dims) {
            Ok(Some(vector)) => return Ok(vector),
            Ok(None) => debug!("Embedding cache miss for {} ({:?})", key.brand_id, key.source_path),
            Err(e) => warn!(
                "Discarding cache entry for {} ({:?}): {}",
                key.brand_id, key.source_path, e
            ),
        }

        let vector = compute()?;

        match self.put(key, vector.clone()) {
            Ok(stored) => Ok(stored),
            Err(e) => {
                warn!("Failed to persist embedding for {}: {}", key.brand_id, e);
                let vector = Arc::new(vector);
                self.memory.write().insert(key.clone(), vector.clone());
                Ok(vector)
            }
        }
    }

    /// Remove an entry from memory and disk
    pub fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.memory.write().remove(key);
        match std::fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the in-memory layer; disk entries are kept
    pub fn clear_memory(&self) {
        self.memory.write().clear();
    }

    /// Number of entries held in memory
    pub fn memory_len(&self) -> usize {
        self.memory.read().len()
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for `key` unless another caller still holds it
    fn release_key_lock(&self, key: &CacheKey, key_lock: &Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        // One reference in the map, one held by the caller
        if Arc::strong_count(key_lock) <= 2 {
            locks.remove(key);
        }
    }
}

fn encode_entry(key: &CacheKey, vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + vector.len() * 4);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    write_str(&mut buf, key.brand_id.as_str());
    write_str(&mut buf, &key.source_path.to_string_lossy());
    write_str(&mut buf, &key.model_version);
    buf.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for value in vector {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    let checksum = Sha256::digest(&buf);
    buf.extend_from_slice(&checksum);
    buf
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn decode_entry(bytes: &[u8], key: &CacheKey, expected_dims: usize) -> Result<Vec<f32>, CacheError> {
    if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
        return Err(CacheError::Corrupt("entry too short".to_string()));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(CacheError::Corrupt("checksum mismatch".to_string()));
    }

    let mut reader = EntryReader { data: body, offset: 0 };

    if reader.take(MAGIC.len())? != MAGIC {
        return Err(CacheError::Corrupt("bad magic".to_string()));
    }
    let version = reader.read_u16()?;
    if version != FORMAT_VERSION {
        return Err(CacheError::Corrupt(format!("unsupported format version {}", version)));
    }

    let brand_id = reader.read_string()?;
    let source_path = reader.read_string()?;
    let model_version = reader.read_string()?;

    if brand_id != key.brand_id.as_str() || source_path != key.source_path.to_string_lossy() {
        return Err(CacheError::Corrupt("entry belongs to a different key".to_string()));
    }
    if model_version != key.model_version {
        return Err(CacheError::Corrupt(format!(
            "model version {} does not match {}",
            model_version, key.model_version
        )));
    }

    let dims = reader.read_u32()? as usize;
    if dims != expected_dims {
        return Err(CacheError::Corrupt(format!(
            "dimensionality {} does not match {}",
            dims, expected_dims
        )));
    }

    let mut vector = Vec::with_capacity(dims);
    for _ in 0..dims {
        vector.push(reader.read_f32()?);
    }

    if reader.offset != body.len() {
        return Err(CacheError::Corrupt("trailing bytes".to_string()));
    }

    Ok(vector)
}

struct EntryReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> EntryReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CacheError::Corrupt("truncated entry".to_string()))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, CacheError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CacheError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self) -> Result<f32, CacheError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String, CacheError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CacheError::Corrupt("invalid UTF-8".to_string()))
    }
}
