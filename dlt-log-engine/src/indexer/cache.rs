//! Index caches
//!
//! Two caches live here:
//! - [`FilterIndexCache`], in memory: filtered indices of named filter sets,
//!   reused while the file path and size are unchanged
//! - the on-disk absolute index, stored as `<sha256(name, size)>.dix`
//!
//! Disk layout (little endian):
//!
//! ```text
//! "DIX1" | file size u64 | count u64 | count x (offset u64, length u32, seconds u32, micros u32)
//! ```

use super::index::{FilteredIndex, IndexEntry};
use crate::types::{EngineError, MessageTime, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"DIX1";

#[derive(Debug, Clone)]
struct CachedFilter {
    path: PathBuf,
    size: u64,
    filtered: FilteredIndex,
}

/// Filtered indices of named filter sets, keyed by (file path, file size)
#[derive(Debug, Default)]
pub struct FilterIndexCache {
    slots: HashMap<String, CachedFilter>,
}

impl FilterIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, path: &Path, size: u64) -> Option<&FilteredIndex> {
        self.slots
            .get(name)
            .filter(|slot| slot.path == path && slot.size == size)
            .map(|slot| &slot.filtered)
    }

    pub fn insert(&mut self, name: &str, path: &Path, size: u64, filtered: FilteredIndex) {
        self.slots.insert(
            name.to_string(),
            CachedFilter { path: path.to_path_buf(), size, filtered },
        );
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Cache file name for a log file of the given size
pub fn cache_key(path: &Path, size: u64) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(size.to_le_bytes());
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn cache_path(dir: &Path, path: &Path, size: u64) -> PathBuf {
    dir.join(format!("{}.dix", cache_key(path, size)))
}

/// Load a stored index; any read or format problem is treated as a miss
pub fn load(dir: &Path, path: &Path, size: u64) -> Option<Vec<IndexEntry>> {
    let file = cache_path(dir, path, size);
    if !file.exists() {
        return None;
    }
    match read_entries(&file, size) {
        Ok(entries) => {
            debug!("Index cache hit {} ({} entries)", file.display(), entries.len());
            Some(entries)
        }
        Err(e) => {
            warn!("Ignoring index cache {}: {}", file.display(), e);
            None
        }
    }
}

fn read_entries(file: &Path, size: u64) -> Result<Vec<IndexEntry>> {
    let mut reader = BufReader::new(File::open(file)?);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(EngineError::Cache("bad magic".into()));
    }
    let stored_size = reader.read_u64::<LittleEndian>()?;
    if stored_size != size {
        return Err(EngineError::Cache(format!("size mismatch {} != {}", stored_size, size)));
    }
    let count = reader.read_u64::<LittleEndian>()?;
    // an entry is 20 bytes and cannot extend past the file it indexes
    if count > size / 20 + 1 {
        return Err(EngineError::Cache(format!("implausible entry count {}", count)));
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut previous_end = 0;
    for _ in 0..count {
        let offset = reader.read_u64::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;
        let seconds = reader.read_u32::<LittleEndian>()?;
        let microseconds = reader.read_u32::<LittleEndian>()?;
        let entry = IndexEntry { offset, length, time: MessageTime::new(seconds, microseconds) };
        if offset < previous_end || entry.end() > size {
            return Err(EngineError::Cache("entries out of order".into()));
        }
        previous_end = entry.end();
        entries.push(entry);
    }
    Ok(entries)
}

/// Store an index for the log file at `path` of length `size`
pub fn store(dir: &Path, path: &Path, size: u64, entries: &[IndexEntry]) -> Result<()> {
    fs::create_dir_all(dir)?;
    let file = cache_path(dir, path, size);
    let mut writer = BufWriter::new(File::create(&file)?);
    writer.write_all(&MAGIC)?;
    writer.write_u64::<LittleEndian>(size)?;
    writer.write_u64::<LittleEndian>(entries.len() as u64)?;
    for entry in entries {
        writer.write_u64::<LittleEndian>(entry.offset)?;
        writer.write_u32::<LittleEndian>(entry.length)?;
        writer.write_u32::<LittleEndian>(entry.time.seconds)?;
        writer.write_u32::<LittleEndian>(entry.time.microseconds)?;
    }
    writer.flush()?;
    debug!("Stored index cache {} ({} entries)", file.display(), entries.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries() -> Vec<IndexEntry> {
        vec![
            IndexEntry { offset: 0, length: 40, time: MessageTime::new(1, 2) },
            IndexEntry { offset: 40, length: 60, time: MessageTime::new(3, 4) },
        ]
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let log = Path::new("/logs/trace.dlt");
        store(dir.path(), log, 100, &entries()).unwrap();

        assert_eq!(load(dir.path(), log, 100), Some(entries()));
        assert_eq!(load(dir.path(), log, 101), None);
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let dir = TempDir::new().unwrap();
        let log = Path::new("trace.dlt");
        store(dir.path(), log, 100, &entries()).unwrap();

        let file = cache_path(dir.path(), log, 100);
        let bytes = fs::read(&file).unwrap();
        fs::write(&file, &bytes[..bytes.len() - 3]).unwrap();
        assert_eq!(load(dir.path(), log, 100), None);
    }

    #[test]
    fn test_key_depends_on_name_and_size() {
        let a = cache_key(Path::new("/a/trace.dlt"), 10);
        assert_eq!(a, cache_key(Path::new("/b/trace.dlt"), 10));
        assert_ne!(a, cache_key(Path::new("/a/trace.dlt"), 11));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_filter_cache_keyed_by_path_and_size() {
        let mut cache = FilterIndexCache::new();
        let mut filtered = FilteredIndex::new();
        filtered.push(3, None);
        cache.insert("errors", Path::new("a.dlt"), 100, filtered.clone());

        assert_eq!(cache.get("errors", Path::new("a.dlt"), 100), Some(&filtered));
        assert!(cache.get("errors", Path::new("a.dlt"), 120).is_none());
        assert!(cache.get("errors", Path::new("b.dlt"), 100).is_none());
        assert!(cache.get("warnings", Path::new("a.dlt"), 100).is_none());
    }
}
