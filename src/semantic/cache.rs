//! Durable embedding cache keyed by document id.
//!
//! File format: embeddings.bin
//!
//! Header (17 bytes):
//! - version: u8 (1)
//! - entry_count: u64 (little-endian)
//! - body_checksum: u32 (CRC32 of every byte after the header)
//! - header_checksum: u32 (CRC32 of header fields before it)
//!
//! Entries (repeated, ordered by doc_id):
//! - doc_id, filename, content_hash: u32 length (little-endian) + UTF-8 bytes
//! - updated_at: i64 (Unix milliseconds, little-endian)
//! - dimensions: u32 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! The whole file is rewritten atomically (temp file -> fsync -> rename) once
//! per upsert call, so a crash never leaves a hash paired with the wrong
//! vector. Use `upsert_many` to persist a batch with one rewrite.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + entry_count(8) + body_checksum(4) + header_checksum(4)
const HEADER_SIZE: usize = 17;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cache file: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: cache file may be corrupted")]
    ChecksumMismatch,

    #[error("Cache has been closed")]
    Closed,

    #[error("Cache lock poisoned")]
    Poisoned,
}

/// One cached embedding and the hash of the exact text that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub doc_id: String,
    pub filename: String,
    /// Hex SHA-256 of the text `embedding` was computed from
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

/// One pending write for [`EmbeddingCache::upsert_many`].
#[derive(Debug, Clone, Copy)]
pub struct CacheUpdate<'a> {
    pub doc_id: &'a str,
    pub filename: &'a str,
    pub content_hash: &'a str,
    pub embedding: &'a [f32],
}

/// File-backed key-value store of [`CacheEntry`] records.
///
/// All access goes through one mutex, so readers and writers sharing an
/// engine can interleave freely. Entries are never removed by normal
/// operation; see [`EmbeddingCache::prune`] for explicit cleanup.
pub struct EmbeddingCache {
    path: PathBuf,
    /// `None` once closed
    entries: Mutex<Option<BTreeMap<String, CacheEntry>>>,
    /// Completed file rewrites since open
    writes: AtomicUsize,
}

impl EmbeddingCache {
    /// Open the cache at `path`, loading existing entries.
    /// A missing file is an empty cache; a damaged one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();

        let entries = if path.exists() {
            let bytes = std::fs::read(&path)?;
            decode(&bytes)?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            BTreeMap::new()
        };

        log::debug!(
            "opened embedding cache at {} ({} entries)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path,
            entries: Mutex::new(Some(entries)),
            writes: AtomicUsize::new(0),
        })
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the entry for `doc_id`.
    pub fn get(&self, doc_id: &str) -> Result<Option<CacheEntry>, CacheError> {
        let guard = self.lock()?;
        let entries = guard.as_ref().ok_or(CacheError::Closed)?;
        Ok(entries.get(doc_id).cloned())
    }

    /// Insert or replace the entry for `doc_id`, stamping it with the current
    /// time, and persist the cache before returning.
    pub fn upsert(
        &self,
        doc_id: &str,
        filename: &str,
        content_hash: &str,
        embedding: &[f32],
    ) -> Result<(), CacheError> {
        self.upsert_many(&[CacheUpdate {
            doc_id,
            filename,
            content_hash,
            embedding,
        }])
    }

    /// Insert or replace every entry in `updates` and persist them with a
    /// single file rewrite.
    ///
    /// On a write failure all of them are rolled back so the in-memory state
    /// always matches what is on disk.
    pub fn upsert_many(&self, updates: &[CacheUpdate<'_>]) -> Result<(), CacheError> {
        let mut guard = self.lock()?;
        let entries = guard.as_mut().ok_or(CacheError::Closed)?;
        if updates.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut previous: Vec<(String, Option<CacheEntry>)> = Vec::with_capacity(updates.len());
        for update in updates {
            let entry = CacheEntry {
                doc_id: update.doc_id.to_string(),
                filename: update.filename.to_string(),
                content_hash: update.content_hash.to_string(),
                embedding: update.embedding.to_vec(),
                updated_at: now,
            };
            let prev = entries.insert(update.doc_id.to_string(), entry);
            previous.push((update.doc_id.to_string(), prev));
        }

        if let Err(e) = self.save(entries) {
            // undo in reverse so a doc_id repeated in `updates` ends at its original value
            for (doc_id, prev) in previous.into_iter().rev() {
                match prev {
                    Some(prev) => entries.insert(doc_id, prev),
                    None => entries.remove(&doc_id),
                };
            }
            return Err(e);
        }

        Ok(())
    }

    /// All entries, ordered by doc_id.
    pub fn all(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let guard = self.lock()?;
        let entries = guard.as_ref().ok_or(CacheError::Closed)?;
        Ok(entries.values().cloned().collect())
    }

    /// Number of cached entries.
    pub fn len(&self) -> Result<usize, CacheError> {
        let guard = self.lock()?;
        Ok(guard.as_ref().ok_or(CacheError::Closed)?.len())
    }

    /// Remove every entry whose doc_id is not in `keep`. Returns how many
    /// entries were dropped.
    pub fn prune(&self, keep: &[String]) -> Result<usize, CacheError> {
        let mut guard = self.lock()?;
        let entries = guard.as_mut().ok_or(CacheError::Closed)?;

        let stale: Vec<String> = entries
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut pruned = entries.clone();
        for id in &stale {
            pruned.remove(id);
        }
        self.save(&pruned)?;
        *entries = pruned;

        Ok(stale.len())
    }

    /// Release the cache. Every upsert is already durable, so nothing is
    /// flushed here; later calls return [`CacheError::Closed`].
    pub fn close(&self) -> Result<(), CacheError> {
        let mut guard = self.lock()?;
        if guard.take().is_some() {
            log::debug!("closed embedding cache at {}", self.path.display());
        }
        Ok(())
    }

    /// Number of times the cache file has been rewritten since open.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.entries
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<BTreeMap<String, CacheEntry>>>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Write `entries` to a temp file and atomically move it into place.
    fn save(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<(), CacheError> {
        let temp_path = self.path.with_extension("tmp");

        let result = write_file(&temp_path, &encode(entries))
            .and_then(|()| std::fs::rename(&temp_path, &self.path).map_err(CacheError::from));
        match result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                // Clean up temp file on error
                let _ = std::fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Serialize the full cache, header included.
fn encode(entries: &BTreeMap<String, CacheEntry>) -> Vec<u8> {
    let mut body = Vec::new();
    for entry in entries.values() {
        write_str(&mut body, &entry.doc_id);
        write_str(&mut body, &entry.filename);
        write_str(&mut body, &entry.content_hash);
        body.extend_from_slice(&entry.updated_at.timestamp_millis().to_le_bytes());
        body.extend_from_slice(&(entry.embedding.len() as u32).to_le_bytes());
        for &value in &entry.embedding {
            body.extend_from_slice(&value.to_le_bytes());
        }
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    let header_checksum = crc32fast::hash(&out);
    out.extend_from_slice(&header_checksum.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Parse a cache file produced by [`encode`].
fn decode(bytes: &[u8]) -> Result<BTreeMap<String, CacheEntry>, CacheError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CacheError::InvalidFormat("file shorter than header".to_string()));
    }

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(CacheError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut header = ByteReader::new(&bytes[1..HEADER_SIZE]);
    let entry_count = header.u64()?;
    let body_checksum = header.u32()?;
    let header_checksum = header.u32()?;

    if crc32fast::hash(&bytes[0..13]) != header_checksum {
        return Err(CacheError::ChecksumMismatch);
    }

    let body = &bytes[HEADER_SIZE..];
    if crc32fast::hash(body) != body_checksum {
        return Err(CacheError::ChecksumMismatch);
    }

    let mut reader = ByteReader::new(body);
    let mut entries = BTreeMap::new();
    for _ in 0..entry_count {
        let doc_id = reader.string()?;
        let filename = reader.string()?;
        let content_hash = reader.string()?;
        let millis = reader.i64()?;
        let updated_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            CacheError::InvalidFormat(format!("timestamp out of range for '{doc_id}'"))
        })?;
        let dimensions = reader.u32()? as usize;
        let embedding = (0..dimensions)
            .map(|_| reader.f32())
            .collect::<Result<Vec<f32>, CacheError>>()?;

        entries.insert(
            doc_id.clone(),
            CacheEntry {
                doc_id,
                filename,
                content_hash,
                embedding,
                updated_at,
            },
        );
    }

    if !reader.is_empty() {
        return Err(CacheError::InvalidFormat("trailing bytes after last entry".to_string()));
    }

    Ok(entries)
}

/// Little-endian cursor over a byte slice.
struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CacheError> {
        let chunk = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        if self.bytes.len() < len {
            return Err(CacheError::InvalidFormat("truncated entry".to_string()));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, CacheError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, CacheError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64, CacheError> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    fn f32(&mut self) -> Result<f32, CacheError> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    fn string(&mut self) -> Result<String, CacheError> {
        let len = self.u32()? as usize;
        let raw = self.slice(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CacheError::InvalidFormat("string is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn temp_cache() -> (EmbeddingCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path().join("embeddings.bin")).unwrap();
        (cache, dir)
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let (cache, _dir) = temp_cache();
        assert_eq!(cache.len().unwrap(), 0);
        assert!(cache.get("doc").unwrap().is_none());
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache").join("embeddings.bin");
        let cache = EmbeddingCache::open(&path).unwrap();
        cache.upsert("a", "a.txt", "h", &[1.0]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_upsert_and_get() {
        let (cache, _dir) = temp_cache();
        cache
            .upsert("doc_0001", "doc_0001.txt", "abc123", &[0.25, -1.5, 3.0])
            .unwrap();

        let entry = cache.get("doc_0001").unwrap().unwrap();
        assert_eq!(entry.doc_id, "doc_0001");
        assert_eq!(entry.filename, "doc_0001.txt");
        assert_eq!(entry.content_hash, "abc123");
        assert_eq!(entry.embedding, vec![0.25, -1.5, 3.0]);
    }

    #[test]
    fn test_upsert_replaces_and_updates_timestamp() {
        let (cache, _dir) = temp_cache();
        cache.upsert("doc", "doc.txt", "old", &[1.0, 0.0]).unwrap();
        let first = cache.get("doc").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.upsert("doc", "doc.txt", "new", &[0.0, 1.0]).unwrap();
        let second = cache.get("doc").unwrap().unwrap();

        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(second.content_hash, "new");
        assert_eq!(second.embedding, vec![0.0, 1.0]);
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        let vector = vec![0.1_f32, f32::MIN_POSITIVE, -7.75, 1e-30];

        {
            let cache = EmbeddingCache::open(&path).unwrap();
            cache.upsert("b", "b.txt", "hash-b", &vector).unwrap();
            cache.upsert("a", "a.txt", "hash-a", &[2.0]).unwrap();
            cache.close().unwrap();
        }

        let cache = EmbeddingCache::open(&path).unwrap();
        let all = cache.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].doc_id, "a");
        assert_eq!(all[1].doc_id, "b");

        let b = cache.get("b").unwrap().unwrap();
        assert_eq!(b.content_hash, "hash-b");
        // Bit-identical float round-trip
        let bits: Vec<u32> = b.embedding.iter().map(|x| x.to_bits()).collect();
        let expected: Vec<u32> = vector.iter().map(|x| x.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn test_closed_cache_rejects_operations() {
        let (cache, _dir) = temp_cache();
        cache.close().unwrap();

        assert!(cache.is_closed());
        assert!(matches!(cache.get("x"), Err(CacheError::Closed)));
        assert!(matches!(cache.upsert("x", "x", "h", &[1.0]), Err(CacheError::Closed)));
        assert!(matches!(cache.all(), Err(CacheError::Closed)));
        // Closing twice is fine
        cache.close().unwrap();
    }

    #[test]
    fn test_prune_removes_unlisted_entries() {
        let (cache, _dir) = temp_cache();
        cache.upsert("keep", "keep.txt", "h1", &[1.0]).unwrap();
        cache.upsert("gone", "gone.txt", "h2", &[2.0]).unwrap();

        let removed = cache.prune(&["keep".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("gone").unwrap().is_none());
        assert!(cache.get("keep").unwrap().is_some());

        let reopened = EmbeddingCache::open(cache.path()).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }

    #[test]
    fn test_prune_nothing_stale() {
        let (cache, _dir) = temp_cache();
        cache.upsert("a", "a.txt", "h", &[1.0]).unwrap();
        assert_eq!(cache.prune(&["a".to_string()]).unwrap(), 0);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        let cache = EmbeddingCache::open(&path).unwrap();
        cache.upsert("a", "a.txt", "h", &[1.0]).unwrap();

        // Make the target path a directory so rename fails
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let result = cache.upsert("b", "b.txt", "h", &[2.0]);
        assert!(result.is_err());
        assert!(cache.get("b").unwrap().is_none());
        assert!(cache.get("a").unwrap().is_some());
        assert!(!path.with_extension("tmp").exists());
    }

    fn update<'a>(doc_id: &'a str, embedding: &'a [f32]) -> CacheUpdate<'a> {
        CacheUpdate {
            doc_id,
            filename: "f.txt",
            content_hash: "h",
            embedding,
        }
    }

    #[test]
    fn test_upsert_many_writes_file_once() {
        let (cache, _dir) = temp_cache();
        let vectors: Vec<Vec<f32>> = (0..50).map(|i| vec![i as f32, 1.0]).collect();
        let ids: Vec<String> = (0..50).map(|i| format!("doc_{i:04}")).collect();
        let updates: Vec<CacheUpdate> = ids
            .iter()
            .zip(&vectors)
            .map(|(id, v)| update(id, v))
            .collect();

        cache.upsert_many(&updates).unwrap();
        assert_eq!(cache.write_count(), 1);
        assert_eq!(cache.len().unwrap(), 50);

        let reopened = EmbeddingCache::open(cache.path()).unwrap();
        assert_eq!(reopened.get("doc_0049").unwrap().unwrap().embedding, vec![49.0, 1.0]);
    }

    #[test]
    fn test_upsert_many_empty_is_noop() {
        let (cache, _dir) = temp_cache();
        cache.upsert_many(&[]).unwrap();
        assert_eq!(cache.write_count(), 0);
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_upsert_many_rolls_back_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        let cache = EmbeddingCache::open(&path).unwrap();
        cache.upsert("a", "a.txt", "old", &[1.0]).unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let result = cache.upsert_many(&[update("a", &[9.0]), update("b", &[2.0])]);
        assert!(result.is_err());
        assert_eq!(cache.write_count(), 1);

        let a = cache.get("a").unwrap().unwrap();
        assert_eq!(a.content_hash, "old");
        assert_eq!(a.embedding, vec![1.0]);
        assert!(cache.get("b").unwrap().is_none());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        {
            let cache = EmbeddingCache::open(&path).unwrap();
            cache.upsert("doc", "doc.txt", "hash", &[1.0, 2.0]).unwrap();
        }

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 2)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let result = EmbeddingCache::open(&path);
        assert!(matches!(result, Err(CacheError::ChecksumMismatch)));
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        let mut bytes = encode(&BTreeMap::new());
        bytes[0] = FORMAT_VERSION + 1;
        std::fs::write(&path, bytes).unwrap();

        let result = EmbeddingCache::open(&path);
        assert!(matches!(result, Err(CacheError::VersionMismatch(2, 1))));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        std::fs::write(&path, [FORMAT_VERSION, 0, 0]).unwrap();

        let result = EmbeddingCache::open(&path);
        assert!(matches!(result, Err(CacheError::InvalidFormat(_))));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let (cache, _dir) = temp_cache();
        let cache = std::sync::Arc::new(cache);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let id = format!("doc-{t}-{i}");
                        cache.upsert(&id, "f.txt", "h", &[t as f32, i as f32]).unwrap();
                        assert!(cache.get(&id).unwrap().is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len().unwrap(), 20);
    }
}
