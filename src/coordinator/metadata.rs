//! File metadata store
//!
//! The authoritative path → chunks → locations map. One exclusive lock
//! guards the whole map: every mutating command acquires it, mutates,
//! persists the full document to `<metadata_dir>/metadata.json` (temp file
//! + rename), and releases. The lock is never held across a network call.

use crate::common::{Error, FileEntry, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const METADATA_FILE: &str = "metadata.json";

/// Work item for the replication repair loop.
#[derive(Debug, Clone)]
pub struct RepairTask {
    pub path: String,
    pub chunk_id: String,
    pub deficit: usize,
    pub holders: Vec<String>,
    pub size: u64,
}

pub struct MetadataStore {
    metadata_dir: PathBuf,
    replication_factor: usize,
    files: Mutex<HashMap<String, FileEntry>>,
}

impl MetadataStore {
    /// Open the store, loading any persisted state. A metadata file that
    /// exists but does not parse refuses to open: the operator must restore
    /// from a backup rather than silently lose committed state.
    pub fn open(metadata_dir: impl AsRef<Path>, replication_factor: usize) -> Result<Self> {
        let metadata_dir = metadata_dir.as_ref().to_path_buf();
        fs::create_dir_all(&metadata_dir)?;

        let metadata_file = metadata_dir.join(METADATA_FILE);
        let files = if metadata_file.exists() {
            let content = fs::read_to_string(&metadata_file)?;
            let files: HashMap<String, FileEntry> = serde_json::from_str(&content)
                .map_err(|e| Error::MetadataCorrupted(format!("{}: {}", metadata_file.display(), e)))?;
            tracing::info!("loaded metadata for {} files", files.len());
            files
        } else {
            tracing::info!("no existing metadata, starting fresh");
            HashMap::new()
        };

        Ok(Self {
            metadata_dir,
            replication_factor,
            files: Mutex::new(files),
        })
    }

    /// Rewrite metadata.json atomically. Called with the map lock held.
    fn persist(&self, files: &HashMap<String, FileEntry>) -> Result<()> {
        let content = serde_json::to_string_pretty(files)
            .map_err(|e| Error::Internal(format!("serialize metadata: {}", e)))?;
        let tmp = self.metadata_dir.join(format!("{}.tmp", METADATA_FILE));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.metadata_dir.join(METADATA_FILE))?;
        Ok(())
    }

    fn deficit_for(&self, locations: usize) -> usize {
        self.replication_factor.saturating_sub(locations)
    }

    /// Initialize a file entry. A no-op if the entry already exists (the
    /// incremental commit path may have created it first).
    pub fn add_file(&self, path: &str, size: u64, chunk_ids: Vec<String>) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            tracing::debug!(path, "add_file: entry already exists");
            return Ok(());
        }
        let mut entry = FileEntry::new(path.to_string());
        entry.total_size = size;
        entry.chunk_ids = chunk_ids;
        files.insert(path.to_string(), entry);
        self.persist(&files)
    }

    /// Install committed locations for a chunk after a successful write.
    /// Creates the file entry on the first commit, extends `chunk_ids` if
    /// the chunk is new, and recomputes the replication deficit.
    pub fn update_file_metadata(
        &self,
        path: &str,
        chunk_id: &str,
        locations: Vec<String>,
        size_delta: u64,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .entry(path.to_string())
            .or_insert_with(|| FileEntry::new(path.to_string()));

        if !entry.chunk_ids.iter().any(|c| c == chunk_id) {
            entry.chunk_ids.push(chunk_id.to_string());
            entry.chunk_offsets.insert(chunk_id.to_string(), size_delta);
            entry.last_chunk_id = Some(chunk_id.to_string());
            entry.last_chunk_offset = size_delta;
        }
        entry.total_size += size_delta;

        let holders = entry
            .chunk_locations
            .entry(chunk_id.to_string())
            .or_default();
        for addr in locations {
            if !holders.contains(&addr) {
                holders.push(addr);
            }
        }

        let deficit = self.deficit_for(holders.len());
        if deficit > 0 {
            entry
                .pending_replication
                .insert(chunk_id.to_string(), deficit);
        } else {
            entry.pending_replication.remove(chunk_id);
        }

        self.persist(&files)
    }

    /// Advance a chunk's valid byte count after an append. Offsets must be
    /// strictly monotonic: a losing concurrent appender gets a stale-offset
    /// error and retries against the fresh tail.
    pub fn update_chunk_offset(&self, path: &str, chunk_id: &str, new_offset: u64) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(path)
            .ok_or_else(|| Error::UnknownFile(path.to_string()))?;

        let current = *entry
            .chunk_offsets
            .get(chunk_id)
            .ok_or_else(|| Error::UnknownChunk(chunk_id.to_string()))?;
        if new_offset <= current {
            return Err(Error::StaleOffset {
                current,
                proposed: new_offset,
            });
        }

        entry.total_size += new_offset - current;
        entry.chunk_offsets.insert(chunk_id.to_string(), new_offset);
        if entry.last_chunk_id.as_deref() == Some(chunk_id) {
            entry.last_chunk_offset = new_offset;
        }

        self.persist(&files)
    }

    pub fn get_file(&self, path: &str) -> Option<FileEntry> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn list_files(&self, prefix: Option<&str>) -> Vec<String> {
        let files = self.files.lock().unwrap();
        let mut paths: Vec<String> = files
            .keys()
            .filter(|p| prefix.map_or(true, |pre| p.starts_with(pre)))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Strip a dead server's address from every chunk location set,
    /// enqueueing replication deficits. Returns the number of chunks that
    /// lost a replica.
    pub fn strip_server(&self, address: &str) -> Result<usize> {
        let mut files = self.files.lock().unwrap();
        let mut stripped = 0;

        for entry in files.values_mut() {
            for (chunk_id, holders) in entry.chunk_locations.iter_mut() {
                let before = holders.len();
                holders.retain(|a| a != address);
                if holders.len() < before {
                    stripped += 1;
                    let deficit = self.replication_factor.saturating_sub(holders.len());
                    if deficit > 0 {
                        entry.pending_replication.insert(chunk_id.clone(), deficit);
                    }
                }
            }
        }

        if stripped > 0 {
            self.persist(&files)?;
        }
        Ok(stripped)
    }

    /// Snapshot the chunks still wanting replicas. Taken under the lock and
    /// released before any network activity.
    pub fn pending_work(&self) -> Vec<RepairTask> {
        let files = self.files.lock().unwrap();
        let mut tasks = Vec::new();
        for entry in files.values() {
            for (chunk_id, &deficit) in &entry.pending_replication {
                if deficit == 0 {
                    continue;
                }
                tasks.push(RepairTask {
                    path: entry.path.clone(),
                    chunk_id: chunk_id.clone(),
                    deficit,
                    holders: entry
                        .chunk_locations
                        .get(chunk_id)
                        .cloned()
                        .unwrap_or_default(),
                    size: entry.chunk_offsets.get(chunk_id).copied().unwrap_or(0),
                });
            }
        }
        tasks
    }

    /// Record replicas created by the repair loop and recompute the deficit.
    pub fn complete_replication(
        &self,
        path: &str,
        chunk_id: &str,
        new_holders: Vec<String>,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(path)
            .ok_or_else(|| Error::UnknownFile(path.to_string()))?;

        let holders = entry
            .chunk_locations
            .entry(chunk_id.to_string())
            .or_default();
        for addr in new_holders {
            if !holders.contains(&addr) {
                holders.push(addr);
            }
        }

        let deficit = self.deficit_for(holders.len());
        if deficit > 0 {
            entry
                .pending_replication
                .insert(chunk_id.to_string(), deficit);
        } else {
            entry.pending_replication.remove(chunk_id);
        }

        self.persist(&files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_update_creates_entry_and_tracks_deficit() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 3).unwrap();

        store
            .update_file_metadata("/r/a.txt", "c1", vec!["s1".into()], 1024)
            .unwrap();

        let entry = store.get_file("/r/a.txt").unwrap();
        assert_eq!(entry.total_size, 1024);
        assert_eq!(entry.chunk_ids, vec!["c1".to_string()]);
        assert_eq!(entry.chunk_locations["c1"], vec!["s1".to_string()]);
        assert_eq!(entry.chunk_offsets["c1"], 1024);
        assert_eq!(entry.last_chunk_id.as_deref(), Some("c1"));
        assert_eq!(entry.pending_replication["c1"], 2);
    }

    #[test]
    fn test_deficit_clears_at_target() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 2).unwrap();

        store
            .update_file_metadata("/f", "c1", vec!["s1".into(), "s2".into()], 10)
            .unwrap();
        let entry = store.get_file("/f").unwrap();
        assert!(entry.pending_replication.is_empty());
    }

    #[test]
    fn test_offset_update_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 1).unwrap();

        store
            .update_file_metadata("/f", "c1", vec!["s1".into()], 1000)
            .unwrap();
        store.update_chunk_offset("/f", "c1", 1024).unwrap();

        let entry = store.get_file("/f").unwrap();
        assert_eq!(entry.total_size, 1024);
        assert_eq!(entry.last_chunk_offset, 1024);

        // Equal and lower offsets are stale.
        assert!(matches!(
            store.update_chunk_offset("/f", "c1", 1024),
            Err(Error::StaleOffset { .. })
        ));
        assert!(matches!(
            store.update_chunk_offset("/f", "c1", 500),
            Err(Error::StaleOffset { .. })
        ));
    }

    #[test]
    fn test_offset_update_unknown_targets() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 1).unwrap();

        assert!(matches!(
            store.update_chunk_offset("/missing", "c1", 10),
            Err(Error::UnknownFile(_))
        ));

        store
            .update_file_metadata("/f", "c1", vec!["s1".into()], 10)
            .unwrap();
        assert!(matches!(
            store.update_chunk_offset("/f", "nope", 20),
            Err(Error::UnknownChunk(_))
        ));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        {
            let store = MetadataStore::open(dir.path(), 3).unwrap();
            store.add_file("/f", 2048, vec!["c1".into(), "c2".into()]).unwrap();
            store
                .update_file_metadata("/f", "c1", vec!["s1".into()], 1024)
                .unwrap();
        }
        {
            let store = MetadataStore::open(dir.path(), 3).unwrap();
            let entry = store.get_file("/f").unwrap();
            assert_eq!(entry.chunk_ids.len(), 2);
            assert_eq!(entry.chunk_locations["c1"], vec!["s1".to_string()]);
        }
    }

    #[test]
    fn test_corrupt_metadata_refuses_to_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(METADATA_FILE), "{not json").unwrap();
        assert!(matches!(
            MetadataStore::open(dir.path(), 3),
            Err(Error::MetadataCorrupted(_))
        ));
    }

    #[test]
    fn test_strip_server_enqueues_repair() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 3).unwrap();

        store
            .update_file_metadata("/f", "c1", vec!["a".into(), "b".into(), "c".into()], 10)
            .unwrap();
        assert!(store.get_file("/f").unwrap().pending_replication.is_empty());

        let stripped = store.strip_server("b").unwrap();
        assert_eq!(stripped, 1);

        let entry = store.get_file("/f").unwrap();
        assert_eq!(entry.chunk_locations["c1"], vec!["a".to_string(), "c".to_string()]);
        assert_eq!(entry.pending_replication["c1"], 1);

        let tasks = store.pending_work();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].chunk_id, "c1");
        assert_eq!(tasks[0].deficit, 1);
        assert_eq!(tasks[0].size, 10);
    }

    #[test]
    fn test_complete_replication_clears_pending() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 2).unwrap();

        store
            .update_file_metadata("/f", "c1", vec!["a".into()], 10)
            .unwrap();
        assert_eq!(store.pending_work().len(), 1);

        store
            .complete_replication("/f", "c1", vec!["b".into()])
            .unwrap();
        assert!(store.pending_work().is_empty());
        assert_eq!(store.get_file("/f").unwrap().chunk_locations["c1"].len(), 2);
    }

    #[test]
    fn test_add_file_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), 3).unwrap();

        store
            .update_file_metadata("/f", "c1", vec!["a".into()], 10)
            .unwrap();
        // A trailing add_file must not clobber the incrementally built entry.
        store.add_file("/f", 10, vec!["c1".into()]).unwrap();
        let entry = store.get_file("/f").unwrap();
        assert_eq!(entry.chunk_locations["c1"], vec!["a".to_string()]);
    }
}
