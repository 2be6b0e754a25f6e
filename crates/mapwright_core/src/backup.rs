//! Open-time snapshots of map files.
//!
//! When a map opens, the session copies its on-disk bytes into a private
//! backups directory. That copy is the baseline the writer diffs against
//! on every save, and it doubles as a recovery copy if the editor dies
//! with the map still open. Snapshots are per-document: at most one per
//! open map, never shared between ids, deleted when the document closes.
//!
//! The directory is an implementation detail, not a user-facing archive;
//! nothing in it is meant to outlive the session that wrote it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MapwrightError, Result};
use crate::fs::FileSystem;
use crate::session::MapId;

/// Content snapshots of currently-open maps, keyed by document identity.
///
/// All I/O goes through the injected [`FileSystem`]; the id -> path table
/// sits behind its own lock and is never held across a read or write, so
/// snapshotting one map cannot stall queries about another.
pub struct BackupStore<FS: FileSystem> {
    fs: FS,
    dir: PathBuf,
    entries: Mutex<HashMap<MapId, PathBuf>>,
}

impl<FS: FileSystem> BackupStore<FS> {
    /// A store writing snapshots under `dir`. The directory is created
    /// lazily on the first snapshot.
    pub fn new(fs: FS, dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: dir.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A store under the platform data directory
    /// (`<data dir>/mapwright/backups`).
    pub fn in_default_location(fs: FS) -> Result<Self> {
        let dir = dirs::data_dir()
            .ok_or(MapwrightError::NoBackupDir)?
            .join("mapwright")
            .join("backups");
        Ok(Self::new(fs, dir))
    }

    /// Directory snapshots are written under
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the original bytes of a freshly opened map.
    ///
    /// The file is named `<env>-<map>-<millis>.backup`, with a numeric
    /// suffix when two snapshots land in the same millisecond. A second
    /// snapshot for the same id replaces the first.
    pub fn snapshot(
        &self,
        id: MapId,
        env_name: &str,
        map_path: &Path,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        self.fs.create_dir_all(&self.dir)?;

        let stem = map_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "map".to_string());
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);

        let mut candidate = self.dir.join(format!("{env_name}-{stem}-{millis}.backup"));
        let mut attempt = 1u32;
        while self.fs.exists(&candidate) {
            candidate = self
                .dir
                .join(format!("{env_name}-{stem}-{millis}-{attempt}.backup"));
            attempt += 1;
        }

        self.fs
            .write_binary(&candidate, bytes)
            .map_err(|source| MapwrightError::FileWrite {
                path: candidate.clone(),
                source,
            })?;
        log::debug!("snapshotted {id} to {}", candidate.display());

        let replaced = {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(id, candidate.clone())
        };
        if let Some(old) = replaced {
            self.remove_file(&old);
        }

        Ok(candidate)
    }

    /// The snapshot bytes for an id: `None` when no snapshot exists,
    /// otherwise the result of reading it back.
    pub fn read(&self, id: MapId) -> Option<Result<Vec<u8>>> {
        let path = {
            let entries = self.entries.lock().unwrap();
            entries.get(&id).cloned()
        }?;
        Some(
            self.fs
                .read_binary(&path)
                .map_err(|source| MapwrightError::FileRead { path, source }),
        )
    }

    /// True when a snapshot is registered for the id
    pub fn contains(&self, id: MapId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    /// Drop the snapshot for a closed document. Unknown ids are a no-op;
    /// file deletion is best effort.
    pub fn discard(&self, id: MapId) {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&id)
        };
        if let Some(path) = removed {
            self.remove_file(&path);
        }
    }

    /// Drop every snapshot, e.g. when the environment resets
    pub fn clear(&self) {
        let drained: Vec<PathBuf> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, path)| path).collect()
        };
        for path in drained {
            self.remove_file(&path);
        }
    }

    fn remove_file(&self, path: &Path) {
        if let Err(err) = self.fs.delete_file(path) {
            log::warn!("could not delete backup {}: {err}", path.display());
        }
    }
}

impl<FS: FileSystem> std::fmt::Debug for BackupStore<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().unwrap();
        f.debug_struct("BackupStore")
            .field("dir", &self.dir)
            .field("entries", &entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    fn store() -> BackupStore<InMemoryFileSystem> {
        BackupStore::new(InMemoryFileSystem::new(), "/backups")
    }

    #[test]
    fn snapshot_writes_under_the_backup_directory() {
        let store = store();
        let path = store
            .snapshot(MapId::new(1), "station", Path::new("/env/maps/deck_one.dmm"), b"bytes")
            .unwrap();

        assert!(path.starts_with("/backups"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("station-deck_one-"));
        assert!(name.ends_with(".backup"));
        assert!(store.contains(MapId::new(1)));
        assert_eq!(store.read(MapId::new(1)).unwrap().unwrap(), b"bytes");
    }

    #[test]
    fn same_millisecond_snapshots_get_distinct_names() {
        let store = store();
        let first = store
            .snapshot(MapId::new(1), "e", Path::new("/env/a.dmm"), b"one")
            .unwrap();
        let second = store
            .snapshot(MapId::new(2), "e", Path::new("/env/a.dmm"), b"two")
            .unwrap();
        let third = store
            .snapshot(MapId::new(3), "e", Path::new("/env/a.dmm"), b"three")
            .unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(store.read(MapId::new(2)).unwrap().unwrap(), b"two");
    }

    #[test]
    fn resnapshot_replaces_the_old_copy() {
        let store = store();
        let first = store
            .snapshot(MapId::new(1), "e", Path::new("/env/a.dmm"), b"old")
            .unwrap();
        store
            .snapshot(MapId::new(1), "e", Path::new("/env/a.dmm"), b"new")
            .unwrap();

        assert!(!store.fs.exists(&first));
        assert_eq!(store.read(MapId::new(1)).unwrap().unwrap(), b"new");
    }

    #[test]
    fn discard_deletes_the_file_and_forgets_the_id() {
        let store = store();
        let path = store
            .snapshot(MapId::new(1), "e", Path::new("/env/a.dmm"), b"x")
            .unwrap();

        store.discard(MapId::new(1));
        assert!(!store.contains(MapId::new(1)));
        assert!(store.read(MapId::new(1)).is_none());
        assert!(!store.fs.exists(&path));

        // Unknown ids are silently ignored
        store.discard(MapId::new(9));
    }

    #[test]
    fn clear_drops_every_snapshot() {
        let store = store();
        store
            .snapshot(MapId::new(1), "e", Path::new("/env/a.dmm"), b"a")
            .unwrap();
        store
            .snapshot(MapId::new(2), "e", Path::new("/env/b.dmm"), b"b")
            .unwrap();

        store.clear();
        assert!(!store.contains(MapId::new(1)));
        assert!(!store.contains(MapId::new(2)));
        assert!(store.fs.list_all_files().is_empty());
    }
}
