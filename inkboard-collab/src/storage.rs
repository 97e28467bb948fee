//! Archive of room documents for the relay.
//!
//! When the last peer leaves a room its Yrs state is LZ4-compressed and
//! kept here; the next join restores it. With a directory configured the
//! snapshot is also written to `<dir>/<hex(room)>.snap` so it survives a
//! relay restart ([`SyncServer::recover`](crate::server::SyncServer::recover)).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::RwLock;

const SNAPSHOT_EXT: &str = "snap";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt snapshot for room {room}: {reason}")]
    Corrupt { room: String, reason: String },
}

/// Compressed room snapshots, in memory and optionally on disk.
pub struct SnapshotStore {
    memory: RwLock<HashMap<String, Vec<u8>>>,
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    /// Memory-only store.
    pub fn in_memory() -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Store that also persists under `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::info!("Snapshot store opened at {}", dir.display());
        Ok(Self {
            memory: RwLock::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Save a full Yrs update for `room`. Returns the compressed size.
    pub async fn save(&self, room: &str, update: &[u8]) -> Result<usize, StorageError> {
        let compressed = lz4_flex::compress_prepend_size(update);
        let size = compressed.len();

        if let Some(dir) = &self.dir {
            let path = snapshot_path(dir, room);
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &compressed).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
        self.memory.write().await.insert(room.to_string(), compressed);

        log::debug!("Saved snapshot for room {room}: {} -> {size} bytes", update.len());
        Ok(size)
    }

    /// Load the last saved update for `room`, if any.
    pub async fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cached = self.memory.read().await.get(room).cloned();
        let compressed = match cached {
            Some(bytes) => bytes,
            None => match &self.dir {
                Some(dir) => match tokio::fs::read(snapshot_path(dir, room)).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                },
                None => return Ok(None),
            },
        };

        lz4_flex::decompress_size_prepended(&compressed)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                room: room.to_string(),
                reason: e.to_string(),
            })
    }

    /// Every room with a snapshot, sorted.
    pub async fn rooms(&self) -> Result<Vec<String>, StorageError> {
        let mut rooms: Vec<String> = self.memory.read().await.keys().cloned().collect();

        if let Some(dir) = &self.dir {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                    continue;
                }
                let decoded = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(decode_room);
                match decoded {
                    Some(room) => rooms.push(room),
                    None => log::warn!("Ignoring unrecognised snapshot file {}", path.display()),
                }
            }
        }

        rooms.sort();
        rooms.dedup();
        Ok(rooms)
    }
}

fn snapshot_path(dir: &Path, room: &str) -> PathBuf {
    dir.join(format!("{}.{SNAPSHOT_EXT}", encode_room(room)))
}

/// Room names are arbitrary strings; hex keeps file names portable.
fn encode_room(room: &str) -> String {
    room.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_room(stem: &str) -> Option<String> {
    if stem.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..stem.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(stem.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_encoding() {
        for room in ["r1", "", "team/board #2", "ünïcode"] {
            assert_eq!(decode_room(&encode_room(room)).as_deref(), Some(room));
        }
        assert!(decode_room("abc").is_none());
        assert!(decode_room("zz").is_none());
    }

    #[tokio::test]
    async fn test_memory_save_load() {
        let store = SnapshotStore::in_memory();
        assert!(store.load("r1").await.unwrap().is_none());

        let update = vec![7u8; 1024];
        let size = store.save("r1", &update).await.unwrap();
        assert!(size < update.len());
        assert_eq!(store.load("r1").await.unwrap(), Some(update));
        assert_eq!(store.rooms().await.unwrap(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_disk_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SnapshotStore::open(dir.path()).await.unwrap();
            store.save("team/board", &[1, 2, 3]).await.unwrap();
        }

        let reopened = SnapshotStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.rooms().await.unwrap(), vec!["team/board".to_string()]);
        assert_eq!(reopened.load("team/board").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).await.unwrap();
        tokio::fs::write(snapshot_path(dir.path(), "r1"), b"\x10\x00\x00\x00junk")
            .await
            .unwrap();

        let err = store.load("r1").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
