//! Durable storage for the event log, backed by sled.

use std::path::Path;
use sync_core::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage backend for `syncd`: a single sled tree of `hash -> Event`, plus
/// a small metadata tree for anything process-level that should survive a
/// restart.
pub struct Storage {
    db: sled::Db,
    events: sled::Tree,
    metadata: sled::Tree,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self { db, events, metadata })
    }

    pub fn put_event(&self, event: &Event) -> Result<(), StorageError> {
        let value = serde_json::to_vec(event)?;
        self.events.insert(event.hash.as_bytes(), value)?;
        Ok(())
    }

    pub fn has_event(&self, hash: &str) -> Result<bool, StorageError> {
        Ok(self.events.contains_key(hash.as_bytes())?)
    }

    pub fn all_events(&self) -> Result<Vec<Event>, StorageError> {
        self.events
            .iter()
            .values()
            .map(|v| {
                let bytes = v?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::EventType;
    use tempfile::tempdir;

    #[test]
    fn stores_and_recovers_events() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let event = Event::new("1".into(), EventType::Create, "n1".into(), "hi".into(), 1000);
        storage.put_event(&event).unwrap();
        assert!(storage.has_event(&event.hash).unwrap());

        let all = storage.all_events().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hash, event.hash);
    }

    #[test]
    fn metadata_round_trips() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.put_metadata("device_id", b"abc").unwrap();
        assert_eq!(storage.get_metadata("device_id").unwrap(), Some(b"abc".to_vec()));
    }
}
