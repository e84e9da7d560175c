//! Durable G-Set: an in-memory `sync_core::GSet` mirrored to sled so a
//! restarted daemon recovers its set without re-syncing from peers.

use crate::storage::{Storage, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use sync_core::{Event, GSet, Projected};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("hash collision on {0}")]
    HashCollision(String),
}

/// The durable, append-only event log a device owns. Wraps a pure in-memory
/// [`GSet`] and keeps sled in sync with it.
pub struct EventLog {
    storage: Arc<Storage>,
    gset: RwLock<GSet>,
}

impl EventLog {
    /// Open storage and rebuild the in-memory G-Set from it.
    pub fn open(storage: Arc<Storage>) -> Result<Self, EventLogError> {
        let mut gset = GSet::new();
        for event in storage.all_events()? {
            // events already passed validation when first written
            let _ = gset.add(event);
        }
        Ok(Self { storage, gset: RwLock::new(gset) })
    }

    /// Append a locally-originated event. The event is durably written
    /// before it is inserted into the in-memory set, so no reader can ever
    /// observe an event in memory that a crash could still lose.
    pub fn add(&self, event: Event) -> Result<bool, EventLogError> {
        let hash = event.hash.clone();
        let mut gset = self.gset.write();
        if !gset.contains(&hash) {
            self.storage.put_event(&event)?;
        }
        gset.add(event).map_err(|_| EventLogError::HashCollision(hash))
    }

    /// Merge events received from a peer. Returns the number newly added.
    /// Each event is durably written before it becomes visible in the
    /// in-memory set.
    pub fn merge(&self, events: Vec<Event>) -> Result<usize, EventLogError> {
        let mut gset = self.gset.write();
        let mut added = 0;
        for event in events {
            let hash = event.hash.clone();
            if !gset.contains(&hash) {
                self.storage.put_event(&event)?;
            }
            match gset.add(event) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(_) => {
                    tracing::warn!(hash = %hash, "hash collision on merge, keeping first-written event");
                }
            }
        }
        Ok(added)
    }

    pub fn hashes(&self) -> Vec<String> {
        self.gset.read().hashes()
    }

    pub fn events_for(&self, hashes: &[String]) -> Vec<Event> {
        self.gset.read().events_for(hashes.iter().map(String::as_str))
    }

    pub fn project(&self) -> BTreeMap<String, Projected> {
        self.gset.read().project()
    }

    pub fn len(&self) -> usize {
        self.gset.read().len()
    }

    pub fn flush(&self) -> Result<(), EventLogError> {
        Ok(self.storage.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::EventType;
    use tempfile::tempdir;

    fn log() -> (EventLog, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        (EventLog::open(storage).unwrap(), dir)
    }

    #[test]
    fn add_then_reopen_recovers_events() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let log = EventLog::open(storage.clone()).unwrap();
        let event = Event::new("1".into(), EventType::Create, "n1".into(), "hi".into(), 1000);
        log.add(event.clone()).unwrap();

        let reopened = EventLog::open(storage).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.hashes(), vec![event.hash]);
    }

    #[test]
    fn merge_reports_only_newly_added() {
        let (log, _dir) = log();
        let e1 = Event::new("1".into(), EventType::Create, "n1".into(), "a".into(), 1);
        let e2 = Event::new("2".into(), EventType::Create, "n2".into(), "b".into(), 2);
        assert_eq!(log.merge(vec![e1.clone(), e2.clone()]).unwrap(), 2);
        assert_eq!(log.merge(vec![e1, e2]).unwrap(), 0);
    }
}
