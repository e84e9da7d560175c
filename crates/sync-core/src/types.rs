//! Event and G-Set: the replicated data model of the sync protocol.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Discriminant for what an [`Event`] does to its subject.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

/// An immutable, content-addressed record in the replicated log.
///
/// `hash` is a pure function of every other field and is recomputed (not
/// trusted) whenever an event is validated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub subject_id: String,
    pub content: String,
    pub timestamp: u64,
    pub hash: String,
}

impl Event {
    /// Build a new event, computing its hash from the other fields.
    pub fn new(id: String, event_type: EventType, subject_id: String, content: String, timestamp: u64) -> Self {
        let hash = compute_hash(&id, event_type, &subject_id, timestamp, &content);
        Self { id, event_type, subject_id, content, timestamp, hash }
    }

    /// Recompute the hash and compare against the stored value.
    pub fn hash_is_valid(&self) -> bool {
        compute_hash(&self.id, self.event_type, &self.subject_id, self.timestamp, &self.content) == self.hash
    }
}

/// 16-hex-character (64-bit) prefix of SHA-256 over the canonical
/// concatenation `id || type || subject_id || timestamp || content`.
fn compute_hash(id: &str, event_type: EventType, subject_id: &str, timestamp: u64, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(subject_id.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// A materialized subject: its content and the timestamp of the event that
/// last wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projected {
    pub content: String,
    pub timestamp: u64,
}

/// A grow-only set of events, keyed by content hash.
///
/// `add` and `merge` are idempotent; the set only ever grows. `project`
/// folds the set deterministically into a `subject_id -> Projected` view.
#[derive(Clone, Debug, Default)]
pub struct GSet {
    events: BTreeMap<String, Event>,
}

impl GSet {
    pub fn new() -> Self {
        Self { events: BTreeMap::new() }
    }

    /// Insert `event`, returning `true` iff it was not already present.
    ///
    /// If a distinct event is observed under a hash already present, the
    /// original is kept (first write wins) and `HashCollision` is returned
    /// instead of silently overwriting it.
    pub fn add(&mut self, event: Event) -> Result<bool> {
        match self.events.get(&event.hash) {
            Some(existing) if existing != &event => Err(Error::HashCollision(event.hash.clone())),
            Some(_) => Ok(false),
            None => {
                self.events.insert(event.hash.clone(), event);
                Ok(true)
            }
        }
    }

    /// All hashes currently held.
    pub fn hashes(&self) -> Vec<String> {
        self.events.keys().cloned().collect()
    }

    /// Whether `hash` is already present.
    pub fn contains(&self, hash: &str) -> bool {
        self.events.contains_key(hash)
    }

    /// Events for the requested hashes; unknown hashes are silently skipped.
    pub fn events_for<'a, I: IntoIterator<Item = &'a str>>(&self, hashes: I) -> Vec<Event> {
        hashes.into_iter().filter_map(|h| self.events.get(h).cloned()).collect()
    }

    /// Merge a batch of events, as if received from a peer. Returns the
    /// number of events that were newly added.
    pub fn merge<I: IntoIterator<Item = Event>>(&mut self, events: I) -> usize {
        let mut added = 0;
        for event in events {
            match self.add(event) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(Error::HashCollision(hash)) => {
                    tracing::warn!(hash = %hash, "hash collision on merge, keeping first-written event");
                }
                Err(_) => {}
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    /// Deterministically fold the set into a `subject_id -> Projected` view.
    ///
    /// Events are ordered ascending by `timestamp`, ties broken
    /// lexicographically on `hash`, so that every replica with the same
    /// hash set produces an identical projection.
    pub fn project(&self) -> BTreeMap<String, Projected> {
        let mut ordered: Vec<&Event> = self.events.values().collect();
        ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.hash.cmp(&b.hash)));

        let mut view: BTreeMap<String, Projected> = BTreeMap::new();
        for event in ordered {
            match event.event_type {
                EventType::Create | EventType::Update => {
                    view.insert(
                        event.subject_id.clone(),
                        Projected { content: event.content.clone(), timestamp: event.timestamp },
                    );
                }
                EventType::Delete => {
                    view.remove(&event.subject_id);
                }
            }
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(id: &str, ty: EventType, subject: &str, content: &str, ts: u64) -> Event {
        Event::new(id.into(), ty, subject.into(), content.into(), ts)
    }

    #[test]
    fn hash_is_pure_function_of_fields() {
        let a = ev("1", EventType::Create, "n1", "hello", 1000);
        let b = ev("1", EventType::Create, "n1", "hello", 1000);
        assert_eq!(a.hash, b.hash);
        assert!(a.hash_is_valid());
    }

    #[test]
    fn add_is_idempotent() {
        let mut set = GSet::new();
        let e = ev("1", EventType::Create, "n1", "hello", 1000);
        assert!(set.add(e.clone()).unwrap());
        assert!(!set.add(e).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let e1 = ev("1", EventType::Create, "n1", "a", 10);
        let e2 = ev("2", EventType::Update, "n1", "b", 20);
        let e3 = ev("3", EventType::Create, "n2", "c", 5);

        let mut left = GSet::new();
        left.merge(vec![e1.clone(), e2.clone()]);
        left.merge(vec![e3.clone()]);

        let mut right = GSet::new();
        right.merge(vec![e3, e2]);
        right.merge(vec![e1]);

        assert_eq!(left.hashes().into_iter().collect::<std::collections::BTreeSet<_>>(),
                   right.hashes().into_iter().collect::<std::collections::BTreeSet<_>>());
        assert_eq!(left.project(), right.project());
    }

    #[test]
    fn projection_is_order_independent() {
        let e1 = ev("1", EventType::Create, "n1", "first", 100);
        let e2 = ev("2", EventType::Update, "n1", "second", 200);

        let mut a = GSet::new();
        a.merge(vec![e1.clone(), e2.clone()]);
        let mut b = GSet::new();
        b.merge(vec![e2, e1]);

        assert_eq!(a.project(), b.project());
        assert_eq!(a.project().get("n1").unwrap().content, "second");
    }

    #[test]
    fn projection_tie_break_is_lexicographic_on_hash() {
        let mut e1 = ev("1", EventType::Create, "n1", "aaaa", 100);
        let mut e2 = ev("2", EventType::Update, "n1", "bbbb", 100);
        e1.hash = "1111111111111111".to_string();
        e2.hash = "2222222222222222".to_string();

        let mut set = GSet::new();
        set.merge(vec![e1, e2.clone()]);
        // same timestamp on both events; the lexicographically greater hash
        // ("2222...") must win regardless of insertion order
        assert_eq!(set.project().get("n1").unwrap().content, e2.content);
    }

    #[test]
    fn delete_removes_subject_from_projection() {
        let e1 = ev("1", EventType::Create, "n1", "hi", 1);
        let e2 = ev("2", EventType::Delete, "n1", "", 2);
        let mut set = GSet::new();
        set.merge(vec![e1, e2]);
        assert!(set.project().get("n1").is_none());
    }
}
