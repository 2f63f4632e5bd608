//! TTL key-value state store used by the stream backend.
//!
//! Holds everything the append-only log cannot express after the fact:
//! mirrored lifecycle states, cooperative cancel flags, offloaded oversized
//! payloads, and last-appended offsets for coalescing works. Entries expire
//! lazily on read.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::work::WorkState;
use crate::util::clock::now_ms;

const STATE_PREFIX: &str = "state:";
const CANCEL_PREFIX: &str = "cancel:";
const OVERFLOW_PREFIX: &str = "overflow:";
const OFFSET_PREFIX: &str = "offset:";

struct Entry {
    value: Vec<u8>,
    expires_at_ms: Option<u128>,
}

impl Entry {
    fn expired(&self, now: u128) -> bool {
        self.expires_at_ms.is_some_and(|t| t <= now)
    }
}

/// In-process key-value store with per-entry TTL.
#[derive(Default)]
pub struct StateStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl StateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous one. `ttl` of `None` keeps the
    /// entry until removed.
    pub fn put(&self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at_ms = ttl.map(|t| now_ms() + t.as_millis());
        self.entries.lock().insert(
            key.into(),
            Entry {
                value,
                expires_at_ms,
            },
        );
    }

    /// Fetch a value. Expired entries are dropped and read as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        let now = now_ms();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    /// Remove a value, returning whether it was present (and live).
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(e) => !e.expired(now_ms()),
            None => false,
        }
    }

    /// Mirror a work unit's lifecycle state.
    pub fn put_state(&self, work_id: &str, state: WorkState, ttl: Option<Duration>) {
        // single-byte tag, no need for serde here
        let tag = match state {
            WorkState::Unknown => b'u',
            WorkState::Scheduled => b's',
            WorkState::Running => b'r',
            WorkState::Completed => b'd',
            WorkState::Failed => b'f',
            WorkState::Canceled => b'c',
        };
        self.put(format!("{STATE_PREFIX}{work_id}"), vec![tag], ttl);
    }

    /// Mirrored lifecycle state of a work unit, when stored and unexpired.
    #[must_use]
    pub fn get_state(&self, work_id: &str) -> Option<WorkState> {
        match self.get(&format!("{STATE_PREFIX}{work_id}"))?.first()? {
            b'u' => Some(WorkState::Unknown),
            b's' => Some(WorkState::Scheduled),
            b'r' => Some(WorkState::Running),
            b'd' => Some(WorkState::Completed),
            b'f' => Some(WorkState::Failed),
            b'c' => Some(WorkState::Canceled),
            _ => None,
        }
    }

    /// Drop the mirrored state of a work unit.
    pub fn clear_state(&self, work_id: &str) {
        self.remove(&format!("{STATE_PREFIX}{work_id}"));
    }

    /// Raise the cooperative cancel flag for a work id.
    pub fn request_cancel(&self, work_id: &str, ttl: Option<Duration>) {
        self.put(format!("{CANCEL_PREFIX}{work_id}"), vec![1], ttl);
    }

    /// Whether cancellation was requested for a work id.
    #[must_use]
    pub fn is_cancel_requested(&self, work_id: &str) -> bool {
        self.get(&format!("{CANCEL_PREFIX}{work_id}")).is_some()
    }

    /// Lower the cancel flag once it has been honored.
    pub fn clear_cancel(&self, work_id: &str) {
        self.remove(&format!("{CANCEL_PREFIX}{work_id}"));
    }

    /// Offload an oversized payload; returns the key to reference it by.
    pub fn put_overflow(&self, work_id: &str, payload: Vec<u8>, ttl: Option<Duration>) -> String {
        let key = format!("{OVERFLOW_PREFIX}{work_id}");
        self.put(key.clone(), payload, ttl);
        key
    }

    /// Fetch an offloaded payload by its overflow key.
    #[must_use]
    pub fn get_overflow(&self, overflow_key: &str) -> Option<Vec<u8>> {
        self.get(overflow_key)
    }

    /// Record the latest appended offset for a coalescing work id.
    pub fn put_last_offset(&self, work_id: &str, offset: u64, ttl: Option<Duration>) {
        self.put(
            format!("{OFFSET_PREFIX}{work_id}"),
            offset.to_be_bytes().to_vec(),
            ttl,
        );
    }

    /// Latest appended offset recorded for a coalescing work id.
    #[must_use]
    pub fn get_last_offset(&self, work_id: &str) -> Option<u64> {
        let bytes = self.get(&format!("{OFFSET_PREFIX}{work_id}"))?;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_put_get_remove() {
        let store = StateStore::new();
        store.put("k", b"v".to_vec(), None);
        assert_eq!(store.get("k").as_deref(), Some(b"v".as_slice()));
        assert!(store.remove("k"));
        assert!(store.get("k").is_none());
        assert!(!store.remove("k"));
    }

    #[test]
    fn test_ttl_expiry() {
        let store = StateStore::new();
        store.put("k", b"v".to_vec(), Some(Duration::from_millis(20)));
        assert!(store.get("k").is_some());
        thread::sleep(Duration::from_millis(40));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_state_mirror_roundtrip() {
        let store = StateStore::new();
        for state in [
            WorkState::Scheduled,
            WorkState::Running,
            WorkState::Completed,
            WorkState::Failed,
            WorkState::Canceled,
        ] {
            store.put_state("w1", state, None);
            assert_eq!(store.get_state("w1"), Some(state));
        }
        store.clear_state("w1");
        assert!(store.get_state("w1").is_none());
    }

    #[test]
    fn test_cancel_flag() {
        let store = StateStore::new();
        assert!(!store.is_cancel_requested("w1"));
        store.request_cancel("w1", None);
        assert!(store.is_cancel_requested("w1"));
    }

    #[test]
    fn test_overflow_and_last_offset() {
        let store = StateStore::new();
        let key = store.put_overflow("w1", vec![9; 64], None);
        assert_eq!(store.get_overflow(&key).unwrap().len(), 64);
        store.put_last_offset("w1", 42, None);
        assert_eq!(store.get_last_offset("w1"), Some(42));
    }
}
