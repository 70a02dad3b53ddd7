//! # Interning Tables
//!
//! Deduplicate repeated heavyweight payloads (call stacks, tracepoint descriptors,
//! strings) by content. A value is hashed over its canonical byte encoding with
//! SHA-256 and the first 8 bytes become its key. Colliding keys are disambiguated by
//! comparing full content and probing the next key, so distinct values are never
//! merged.
//!
//! ## External keys
//!
//! Capture files and agents name payloads with keys of their own choosing. Those
//! keys live in a separate alias namespace: `publish` interns the value by content
//! and records `external -> content` key, and `translate` maps an external key back.
//! Everything stored in a session refers to content keys only, so the same payload
//! arriving by both paths is kept once.
//!
//! ## Concurrency
//!
//! Tables are shared between producer threads. `intern` takes the read lock for the
//! common already-present case and the write lock only around insert-if-absent.
//! `resolve` only ever takes the read lock.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{CallStack, InternError, InternKey};
use loupe_common::TracepointInfo;

/// Canonical byte encoding used for content hashing.
pub trait ContentHash {
    fn write_content(&self, hasher: &mut Sha256);

    /// 64-bit content hash of the value
    fn content_key(&self) -> InternKey {
        let mut hasher = Sha256::new();
        self.write_content(&mut hasher);
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        InternKey(u64::from_le_bytes(prefix))
    }
}

impl ContentHash for CallStack {
    fn write_content(&self, hasher: &mut Sha256) {
        for frame in &self.frames {
            hasher.update(frame.to_le_bytes());
        }
    }
}

impl ContentHash for TracepointInfo {
    fn write_content(&self, hasher: &mut Sha256) {
        hasher.update(self.category.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
    }
}

impl ContentHash for String {
    fn write_content(&self, hasher: &mut Sha256) {
        hasher.update(self.as_bytes());
    }
}

#[derive(Debug)]
struct Entries<T> {
    values: HashMap<InternKey, Arc<T>>,
    /// External key -> content key
    aliases: HashMap<InternKey, InternKey>,
}

/// Content-addressed table handing out stable keys
#[derive(Debug)]
pub struct InternTable<T> {
    entries: RwLock<Entries<T>>,
}

impl<T> Default for InternTable<T> {
    fn default() -> Self {
        Self { entries: RwLock::new(Entries { values: HashMap::new(), aliases: HashMap::new() }) }
    }
}

pub type CallstackTable = InternTable<CallStack>;
pub type TracepointTable = InternTable<TracepointInfo>;
pub type StringTable = InternTable<String>;

/// Outcome of probing the table for a value
enum Probe {
    Found(InternKey),
    Vacant(InternKey),
}

impl<T: ContentHash + PartialEq> InternTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn probe(values: &HashMap<InternKey, Arc<T>>, value: &T) -> Probe {
        let mut key = value.content_key();
        loop {
            match values.get(&key) {
                Some(existing) if **existing == *value => return Probe::Found(key),
                Some(_) => key = InternKey(key.0.wrapping_add(1)),
                None => return Probe::Vacant(key),
            }
        }
    }

    fn insert(values: &mut HashMap<InternKey, Arc<T>>, value: T) -> InternKey {
        match Self::probe(values, &value) {
            Probe::Found(key) => key,
            Probe::Vacant(key) => {
                values.insert(key, Arc::new(value));
                key
            }
        }
    }

    /// Store `value` once and return its key. Content-equal values always get the
    /// same key.
    pub fn intern(&self, value: T) -> InternKey {
        if let Probe::Found(key) = Self::probe(&self.entries.read().values, &value) {
            return key;
        }
        Self::insert(&mut self.entries.write().values, value)
    }

    /// Intern `value` under an externally chosen key (from a capture file or an
    /// agent) and return its content key.
    ///
    /// Publishing the same content under the same key twice is a no-op.
    ///
    /// # Errors
    /// Returns [`InternError::KeyConflict`] if `key` is bound to different content
    pub fn publish(&self, key: InternKey, value: T) -> Result<InternKey, InternError> {
        let mut entries = self.entries.write();
        if let Some(&bound) = entries.aliases.get(&key) {
            return match entries.values.get(&bound) {
                Some(existing) if **existing == value => Ok(bound),
                _ => Err(InternError::KeyConflict(key)),
            };
        }
        let content_key = Self::insert(&mut entries.values, value);
        entries.aliases.insert(key, content_key);
        Ok(content_key)
    }

    /// Content key for a key seen on the wire.
    ///
    /// Published keys map to their content key; a content key handed out by this
    /// table maps to itself.
    #[must_use]
    pub fn translate(&self, key: InternKey) -> Option<InternKey> {
        let entries = self.entries.read();
        entries
            .aliases
            .get(&key)
            .copied()
            .or_else(|| entries.values.contains_key(&key).then_some(key))
    }

    /// Value stored under a content key
    #[must_use]
    pub fn resolve(&self, key: InternKey) -> Option<Arc<T>> {
        self.entries.read().values.get(&key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: InternKey) -> bool {
        self.entries.read().values.contains_key(&key)
    }

    /// Number of distinct values
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().values.is_empty()
    }

    /// All entries ordered by content key, for deterministic serialization
    #[must_use]
    pub fn snapshot(&self) -> Vec<(InternKey, Arc<T>)> {
        let mut entries: Vec<_> =
            self.entries.read().values.iter().map(|(k, v)| (*k, Arc::clone(v))).collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_interning_is_idempotent() {
        let table = CallstackTable::new();
        let first = table.intern(CallStack::new(vec![1, 2, 3]));
        for _ in 0..100 {
            assert_eq!(table.intern(CallStack::new(vec![1, 2, 3])), first);
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(first).unwrap().frames, vec![1, 2, 3]);
    }

    #[test]
    fn test_order_matters_for_call_stacks() {
        let table = CallstackTable::new();
        let a = table.intern(CallStack::new(vec![1, 2]));
        let b = table.intern(CallStack::new(vec![2, 1]));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_tracepoint_fields_do_not_run_together() {
        let table = TracepointTable::new();
        let a = table.intern(TracepointInfo::new("sched", "switch"));
        let b = table.intern(TracepointInfo::new("schedswitch", ""));
        assert_ne!(a, b);
    }

    #[test]
    fn test_colliding_key_is_probed_not_merged() {
        let table = StringTable::new();
        let natural = "a".to_string().content_key();
        // Occupy the natural key of "a" with different content
        table.entries.write().values.insert(natural, Arc::new("intruder".to_string()));

        let key = table.intern("a".to_string());
        assert_ne!(key, natural);
        assert_eq!(*table.resolve(key).unwrap(), "a");
        assert_eq!(*table.resolve(natural).unwrap(), "intruder");
        assert_eq!(table.intern("a".to_string()), key);
    }

    #[test]
    fn test_publish_conflict() {
        let table = StringTable::new();
        let key = table.publish(InternKey(7), "seven".to_string()).unwrap();
        assert_eq!(table.publish(InternKey(7), "seven".to_string()), Ok(key));
        assert_eq!(
            table.publish(InternKey(7), "eight".to_string()),
            Err(InternError::KeyConflict(InternKey(7)))
        );
        assert_eq!(*table.resolve(table.translate(InternKey(7)).unwrap()).unwrap(), "seven");
    }

    #[test]
    fn test_published_and_interned_content_is_stored_once() {
        let table = CallstackTable::new();
        let interned = table.intern(CallStack::new(vec![4, 5, 6]));
        let published = table.publish(InternKey(1), CallStack::new(vec![4, 5, 6])).unwrap();

        assert_eq!(published, interned);
        assert_eq!(table.len(), 1);
        assert_eq!(table.translate(InternKey(1)), Some(interned));
        assert_eq!(table.translate(interned), Some(interned));
    }

    #[test]
    fn test_external_key_equal_to_content_key_does_not_conflict() {
        let table = CallstackTable::new();
        let interned = table.intern(CallStack::new(vec![1, 2]));
        // The agent happens to pick that same number for a different stack
        let published = table.publish(interned, CallStack::new(vec![3, 4])).unwrap();

        assert_ne!(published, interned);
        assert_eq!(table.len(), 2);
        assert_eq!(table.translate(interned), Some(published));
        assert_eq!(table.resolve(interned).unwrap().frames, vec![1, 2]);
        assert_eq!(table.resolve(published).unwrap().frames, vec![3, 4]);
    }

    #[test]
    fn test_translate_unknown_key() {
        let table = StringTable::new();
        assert_eq!(table.translate(InternKey(3)), None);
    }

    #[test]
    fn test_resolve_unknown_key() {
        let table = StringTable::new();
        assert!(table.resolve(InternKey(42)).is_none());
    }

    #[test]
    fn test_concurrent_interning_converges() {
        let table = Arc::new(CallstackTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..200u64)
                        .map(|i| table.intern(CallStack::new(vec![i, i + 1, i + 2])))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<InternKey>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for keys in &results[1..] {
            assert_eq!(keys, &results[0]);
        }
        assert_eq!(table.len(), 200);
    }

    proptest! {
        #[test]
        fn prop_keys_equal_iff_content_equal(
            a in prop::collection::vec(any::<u64>(), 0..16),
            b in prop::collection::vec(any::<u64>(), 0..16),
        ) {
            let table = CallstackTable::new();
            let ka = table.intern(CallStack::new(a.clone()));
            let kb = table.intern(CallStack::new(b.clone()));
            prop_assert_eq!(ka == kb, a == b);
        }
    }
}
