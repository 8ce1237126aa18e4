//! Persistent-copy session maps
//!
//! A [`DeltaMap`] behaves like a persistent (copy-on-write) map: `do_copy`
//! hands out a logical child that shares the parent's structure by reference,
//! and mutations on either side never leak to the other. Internally the map
//! is a stack of layers: an immutable consolidated base, zero or more frozen
//! delta layers shared through `Arc`, and one mutable local layer. Removals
//! are tombstones so a child can shadow a key its ancestors still hold.
//!
//! The delta of a map is everything changed since its most recent
//! consolidation point. `do_copy(true)` squashes the layers into a fresh
//! base, producing a map with the same merged view and an empty delta.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// SessionMap trait
// ---------------------------------------------------------------------------

/// A key/value map supporting persistent copies and delta iteration.
pub trait SessionMap<K, V> {
    /// Look up a key across all layers.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or update a key in the current delta.
    fn put(&mut self, key: K, value: V);

    /// Remove a key, recording a tombstone in the current delta.
    fn remove(&mut self, key: &K);

    /// The merged view: child entries override ancestors, tombstones
    /// suppress them. Order is unspecified.
    fn iter_all(&self) -> Vec<(K, V)>;

    /// Entries changed since the most recent consolidation point;
    /// `None` values are tombstones.
    fn iter_delta(&self) -> Vec<(K, Option<V>)>;

    /// Create a logical child. With `consolidate` the child gets a squashed
    /// base and an empty delta; without, it shares this map's layers.
    fn do_copy(&mut self, consolidate: bool) -> Self
    where
        Self: Sized;
}

// ---------------------------------------------------------------------------
// DeltaMap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Slot<V> {
    Value(V),
    Tombstone,
}

/// In-memory layered implementation of [`SessionMap`].
///
/// Not internally synchronized; wrap in [`SyncSessionMap`] to share across
/// threads.
#[derive(Debug, Clone)]
pub struct DeltaMap<K, V> {
    /// Consolidated entries, tombstone-free.
    base: Arc<HashMap<K, V>>,
    /// Frozen delta layers since the last consolidation, oldest first.
    layers: Vec<Arc<HashMap<K, Slot<V>>>>,
    /// Mutable current layer.
    local: HashMap<K, Slot<V>>,
}

impl<K, V> Default for DeltaMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DeltaMap<K, V> {
    pub fn new() -> Self {
        Self {
            base: Arc::new(HashMap::new()),
            layers: Vec::new(),
            local: HashMap::new(),
        }
    }
}

impl<K, V> DeltaMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn lookup(&self, key: &K) -> Option<V> {
        if let Some(slot) = self.local.get(key) {
            return match slot {
                Slot::Value(v) => Some(v.clone()),
                Slot::Tombstone => None,
            };
        }
        for layer in self.layers.iter().rev() {
            if let Some(slot) = layer.get(key) {
                return match slot {
                    Slot::Value(v) => Some(v.clone()),
                    Slot::Tombstone => None,
                };
            }
        }
        self.base.get(key).cloned()
    }

    fn merged(&self) -> HashMap<K, V> {
        let mut merged: HashMap<K, V> = (*self.base).clone();
        for layer in self.layers.iter().map(|l| l.as_ref()).chain([&self.local]) {
            for (k, slot) in layer {
                match slot {
                    Slot::Value(v) => {
                        merged.insert(k.clone(), v.clone());
                    }
                    Slot::Tombstone => {
                        merged.remove(k);
                    }
                }
            }
        }
        merged
    }

    fn merged_delta(&self) -> HashMap<K, Slot<V>> {
        let mut delta: HashMap<K, Slot<V>> = HashMap::new();
        for layer in self.layers.iter().map(|l| l.as_ref()).chain([&self.local]) {
            for (k, slot) in layer {
                delta.insert(k.clone(), slot.clone());
            }
        }
        delta
    }

    /// Freeze the local layer so it can be shared with a child.
    fn freeze_local(&mut self) {
        if !self.local.is_empty() {
            self.layers.push(Arc::new(std::mem::take(&mut self.local)));
        }
    }
}

impl<K, V> SessionMap<K, V> for DeltaMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn get(&self, key: &K) -> Option<V> {
        self.lookup(key)
    }

    fn put(&mut self, key: K, value: V) {
        self.local.insert(key, Slot::Value(value));
    }

    fn remove(&mut self, key: &K) {
        self.local.insert(key.clone(), Slot::Tombstone);
    }

    fn iter_all(&self) -> Vec<(K, V)> {
        self.merged().into_iter().collect()
    }

    fn iter_delta(&self) -> Vec<(K, Option<V>)> {
        self.merged_delta()
            .into_iter()
            .map(|(k, slot)| match slot {
                Slot::Value(v) => (k, Some(v)),
                Slot::Tombstone => (k, None),
            })
            .collect()
    }

    fn do_copy(&mut self, consolidate: bool) -> Self {
        self.freeze_local();
        if consolidate {
            Self {
                base: Arc::new(self.merged()),
                layers: Vec::new(),
                local: HashMap::new(),
            }
        } else {
            Self {
                base: self.base.clone(),
                layers: self.layers.clone(),
                local: HashMap::new(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SyncSessionMap
// ---------------------------------------------------------------------------

/// Mutex wrapper composing synchronization around a [`DeltaMap`].
#[derive(Debug)]
pub struct SyncSessionMap<K, V> {
    inner: Mutex<DeltaMap<K, V>>,
}

impl<K, V> SyncSessionMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DeltaMap::new()),
        }
    }

    pub fn wrap(map: DeltaMap<K, V>) -> Self {
        Self {
            inner: Mutex::new(map),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeltaMap<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key)
    }

    pub fn put(&self, key: K, value: V) {
        self.lock().put(key, value)
    }

    pub fn remove(&self, key: &K) {
        self.lock().remove(key)
    }

    pub fn iter_all(&self) -> Vec<(K, V)> {
        self.lock().iter_all()
    }

    pub fn iter_delta(&self) -> Vec<(K, Option<V>)> {
        self.lock().iter_delta()
    }

    pub fn do_copy(&self, consolidate: bool) -> Self {
        Self::wrap(self.lock().do_copy(consolidate))
    }
}

impl<K, V> Default for SyncSessionMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
