//! Stored data and per-transaction deltas
//!
//! Committed records live in [`DatabaseState`]. A transaction never writes
//! there directly: its puts, deletes, clears and key-generator bumps collect
//! in a [`Delta`] that commit applies in one step and abort drops. Reads go
//! through a [`StoreView`], which overlays a delta on the committed records.

use idbind_core::{DomException, EngineResult, Key, Query, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Largest key a generator produces (2^53)
pub(crate) const MAX_GENERATED_KEY: u64 = 9_007_199_254_740_992;

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexMeta {
    pub(crate) key_path: String,
    pub(crate) unique: bool,
    pub(crate) multi_entry: bool,
}

/// One object store's schema and committed records
#[derive(Debug, Clone)]
pub(crate) struct StoreData {
    pub(crate) key_path: Option<String>,
    pub(crate) auto_increment: bool,
    /// Next generated key
    pub(crate) next_key: u64,
    pub(crate) records: BTreeMap<Key, Value>,
    pub(crate) indexes: BTreeMap<String, IndexMeta>,
}

impl StoreData {
    pub(crate) fn new(key_path: Option<String>, auto_increment: bool) -> Self {
        Self {
            key_path,
            auto_increment,
            next_key: 1,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }
}

/// Committed state of one database
#[derive(Debug, Clone, Default)]
pub(crate) struct DatabaseState {
    /// 0 until the first upgrade commits
    pub(crate) version: u64,
    pub(crate) stores: BTreeMap<String, StoreData>,
}

impl DatabaseState {
    pub(crate) fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    /// Apply a committed transaction's writes
    pub(crate) fn apply(&mut self, delta: Delta) {
        for (name, store_delta) in delta.stores {
            // Stores deleted by the same upgrade are gone already
            let Some(store) = self.stores.get_mut(&name) else {
                continue;
            };
            if store_delta.cleared {
                store.records.clear();
            }
            for (key, write) in store_delta.writes {
                match write {
                    Some(value) => {
                        store.records.insert(key, value);
                    }
                    None => {
                        store.records.remove(&key);
                    }
                }
            }
            if let Some(next_key) = store_delta.next_key {
                store.next_key = store.next_key.max(next_key);
            }
        }
    }
}

/// Uncommitted writes to one store
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreDelta {
    cleared: bool,
    writes: BTreeMap<Key, Option<Value>>,
    next_key: Option<u64>,
}

impl StoreDelta {
    pub(crate) fn put(&mut self, key: Key, value: Value) {
        self.writes.insert(key, Some(value));
    }

    pub(crate) fn delete(&mut self, key: Key) {
        self.writes.insert(key, None);
    }

    pub(crate) fn clear(&mut self) {
        self.cleared = true;
        self.writes.clear();
    }

    pub(crate) fn set_next_key(&mut self, next_key: u64) {
        self.next_key = Some(self.next_key.map_or(next_key, |n| n.max(next_key)));
    }
}

/// Uncommitted writes of one transaction, by store name
#[derive(Debug, Clone, Default)]
pub(crate) struct Delta {
    stores: HashMap<String, StoreDelta>,
}

impl Delta {
    pub(crate) fn store(&self, name: &str) -> Option<&StoreDelta> {
        self.stores.get(name)
    }

    pub(crate) fn store_mut(&mut self, name: &str) -> &mut StoreDelta {
        self.stores.entry(name.to_string()).or_default()
    }

    pub(crate) fn forget(&mut self, name: &str) {
        self.stores.remove(name);
    }
}

/// One row of a store or index, in traversal order
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// Index key for index rows, primary key for store rows
    pub(crate) key: Key,
    pub(crate) primary: Key,
    pub(crate) value: Value,
}

impl Entry {
    pub(crate) fn position(&self) -> (&Key, &Key) {
        (&self.key, &self.primary)
    }
}

/// Committed records of a store overlaid with a transaction's writes
pub(crate) struct StoreView<'a> {
    pub(crate) data: &'a StoreData,
    pub(crate) delta: Option<&'a StoreDelta>,
}

impl StoreView<'_> {
    pub(crate) fn get(&self, key: &Key) -> Option<Value> {
        if let Some(delta) = self.delta {
            if let Some(write) = delta.writes.get(key) {
                return write.clone();
            }
            if delta.cleared {
                return None;
            }
        }
        self.data.records.get(key).cloned()
    }

    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn next_key(&self) -> u64 {
        let pending = self.delta.and_then(|d| d.next_key).unwrap_or(0);
        self.data.next_key.max(pending)
    }

    /// Every live record in key order
    pub(crate) fn records(&self) -> BTreeMap<Key, Value> {
        let mut merged = match self.delta {
            Some(delta) if delta.cleared => BTreeMap::new(),
            _ => self.data.records.clone(),
        };
        if let Some(delta) = self.delta {
            for (key, write) in &delta.writes {
                match write {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        merged
    }

    /// Store rows matching `query`, in primary key order
    pub(crate) fn store_entries(&self, query: &Query) -> Vec<Entry> {
        self.records()
            .into_iter()
            .filter(|(key, _)| query.matches(key))
            .map(|(key, value)| Entry {
                primary: key.clone(),
                key,
                value,
            })
            .collect()
    }

    /// Index rows matching `query`, ordered by (index key, primary key)
    pub(crate) fn index_entries(&self, meta: &IndexMeta, query: &Query) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .records()
            .into_iter()
            .flat_map(|(primary, value)| {
                index_keys(&value, meta)
                    .into_iter()
                    .filter(|key| query.matches(key))
                    .map(|key| Entry {
                        key,
                        primary: primary.clone(),
                        value: value.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        entries.sort_by(|a, b| a.position().cmp(&b.position()));
        entries
    }

    /// `ConstraintError` if writing `value` at `primary` would duplicate a
    /// key in a unique index
    pub(crate) fn check_unique(&self, primary: &Key, value: &Value) -> EngineResult<()> {
        let unique: Vec<(&String, &IndexMeta)> = self
            .data
            .indexes
            .iter()
            .filter(|(_, meta)| meta.unique)
            .collect();
        if unique.is_empty() {
            return Ok(());
        }
        let records = self.records();
        for (name, meta) in unique {
            let wanted = index_keys(value, meta);
            if wanted.is_empty() {
                continue;
            }
            let clash = records
                .iter()
                .filter(|(key, _)| *key != primary)
                .any(|(_, other)| index_keys(other, meta).iter().any(|k| wanted.contains(k)));
            if clash {
                return Err(DomException::new(
                    DomException::CONSTRAINT_ERROR,
                    format!("unique index '{name}' already contains this key"),
                ));
            }
        }
        Ok(())
    }
}

/// The key stored at `path` inside `value`.
///
/// `None` when nothing is stored there; `Some(Err)` when the stored value is
/// not a valid key.
pub(crate) fn key_at_path(value: &Value, path: &str) -> Option<EngineResult<Key>> {
    value.get_path(path).map(Key::try_from)
}

/// Keys under which `value` appears in an index; empty if it is not indexed
pub(crate) fn index_keys(value: &Value, meta: &IndexMeta) -> BTreeSet<Key> {
    let Some(found) = value.get_path(&meta.key_path) else {
        return BTreeSet::new();
    };
    match found {
        Value::Array(items) if meta.multi_entry => {
            items.iter().filter_map(|item| Key::try_from(item).ok()).collect()
        }
        other => Key::try_from(other).into_iter().collect(),
    }
}

/// Store a generated key at `path`, creating intermediate objects
pub(crate) fn inject_key(value: &mut Value, path: &str, key: &Key) -> EngineResult<()> {
    if value.set_path(path, key.to_value()) {
        Ok(())
    } else {
        Err(DomException::data(format!(
            "cannot store the generated key at '{path}'"
        )))
    }
}
