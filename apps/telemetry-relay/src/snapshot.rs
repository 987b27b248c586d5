//! The authoritative snapshot and the store that serializes access to it.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    schema::SchemaError,
    update::{is_identifier, ChannelPath, Update},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Leaf {
    Int(i64),
    Text(String),
}

type Section = BTreeMap<String, Leaf>;

/// `group -> subKey -> field -> leaf`. Serializes as the nested JSON object
/// clients receive in the `init` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    groups: BTreeMap<String, BTreeMap<String, Section>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("group {0:?} is not part of the schema")]
    UnknownGroup(String),
    #[error("sub-key {sub_key:?} is not declared under group {group:?}")]
    UnknownSubKey { group: String, sub_key: String },
    #[error("leaf {0} holds text and cannot take an integer")]
    FieldType(String),
    #[error("field {0:?} is not a valid identifier")]
    InvalidIdentifier(String),
}

impl Snapshot {
    pub fn from_seed(raw: &str) -> Result<Self, SchemaError> {
        let snapshot: Snapshot = serde_json::from_str(raw)?;
        for (group, sections) in &snapshot.groups {
            if !is_identifier(group) {
                return Err(SchemaError::InvalidKey(group.clone()));
            }
            for (sub_key, fields) in sections {
                if !is_identifier(sub_key) {
                    return Err(SchemaError::InvalidKey(sub_key.clone()));
                }
                if let Some(bad) = fields.keys().find(|field| !is_identifier(field)) {
                    return Err(SchemaError::InvalidKey(bad.clone()));
                }
            }
        }
        Ok(snapshot)
    }

    pub fn has_section(&self, group: &str, sub_key: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|sections| sections.contains_key(sub_key))
    }

    /// Every declared `(group, subKey)` pair.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &str)> {
        self.groups.iter().flat_map(|(group, sections)| {
            sections
                .keys()
                .map(move |sub_key| (group.as_str(), sub_key.as_str()))
        })
    }

    pub fn leaf(&self, path: &ChannelPath) -> Option<&Leaf> {
        self.groups
            .get(path.group())?
            .get(path.sub_key())?
            .get(path.field())
    }

    pub fn int_at(&self, path: &str) -> Option<i64> {
        let path: ChannelPath = path.parse().ok()?;
        match self.leaf(&path)? {
            Leaf::Int(value) => Some(*value),
            Leaf::Text(_) => None,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|sections| sections.values())
            .map(|fields| fields.len())
            .sum()
    }

    pub fn apply(&mut self, update: &Update) -> Result<(), StoreError> {
        self.set_int(
            update.path.group(),
            update.path.sub_key(),
            update.path.field(),
            update.value,
        )
    }

    fn set_int(
        &mut self,
        group: &str,
        sub_key: &str,
        field: &str,
        value: i64,
    ) -> Result<(), StoreError> {
        if !is_identifier(field) {
            return Err(StoreError::InvalidIdentifier(field.to_string()));
        }
        let sections = self
            .groups
            .get_mut(group)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
        let fields = sections
            .get_mut(sub_key)
            .ok_or_else(|| StoreError::UnknownSubKey {
                group: group.to_string(),
                sub_key: sub_key.to_string(),
            })?;
        match fields.get_mut(field) {
            Some(Leaf::Int(slot)) => *slot = value,
            Some(Leaf::Text(_)) => {
                return Err(StoreError::FieldType(format!("{group}.{sub_key}.{field}")));
            }
            None => {
                fields.insert(field.to_string(), Leaf::Int(value));
            }
        }
        Ok(())
    }
}

/// Owns the snapshot. Readers share the lock; each writer is exclusive.
///
/// The `*_then` variants run a closure while the lock is still held. The
/// relay uses them to make "mutate + push" and "read + register" atomic
/// with respect to each other.
#[derive(Debug)]
pub struct SnapshotStore {
    inner: RwLock<Snapshot>,
}

impl SnapshotStore {
    pub fn new(seed: Snapshot) -> Self {
        Self {
            inner: RwLock::new(seed),
        }
    }

    pub fn read_all(&self) -> Snapshot {
        self.inner.read().clone()
    }

    pub fn mutate_leaf(
        &self,
        group: &str,
        sub_key: &str,
        field: &str,
        value: i64,
    ) -> Result<(), StoreError> {
        self.inner.write().set_int(group, sub_key, field, value)
    }

    pub fn apply_then<T>(
        &self,
        update: &Update,
        after: impl FnOnce(&Update) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.write();
        guard.apply(update)?;
        Ok(after(update))
    }

    pub fn read_then<T>(&self, with: impl FnOnce() -> T) -> (Snapshot, T) {
        let guard = self.inner.read();
        let snapshot = guard.clone();
        let extra = with();
        (snapshot, extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DEFAULT_SEED;
    use std::sync::Arc;

    fn seeded() -> SnapshotStore {
        SnapshotStore::new(Snapshot::from_seed(DEFAULT_SEED).unwrap())
    }

    fn update(path: &str, value: i64) -> Update {
        Update::new(path.parse().unwrap(), value)
    }

    #[test]
    fn seed_serializes_as_nested_json() {
        let snapshot = seeded().read_all();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["quarterA"]["col2"]["num5"], 72);
        assert_eq!(json["quarterA"]["col1"]["title"], "CBW 1");
        assert_eq!(json["quarterD"]["col6"]["target"], 100);
        assert_eq!(json["quarterC"]["wastedMinutes"]["current"], 150);
    }

    #[test]
    fn seed_rejects_wrong_depth_and_bad_keys() {
        assert!(matches!(
            Snapshot::from_seed(r#"{"screen":"tv"}"#),
            Err(SchemaError::Parse(_))
        ));
        assert!(matches!(
            Snapshot::from_seed(r#"{"quarterA":{"col 1":{"num1":1}}}"#),
            Err(SchemaError::InvalidKey(key)) if key == "col 1"
        ));
        assert!(matches!(
            Snapshot::from_seed(r#"{"quarterA":{"col1":{"num1":1.5}}}"#),
            Err(SchemaError::Parse(_))
        ));
    }

    #[test]
    fn mutate_existing_and_new_fields() {
        let store = seeded();
        store.mutate_leaf("quarterA", "col2", "num5", 77).unwrap();
        store.mutate_leaf("quarterD", "col1", "peak", 12).unwrap();
        let snapshot = store.read_all();
        assert_eq!(snapshot.int_at("quarterA.col2.num5"), Some(77));
        assert_eq!(snapshot.int_at("quarterD.col1.peak"), Some(12));
    }

    #[test]
    fn mutate_rejects_undeclared_levels() {
        let store = seeded();
        let before = store.read_all();
        assert_eq!(
            store.mutate_leaf("quarterZ", "foo", "current", 1),
            Err(StoreError::UnknownGroup("quarterZ".into()))
        );
        assert_eq!(
            store.mutate_leaf("quarterA", "col9", "num1", 1),
            Err(StoreError::UnknownSubKey {
                group: "quarterA".into(),
                sub_key: "col9".into()
            })
        );
        assert_eq!(store.read_all(), before);
    }

    #[test]
    fn text_leaves_keep_their_type() {
        let store = seeded();
        let err = store.mutate_leaf("quarterA", "col1", "title", 3).unwrap_err();
        assert_eq!(err, StoreError::FieldType("quarterA.col1.title".into()));
        assert_eq!(
            store.read_all().leaf(&"quarterA.col1.title".parse().unwrap()),
            Some(&Leaf::Text("CBW 1".into()))
        );
    }

    #[test]
    fn sequence_equals_fold_over_seed() {
        let store = seeded();
        let updates = vec![
            update("quarterA.col1.num1", 5),
            update("quarterD.col2.current", 40),
            update("quarterA.col1.num1", 6),
            update("quarterC.cbw3.waitTime", 11),
            update("quarterD.col2.current", 41),
        ];
        let mut expected = store.read_all();
        for u in &updates {
            store.apply_then(u, |_| ()).unwrap();
            expected.apply(u).unwrap();
        }
        assert_eq!(store.read_all(), expected);
        assert_eq!(expected.int_at("quarterA.col1.num1"), Some(6));
    }

    #[test]
    fn concurrent_writers_on_distinct_paths() {
        let store = Arc::new(seeded());
        let paths: Vec<String> = (1..=8).map(|n| format!("quarterA.col3.num{n}")).collect();

        let handles: Vec<_> = paths
            .iter()
            .cloned()
            .map(|path| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for value in 0..200 {
                        store.apply_then(&update(&path, value), |_| ()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut expected = Snapshot::from_seed(DEFAULT_SEED).unwrap();
        for path in &paths {
            expected.apply(&update(path, 199)).unwrap();
        }
        assert_eq!(store.read_all(), expected);
    }

    #[test]
    fn read_then_runs_under_the_read_lock() {
        let store = seeded();
        let (snapshot, count) = store.read_then(|| 7usize);
        assert_eq!(count, 7);
        assert_eq!(snapshot.leaf_count(), store.read_all().leaf_count());
    }
}
