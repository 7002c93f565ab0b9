use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Whether a label names a source or a destination.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    Source,
    Destination,
}

/// Key of one label. On the client protocol the kind travels as `target`
/// and matrix/level default to 0.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LabelKey {
    #[serde(rename = "target")]
    pub kind: LabelKind,
    #[serde(default)]
    pub matrix: u8,
    #[serde(default)]
    pub level: u8,
    pub index: u16,
}

/// In-process label store. Writes are last-write-wins; persistence is the
/// embedding application's concern.
#[derive(Default)]
pub struct LabelStore {
    labels: RwLock<HashMap<LabelKey, String>>,
}

impl LabelStore {
    pub fn new() -> LabelStore {
        LabelStore::default()
    }

    pub fn set(&self, key: LabelKey, value: String) {
        self.labels.write().expect("label lock").insert(key, value);
    }

    pub fn get(&self, key: &LabelKey) -> Option<String> {
        self.labels.read().expect("label lock").get(key).cloned()
    }

    /// Every label, ordered by key.
    pub fn all(&self) -> Vec<(LabelKey, String)> {
        let mut all: Vec<(LabelKey, String)> = self
            .labels
            .read()
            .expect("label lock")
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }

    pub fn len(&self) -> usize {
        self.labels.read().expect("label lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: LabelKind, index: u16) -> LabelKey {
        LabelKey {
            kind,
            matrix: 0,
            level: 0,
            index,
        }
    }

    #[test]
    fn last_write_wins() {
        let store = LabelStore::new();
        store.set(key(LabelKind::Source, 3), "CAM 3".into());
        store.set(key(LabelKind::Source, 3), "CAM 3B".into());

        assert_eq!(store.get(&key(LabelKind::Source, 3)).unwrap(), "CAM 3B");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sources_and_destinations_do_not_collide() {
        let store = LabelStore::new();
        store.set(key(LabelKind::Source, 1), "VTR".into());
        store.set(key(LabelKind::Destination, 1), "MON 1".into());

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&key(LabelKind::Destination, 1)).unwrap(), "MON 1");
    }
}
