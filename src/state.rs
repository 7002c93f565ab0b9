use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Routing status of a cached crosspoint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrosspointStatus {
    /// The router has tallied this route.
    Connected,
    /// A take was submitted and the confirming tally is still outstanding.
    Pending,
    Disconnected,
}

/// The last observed (or optimistically assumed) source of one destination
/// on one level of one matrix. Serializes in the shape the fan-out clients
/// expect.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrosspointState {
    pub matrix: u8,
    pub level: u8,
    pub destination: u16,
    pub source: u16,
    pub status: CrosspointStatus,
    pub source_status: bool,
    #[serde(with = "time_ms")]
    pub last_update: SystemTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Key {
    matrix: u8,
    level: u8,
    destination: u16,
}

/// Destination -> source cache, keyed by (matrix, level, destination).
/// A new tally overwrites whatever was recorded for that key.
#[derive(Default)]
pub struct CrosspointCache {
    entries: HashMap<Key, CrosspointState>,
    last_update: Option<SystemTime>,
}

impl CrosspointCache {
    pub fn new() -> CrosspointCache {
        CrosspointCache::default()
    }

    pub fn upsert(
        &mut self,
        matrix: u8,
        level: u8,
        destination: u16,
        source: u16,
        status: CrosspointStatus,
        source_status: bool,
    ) -> CrosspointState {
        let now = SystemTime::now();
        let state = CrosspointState {
            matrix,
            level,
            destination,
            source,
            status,
            source_status,
            last_update: now,
        };
        self.entries.insert(
            Key {
                matrix,
                level,
                destination,
            },
            state,
        );
        self.last_update = Some(now);
        state
    }

    pub fn get(&self, matrix: u8, level: u8, destination: u16) -> Option<CrosspointState> {
        self.entries
            .get(&Key {
                matrix,
                level,
                destination,
            })
            .copied()
    }

    /// Every cached crosspoint, ordered by (matrix, level, destination).
    pub fn all(&self) -> Vec<CrosspointState> {
        let mut all: Vec<CrosspointState> = self.entries.values().copied().collect();
        all.sort_by_key(|s| (s.matrix, s.level, s.destination));
        all
    }

    pub fn by_level(&self, matrix: u8, level: u8) -> Vec<CrosspointState> {
        let mut matching: Vec<CrosspointState> = self
            .entries
            .values()
            .filter(|s| s.matrix == matrix && s.level == level)
            .copied()
            .collect();
        matching.sort_by_key(|s| s.destination);
        matching
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the cache last changed; `None` until the first tally lands.
    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }
}

/// Serialize timestamps as integer milliseconds since the epoch; that is
/// what the fan-out clients expect.
pub mod time_ms {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins_per_key() {
        let mut cache = CrosspointCache::new();
        cache.upsert(0, 0, 5, 10, CrosspointStatus::Pending, false);
        cache.upsert(0, 0, 5, 12, CrosspointStatus::Connected, false);
        cache.upsert(0, 1, 5, 10, CrosspointStatus::Connected, false);

        assert_eq!(cache.len(), 2);
        let state = cache.get(0, 0, 5).unwrap();
        assert_eq!(state.source, 12);
        assert_eq!(state.status, CrosspointStatus::Connected);
    }

    #[test]
    fn levels_are_independent() {
        let mut cache = CrosspointCache::new();
        cache.upsert(0, 0, 1, 7, CrosspointStatus::Connected, false);
        cache.upsert(0, 1, 1, 9, CrosspointStatus::Connected, false);

        assert_eq!(cache.get(0, 0, 1).unwrap().source, 7);
        assert_eq!(cache.get(0, 1, 1).unwrap().source, 9);
        assert_eq!(cache.by_level(0, 1).len(), 1);
    }

    #[test]
    fn all_is_ordered() {
        let mut cache = CrosspointCache::new();
        cache.upsert(0, 1, 2, 0, CrosspointStatus::Connected, false);
        cache.upsert(0, 0, 9, 0, CrosspointStatus::Connected, false);
        cache.upsert(0, 0, 3, 0, CrosspointStatus::Connected, false);

        let keys: Vec<(u8, u16)> = cache.all().iter().map(|s| (s.level, s.destination)).collect();
        assert_eq!(keys, vec![(0, 3), (0, 9), (1, 2)]);
    }

    #[test]
    fn last_update_tracks_writes() {
        let mut cache = CrosspointCache::new();
        assert!(cache.last_update().is_none());
        cache.upsert(0, 0, 0, 0, CrosspointStatus::Connected, false);
        assert!(cache.last_update().is_some());
    }
}
