use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// One crosspoint of a salvo. Destinations route on matrix 0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SalvoEntry {
    pub destination: u16,
    pub source: u16,
    pub level: u8,
}

/// A named group of crosspoints applied as a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Salvo {
    pub id: u32,
    pub name: String,
    pub crosspoints: Vec<SalvoEntry>,
}

/// In-process salvo store, last-write-wins per id.
#[derive(Default)]
pub struct SalvoStore {
    salvos: RwLock<HashMap<u32, Salvo>>,
}

impl SalvoStore {
    pub fn new() -> SalvoStore {
        SalvoStore::default()
    }

    pub fn insert(&self, salvo: Salvo) {
        self.salvos
            .write()
            .expect("salvo lock")
            .insert(salvo.id, salvo);
    }

    pub fn get(&self, id: u32) -> Option<Salvo> {
        self.salvos.read().expect("salvo lock").get(&id).cloned()
    }

    /// Every salvo, ordered by id.
    pub fn all(&self) -> Vec<Salvo> {
        let mut all: Vec<Salvo> = self
            .salvos
            .read()
            .expect("salvo lock")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn len(&self) -> usize {
        self.salvos.read().expect("salvo lock").len()
    }
}
