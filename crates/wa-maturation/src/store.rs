//! Chip persistence boundary
//!
//! The engine restores its chip set from the store at construction and writes
//! every change back, so `current_day` and `phase` survive restarts.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::chip::Chip;
use crate::Result;

#[async_trait]
pub trait ChipStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Chip>>;

    async fn save(&self, chip: &Chip) -> Result<()>;

    async fn remove(&self, chip_id: &str) -> Result<()>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryChipStore {
    chips: RwLock<HashMap<String, Chip>>,
}

impl InMemoryChipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate a restart.
    pub fn with_chips(chips: impl IntoIterator<Item = Chip>) -> Self {
        Self {
            chips: RwLock::new(chips.into_iter().map(|c| (c.id.clone(), c)).collect()),
        }
    }

    pub fn get(&self, chip_id: &str) -> Option<Chip> {
        self.chips.read().get(chip_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.chips.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChipStore for InMemoryChipStore {
    async fn load_all(&self) -> Result<Vec<Chip>> {
        Ok(self.chips.read().values().cloned().collect())
    }

    async fn save(&self, chip: &Chip) -> Result<()> {
        self.chips.write().insert(chip.id.clone(), chip.clone());
        Ok(())
    }

    async fn remove(&self, chip_id: &str) -> Result<()> {
        self.chips.write().remove(chip_id);
        Ok(())
    }
}
