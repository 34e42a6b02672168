//! Voxel hash index
//!
//! Maps a quantized cell to the slot of the splat that owns it. Entries are
//! only ever inserted; the whole index is dropped on wholesale replacement.

use std::collections::HashMap;

use crate::core::splat::VoxelKey;

/// Insert-only map from voxel key to store slot
#[derive(Debug, Default, Clone)]
pub struct VoxelIndex {
    cells: HashMap<VoxelKey, u32>,
}

impl VoxelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: HashMap::with_capacity(capacity),
        }
    }

    /// Slot owning `key`, if any
    #[inline]
    pub fn get(&self, key: &VoxelKey) -> Option<usize> {
        self.cells.get(key).map(|&slot| slot as usize)
    }

    /// Insert `key -> slot` if the key is absent. Returns whether it was inserted.
    pub fn insert(&mut self, key: VoxelKey, slot: usize) -> bool {
        let Ok(slot) = u32::try_from(slot) else {
            return false;
        };
        match self.cells.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(slot);
                true
            }
        }
    }

    pub fn contains(&self, key: &VoxelKey) -> bool {
        self.cells.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Largest slot referenced by the index
    pub fn max_slot(&self) -> Option<usize> {
        self.cells.values().max().map(|&slot| slot as usize)
    }

    pub(crate) fn clear(&mut self) {
        self.cells.clear();
    }
}
